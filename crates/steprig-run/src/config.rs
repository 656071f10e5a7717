//! Run configuration.
//!
//! A [`RunConfig`] is assembled once, from a TOML file plus command-line
//! overrides, and handed to the orchestrator at construction. Nothing reads
//! configuration after that point.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use steprig_env::{NetworkTopology, ResourceRole, ResourceSpec};
use steprig_probes::Endpoint;

use crate::suite::SuiteSelection;

/// Where the service under test listens and which account probes use.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub address: String,
    pub port: u16,
    pub username: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            address: "192.168.100.2".into(),
            port: 1379,
            username: "steprig".into(),
        }
    }
}

/// One host in the test topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub name: String,
    pub memory_mb: u32,
}

/// Environment topology and bring-up behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    pub network: NetworkTopology,
    pub server: HostConfig,
    pub clients: Vec<HostConfig>,
    /// Host-side interface impairments are applied to.
    pub interface: String,
    /// How long to wait for the server to answer after start. Zero disables
    /// the wait (already-provisioned environments).
    pub reachability_timeout_secs: f64,
    /// Run `virsh`/`tc` through sudo.
    pub use_sudo: bool,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            network: NetworkTopology {
                name: "steprig-net".into(),
                gateway: "192.168.100.1".into(),
                server_addr: "192.168.100.2".into(),
                client_addrs: vec!["192.168.100.11".into()],
            },
            server: HostConfig {
                name: "steprig-server".into(),
                memory_mb: 2048,
            },
            clients: vec![HostConfig {
                name: "steprig-client".into(),
                memory_mb: 1024,
            }],
            interface: "vnet0".into(),
            reachability_timeout_secs: 120.0,
            use_sudo: false,
        }
    }
}

impl EnvConfig {
    pub fn reachability_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.reachability_timeout_secs.max(0.0))
    }

    /// All hosts of the topology, server first.
    pub fn resource_specs(&self) -> Vec<ResourceSpec> {
        let mut specs = vec![ResourceSpec {
            name: self.server.name.clone(),
            role: ResourceRole::Server,
            memory_mb: self.server.memory_mb,
            network: self.network.name.clone(),
        }];
        for client in &self.clients {
            specs.push(ResourceSpec {
                name: client.name.clone(),
                role: ResourceRole::Client,
                memory_mb: client.memory_mb,
                network: self.network.name.clone(),
            });
        }
        specs
    }
}

/// Everything one run needs, immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub endpoint: EndpointConfig,
    pub env: EnvConfig,
    pub suite: SuiteSelection,
    pub results_dir: PathBuf,
    /// Skip environment bring-up, assume it is already there.
    pub reuse_env: bool,
    /// Skip teardown, leave the environment for inspection or the next run.
    pub keep_env: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            env: EnvConfig::default(),
            suite: SuiteSelection::Functional,
            results_dir: PathBuf::from("results"),
            reuse_env: false,
            keep_env: false,
        }
    }
}

impl RunConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            address: self.endpoint.address.clone(),
            port: self.endpoint.port,
            username: self.endpoint.username.clone(),
        }
    }
}
