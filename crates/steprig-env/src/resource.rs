//! Idempotent lifecycle management of named isolated hosts.
//!
//! Resources are referenced by name only, never by live handle, so
//! orchestration logic survives resource recreation. The manager owns the
//! per-resource state machine:
//!
//! `Undefined -> Defined -> Configured -> Running <-> Stopped -> Deleted`

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use steprig_common::EnvError;
use tracing::{debug, info};

use crate::backend::{BackendHostState, ResourceBackend};

/// Role a host plays in the test topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceRole {
    Server,
    Client,
}

/// Specification of one isolated host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub name: String,
    pub role: ResourceRole,
    pub memory_mb: u32,
    /// Name of the virtual network the host attaches to.
    pub network: String,
}

/// A named isolated virtual subnet with a static address plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkTopology {
    pub name: String,
    pub gateway: String,
    pub server_addr: String,
    pub client_addrs: Vec<String>,
}

impl NetworkTopology {
    /// Address plans match when every assignment is identical.
    pub fn plan_matches(&self, other: &NetworkTopology) -> bool {
        self.gateway == other.gateway
            && self.server_addr == other.server_addr
            && self.client_addrs == other.client_addrs
    }
}

/// Lifecycle state of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResourceState {
    Undefined,
    Defined,
    Configured,
    Running,
    Stopped,
    Deleted,
}

impl std::fmt::Display for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceState::Undefined => "UNDEFINED",
            ResourceState::Defined => "DEFINED",
            ResourceState::Configured => "CONFIGURED",
            ResourceState::Running => "RUNNING",
            ResourceState::Stopped => "STOPPED",
            ResourceState::Deleted => "DELETED",
        };
        f.write_str(s)
    }
}

/// Creates, starts, stops, and destroys named hosts and their network.
/// All operations are idempotent with respect to resource names.
pub struct ResourceManager {
    backend: Arc<dyn ResourceBackend>,
    states: Mutex<HashMap<String, ResourceState>>,
}

impl ResourceManager {
    pub fn new(backend: Arc<dyn ResourceBackend>) -> Self {
        Self {
            backend,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Current state as the manager knows it.
    pub fn state(&self, name: &str) -> ResourceState {
        self.states
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(ResourceState::Undefined)
    }

    fn set_state(&self, name: &str, state: ResourceState) {
        self.states.lock().unwrap().insert(name.to_string(), state);
    }

    /// Ensure a network of this name exists with exactly this address plan.
    ///
    /// Idempotent: an existing network with a matching plan is success; a
    /// mismatched plan is a [`EnvError::Conflict`].
    pub fn ensure_network(&self, topo: &NetworkTopology) -> Result<(), EnvError> {
        if let Some(existing) = self.backend.lookup_network(&topo.name)? {
            if existing.plan_matches(topo) {
                debug!(network = %topo.name, "network already defined with matching plan");
                return Ok(());
            }
            return Err(EnvError::Conflict {
                name: topo.name.clone(),
                reason: format!(
                    "existing plan gw={} server={} clients={:?}, requested gw={} server={} clients={:?}",
                    existing.gateway,
                    existing.server_addr,
                    existing.client_addrs,
                    topo.gateway,
                    topo.server_addr,
                    topo.client_addrs
                ),
            });
        }
        self.backend.define_network(topo)?;
        info!(network = %topo.name, "network created");
        Ok(())
    }

    /// Ensure a host of this name exists, creating it if necessary.
    ///
    /// An existing host in any non-deleted state is adopted as-is, without
    /// reconfiguration; the returned value is its current state.
    pub fn ensure_resource(&self, spec: &ResourceSpec) -> Result<ResourceState, EnvError> {
        if let Some(existing) = self.backend.lookup_host(&spec.name)? {
            let state = match existing {
                BackendHostState::Running => ResourceState::Running,
                BackendHostState::Stopped => ResourceState::Configured,
            };
            self.set_state(&spec.name, state);
            debug!(name = %spec.name, %state, "resource already present, adopting");
            return Ok(state);
        }

        // UNDEFINED -> DEFINED -> CONFIGURED: the backend allocates memory
        // and attaches the host to the named network in one define step.
        self.set_state(&spec.name, ResourceState::Defined);
        self.backend.define_host(spec)?;
        self.set_state(&spec.name, ResourceState::Configured);
        info!(name = %spec.name, memory_mb = spec.memory_mb, network = %spec.network, "resource configured");
        Ok(ResourceState::Configured)
    }

    /// Start a host. Starting an already-running host is a no-op success.
    pub fn start(&self, name: &str) -> Result<(), EnvError> {
        match self.state(name) {
            ResourceState::Running => Ok(()),
            ResourceState::Configured | ResourceState::Stopped => {
                self.backend.start_host(name)?;
                self.set_state(name, ResourceState::Running);
                info!(name, "resource started");
                Ok(())
            }
            from => Err(EnvError::InvalidTransition {
                name: name.to_string(),
                from: from.to_string(),
                to: ResourceState::Running.to_string(),
            }),
        }
    }

    /// Stop a host. Stopping a non-running host is a no-op success.
    pub fn stop(&self, name: &str) -> Result<(), EnvError> {
        match self.state(name) {
            ResourceState::Running => {
                self.backend.stop_host(name)?;
                self.set_state(name, ResourceState::Stopped);
                info!(name, "resource stopped");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Stop if running, release backing storage, transition to DELETED.
    ///
    /// Safe to call twice; teardown must never be the reason a run fails
    /// to finish cleaning up.
    pub fn delete(&self, name: &str) -> Result<(), EnvError> {
        match self.state(name) {
            ResourceState::Deleted => Ok(()),
            _ => {
                self.backend.delete_host(name)?;
                self.set_state(name, ResourceState::Deleted);
                info!(name, "resource deleted");
                Ok(())
            }
        }
    }

    /// Poll reachability (ICMP, then TCP connect to the service port) until
    /// success or `timeout`. On timeout the error carries the last cause.
    pub async fn wait_reachable(
        &self,
        name: &str,
        address: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<(), EnvError> {
        let deadline = Instant::now() + timeout;
        let mut last_cause = String::from("not yet probed");

        loop {
            match probe_once(address, port).await {
                Ok(()) => {
                    info!(name, address, port, "resource reachable");
                    return Ok(());
                }
                Err(cause) => last_cause = cause,
            }

            if Instant::now() >= deadline {
                return Err(EnvError::Reachability {
                    name: name.to_string(),
                    waited_secs: timeout.as_secs_f64(),
                    last_cause,
                });
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

/// One reachability attempt: ping, then TCP connect to the service port.
async fn probe_once(address: &str, port: u16) -> Result<(), String> {
    let ping = tokio::process::Command::new("ping")
        .args(["-c", "1", "-W", "1", address])
        .output()
        .await;
    match ping {
        Ok(out) if out.status.success() => {}
        Ok(out) => {
            return Err(format!(
                "ping failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            ))
        }
        Err(e) => return Err(format!("ping unavailable: {e}")),
    }

    let target = format!("{address}:{port}");
    match tokio::time::timeout(
        Duration::from_secs(2),
        tokio::net::TcpStream::connect(&target),
    )
    .await
    {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(format!("tcp connect to {target}: {e}")),
        Err(_) => Err(format!("tcp connect to {target}: timed out")),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory backend tracking defined networks and hosts.
    #[derive(Default)]
    pub struct FakeBackend {
        pub networks: Mutex<HashMap<String, NetworkTopology>>,
        pub hosts: Mutex<HashMap<String, BackendHostState>>,
        pub define_calls: Mutex<u32>,
        /// When set, define_host fails with this reason (capacity testing).
        pub reject_define: Mutex<Option<String>>,
    }

    impl ResourceBackend for FakeBackend {
        fn lookup_network(&self, name: &str) -> Result<Option<NetworkTopology>, EnvError> {
            Ok(self.networks.lock().unwrap().get(name).cloned())
        }

        fn define_network(&self, topo: &NetworkTopology) -> Result<(), EnvError> {
            self.networks
                .lock()
                .unwrap()
                .insert(topo.name.clone(), topo.clone());
            Ok(())
        }

        fn lookup_host(&self, name: &str) -> Result<Option<BackendHostState>, EnvError> {
            Ok(self.hosts.lock().unwrap().get(name).copied())
        }

        fn define_host(&self, spec: &ResourceSpec) -> Result<(), EnvError> {
            if let Some(reason) = self.reject_define.lock().unwrap().clone() {
                return Err(EnvError::Provisioning {
                    name: spec.name.clone(),
                    reason,
                });
            }
            *self.define_calls.lock().unwrap() += 1;
            self.hosts
                .lock()
                .unwrap()
                .insert(spec.name.clone(), BackendHostState::Stopped);
            Ok(())
        }

        fn start_host(&self, name: &str) -> Result<(), EnvError> {
            self.hosts
                .lock()
                .unwrap()
                .insert(name.to_string(), BackendHostState::Running);
            Ok(())
        }

        fn stop_host(&self, name: &str) -> Result<(), EnvError> {
            self.hosts
                .lock()
                .unwrap()
                .insert(name.to_string(), BackendHostState::Stopped);
            Ok(())
        }

        fn delete_host(&self, name: &str) -> Result<(), EnvError> {
            self.hosts.lock().unwrap().remove(name);
            Ok(())
        }
    }
}
