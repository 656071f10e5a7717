//! Resource control surface.
//!
//! [`ResourceBackend`] is the minimal primitive set the
//! [`crate::ResourceManager`] needs; any backend satisfying it is
//! substitutable (libvirt VMs here, containers or namespaces elsewhere).

use std::io::Write;
use std::sync::Arc;

use steprig_common::EnvError;
use tracing::debug;

use crate::cmd::{stderr_of, CommandRunner};
use crate::resource::{NetworkTopology, ResourceSpec};

/// What the backend knows about an existing host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendHostState {
    Running,
    Stopped,
}

/// Primitive lifecycle operations over named hosts and networks.
pub trait ResourceBackend: Send + Sync {
    /// The existing network's address plan, or `None` if undefined.
    fn lookup_network(&self, name: &str) -> Result<Option<NetworkTopology>, EnvError>;
    fn define_network(&self, topo: &NetworkTopology) -> Result<(), EnvError>;

    /// The existing host's state, or `None` if undefined.
    fn lookup_host(&self, name: &str) -> Result<Option<BackendHostState>, EnvError>;
    fn define_host(&self, spec: &ResourceSpec) -> Result<(), EnvError>;
    fn start_host(&self, name: &str) -> Result<(), EnvError>;
    fn stop_host(&self, name: &str) -> Result<(), EnvError>;
    /// Remove the host and its backing storage. Absent hosts are fine.
    fn delete_host(&self, name: &str) -> Result<(), EnvError>;
}

/// Backend shelling out to `virsh`.
pub struct LibvirtBackend {
    runner: Arc<dyn CommandRunner>,
}

impl LibvirtBackend {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn virsh(&self, args: &[&str]) -> Result<std::process::Output, EnvError> {
        self.runner
            .run("virsh", args)
            .map_err(|e| EnvError::Backend(e.to_string()))
    }

    /// `virsh net-define`/`define` only take files, so XML goes through a
    /// temp file that lives until the command returns.
    fn define_from_xml(&self, subcommand: &str, xml: &str) -> Result<(), EnvError> {
        let mut file = tempfile::NamedTempFile::new()
            .map_err(|e| EnvError::Backend(format!("temp xml: {e}")))?;
        file.write_all(xml.as_bytes())
            .map_err(|e| EnvError::Backend(format!("temp xml: {e}")))?;
        let path = file.path().to_string_lossy().to_string();

        let output = self.virsh(&[subcommand, &path])?;
        if !output.status.success() {
            return Err(EnvError::Backend(stderr_of(&output)));
        }
        Ok(())
    }
}

impl ResourceBackend for LibvirtBackend {
    fn lookup_network(&self, name: &str) -> Result<Option<NetworkTopology>, EnvError> {
        let output = self.virsh(&["net-dumpxml", name])?;
        if !output.status.success() {
            let stderr = stderr_of(&output);
            if is_not_found(&stderr) {
                return Ok(None);
            }
            return Err(EnvError::Backend(stderr));
        }
        let xml = String::from_utf8_lossy(&output.stdout);
        Ok(Some(parse_network_xml(name, &xml)))
    }

    fn define_network(&self, topo: &NetworkTopology) -> Result<(), EnvError> {
        self.define_from_xml("net-define", &network_xml(topo))?;
        let output = self.virsh(&["net-start", &topo.name])?;
        if !output.status.success() {
            let stderr = stderr_of(&output);
            // An already-active network is not a failure.
            if !stderr.contains("already active") {
                return Err(EnvError::Backend(stderr));
            }
        }
        debug!(network = %topo.name, "network defined and started");
        Ok(())
    }

    fn lookup_host(&self, name: &str) -> Result<Option<BackendHostState>, EnvError> {
        let output = self.virsh(&["dominfo", name])?;
        if !output.status.success() {
            let stderr = stderr_of(&output);
            if is_not_found(&stderr) {
                return Ok(None);
            }
            return Err(EnvError::Backend(stderr));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let state = stdout
            .lines()
            .find_map(|l| l.strip_prefix("State:"))
            .map(str::trim)
            .unwrap_or("");
        Ok(Some(if state == "running" {
            BackendHostState::Running
        } else {
            BackendHostState::Stopped
        }))
    }

    fn define_host(&self, spec: &ResourceSpec) -> Result<(), EnvError> {
        self.define_from_xml("define", &domain_xml(spec))
            .map_err(|e| match e {
                EnvError::Backend(reason) if is_capacity_failure(&reason) => {
                    EnvError::Provisioning {
                        name: spec.name.clone(),
                        reason,
                    }
                }
                other => other,
            })
    }

    fn start_host(&self, name: &str) -> Result<(), EnvError> {
        let output = self.virsh(&["start", name])?;
        if !output.status.success() {
            let stderr = stderr_of(&output);
            if stderr.contains("already active") {
                return Ok(());
            }
            if is_capacity_failure(&stderr) {
                return Err(EnvError::Provisioning {
                    name: name.to_string(),
                    reason: stderr,
                });
            }
            return Err(EnvError::Backend(stderr));
        }
        Ok(())
    }

    fn stop_host(&self, name: &str) -> Result<(), EnvError> {
        let output = self.virsh(&["shutdown", name])?;
        if !output.status.success() {
            let stderr = stderr_of(&output);
            // Graceful shutdown of a wedged guest can fail; force it.
            let output = self.virsh(&["destroy", name])?;
            if !output.status.success() {
                let stderr2 = stderr_of(&output);
                if !stderr2.contains("not running") {
                    return Err(EnvError::Backend(format!("{stderr}; {stderr2}")));
                }
            }
        }
        Ok(())
    }

    fn delete_host(&self, name: &str) -> Result<(), EnvError> {
        // Stop first; a running domain cannot be undefined.
        let _ = self.virsh(&["destroy", name]);

        let output = self.virsh(&["undefine", name, "--remove-all-storage"])?;
        if !output.status.success() {
            let stderr = stderr_of(&output);
            if is_not_found(&stderr) {
                return Ok(());
            }
            return Err(EnvError::Backend(stderr));
        }
        Ok(())
    }
}

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("not found") || stderr.contains("failed to get")
}

fn is_capacity_failure(stderr: &str) -> bool {
    stderr.contains("cannot allocate")
        || stderr.contains("Not enough")
        || stderr.contains("No space left")
        || stderr.contains("out of memory")
}

fn network_xml(topo: &NetworkTopology) -> String {
    let mut hosts = String::new();
    hosts.push_str(&format!(
        "      <host name='server' ip='{}'/>\n",
        topo.server_addr
    ));
    for (i, addr) in topo.client_addrs.iter().enumerate() {
        hosts.push_str(&format!(
            "      <host name='client{}' ip='{}'/>\n",
            i + 1,
            addr
        ));
    }
    format!(
        "<network>\n  <name>{name}</name>\n  <forward mode='nat'/>\n  \
         <ip address='{gw}' netmask='255.255.255.0'>\n    <dhcp>\n{hosts}    </dhcp>\n  </ip>\n</network>\n",
        name = topo.name,
        gw = topo.gateway,
    )
}

fn domain_xml(spec: &ResourceSpec) -> String {
    format!(
        "<domain type='kvm'>\n  <name>{name}</name>\n  <memory unit='MiB'>{mem}</memory>\n  \
         <vcpu>1</vcpu>\n  <os><type arch='x86_64'>hvm</type></os>\n  <devices>\n    \
         <disk type='file' device='disk'>\n      <source file='/var/lib/libvirt/images/{name}.qcow2'/>\n      \
         <target dev='vda' bus='virtio'/>\n    </disk>\n    <interface type='network'>\n      \
         <source network='{net}'/>\n      <model type='virtio'/>\n    </interface>\n  </devices>\n</domain>\n",
        name = spec.name,
        mem = spec.memory_mb,
        net = spec.network,
    )
}

/// Recover the address plan from `net-dumpxml` output. Only the shapes we
/// generate ourselves need to parse: gateway from the `<ip address=` element,
/// static hosts in definition order (server first).
fn parse_network_xml(name: &str, xml: &str) -> NetworkTopology {
    let gateway = xml
        .lines()
        .find(|l| l.trim_start().starts_with("<ip "))
        .and_then(|l| attr(l, "address"))
        .unwrap_or_default();

    let mut host_addrs: Vec<String> = xml
        .lines()
        .filter(|l| l.trim_start().starts_with("<host "))
        .filter_map(|l| attr(l, "ip"))
        .collect();

    let server_addr = if host_addrs.is_empty() {
        String::new()
    } else {
        host_addrs.remove(0)
    };

    NetworkTopology {
        name: name.to_string(),
        gateway,
        server_addr,
        client_addrs: host_addrs,
    }
}

fn attr(line: &str, key: &str) -> Option<String> {
    let marker = format!("{key}='");
    let start = line.find(&marker)? + marker.len();
    let rest = &line[start..];
    let end = rest.find('\'')?;
    Some(rest[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topo() -> NetworkTopology {
        NetworkTopology {
            name: "steprig-net".into(),
            gateway: "192.168.100.1".into(),
            server_addr: "192.168.100.2".into(),
            client_addrs: vec!["192.168.100.11".into(), "192.168.100.12".into()],
        }
    }

    #[test]
    fn network_xml_round_trips_through_parser() {
        let t = topo();
        let parsed = parse_network_xml(&t.name, &network_xml(&t));
        assert_eq!(parsed.gateway, t.gateway);
        assert_eq!(parsed.server_addr, t.server_addr);
        assert_eq!(parsed.client_addrs, t.client_addrs);
    }

    #[test]
    fn domain_xml_carries_name_memory_and_network() {
        let spec = ResourceSpec {
            name: "step-server".into(),
            role: crate::resource::ResourceRole::Server,
            memory_mb: 2048,
            network: "steprig-net".into(),
        };
        let xml = domain_xml(&spec);
        assert!(xml.contains("<name>step-server</name>"));
        assert!(xml.contains("<memory unit='MiB'>2048</memory>"));
        assert!(xml.contains("<source network='steprig-net'/>"));
    }
}
