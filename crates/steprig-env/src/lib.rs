//! Environment control plane for steprig.
//!
//! Provides idempotent lifecycle management of named isolated hosts (VMs)
//! and their shared virtual network, plus `tc netem` impairment injection
//! with guaranteed removal. Both surfaces sit behind small traits so a
//! non-VM backend (containers, network namespaces) can be substituted
//! without touching the orchestrator.

pub mod backend;
pub mod cmd;
pub mod impairment;
pub mod resource;

pub use backend::{BackendHostState, LibvirtBackend, ResourceBackend};
pub use cmd::{CommandRunner, HostRunner};
pub use impairment::{FaultInjector, ImpairmentGuard};
pub use resource::{
    NetworkTopology, ResourceManager, ResourceRole, ResourceSpec, ResourceState,
};
