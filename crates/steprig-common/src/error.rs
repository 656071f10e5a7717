//! Error taxonomy for the orchestrator.
//!
//! Three layers with distinct propagation rules:
//! - [`EnvError`] — environment control plane; fatal to the run
//! - [`ImpairmentError`] — netem control; fatal to the probe that asked for it
//! - [`ProbeError`] — protocol level; recorded as a failed probe, never fatal

use thiserror::Error;

/// Environment-layer failures. Any of these aborts the run: no probe is
/// meaningful without a reachable target.
#[derive(Debug, Error)]
pub enum EnvError {
    /// The backend could not allocate what the resource spec asked for.
    #[error("provisioning failed for '{name}': {reason}")]
    Provisioning { name: String, reason: String },

    /// A network of the requested name exists with a different address plan.
    #[error("network '{name}' exists with a conflicting address plan: {reason}")]
    Conflict { name: String, reason: String },

    /// The target never became reachable within the timeout.
    #[error("'{name}' unreachable after {waited_secs:.1}s (last cause: {last_cause})")]
    Reachability {
        name: String,
        waited_secs: f64,
        last_cause: String,
    },

    /// An invalid state-machine transition was requested.
    #[error("invalid transition for '{name}': {from} -> {to}")]
    InvalidTransition {
        name: String,
        from: String,
        to: String,
    },

    /// Underlying control surface failed in a way we cannot classify.
    #[error("backend command failed: {0}")]
    Backend(String),
}

/// Impairment-layer failures. These fail the probe that required the
/// impairment but never the run.
#[derive(Debug, Error)]
pub enum ImpairmentError {
    #[error("interface '{0}' does not exist")]
    InterfaceNotFound(String),

    /// tc/netem is not available on this host (missing tool or kernel module).
    #[error("impairment control unavailable: {0}")]
    Unsupported(String),

    #[error("failed to apply impairment on '{interface}': {reason}")]
    Apply { interface: String, reason: String },
}

/// Probe-layer failures. Caught at the ProbeRunner boundary and converted
/// into a failed [`crate::ProbeResult`].
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("could not connect to service: {0}")]
    Connect(String),

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("integrity mismatch: local {local} != server {server}")]
    IntegrityMismatch { local: String, server: String },
}
