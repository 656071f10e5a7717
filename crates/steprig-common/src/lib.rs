//! Shared types for the steprig test orchestrator.
//!
//! This crate contains:
//! - **Probe model** — probe definitions, execution results, measurements
//! - **Run summary** — run-level aggregation of ordered probe results
//! - **Error taxonomy** — environment, impairment, and probe layer errors

pub mod error;
pub mod impairment;
pub mod probe;
pub mod summary;

pub use error::{EnvError, ImpairmentError, ProbeError};
pub use impairment::ImpairmentSpec;
pub use probe::{
    Expectation, Measurements, ProbeCategory, ProbeResult, ProbeSpec, ProbeStatus,
};
pub use summary::{RunStatus, RunSummary};
