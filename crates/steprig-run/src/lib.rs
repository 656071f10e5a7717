//! Run-level wiring for steprig: configuration, the built-in probe catalog,
//! the orchestrator state machine, and result collection.

pub mod collector;
pub mod config;
pub mod orchestrator;
pub mod suite;

pub use collector::{write_artifact, ResultCollector};
pub use config::{EndpointConfig, EnvConfig, HostConfig, RunConfig};
pub use orchestrator::{exit_code, RunOutcome, RunPhase, TestOrchestrator};
pub use suite::SuiteSelection;
