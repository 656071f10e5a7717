//! Probe execution against a STEP protocol service.
//!
//! - [`wire`] — length-prefixed JSON+binary framing shared with the service
//! - [`client`] — async upload client (login, plan, blocks, bye)
//! - [`fixtures`] — scoped scratch files with known content hashes
//! - [`runner`] — executes one probe and produces exactly one result record
//! - [`testing`] — in-process mock STEP server for integration tests

pub mod client;
pub mod fixtures;
pub mod runner;
pub mod testing;
pub mod wire;

pub use client::{Endpoint, StepClient, UploadOutcome};
pub use runner::ProbeRunner;
