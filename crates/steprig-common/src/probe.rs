//! Probe definitions and per-execution results.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which suite a probe belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeCategory {
    Functional,
    Performance,
}

/// What outcome the probe treats as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expectation {
    /// Transfer completes and the server hash matches the local hash.
    Accept,
    /// Login must be rejected with a 4xx class status (invalid credential).
    RejectAuth,
    /// One block is tampered in flight; the server hash must NOT match the
    /// untampered local hash.
    DetectCorruption,
}

/// One test case against the protocol service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSpec {
    /// Stable identifier, e.g. "A3-tail-block" or "C4-loss-10pct".
    pub id: String,
    pub category: ProbeCategory,
    /// Fixture size in bytes. Zero is legal.
    pub file_size: u64,
    /// Requested block size in bytes (the service may assign its own; this
    /// drives fixture sizing for tail-block cases). Must be > 0.
    pub block_size: u64,
    /// Parallel upload sessions. Must be >= 1.
    pub concurrency: u32,
    /// Hard bound on the whole probe execution.
    #[serde(with = "serde_duration_secs")]
    pub timeout: Duration,
    /// Impairment to hold on the path while the probe runs.
    pub impairment: Option<crate::impairment::ImpairmentSpec>,
    pub expect: Expectation,
    /// Upload twice under the same key and check the policy is consistent.
    #[serde(default)]
    pub repeat_upload: bool,
    /// Override the login username (auth-error probes).
    #[serde(default)]
    pub username: Option<String>,
}

impl ProbeSpec {
    /// Validate the input constraints shared by all probes.
    pub fn validate(&self) -> Result<(), String> {
        if self.block_size == 0 {
            return Err(format!("{}: block_size must be > 0", self.id));
        }
        if self.concurrency == 0 {
            return Err(format!("{}: concurrency must be >= 1", self.id));
        }
        if self.timeout.is_zero() {
            return Err(format!("{}: timeout must be > 0", self.id));
        }
        Ok(())
    }
}

/// Terminal status of one probe execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProbeStatus {
    Passed,
    Failed,
    /// Unexpected failure outside the probe-layer taxonomy (still captured,
    /// never allowed to abort the run silently).
    Error,
}

/// Measurements taken during a probe execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Measurements {
    pub duration_secs: f64,
    /// Goodput over the transferred payload, MiB/s. Zero when nothing moved.
    pub throughput_mibps: f64,
    pub bytes_transferred: u64,
    pub local_md5: Option<String>,
    pub server_md5: Option<String>,
    /// Fraction of concurrent sessions that succeeded (1.0 for a single one).
    pub success_rate: f64,
    /// Free-form observations, e.g. the observed repeat-upload policy.
    pub notes: Option<String>,
}

/// Immutable record of one probe execution. Append-only within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub probe_id: String,
    pub category: ProbeCategory,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: ProbeStatus,
    pub measurements: Measurements,
    pub failure_reason: Option<String>,
}

impl ProbeResult {
    pub fn passed(&self) -> bool {
        self.status == ProbeStatus::Passed
    }
}

/// Serialize `Duration` as whole seconds (f64) so TOML/JSON configs stay flat.
mod serde_duration_secs {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs))
    }
}
