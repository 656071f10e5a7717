//! Probe execution.
//!
//! [`ProbeRunner::run`] executes one probe definition and always produces
//! exactly one [`ProbeResult`]: protocol-level failures become FAILED,
//! anything unexpected becomes ERROR, and nothing aborts the caller.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use chrono::Utc;
use steprig_common::{
    Expectation, Measurements, ProbeError, ProbeResult, ProbeSpec, ProbeStatus,
};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::client::{Endpoint, StepClient};
use crate::fixtures::{md5_of_file, Scratch};

/// Outcome of the probe body before it is stamped into a result record.
struct Outcome {
    status: ProbeStatus,
    measurements: Measurements,
    failure_reason: Option<String>,
}

/// What one upload session observed.
struct SessionStats {
    bytes: u64,
    local_md5: String,
    server_md5: Option<String>,
    note: Option<String>,
    /// Set when the session completed but its expectation was not met.
    failure: Option<String>,
}

/// Executes probes against a fixed service endpoint.
pub struct ProbeRunner {
    endpoint: Endpoint,
}

impl ProbeRunner {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    /// Run one probe to completion, bounded by its timeout.
    pub async fn run(&self, spec: &ProbeSpec) -> ProbeResult {
        let started_at = Utc::now();
        let started = Instant::now();
        info!(probe = %spec.id, "probe starting");

        let outcome = match spec.validate() {
            Err(reason) => Outcome {
                status: ProbeStatus::Error,
                measurements: Measurements::default(),
                failure_reason: Some(reason),
            },
            Ok(()) => match tokio::time::timeout(spec.timeout, self.execute(spec)).await {
                Err(_) => Outcome {
                    status: ProbeStatus::Failed,
                    measurements: Measurements::default(),
                    failure_reason: Some(format!(
                        "timed out after {:.0}s",
                        spec.timeout.as_secs_f64()
                    )),
                },
                Ok(Ok(outcome)) => outcome,
                Ok(Err(err)) => match err.downcast_ref::<ProbeError>() {
                    // Probe-layer errors are expected failure modes.
                    Some(_) => Outcome {
                        status: ProbeStatus::Failed,
                        measurements: Measurements::default(),
                        failure_reason: Some(err.to_string()),
                    },
                    None => Outcome {
                        status: ProbeStatus::Error,
                        measurements: Measurements::default(),
                        failure_reason: Some(format!("{err:#}")),
                    },
                },
            },
        };

        let mut measurements = outcome.measurements;
        measurements.duration_secs = started.elapsed().as_secs_f64();
        if measurements.duration_secs > 0.0 && measurements.bytes_transferred > 0 {
            measurements.throughput_mibps = measurements.bytes_transferred as f64
                / (1024.0 * 1024.0)
                / measurements.duration_secs;
        }

        if let Some(reason) = &outcome.failure_reason {
            warn!(probe = %spec.id, status = ?outcome.status, reason, "probe did not pass");
        } else {
            info!(probe = %spec.id, "probe passed");
        }

        ProbeResult {
            probe_id: spec.id.clone(),
            category: spec.category,
            started_at,
            finished_at: Utc::now(),
            status: outcome.status,
            measurements,
            failure_reason: outcome.failure_reason,
        }
    }

    async fn execute(&self, spec: &ProbeSpec) -> anyhow::Result<Outcome> {
        let scratch = Scratch::new()?;
        let username = spec
            .username
            .clone()
            .unwrap_or_else(|| self.endpoint.username.clone());

        if spec.concurrency == 1 {
            let fixture = scratch
                .create_file(&format!("{}.bin", spec.id), spec.file_size)
                .context("create fixture")?;
            let stats =
                run_session(self.endpoint.clone(), spec.clone(), username, fixture, 0).await?;
            return Ok(outcome_from_sessions(vec![stats]));
        }

        // Concurrency probe: N parallel sessions, each with its own fixture
        // and key. The probe measures the aggregate.
        let mut set: JoinSet<anyhow::Result<SessionStats>> = JoinSet::new();
        for idx in 0..spec.concurrency {
            let fixture = scratch
                .create_file(&format!("{}-{idx}.bin", spec.id), spec.file_size)
                .context("create fixture")?;
            let endpoint = self.endpoint.clone();
            let spec = spec.clone();
            let username = username.clone();
            set.spawn(async move { run_session(endpoint, spec, username, fixture, idx).await });
        }

        let mut sessions = Vec::with_capacity(spec.concurrency as usize);
        while let Some(joined) = set.join_next().await {
            match joined.context("session task panicked")? {
                Ok(stats) => sessions.push(stats),
                Err(err) => sessions.push(SessionStats {
                    bytes: 0,
                    local_md5: String::new(),
                    server_md5: None,
                    note: None,
                    failure: Some(err.to_string()),
                }),
            }
        }
        Ok(outcome_from_sessions(sessions))
    }
}

/// One full client session: connect, login, upload(s), verdict.
async fn run_session(
    endpoint: Endpoint,
    spec: ProbeSpec,
    username: String,
    fixture: PathBuf,
    idx: u32,
) -> anyhow::Result<SessionStats> {
    let local_md5 = md5_of_file(&fixture).context("hash fixture")?;

    let mut client = StepClient::connect(&endpoint).await?;
    let login = client.login(&username).await?;

    if spec.expect == Expectation::RejectAuth {
        // Success here means the rejection happened with the expected class.
        let failure = if login.is_rejection() {
            None
        } else {
            Some(format!(
                "service accepted invalid credential '{username}' (status {:?})",
                login.status
            ))
        };
        client.bye().await;
        return Ok(SessionStats {
            bytes: 0,
            local_md5,
            server_md5: None,
            note: login.status_msg,
            failure,
        });
    }

    if login.is_rejection() {
        client.bye().await;
        return Err(ProbeError::Connect(format!(
            "login rejected: {} (status {:?})",
            login.status_msg.unwrap_or_default(),
            login.status
        ))
        .into());
    }

    let key = format!("{}-{idx}.bin", spec.id);
    let corrupt_block = match spec.expect {
        Expectation::DetectCorruption => Some(0),
        _ => None,
    };

    let first = client.upload(&fixture, &key, corrupt_block).await?;
    if !first.accepted {
        client.bye().await;
        return Err(ProbeError::Transfer(format!(
            "upload rejected: {} (status {:?})",
            first.status_msg.unwrap_or_default(),
            first.status
        ))
        .into());
    }

    let mut bytes = first.bytes_sent;
    let mut note = None;
    let mut failure = verify_expectation(&spec, &local_md5, first.server_md5.as_deref());

    if spec.repeat_upload && failure.is_none() {
        // Either overwrite or reject is a valid policy; the probe only
        // asserts the behavior is consistent and records what it saw.
        let second = client.upload(&fixture, &key, None).await;
        match second {
            Ok(outcome) if outcome.accepted => {
                bytes += outcome.bytes_sent;
                if outcome.server_md5.as_deref() == Some(local_md5.as_str()) {
                    note = Some("repeat upload policy: overwrite".into());
                } else {
                    failure = Some(format!(
                        "repeat upload accepted but content diverged (server {:?})",
                        outcome.server_md5
                    ));
                }
            }
            Ok(outcome) => {
                note = Some(format!(
                    "repeat upload policy: reject (status {:?})",
                    outcome.status
                ));
            }
            Err(e) => {
                failure = Some(format!("repeat upload behaved inconsistently: {e}"));
            }
        }
    }

    client.bye().await;
    debug!(probe = %spec.id, session = idx, bytes, "session finished");

    Ok(SessionStats {
        bytes,
        local_md5,
        server_md5: first.server_md5,
        note,
        failure,
    })
}

fn verify_expectation(
    spec: &ProbeSpec,
    local_md5: &str,
    server_md5: Option<&str>,
) -> Option<String> {
    match spec.expect {
        Expectation::Accept => match server_md5 {
            Some(server) if server == local_md5 => None,
            Some(server) => Some(
                ProbeError::IntegrityMismatch {
                    local: local_md5.to_string(),
                    server: server.to_string(),
                }
                .to_string(),
            ),
            None => Some("service reported no content hash".into()),
        },
        Expectation::DetectCorruption => match server_md5 {
            Some(server) if server != local_md5 => None,
            Some(_) => Some("service reported the original hash for tampered content".into()),
            None => Some("service reported no content hash".into()),
        },
        Expectation::RejectAuth => None, // handled before upload
    }
}

fn outcome_from_sessions(sessions: Vec<SessionStats>) -> Outcome {
    let total = sessions.len().max(1);
    let succeeded = sessions.iter().filter(|s| s.failure.is_none()).count();
    let bytes: u64 = sessions.iter().map(|s| s.bytes).sum();

    let first_failure = sessions.iter().find_map(|s| s.failure.clone());
    let note = sessions.iter().find_map(|s| s.note.clone());
    let local_md5 = sessions.first().map(|s| s.local_md5.clone());
    let server_md5 = sessions.first().and_then(|s| s.server_md5.clone());

    Outcome {
        status: if first_failure.is_none() {
            ProbeStatus::Passed
        } else {
            ProbeStatus::Failed
        },
        measurements: Measurements {
            bytes_transferred: bytes,
            local_md5,
            server_md5,
            success_rate: succeeded as f64 / total as f64,
            notes: note,
            ..Default::default()
        },
        failure_reason: first_failure,
    }
}
