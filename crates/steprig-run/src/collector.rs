//! Result collection and the run artifact.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use steprig_common::{ProbeResult, RunSummary};
use tracing::info;

/// Accumulates probe results in execution order and produces the summary.
pub struct ResultCollector {
    run_id: String,
    started_at: DateTime<Utc>,
    results: Vec<ProbeResult>,
}

impl ResultCollector {
    pub fn new() -> Self {
        Self {
            run_id: RunSummary::new_run_id(),
            started_at: Utc::now(),
            results: Vec::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn record(&mut self, result: ProbeResult) {
        info!(
            probe = %result.probe_id,
            status = ?result.status,
            duration_secs = result.measurements.duration_secs,
            "result recorded"
        );
        self.results.push(result);
    }

    /// Close the run. `abort_reason` forces an aborted verdict; `partial`
    /// marks a run with probes left unexecuted.
    pub fn finish(self, abort_reason: Option<String>, partial: bool) -> RunSummary {
        RunSummary::build(self.run_id, self.started_at, self.results, abort_reason, partial)
    }
}

impl Default for ResultCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Write the summary as pretty JSON to `<dir>/run-<id>.json`.
pub fn write_artifact(summary: &RunSummary, dir: &Path) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("create results dir {}", dir.display()))?;

    let path = dir.join(format!("{}.json", summary.run_id.replace("run_", "run-")));
    let json = serde_json::to_string_pretty(summary).context("serialize run summary")?;
    std::fs::write(&path, json).with_context(|| format!("write artifact {}", path.display()))?;

    info!(path = %path.display(), overall = ?summary.overall, "run artifact written");
    Ok(path)
}
