//! Run-level aggregation of probe results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::probe::{ProbeCategory, ProbeResult, ProbeStatus};

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Passed,
    Failed,
    /// Environment bring-up failed or the run was cut short before any
    /// meaningful verdict.
    Aborted,
}

/// Per-category pass/fail/error counts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SuiteCounts {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
}

impl SuiteCounts {
    fn tally(results: &[ProbeResult], category: ProbeCategory) -> Self {
        let mut c = SuiteCounts::default();
        for r in results.iter().filter(|r| r.category == category) {
            c.total += 1;
            match r.status {
                ProbeStatus::Passed => c.passed += 1,
                ProbeStatus::Failed => c.failed += 1,
                ProbeStatus::Error => c.errored += 1,
            }
        }
        c
    }
}

/// The single externally consumed artifact of a run: identifier, timestamps,
/// overall verdict, and the ordered list of probe results (result order is
/// execution order).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub overall: RunStatus,
    /// True when the run was cancelled or aborted with probes still pending.
    pub partial: bool,
    pub functional: SuiteCounts,
    pub performance: SuiteCounts,
    pub abort_reason: Option<String>,
    pub results: Vec<ProbeResult>,
}

impl RunSummary {
    /// Fresh run id: UUIDv7, time-ordered, with a readable prefix.
    pub fn new_run_id() -> String {
        format!("run_{}", Uuid::now_v7())
    }

    /// Aggregate ordered probe results into the run verdict.
    ///
    /// The run passes iff every functional probe passed. Performance probes
    /// are reported but never fail the run. An explicit abort reason forces
    /// [`RunStatus::Aborted`] regardless of probe outcomes.
    pub fn build(
        run_id: String,
        started_at: DateTime<Utc>,
        results: Vec<ProbeResult>,
        abort_reason: Option<String>,
        partial: bool,
    ) -> Self {
        let functional = SuiteCounts::tally(&results, ProbeCategory::Functional);
        let performance = SuiteCounts::tally(&results, ProbeCategory::Performance);

        let overall = if abort_reason.is_some() {
            RunStatus::Aborted
        } else if functional.passed == functional.total {
            RunStatus::Passed
        } else {
            RunStatus::Failed
        };

        RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            overall,
            partial,
            functional,
            performance,
            abort_reason,
            results,
        }
    }
}
