//! The run state machine.
//!
//! Phases: Init -> EnvReady -> RunningFunctional -> RunningPerformance ->
//! Collecting -> Done, with Aborted reachable from any phase before Done.
//! Probe failures are recorded, never fatal; environment failures abort the
//! run with a partial summary; cancellation interrupts the in-flight probe,
//! skips the rest, and still runs every cleanup step.

use chrono::{DateTime, Utc};
use steprig_common::{
    EnvError, ImpairmentError, Measurements, ProbeResult, ProbeSpec, ProbeStatus, RunStatus,
    RunSummary,
};
use steprig_env::{FaultInjector, ResourceManager};
use steprig_probes::ProbeRunner;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::collector::ResultCollector;
use crate::config::RunConfig;
use crate::suite;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Init,
    EnvReady,
    RunningFunctional,
    RunningPerformance,
    Collecting,
    Done,
    Aborted,
}

/// What the binary needs to pick an exit code.
pub struct RunOutcome {
    pub summary: RunSummary,
    /// Terminal phase of the run, [`RunPhase::Done`] or [`RunPhase::Aborted`].
    pub phase: RunPhase,
    pub cancelled: bool,
    pub env_failed: bool,
}

/// 0 = passed, 1 = probe failures, 2 = environment failure, 3 = cancelled.
pub fn exit_code(outcome: &RunOutcome) -> i32 {
    if outcome.cancelled {
        3
    } else if outcome.env_failed {
        2
    } else if outcome.summary.overall == RunStatus::Passed {
        0
    } else {
        1
    }
}

/// Drives one run end to end.
pub struct TestOrchestrator {
    config: RunConfig,
    resources: ResourceManager,
    injector: FaultInjector,
    runner: ProbeRunner,
    cancel: watch::Receiver<bool>,
    phase: RunPhase,
    functional: Vec<ProbeSpec>,
    performance: Vec<ProbeSpec>,
}

impl TestOrchestrator {
    pub fn new(
        config: RunConfig,
        resources: ResourceManager,
        injector: FaultInjector,
        runner: ProbeRunner,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let functional = if config.suite.includes_functional() {
            suite::functional()
        } else {
            Vec::new()
        };
        let performance = if config.suite.includes_performance() {
            suite::performance()
        } else {
            Vec::new()
        };
        Self {
            config,
            resources,
            injector,
            runner,
            cancel,
            phase: RunPhase::Init,
            functional,
            performance,
        }
    }

    /// Replace the built-in catalog (scenario tests).
    pub fn with_probes(
        mut self,
        functional: Vec<ProbeSpec>,
        performance: Vec<ProbeSpec>,
    ) -> Self {
        self.functional = functional;
        self.performance = performance;
        self
    }

    pub async fn run(mut self) -> RunOutcome {
        let mut collector = ResultCollector::new();
        info!(run_id = collector.run_id(), suite = ?self.config.suite, "run starting");

        let ready = if self.config.reuse_env {
            info!("reusing existing environment");
            self.wait_service_reachable().await
        } else {
            self.bring_up().await
        };
        if let Err(e) = ready {
            error!(error = %e, "environment not ready, aborting run");
            self.phase = RunPhase::Aborted;
            self.teardown();
            let summary = collector.finish(Some(format!("environment not ready: {e}")), true);
            return RunOutcome {
                summary,
                phase: RunPhase::Aborted,
                cancelled: false,
                env_failed: true,
            };
        }
        self.phase = RunPhase::EnvReady;

        self.phase = RunPhase::RunningFunctional;
        let functional = std::mem::take(&mut self.functional);
        let mut cancelled = self.run_category(&functional, &mut collector).await;

        if !cancelled {
            self.phase = RunPhase::RunningPerformance;
            let performance = std::mem::take(&mut self.performance);
            cancelled = self.run_category(&performance, &mut collector).await;
        }

        self.phase = RunPhase::Collecting;
        self.teardown();

        let abort_reason = cancelled.then(|| "cancelled by operator".to_string());
        let summary = collector.finish(abort_reason, cancelled);
        self.phase = if cancelled {
            RunPhase::Aborted
        } else {
            RunPhase::Done
        };
        info!(overall = ?summary.overall, partial = summary.partial, "run finished");

        RunOutcome {
            summary,
            phase: self.phase,
            cancelled,
            env_failed: false,
        }
    }

    /// Run probes in declaration order. Returns true when cancelled; probes
    /// after the cancellation point are skipped, already-recorded results
    /// stay.
    async fn run_category(
        &mut self,
        probes: &[ProbeSpec],
        collector: &mut ResultCollector,
    ) -> bool {
        for spec in probes {
            if *self.cancel.borrow() {
                return true;
            }
            let (result, interrupted) = self.run_probe(spec).await;
            collector.record(result);
            if interrupted {
                return true;
            }
        }
        false
    }

    /// Execute one probe, holding its impairment (if any) for exactly the
    /// probe's duration. Returns the result and whether cancellation hit
    /// mid-probe.
    async fn run_probe(&mut self, spec: &ProbeSpec) -> (ProbeResult, bool) {
        let started_at = Utc::now();
        let _guard = match &spec.impairment {
            Some(impairment) => {
                match self.injector.inject(&self.config.env.interface, impairment.clone()) {
                    Ok(guard) => Some(guard),
                    Err(e) => {
                        // A partial apply must not leak onto the next probe.
                        if let Err(clear_err) = self.injector.clear(&self.config.env.interface) {
                            warn!(error = %clear_err, "clear after failed apply also failed");
                        }
                        return (impairment_failure(spec, started_at, &e), false);
                    }
                }
            }
            None => None,
        };

        let mut cancel = self.cancel.clone();
        tokio::select! {
            result = self.runner.run(spec) => (result, false),
            _ = wait_cancelled(&mut cancel) => {
                warn!(probe = %spec.id, "probe interrupted by cancellation");
                (interrupted_result(spec, started_at), true)
            }
        }
        // guard drops here, clearing the impairment on every path
    }

    async fn bring_up(&self) -> Result<(), EnvError> {
        let env = &self.config.env;
        self.resources.ensure_network(&env.network)?;
        for spec in env.resource_specs() {
            self.resources.ensure_resource(&spec)?;
            self.resources.start(&spec.name)?;
        }
        self.wait_service_reachable().await
    }

    /// The readiness gate. Reused environments skip provisioning but never
    /// this: a down service aborts the run instead of failing every probe.
    async fn wait_service_reachable(&self) -> Result<(), EnvError> {
        let wait = self.config.env.reachability_timeout();
        if wait.is_zero() {
            return Ok(());
        }
        self.resources
            .wait_reachable(
                &self.config.env.server.name,
                &self.config.endpoint.address,
                self.config.endpoint.port,
                wait,
            )
            .await
    }

    /// Best-effort teardown. Failures are logged, never fatal; a run that
    /// produced results must still report them.
    fn teardown(&self) {
        if self.config.keep_env {
            info!("keeping environment as requested");
            return;
        }
        for spec in self.config.env.resource_specs() {
            if let Err(e) = self.resources.stop(&spec.name) {
                warn!(name = %spec.name, error = %e, "stop failed during teardown");
            }
            if let Err(e) = self.resources.delete(&spec.name) {
                warn!(name = %spec.name, error = %e, "delete failed during teardown");
            }
        }
    }
}

/// Resolves once the cancel flag is observed true; pends forever otherwise,
/// including after the sender is gone.
async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn impairment_failure(
    spec: &ProbeSpec,
    started_at: DateTime<Utc>,
    err: &ImpairmentError,
) -> ProbeResult {
    ProbeResult {
        probe_id: spec.id.clone(),
        category: spec.category,
        started_at,
        finished_at: Utc::now(),
        status: ProbeStatus::Failed,
        measurements: Measurements::default(),
        failure_reason: Some(format!("impairment setup failed: {err}")),
    }
}

fn interrupted_result(spec: &ProbeSpec, started_at: DateTime<Utc>) -> ProbeResult {
    ProbeResult {
        probe_id: spec.id.clone(),
        category: spec.category,
        started_at,
        finished_at: Utc::now(),
        status: ProbeStatus::Error,
        measurements: Measurements::default(),
        failure_reason: Some("cancelled while in flight".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(overall: RunStatus, cancelled: bool, env_failed: bool) -> RunOutcome {
        let mut summary = RunSummary::build("run_x".into(), Utc::now(), vec![], None, false);
        summary.overall = overall;
        RunOutcome {
            summary,
            phase: if overall == RunStatus::Aborted {
                RunPhase::Aborted
            } else {
                RunPhase::Done
            },
            cancelled,
            env_failed,
        }
    }

    #[test]
    fn exit_codes_cover_the_four_outcomes() {
        assert_eq!(exit_code(&outcome(RunStatus::Passed, false, false)), 0);
        assert_eq!(exit_code(&outcome(RunStatus::Failed, false, false)), 1);
        assert_eq!(exit_code(&outcome(RunStatus::Aborted, false, true)), 2);
        assert_eq!(exit_code(&outcome(RunStatus::Aborted, true, false)), 3);
    }
}
