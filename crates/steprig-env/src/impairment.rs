//! Network impairment via `tc netem`.
//!
//! Applies a single [`ImpairmentSpec`] to a named interface and guarantees
//! its removal. Any existing root qdisc is removed before a new one is
//! installed, so impairments never stack and a probe's network conditions
//! are exactly what its spec says.

use std::sync::Arc;

use steprig_common::{ImpairmentError, ImpairmentSpec};
use tracing::{debug, warn};

use crate::cmd::{stderr_of, CommandRunner};

/// Thin typed wrapper over the `tc` qdisc command set.
pub struct FaultInjector {
    runner: Arc<dyn CommandRunner>,
}

impl FaultInjector {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Clear any existing impairment on `interface`, then apply `spec`.
    pub fn apply(&self, interface: &str, spec: ImpairmentSpec) -> Result<(), ImpairmentError> {
        // Pre-clear: a leftover qdisc from a previous run must never stack.
        self.clear(interface)?;

        let mut args: Vec<String> = vec![
            "qdisc".into(),
            "add".into(),
            "dev".into(),
            interface.into(),
            "root".into(),
            "netem".into(),
        ];
        match spec {
            ImpairmentSpec::Loss { percent } => {
                args.push("loss".into());
                args.push(format!("{percent}%"));
            }
            ImpairmentSpec::Delay { ms } => {
                args.push("delay".into());
                args.push(format!("{ms}ms"));
            }
            ImpairmentSpec::Rate { kbit } => {
                args.push("rate".into());
                args.push(format!("{kbit}kbit"));
            }
        }

        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let output = self
            .runner
            .run("tc", &arg_refs)
            .map_err(|e| ImpairmentError::Unsupported(e.to_string()))?;

        if !output.status.success() {
            return Err(classify_tc_failure(interface, &stderr_of(&output)));
        }

        debug!(interface, %spec, "impairment applied");
        Ok(())
    }

    /// Remove any impairment on `interface`. "Nothing to clear" is success.
    pub fn clear(&self, interface: &str) -> Result<(), ImpairmentError> {
        let output = self
            .runner
            .run("tc", &["qdisc", "del", "dev", interface, "root"])
            .map_err(|e| ImpairmentError::Unsupported(e.to_string()))?;

        if output.status.success() {
            debug!(interface, "impairment cleared");
            return Ok(());
        }

        let stderr = stderr_of(&output);
        if is_nothing_to_clear(&stderr) {
            return Ok(());
        }
        Err(classify_tc_failure(interface, &stderr))
    }

    /// The currently active impairment, or `None` for an unshaped interface.
    pub fn current_state(
        &self,
        interface: &str,
    ) -> Result<Option<ImpairmentSpec>, ImpairmentError> {
        let output = self
            .runner
            .run("tc", &["qdisc", "show", "dev", interface])
            .map_err(|e| ImpairmentError::Unsupported(e.to_string()))?;

        if !output.status.success() {
            return Err(classify_tc_failure(interface, &stderr_of(&output)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_qdisc_show(&stdout))
    }

    /// Apply `spec` and return a guard that clears it when dropped.
    ///
    /// This is the only way the orchestrator shapes the path: the guard's
    /// drop runs on every exit path of the wrapped probe, including panics,
    /// timeouts, and cancellation.
    pub fn inject<'a>(
        &'a self,
        interface: &str,
        spec: ImpairmentSpec,
    ) -> Result<ImpairmentGuard<'a>, ImpairmentError> {
        self.apply(interface, spec)?;
        Ok(ImpairmentGuard {
            injector: self,
            interface: interface.to_string(),
            cleared: false,
        })
    }
}

/// Scoped impairment: clears the interface on drop.
pub struct ImpairmentGuard<'a> {
    injector: &'a FaultInjector,
    interface: String,
    cleared: bool,
}

impl ImpairmentGuard<'_> {
    /// Clear eagerly and surface the result instead of relying on drop.
    pub fn clear(mut self) -> Result<(), ImpairmentError> {
        self.cleared = true;
        self.injector.clear(&self.interface)
    }
}

impl Drop for ImpairmentGuard<'_> {
    fn drop(&mut self) {
        if self.cleared {
            return;
        }
        if let Err(e) = self.injector.clear(&self.interface) {
            warn!(interface = %self.interface, error = %e, "failed to clear impairment on drop");
        }
    }
}

/// netem replies "No such file or directory" (or, on newer iproute2,
/// "Invalid handle") when deleting a root qdisc that was never installed.
fn is_nothing_to_clear(stderr: &str) -> bool {
    stderr.contains("No such file or directory")
        || stderr.contains("Invalid handle")
        || stderr.contains("no current qdisc")
}

fn classify_tc_failure(interface: &str, stderr: &str) -> ImpairmentError {
    if stderr.contains("Cannot find device") {
        ImpairmentError::InterfaceNotFound(interface.to_string())
    } else if stderr.contains("qdisc kind is unknown")
        || stderr.contains("Specified qdisc kind is unknown")
        || stderr.contains("Operation not supported")
        || stderr.contains("command not found")
    {
        ImpairmentError::Unsupported(stderr.to_string())
    } else {
        ImpairmentError::Apply {
            interface: interface.to_string(),
            reason: stderr.to_string(),
        }
    }
}

/// Parse `tc qdisc show dev <if>` output back into a spec.
///
/// Example lines:
///   `qdisc netem 8001: root refcnt 2 limit 1000 loss 10%`
///   `qdisc netem 8002: root refcnt 2 limit 1000 delay 200ms`
///   `qdisc netem 8003: root refcnt 2 limit 1000 rate 1Mbit`
fn parse_qdisc_show(stdout: &str) -> Option<ImpairmentSpec> {
    let line = stdout.lines().find(|l| l.contains("netem"))?;
    let tokens: Vec<&str> = line.split_whitespace().collect();

    for (i, tok) in tokens.iter().enumerate() {
        let value = tokens.get(i + 1)?;
        match *tok {
            "loss" => {
                let percent = value.trim_end_matches('%').parse().ok()?;
                return Some(ImpairmentSpec::Loss { percent });
            }
            "delay" => {
                let ms = parse_time_ms(value)?;
                return Some(ImpairmentSpec::Delay { ms });
            }
            "rate" => {
                let kbit = parse_rate_kbit(value)?;
                return Some(ImpairmentSpec::Rate { kbit });
            }
            _ => {}
        }
    }
    None
}

fn parse_time_ms(value: &str) -> Option<u32> {
    if let Some(s) = value.strip_suffix("ms") {
        s.parse::<f64>().ok().map(|v| v.round() as u32)
    } else if let Some(s) = value.strip_suffix('s') {
        s.parse::<f64>().ok().map(|v| (v * 1000.0).round() as u32)
    } else {
        None
    }
}

fn parse_rate_kbit(value: &str) -> Option<u64> {
    let lower = value.to_ascii_lowercase();
    if let Some(s) = lower.strip_suffix("mbit") {
        s.parse::<f64>().ok().map(|v| (v * 1000.0).round() as u64)
    } else if let Some(s) = lower.strip_suffix("kbit") {
        s.parse::<f64>().ok().map(|v| v.round() as u64)
    } else if let Some(s) = lower.strip_suffix("bit") {
        s.parse::<f64>().ok().map(|v| (v / 1000.0).round() as u64)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::testing::ScriptedRunner;

    fn injector(script: Vec<(i32, &'static str, &'static str)>) -> (Arc<ScriptedRunner>, FaultInjector) {
        let runner = Arc::new(ScriptedRunner::new(script));
        (runner.clone(), FaultInjector::new(runner))
    }

    #[test]
    fn apply_preclears_then_installs_netem() {
        let (runner, inj) = injector(vec![
            (2, "", "Error: Cannot delete qdisc with handle of zero.\nNo such file or directory"),
            (0, "", ""),
        ]);

        inj.apply("vnet0", ImpairmentSpec::Loss { percent: 10.0 })
            .unwrap();

        let calls = runner.calls();
        assert_eq!(calls[0], "tc qdisc del dev vnet0 root");
        assert_eq!(calls[1], "tc qdisc add dev vnet0 root netem loss 10%");
    }

    #[test]
    fn clear_twice_is_idempotent() {
        let (_, inj) = injector(vec![
            (0, "", ""),
            (2, "", "RTNETLINK answers: No such file or directory"),
        ]);
        inj.clear("vnet0").unwrap();
        inj.clear("vnet0").unwrap();
    }

    #[test]
    fn missing_interface_is_a_distinct_error() {
        let (_, inj) = injector(vec![(1, "", "Cannot find device \"vnet9\"")]);
        let err = inj.clear("vnet9").unwrap_err();
        assert!(matches!(err, ImpairmentError::InterfaceNotFound(_)));
    }

    #[test]
    fn missing_netem_module_maps_to_unsupported() {
        let (_, inj) = injector(vec![
            (0, "", ""), // pre-clear
            (2, "", "Error: Specified qdisc kind is unknown."),
        ]);
        let err = inj
            .apply("vnet0", ImpairmentSpec::Delay { ms: 200 })
            .unwrap_err();
        assert!(matches!(err, ImpairmentError::Unsupported(_)));
    }

    #[test]
    fn current_state_round_trips_each_kind() {
        let (_, inj) = injector(vec![
            (0, "qdisc netem 8001: root refcnt 2 limit 1000 loss 10%\n", ""),
            (0, "qdisc netem 8002: root refcnt 2 limit 1000 delay 200ms\n", ""),
            (0, "qdisc netem 8003: root refcnt 2 limit 1000 rate 1Mbit\n", ""),
            (0, "qdisc noqueue 0: root refcnt 2\n", ""),
        ]);

        assert_eq!(
            inj.current_state("vnet0").unwrap(),
            Some(ImpairmentSpec::Loss { percent: 10.0 })
        );
        assert_eq!(
            inj.current_state("vnet0").unwrap(),
            Some(ImpairmentSpec::Delay { ms: 200 })
        );
        assert_eq!(
            inj.current_state("vnet0").unwrap(),
            Some(ImpairmentSpec::Rate { kbit: 1000 })
        );
        assert_eq!(inj.current_state("vnet0").unwrap(), None);
    }

    #[test]
    fn guard_clears_on_drop() {
        let (runner, inj) = injector(vec![]);
        {
            let _guard = inj
                .inject("vnet0", ImpairmentSpec::Rate { kbit: 1000 })
                .unwrap();
        }
        let calls = runner.calls();
        // pre-clear, add, clear-on-drop
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2], "tc qdisc del dev vnet0 root");
    }

    #[test]
    fn guard_clears_even_when_dropped_during_panic() {
        let (runner, inj) = injector(vec![]);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = inj
                .inject("vnet0", ImpairmentSpec::Loss { percent: 1.0 })
                .unwrap();
            panic!("probe blew up");
        }));
        assert!(result.is_err());
        assert_eq!(runner.calls().last().unwrap(), "tc qdisc del dev vnet0 root");
    }
}
