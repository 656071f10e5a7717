//! Built-in probe catalog.
//!
//! The functional suite exercises protocol correctness; the performance suite
//! sweeps file size, block size, concurrency, and network conditions. Probes
//! run in declaration order and the order here is stable across runs.

use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use steprig_common::{
    Expectation, ImpairmentSpec, ProbeCategory, ProbeSpec,
};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * 1024;

/// Default block size the original service hands out; fixture sizes in the
/// catalog are chosen relative to it.
const DEFAULT_BLOCK: u64 = 20480;

/// Which suites a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SuiteSelection {
    Functional,
    Performance,
    All,
}

impl SuiteSelection {
    pub fn includes_functional(self) -> bool {
        matches!(self, SuiteSelection::Functional | SuiteSelection::All)
    }

    pub fn includes_performance(self) -> bool {
        matches!(self, SuiteSelection::Performance | SuiteSelection::All)
    }
}

fn probe(id: &str, category: ProbeCategory, file_size: u64) -> ProbeSpec {
    ProbeSpec {
        id: id.into(),
        category,
        file_size,
        block_size: DEFAULT_BLOCK,
        concurrency: 1,
        timeout: Duration::from_secs(300),
        impairment: None,
        expect: Expectation::Accept,
        repeat_upload: false,
        username: None,
    }
}

/// The functional suite, in execution order.
pub fn functional() -> Vec<ProbeSpec> {
    let mut a5 = probe("A5-auth-error", ProbeCategory::Functional, KIB);
    a5.expect = Expectation::RejectAuth;
    a5.username = Some("intruder".into());

    let mut a4 = probe("A4-repeat-upload", ProbeCategory::Functional, MIB);
    a4.repeat_upload = true;

    let mut a6 = probe("A6-corrupt-block", ProbeCategory::Functional, MIB);
    a6.expect = Expectation::DetectCorruption;

    vec![
        probe("A1-baseline", ProbeCategory::Functional, 10 * MIB),
        probe("A2-empty-file", ProbeCategory::Functional, 0),
        probe("A2-one-byte", ProbeCategory::Functional, 1),
        // one full block plus a one-byte tail
        probe("A3-tail-block", ProbeCategory::Functional, DEFAULT_BLOCK + 1),
        a4,
        a5,
        a6,
    ]
}

/// The performance suite, in execution order.
pub fn performance() -> Vec<ProbeSpec> {
    let mut probes = Vec::new();

    // C1: file-size sweep.
    for (label, size) in [
        ("1k", KIB),
        ("100k", 100 * KIB),
        ("1m", MIB),
        ("10m", 10 * MIB),
    ] {
        probes.push(probe(
            &format!("C1-size-{label}"),
            ProbeCategory::Performance,
            size,
        ));
    }

    // C2: block-size sensitivity over a fixed payload.
    for (label, block) in [("4k", 4 * KIB), ("64k", 64 * KIB), ("256k", 256 * KIB)] {
        let mut p = probe(&format!("C2-block-{label}"), ProbeCategory::Performance, MIB);
        p.block_size = block;
        probes.push(p);
    }

    // C3: concurrent sessions.
    for n in [1u32, 2, 4] {
        let mut p = probe(&format!("C3-conc-{n}"), ProbeCategory::Performance, MIB);
        p.concurrency = n;
        probes.push(p);
    }

    // C4: network conditions. The baseline runs unshaped for comparison.
    probes.push(probe("C4-baseline", ProbeCategory::Performance, MIB));
    for (label, impairment) in [
        ("rate-1mbit", ImpairmentSpec::Rate { kbit: 1000 }),
        ("delay-200ms", ImpairmentSpec::Delay { ms: 200 }),
        ("loss-10pct", ImpairmentSpec::Loss { percent: 10.0 }),
    ] {
        let mut p = probe(&format!("C4-{label}"), ProbeCategory::Performance, MIB);
        p.impairment = Some(impairment);
        p.timeout = Duration::from_secs(600);
        probes.push(p);
    }

    probes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_builtin_probe_validates() {
        for p in functional().iter().chain(performance().iter()) {
            p.validate().unwrap_or_else(|e| panic!("{e}"));
        }
    }

    #[test]
    fn probe_ids_are_unique() {
        let mut ids: Vec<String> = functional()
            .into_iter()
            .chain(performance())
            .map(|p| p.id)
            .collect();
        let before = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), before);
    }

    #[test]
    fn functional_suite_declares_the_expected_order() {
        let ids: Vec<String> = functional().into_iter().map(|p| p.id).collect();
        assert_eq!(ids[0], "A1-baseline");
        assert_eq!(ids.last().unwrap(), "A6-corrupt-block");
    }

    #[test]
    fn only_c4_probes_declare_impairment() {
        for p in functional() {
            assert!(p.impairment.is_none(), "{}", p.id);
        }
        for p in performance() {
            assert_eq!(p.impairment.is_some(), p.id.starts_with("C4-") && p.id != "C4-baseline");
        }
    }
}
