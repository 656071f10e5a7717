//! Network impairment descriptions.
//!
//! At most one spec is active per interface at any time. Applying a new one
//! always clears the previous one first — impairments never stack, so a
//! probe's network conditions are exactly what its spec says.

use serde::{Deserialize, Serialize};

/// A single deliberate degradation of a network path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImpairmentSpec {
    /// Random packet loss.
    Loss { percent: f32 },
    /// Added one-way delay.
    Delay { ms: u32 },
    /// Bandwidth cap.
    Rate { kbit: u64 },
}

impl std::fmt::Display for ImpairmentSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImpairmentSpec::Loss { percent } => write!(f, "loss {percent}%"),
            ImpairmentSpec::Delay { ms } => write!(f, "delay {ms}ms"),
            ImpairmentSpec::Rate { kbit } => write!(f, "rate {kbit}kbit"),
        }
    }
}
