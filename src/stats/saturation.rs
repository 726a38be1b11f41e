//! Saturation Detection
//!
//! Grounded theory's "no new codes emerging" criterion: compare consecutive
//! codebook snapshots by normalized code name and signal saturation once
//! growth stays below a threshold for enough consecutive steps. Pure over
//! the snapshot sequence, with no state beyond the tunables.

use serde::{Deserialize, Serialize};

use crate::constants::saturation as defaults;
use crate::types::Codebook;

/// Tunables for saturation detection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SaturationConfig {
    /// Growth rate below which a step counts toward saturation.
    pub growth_threshold: f64,
    /// Consecutive below-threshold steps required to signal saturation.
    pub consecutive_steps: usize,
}

impl Default for SaturationConfig {
    fn default() -> Self {
        Self {
            growth_threshold: defaults::GROWTH_THRESHOLD,
            consecutive_steps: defaults::CONSECUTIVE_STEPS,
        }
    }
}

/// Per-step saturation record: how many genuinely new codes one document
/// (or batch) contributed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaturationSignal {
    /// Codebook version the step produced.
    pub version: u64,
    pub new_code_count: usize,
    pub growth_rate: f64,
    /// Whether this step counted toward the consecutive run.
    pub below_threshold: bool,
    /// Whether saturation is signaled as of this step.
    pub saturated: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SaturationDetector {
    config: SaturationConfig,
}

impl SaturationDetector {
    pub fn new(config: SaturationConfig) -> Self {
        Self { config }
    }

    /// Compare one snapshot step. An empty previous codebook is always
    /// unsaturated (there is nothing to grow from yet).
    pub fn step(&self, previous: &Codebook, current: &Codebook, consecutive_below: usize) -> SaturationSignal {
        let prev_names = previous.active_name_set();
        let curr_names = current.active_name_set();
        let new_code_count = curr_names.difference(&prev_names).count();

        if prev_names.is_empty() {
            return SaturationSignal {
                version: current.version,
                new_code_count,
                growth_rate: f64::INFINITY,
                below_threshold: false,
                saturated: false,
            };
        }

        let growth_rate = new_code_count as f64 / prev_names.len() as f64;
        let below = growth_rate < self.config.growth_threshold;
        let run = if below { consecutive_below + 1 } else { 0 };
        SaturationSignal {
            version: current.version,
            new_code_count,
            growth_rate,
            below_threshold: below,
            saturated: run >= self.config.consecutive_steps,
        }
    }

    /// Evaluate a whole snapshot sequence (version-ordered). Returns one
    /// signal per consecutive pair; the last signal's `saturated` flag is the
    /// verdict for the sequence.
    pub fn evaluate(&self, snapshots: &[Codebook]) -> Vec<SaturationSignal> {
        let mut signals = Vec::new();
        let mut run = 0usize;
        for pair in snapshots.windows(2) {
            let signal = self.step(&pair[0], &pair[1], run);
            run = if signal.below_threshold { run + 1 } else { 0 };
            signals.push(signal);
        }
        signals
    }

    /// Continue a running count across documents (constant comparison).
    /// Returns the updated consecutive count alongside the signal.
    pub fn advance(
        &self,
        previous: &Codebook,
        current: &Codebook,
        consecutive_below: usize,
    ) -> (SaturationSignal, usize) {
        let signal = self.step(previous, current, consecutive_below);
        let run = if signal.below_threshold {
            consecutive_below + 1
        } else {
            0
        };
        (signal, run)
    }
}

// =============================================================================
// Tests
// =============================================================================
