//! Adaptive strategy: the only stateful one. Tracks a rolling hit rate
//! and interpolates its thresholds between [`crate::Conservative`] and
//! [`crate::Aggressive`]'s bounds (§4.5.1, §9).
//!
//! Tuning state (the rolling hit rate) lives only for the lifetime of
//! the owning channel; it is never persisted across restarts (§9 open
//! question: "Adaptive scheduler tuning parameters... a port may
//! reasonably pick defaults and expose them as tunables").

use parking_lot::Mutex;
use vmrkl_core::shape::Shape;
use vmrkl_merkle::State;

use crate::select::{select_and_dispatch, StrategyParams};
use crate::strategy::Strategy;
use crate::task::{NodeDownloadTask, SchedulingTarget};

const CONSERVATIVE_THRESHOLD: f64 = 1.0;
const AGGRESSIVE_THRESHOLD: f64 = 0.30;
const CONSERVATIVE_MIN_CHUNKS: f64 = 1.0;
const AGGRESSIVE_MIN_CHUNKS: f64 = 2.0;
const CONSERVATIVE_PREFETCH: f64 = 0.0;
const AGGRESSIVE_PREFETCH: f64 = 2.0;

/// Exponential-moving-average smoothing factor applied to each observed
/// hit/miss outcome.
const EWMA_ALPHA: f64 = 0.2;

/// Interpolates between Conservative's and Aggressive's thresholds based
/// on a rolling hit-rate estimate: a string of misses (working through a
/// cold cache, or a sequential scan) pushes thresholds toward Aggressive;
/// a string of hits (the cache is mostly warm) relaxes back toward
/// Conservative's minimal-waste behavior.
#[derive(Debug)]
pub struct Adaptive {
    hit_rate: Mutex<f64>,
}

impl Default for Adaptive {
    fn default() -> Self {
        Self {
            // Start at the midpoint: neither assume a cold nor a warm cache.
            hit_rate: Mutex::new(0.5),
        }
    }
}

impl Adaptive {
    /// Build a fresh adaptive scheduler with a neutral initial hit-rate
    /// estimate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn current_params(&self) -> StrategyParams {
        let hit_rate = *self.hit_rate.lock();
        // hit_rate == 1.0 -> fully conservative; hit_rate == 0.0 -> fully
        // aggressive.
        StrategyParams {
            efficiency_threshold: lerp(AGGRESSIVE_THRESHOLD, CONSERVATIVE_THRESHOLD, hit_rate),
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            min_internal_chunks: lerp(
                AGGRESSIVE_MIN_CHUNKS,
                CONSERVATIVE_MIN_CHUNKS,
                hit_rate,
            )
            .round() as u64,
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            prefetch_margin: lerp(AGGRESSIVE_PREFETCH, CONSERVATIVE_PREFETCH, hit_rate).round()
                as u64,
            max_depth: None,
        }
    }
}

fn lerp(at_zero: f64, at_one: f64, t: f64) -> f64 {
    at_zero + (at_one - at_zero) * t
}

impl Strategy for Adaptive {
    fn schedule_downloads(
        &self,
        offset: u64,
        length: u64,
        shape: &Shape,
        state: &State,
        target: &dyn SchedulingTarget,
    ) -> Vec<NodeDownloadTask> {
        let params = self.current_params();
        select_and_dispatch(&params, offset, length, shape, state, target)
    }

    fn name(&self) -> &'static str {
        "adaptive"
    }

    fn observe_outcome(&self, hit: bool) {
        let mut rate = self.hit_rate.lock();
        let sample = if hit { 1.0 } else { 0.0 };
        *rate = *rate * (1.0 - EWMA_ALPHA) + sample * EWMA_ALPHA;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_misses_drive_toward_aggressive_bounds() {
        let adaptive = Adaptive::new();
        for _ in 0..50 {
            adaptive.observe_outcome(false);
        }
        let params = adaptive.current_params();
        assert!(params.efficiency_threshold < 0.5);
        assert!(params.prefetch_margin >= 1);
    }

    #[test]
    fn repeated_hits_drive_toward_conservative_bounds() {
        let adaptive = Adaptive::new();
        for _ in 0..50 {
            adaptive.observe_outcome(true);
        }
        let params = adaptive.current_params();
        assert!(params.efficiency_threshold > 0.9);
        assert_eq!(params.prefetch_margin, 0);
    }
}
