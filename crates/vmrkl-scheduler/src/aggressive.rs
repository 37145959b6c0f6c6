//! Aggressive strategy: broad consolidation, generous prefetch, used
//! unconditionally by `prebuffer` (§4.5.1, §4.6).

use vmrkl_core::shape::Shape;
use vmrkl_merkle::State;

use crate::select::{select_and_dispatch, StrategyParams};
use crate::strategy::Strategy;
use crate::task::{NodeDownloadTask, SchedulingTarget};

/// Consolidates internal nodes spanning at least 2 chunks at 30%+
/// efficiency, and prefetches two extra chunks on each side. Tolerates up
/// to 70% over-download in exchange for fewer round trips.
#[derive(Debug, Default, Clone, Copy)]
pub struct Aggressive;

impl Strategy for Aggressive {
    fn schedule_downloads(
        &self,
        offset: u64,
        length: u64,
        shape: &Shape,
        state: &State,
        target: &dyn SchedulingTarget,
    ) -> Vec<NodeDownloadTask> {
        let params = StrategyParams {
            efficiency_threshold: 0.30,
            min_internal_chunks: 2,
            prefetch_margin: 2,
            max_depth: None,
        };
        select_and_dispatch(&params, offset, length, shape, state, target)
    }

    fn name(&self) -> &'static str {
        "aggressive"
    }
}
