//! Conservative strategy: leaves only, never over-downloads (§4.5.1).

use vmrkl_core::shape::Shape;
use vmrkl_merkle::State;

use crate::select::{select_and_dispatch, StrategyParams};
use crate::strategy::Strategy;
use crate::task::{NodeDownloadTask, SchedulingTarget};

/// Only consolidates into an internal node when doing so covers exactly
/// the required chunks with no waste; otherwise falls back to one task
/// per leaf. No prefetch.
#[derive(Debug, Default, Clone, Copy)]
pub struct Conservative;

impl Strategy for Conservative {
    fn schedule_downloads(
        &self,
        offset: u64,
        length: u64,
        shape: &Shape,
        state: &State,
        target: &dyn SchedulingTarget,
    ) -> Vec<NodeDownloadTask> {
        let params = StrategyParams {
            efficiency_threshold: 1.0,
            min_internal_chunks: 1,
            prefetch_margin: 0,
            max_depth: None,
        };
        select_and_dispatch(&params, offset, length, shape, state, target)
    }

    fn name(&self) -> &'static str {
        "conservative"
    }
}
