//! Default strategy: balanced consolidation with light sequential
//! prefetch (§4.5.1).

use vmrkl_core::shape::Shape;
use vmrkl_merkle::State;

use crate::select::{select_and_dispatch, StrategyParams};
use crate::strategy::Strategy;
use crate::task::{NodeDownloadTask, SchedulingTarget};

/// Consolidates internal nodes spanning at least 3 chunks at 60%+
/// efficiency, and pulls in one extra chunk on each side of the request
/// speculatively.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultStrategy;

impl Strategy for DefaultStrategy {
    fn schedule_downloads(
        &self,
        offset: u64,
        length: u64,
        shape: &Shape,
        state: &State,
        target: &dyn SchedulingTarget,
    ) -> Vec<NodeDownloadTask> {
        let params = StrategyParams {
            efficiency_threshold: 0.60,
            min_internal_chunks: 3,
            prefetch_margin: 1,
            max_depth: None,
        };
        select_and_dispatch(&params, offset, length, shape, state, target)
    }

    fn name(&self) -> &'static str {
        "default"
    }
}
