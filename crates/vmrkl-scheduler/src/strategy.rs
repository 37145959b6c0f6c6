//! The strategy trait shared by the four concrete policies (§4.5.1, §9).

use vmrkl_core::shape::Shape;
use vmrkl_merkle::State;

use crate::task::{NodeDownloadTask, SchedulingTarget};

/// A pluggable decision function: given a read request and the current
/// validity bitmap, choose which tree nodes to fetch.
///
/// Implementations share the selection skeleton in [`crate::select`] and
/// differ only in the [`crate::select::StrategyParams`] they hand it.
pub trait Strategy: Send + Sync {
    /// Select and dispatch the nodes needed to cover `[offset,
    /// offset+length)`, returning every task so the caller can filter and
    /// await the ones covering its own missing chunks.
    fn schedule_downloads(
        &self,
        offset: u64,
        length: u64,
        shape: &Shape,
        state: &State,
        target: &dyn SchedulingTarget,
    ) -> Vec<NodeDownloadTask>;

    /// A short, stable name for logging and diagnostics.
    fn name(&self) -> &'static str;

    /// Feed back whether the read that just completed found all its
    /// chunks already valid (`true`) or had to wait on a fetch (`false`).
    /// Every strategy but [`crate::Adaptive`] ignores this.
    fn observe_outcome(&self, _hit: bool) {}
}
