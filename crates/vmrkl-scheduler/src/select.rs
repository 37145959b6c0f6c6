//! The selection skeleton shared by every strategy (§4.5.1): compute the
//! required chunk set, consider internal-node consolidation candidates,
//! greedily pick the useful ones, and fall back to individual leaves for
//! whatever's left.

use std::collections::BTreeSet;

use tracing::trace;
use vmrkl_merkle::State;
use vmrkl_core::shape::Shape;

use crate::task::{NodeDownloadTask, SchedulingTarget};

/// Tunables that distinguish one strategy from another; see the strategy
/// table in §4.5.1.
#[derive(Clone, Copy, Debug)]
pub struct StrategyParams {
    /// Minimum `required_covered / invalid_covered` ratio for an internal
    /// node to be considered instead of its constituent leaves.
    pub efficiency_threshold: f64,
    /// Minimum number of chunks an internal node must span to be worth
    /// consolidating (below this, per-leaf tasks are just as cheap).
    pub min_internal_chunks: u64,
    /// Extra chunks pulled in on each side of the requested range,
    /// speculatively, when not yet valid.
    pub prefetch_margin: u64,
    /// Maximum tree depth (root = level 0) at which internal-node
    /// candidates are considered. `None` means no cap beyond the tree's
    /// own height.
    pub max_depth: Option<u64>,
}

struct Candidate {
    node: u64,
    required_covered: u64,
    efficiency: f64,
}

/// Run the common selection skeleton for `[offset, offset+length)` and
/// dispatch the resulting tasks through `target`, returning the full set
/// of tasks a caller can filter and await.
pub fn select_and_dispatch(
    params: &StrategyParams,
    offset: u64,
    length: u64,
    shape: &Shape,
    state: &State,
    target: &dyn SchedulingTarget,
) -> Vec<NodeDownloadTask> {
    if length == 0 || offset >= shape.total_size() {
        return Vec::new();
    }
    let end = offset.saturating_add(length).min(shape.total_size());
    let Ok(first_chunk) = shape.chunk_index_for_position(offset) else {
        return Vec::new();
    };
    let Ok(last_chunk) = shape.chunk_index_for_position(end - 1) else {
        return Vec::new();
    };

    let mut pending: BTreeSet<u64> = (first_chunk..=last_chunk)
        .filter(|&k| !state.is_valid(k))
        .collect();

    expand_with_prefetch(&mut pending, params.prefetch_margin, shape, state);

    if pending.is_empty() {
        return Vec::new();
    }

    let candidates = enumerate_candidates(shape, state, &pending, params);
    let mut selected_nodes: Vec<u64> = Vec::new();

    for candidate in candidates {
        let (a, b) = shape.leaf_range_for_node(candidate.node);
        let still_needed: Vec<u64> = (a..b).filter(|k| pending.contains(k)).collect();
        if still_needed.is_empty() {
            continue;
        }
        trace!(
            node = candidate.node,
            required_covered = candidate.required_covered,
            efficiency = candidate.efficiency,
            "consolidating into internal node"
        );
        selected_nodes.push(candidate.node);
        for k in still_needed {
            pending.remove(&k);
        }
    }

    for k in pending {
        if let Ok(leaf) = shape.chunk_index_to_leaf_node(k) {
            selected_nodes.push(leaf);
        }
    }

    selected_nodes
        .into_iter()
        .map(|node| build_task(shape, target, node))
        .collect()
}

fn expand_with_prefetch(
    pending: &mut BTreeSet<u64>,
    margin: u64,
    shape: &Shape,
    state: &State,
) {
    if margin == 0 {
        return;
    }
    let (Some(&lo), Some(&hi)) = (pending.first(), pending.last()) else {
        return;
    };

    let expand_lo = lo.saturating_sub(margin);
    let expand_hi = (hi + margin).min(shape.leaf_count().saturating_sub(1));

    for k in expand_lo..=expand_hi {
        if k < shape.leaf_count() && !state.is_valid(k) {
            pending.insert(k);
        }
    }
}

fn enumerate_candidates(
    shape: &Shape,
    state: &State,
    pending: &BTreeSet<u64>,
    params: &StrategyParams,
) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    for node in 0..shape.internal_node_count() {
        if let Some(max_depth) = params.max_depth {
            if node_level(node) > max_depth {
                continue;
            }
        }
        let (a, b) = shape.leaf_range_for_node(node);
        if a >= b {
            continue;
        }
        let span = b - a;
        if span < params.min_internal_chunks {
            continue;
        }
        let invalid_covered = (a..b).filter(|k| !state.is_valid(*k)).count() as u64;
        if invalid_covered == 0 {
            continue;
        }
        let required_covered = (a..b).filter(|k| pending.contains(k)).count() as u64;
        if required_covered == 0 {
            continue;
        }
        #[allow(clippy::cast_precision_loss)]
        let efficiency = required_covered as f64 / invalid_covered as f64;
        if efficiency < params.efficiency_threshold {
            continue;
        }
        candidates.push(Candidate {
            node,
            required_covered,
            efficiency,
        });
    }

    candidates.sort_by(|a, b| {
        b.required_covered
            .cmp(&a.required_covered)
            .then(b.efficiency.total_cmp(&a.efficiency))
    });
    candidates
}

fn build_task(shape: &Shape, target: &dyn SchedulingTarget, node: u64) -> NodeDownloadTask {
    let leaf_range = shape.leaf_range_for_node(node);
    let (byte_offset, byte_end) = shape.byte_range_for_node(node);
    let task = NodeDownloadTask {
        node_index: node,
        byte_offset,
        byte_length: byte_end - byte_offset,
        is_leaf: shape.is_leaf_node(node),
        leaf_range,
    };
    // get_or_create_future is the single dedup point: only the caller
    // that actually creates the entry may offer the task for execution,
    // so two concurrent selections of the same node spawn exactly one.
    let (_future, created) = target.get_or_create_future(node);
    if created {
        target.offer_task(task.clone());
    }
    task
}

/// Zero-indexed tree level of `node` in heap order (root is level `0`).
const fn node_level(node: u64) -> u64 {
    let n_plus_one = node + 1;
    63 - n_plus_one.leading_zeros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use vmrkl_core::hash::hash_leaf;
    use vmrkl_merkle::Reference;

    struct RecordingTarget {
        offered: Mutex<Vec<u64>>,
        seen: Mutex<std::collections::HashSet<u64>>,
    }

    impl SchedulingTarget for RecordingTarget {
        fn offer_task(&self, task: NodeDownloadTask) {
            self.offered.lock().unwrap().push(task.node_index);
        }

        fn get_or_create_future(
            &self,
            node_index: u64,
        ) -> (vmrkl_core::future::SharedChunkFuture, bool) {
            use futures::FutureExt;
            let created = self.seen.lock().unwrap().insert(node_index);
            (futures::future::ready(Ok(())).boxed().shared(), created)
        }
    }

    fn sample(leaf_count: u64) -> (Shape, State) {
        let shape = Shape::new(leaf_count * 1024, 1024).unwrap();
        let leaves: Vec<_> = (0..leaf_count).map(|i| hash_leaf(&[i as u8])).collect();
        let reference = Reference::from_leaf_hashes(shape, leaves).unwrap();
        let state = State::from_reference(&reference, "unused.mrkl");
        (shape, state)
    }

    #[test]
    fn conservative_params_consolidate_when_exactly_covering() {
        let (shape, state) = sample(8);
        let params = StrategyParams {
            efficiency_threshold: 1.0,
            min_internal_chunks: 1,
            prefetch_margin: 0,
            max_depth: None,
        };
        let target = RecordingTarget {
            offered: Mutex::new(Vec::new()),
            seen: Mutex::new(std::collections::HashSet::new()),
        };
        let tasks = select_and_dispatch(&params, 0, 8 * 1024, &shape, &state, &target);
        // The root spans all 8 chunks with perfect efficiency (all invalid,
        // all required), so even the conservative threshold of 1.0 accepts
        // it as a single consolidated task.
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].node_index, 0);
    }

    #[test]
    fn partially_valid_file_still_covers_every_missing_chunk() {
        let (shape, state) = sample(4);
        state.mark_valid(0);
        state.mark_valid(1);
        let params = StrategyParams {
            efficiency_threshold: 1.0,
            min_internal_chunks: 1,
            prefetch_margin: 0,
            max_depth: None,
        };
        let target = RecordingTarget {
            offered: Mutex::new(Vec::new()),
            seen: Mutex::new(std::collections::HashSet::new()),
        };
        let tasks = select_and_dispatch(&params, 0, 4 * 1024, &shape, &state, &target);
        let mut covered = BTreeSet::new();
        for t in &tasks {
            let (a, b) = t.leaf_range;
            for k in a..b {
                covered.insert(k);
            }
        }
        // Every chunk that was invalid before scheduling must end up
        // covered by some task; a consolidated internal node may also
        // span already-valid neighbors (over-download is a property the
        // dispatcher tolerates, not the scheduler's job to prevent).
        assert!(covered.contains(&2));
        assert!(covered.contains(&3));
    }

    #[test]
    fn high_threshold_rejects_consolidation_with_unrelated_invalid_neighbor() {
        let (shape, state) = sample(8);
        // Chunks 4 and 6 are invalid, but only chunk 4 is being requested.
        // A node spanning [4, 8) would pull in chunk 6 (invalid, but not
        // part of this request) alongside chunk 4, diluting efficiency
        // below the conservative threshold; the narrower node spanning
        // just [4, 6) keeps efficiency at 1.0 and should win instead.
        for k in [0u64, 1, 2, 3, 5, 7] {
            state.mark_valid(k);
        }
        let params = StrategyParams {
            efficiency_threshold: 1.0,
            min_internal_chunks: 2,
            prefetch_margin: 0,
            max_depth: None,
        };
        let target = RecordingTarget {
            offered: Mutex::new(Vec::new()),
            seen: Mutex::new(std::collections::HashSet::new()),
        };
        let tasks = select_and_dispatch(&params, 4 * 1024, 1024, &shape, &state, &target);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].leaf_range, (4, 6));
    }

    #[test]
    fn nothing_scheduled_when_everything_already_valid() {
        let (shape, state) = sample(4);
        for k in 0..4 {
            state.mark_valid(k);
        }
        let params = StrategyParams {
            efficiency_threshold: 1.0,
            min_internal_chunks: 1,
            prefetch_margin: 0,
            max_depth: None,
        };
        let target = RecordingTarget {
            offered: Mutex::new(Vec::new()),
            seen: Mutex::new(std::collections::HashSet::new()),
        };
        let tasks = select_and_dispatch(&params, 0, 4 * 1024, &shape, &state, &target);
        assert!(tasks.is_empty());
    }

    #[test]
    fn last_real_chunk_never_yields_virtual_leaf_tasks() {
        let (shape, state) = sample(5);
        let params = StrategyParams {
            efficiency_threshold: 0.3,
            min_internal_chunks: 2,
            prefetch_margin: 0,
            max_depth: None,
        };
        let target = RecordingTarget {
            offered: Mutex::new(Vec::new()),
            seen: Mutex::new(std::collections::HashSet::new()),
        };
        let tasks = select_and_dispatch(&params, 4 * 1024, 1024, &shape, &state, &target);
        for t in &tasks {
            let (a, b) = t.leaf_range;
            assert_eq!((a, b), (4, 5));
        }
    }
}
