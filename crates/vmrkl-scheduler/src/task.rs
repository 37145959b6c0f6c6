//! The unit of scheduled work, and the dedup/enqueue contract a scheduler
//! strategy drives (§4.5).

use vmrkl_core::future::SharedChunkFuture;

/// A single node's worth of download work: which node, its byte span, and
/// the shared future that every reader racing for that node's chunks
/// awaits.
#[derive(Clone, Debug)]
pub struct NodeDownloadTask {
    /// Index of the node (leaf or internal) this task covers.
    pub node_index: u64,
    /// Starting byte offset of the node's (clipped) byte range.
    pub byte_offset: u64,
    /// Length in bytes of the node's (clipped) byte range.
    pub byte_length: u64,
    /// Whether `node_index` is a leaf (vs. an internal, consolidated node).
    pub is_leaf: bool,
    /// The node's clipped leaf range in chunk-index space, `[a, b)`.
    pub leaf_range: (u64, u64),
}

impl NodeDownloadTask {
    /// The half-open chunk-index range `[a, b)` this task covers. Alias
    /// for [`Self::leaf_range`] at the call sites that think in chunks
    /// rather than tree leaves.
    #[must_use]
    pub const fn chunk_range(&self) -> (u64, u64) {
        self.leaf_range
    }
}

/// The collaborator a [`crate::Strategy`] drives: somewhere to enqueue
/// tasks for execution, and a dedup point so two strategies (or two
/// concurrent reads) racing for the same node share one fetch.
pub trait SchedulingTarget: Send + Sync {
    /// Enqueue `task` for execution by the dispatcher's worker pool.
    /// Callers must only invoke this when [`Self::get_or_create_future`]
    /// reports that it created a new entry for `task.node_index` — that
    /// is the single dedup point, not this method.
    fn offer_task(&self, task: NodeDownloadTask);

    /// Return the shared future tracking `node_index`'s fetch, creating
    /// and registering a new one if none is in flight. Concurrent callers
    /// racing on the same `node_index` must observe the same future. The
    /// `bool` is `true` exactly when this call created the entry — the
    /// caller that gets `true` is the one responsible for calling
    /// [`Self::offer_task`]; every other racing caller must not.
    fn get_or_create_future(&self, node_index: u64) -> (SharedChunkFuture, bool);
}
