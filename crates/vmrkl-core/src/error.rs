//! Error taxonomy shared across the workspace (§7).
//!
//! Each variant corresponds to one row of the design's error table. Variants
//! carry enough context (operation, offending range or chunk, cause chain)
//! for a caller to diagnose without re-deriving state.

use std::fmt;
use std::sync::Arc;

/// Errors produced by pure geometry operations ([`crate::shape::Shape`]).
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// `chunk_size` is zero or not a power of two, or sizes don't make sense.
    #[error("invalid shape: {reason}")]
    InvalidShape {
        /// Human-readable description of what made the shape invalid.
        reason: String,
    },
    /// An index or position fell outside its valid bound.
    #[error("{what} {value} out of range (bound {bound})")]
    OutOfRange {
        /// Name of the quantity that was out of range.
        what: &'static str,
        /// The offending value.
        value: u64,
        /// The (exclusive) bound it should have respected.
        bound: u64,
    },
}

/// Convenience alias for geometry operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// A half-open byte range, used to annotate failures with the span that
/// triggered them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    /// Inclusive start offset.
    pub start: u64,
    /// Exclusive end offset.
    pub end: u64,
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// The workspace-wide error taxonomy for the verified channel (§7). Every
/// variant is one "kind" from the design's error table; `#[source]` chains
/// preserve the underlying cause for diagnosis.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// `chunkSize` not a positive power of two, or a negative/overflowing
    /// size was supplied at construction time.
    #[error("invalid shape: {0}")]
    InvalidShape(#[from] CoreError),

    /// Magic/version/checksum mismatch while loading a `.mref` file.
    #[error("corrupt reference file {path}: {reason}")]
    CorruptReference {
        /// Path of the offending `.mref` file.
        path: String,
        /// What specifically failed to validate.
        reason: String,
    },

    /// Magic/version/checksum mismatch while loading a `.mrkl` file.
    #[error("corrupt state file {path}: {reason}")]
    CorruptState {
        /// Path of the offending `.mrkl` file.
        path: String,
        /// What specifically failed to validate.
        reason: String,
    },

    /// The State's shape disagrees with the Reference's shape, or the
    /// Transport's reported size disagrees with the Reference's size.
    #[error("shape mismatch: {reason}")]
    ShapeMismatch {
        /// Description of which two shapes disagreed and how.
        reason: String,
    },

    /// Network/IO failure while fetching a byte range from the transport.
    #[error("transport error fetching {range} from {url}: {source}")]
    Transport {
        /// The remote artifact URL.
        url: String,
        /// The byte range that was being fetched.
        range: ByteRange,
        /// The underlying cause.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A fetched chunk's hash does not match the published Reference.
    #[error("integrity error: chunk {chunk_index} hash mismatch")]
    Integrity {
        /// The chunk index whose content failed verification.
        chunk_index: u64,
    },

    /// Post-await validity check found a required chunk still invalid
    /// after its covering task completed.
    #[error("read incomplete: chunk {chunk_index} still invalid after await")]
    ReadIncomplete {
        /// The chunk index that should have been covered but wasn't.
        chunk_index: u64,
    },

    /// [`prebuffer`](trait.Channel.html) completed its scheduled fetches but
    /// some required chunks are still invalid.
    #[error("prebuffer incomplete: {} chunk(s) still missing", missing.len())]
    PrebufferIncomplete {
        /// Chunk indices that remained invalid after the prebuffer await.
        missing: Vec<u64>,
    },

    /// The operation was issued after, or raced with, `close()`.
    #[error("channel is closed")]
    ChannelClosed,

    /// Request position was at or past the artifact's total size.
    #[error("position {position} is out of range (size {size})")]
    OutOfRange {
        /// The requested position.
        position: u64,
        /// The artifact's total size.
        size: u64,
    },

    /// Local filesystem I/O failure (opening/truncating/reading/writing the
    /// cache or state files).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error observed by another reader racing for the same node's
    /// shared future. Wrapped in `Arc` rather than cloned: `ChannelError`
    /// itself has no `Clone` impl (its `Transport` variant carries a
    /// boxed `dyn Error`), but every waiter on a [`SharedChunkFuture`]
    /// needs its own owned error to propagate.
    ///
    /// [`SharedChunkFuture`]: crate::future::SharedChunkFuture
    #[error("{0}")]
    Shared(Arc<ChannelError>),
}

/// Convenience alias for channel-level operations.
pub type ChannelResult<T> = Result<T, ChannelError>;
