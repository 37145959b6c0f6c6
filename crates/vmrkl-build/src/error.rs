//! Errors specific to reference construction (§4.7).

/// Failures that can occur while hashing a source file into a fresh
/// [`vmrkl_merkle::Reference`].
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// The computed `(total_size, chunk_size)` pair doesn't form a valid
    /// [`vmrkl_core::shape::Shape`].
    #[error("invalid shape: {0}")]
    InvalidShape(#[from] vmrkl_core::error::CoreError),

    /// I/O failure reading the source file or writing the `.mref`.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The `rayon` thread pool for parallel hashing failed to build.
    #[error("failed to build hashing thread pool: {0}")]
    ThreadPool(String),

    /// The source file's length changed between the initial size probe
    /// and the end of hashing, invalidating the chunk layout that was
    /// already computed.
    #[error("source file changed size during hashing: was {expected} bytes, now {actual} bytes")]
    SourceChanged {
        /// Length observed before hashing began.
        expected: u64,
        /// Length observed after hashing completed.
        actual: u64,
    },

    /// Constructing the [`vmrkl_merkle::Reference`] or persisting it
    /// failed.
    #[error("reference construction failed: {0}")]
    Reference(#[from] vmrkl_core::error::ChannelError),
}

/// Convenience alias for build-pipeline operations.
pub type BuildResult<T> = Result<T, BuildError>;
