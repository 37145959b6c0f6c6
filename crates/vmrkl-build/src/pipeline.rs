//! Parallel hashing of a source file into a fresh [`Reference`] (§4.7).

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use vmrkl_core::hash::{hash_leaf, Digest32};
use vmrkl_core::shape::Shape;
use vmrkl_merkle::Reference;

use crate::error::{BuildError, BuildResult};
use crate::progress::BuildProgress;

/// Hash every chunk of `source_path` under `shape` using a `rayon` pool of
/// `worker_count` threads (defaulting to the available core count),
/// publishing a [`BuildProgress`] snapshot after each completed chunk.
///
/// Each chunk is read through its own [`File`] handle rather than a
/// shared cursor, so workers never contend on seek position (§4.7's
/// "pread-style offsetted reads"). Results are collected in chunk-index
/// order regardless of which worker finishes first.
fn hash_leaves_blocking(
    source_path: &Path,
    shape: Shape,
    worker_count: Option<usize>,
    progress: Option<Arc<watch::Sender<BuildProgress>>>,
) -> BuildResult<Vec<Digest32>> {
    let leaf_count = shape.leaf_count();
    let chunk_size = shape.chunk_size();
    let total_size = shape.total_size();

    if leaf_count == 0 {
        return Ok(Vec::new());
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(worker_count.unwrap_or_else(num_cpus::get))
        .build()
        .map_err(|e| BuildError::ThreadPool(e.to_string()))?;

    let chunks_done = AtomicU64::new(0);
    let bytes_done = AtomicU64::new(0);

    pool.install(|| {
        (0..leaf_count)
            .into_par_iter()
            .map(|k| -> BuildResult<Digest32> {
                let start = k * chunk_size;
                let end = ((k + 1) * chunk_size).min(total_size);
                #[allow(clippy::cast_possible_truncation)]
                let len = (end - start) as usize;

                let mut file = File::open(source_path)?;
                file.seek(SeekFrom::Start(start))?;
                let mut buf = vec![0u8; len];
                file.read_exact(&mut buf)?;

                let hash = hash_leaf(&buf);

                let done = chunks_done.fetch_add(1, Ordering::SeqCst) + 1;
                let consumed = bytes_done.fetch_add(len as u64, Ordering::SeqCst) + len as u64;
                if let Some(tx) = &progress {
                    let _ = tx.send(BuildProgress {
                        chunks_done: done,
                        chunks_total: leaf_count,
                        bytes_done: consumed,
                        bytes_total: total_size,
                    });
                }
                Ok(hash)
            })
            .collect()
    })
}

/// Build a [`Reference`] for `source_path`, chunked at `chunk_size` bytes,
/// running entirely on the calling thread (via the `rayon` pool it spins
/// up internally). Intended to run inside [`tokio::task::spawn_blocking`];
/// see [`build_reference`] for the async entry point.
pub fn build_reference_blocking(
    source_path: &Path,
    chunk_size: u64,
    worker_count: Option<usize>,
    progress: Option<Arc<watch::Sender<BuildProgress>>>,
) -> BuildResult<Reference> {
    let total_size = std::fs::metadata(source_path)?.len();
    let shape = Shape::new(total_size, chunk_size)?;

    debug!(
        total_size,
        chunk_size,
        leaf_count = shape.leaf_count(),
        "hashing source file"
    );
    let leaf_hashes = hash_leaves_blocking(source_path, shape, worker_count, progress)?;

    let actual_size = std::fs::metadata(source_path)?.len();
    if actual_size != total_size {
        return Err(BuildError::SourceChanged {
            expected: total_size,
            actual: actual_size,
        });
    }

    let reference = Reference::from_leaf_hashes(shape, leaf_hashes)?;
    info!(
        root_hash = %hex::encode(reference.root_hash()),
        leaf_count = shape.leaf_count(),
        "reference built"
    );
    Ok(reference)
}

/// Build a [`Reference`] for `source_path` asynchronously, returning a
/// [`watch::Receiver`] of live [`BuildProgress`] snapshots alongside a
/// [`JoinHandle`] resolving to the finished reference (§4.7's
/// `fromData(sourcePath) -> (Progress, Future<Reference>)`).
pub async fn build_reference(
    source_path: PathBuf,
    chunk_size: u64,
    worker_count: Option<usize>,
) -> BuildResult<(
    watch::Receiver<BuildProgress>,
    JoinHandle<BuildResult<Reference>>,
)> {
    let total_size = tokio::fs::metadata(&source_path).await?.len();
    let shape = Shape::new(total_size, chunk_size)?;

    let (tx, rx) = watch::channel(BuildProgress::starting(shape.leaf_count(), total_size));
    let tx = Arc::new(tx);

    let handle = tokio::task::spawn_blocking(move || {
        build_reference_blocking(&source_path, chunk_size, worker_count, Some(tx))
    });

    Ok((rx, handle))
}

/// Build a reference for `source_path` and atomically persist it to
/// `out_path`, returning the built reference.
pub async fn build_and_save(
    source_path: PathBuf,
    chunk_size: u64,
    out_path: PathBuf,
    worker_count: Option<usize>,
) -> BuildResult<Reference> {
    let (_progress, handle) = build_reference(source_path, chunk_size, worker_count).await?;
    let reference = handle
        .await
        .map_err(|e| BuildError::ThreadPool(e.to_string()))??;
    reference.save(&out_path)?;
    Ok(reference)
}
