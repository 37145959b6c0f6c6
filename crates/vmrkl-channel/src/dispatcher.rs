//! The dispatcher: per-node fetch dedup plus the worker pool that
//! actually executes [`NodeDownloadTask`]s (§4.5, §4.6.2, §4.6.3, §5).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, warn};

use vmrkl_core::error::{ByteRange, ChannelError};
use vmrkl_core::future::{SharedChunkFuture, SharedFetchOutcome};
use vmrkl_core::shape::Shape;
use vmrkl_core::transport::Transport;
use vmrkl_merkle::{SaveOutcome, State};
use vmrkl_scheduler::{NodeDownloadTask, SchedulingTarget};

use crate::cache_file::CacheFile;
use crate::retry::RetryConfig;

/// Dedupes in-flight node fetches and drives each through the transport,
/// hash verification, cache-file persistence, and state bitmap update.
///
/// Cheap to clone: every field is an `Arc` or `Copy` value, so a clone
/// shares the same dedup map and worker concurrency bound as its
/// original — the standard pattern for spawning `'static` async work
/// that needs to call back into the owner.
#[derive(Clone)]
pub struct Dispatcher {
    shape: Shape,
    state: Arc<State>,
    transport: Arc<dyn Transport>,
    cache: Arc<CacheFile>,
    futures: Arc<Mutex<HashMap<u64, SharedChunkFuture>>>,
    senders: Arc<Mutex<HashMap<u64, oneshot::Sender<SharedFetchOutcome>>>>,
    semaphore: Arc<Semaphore>,
    retry: RetryConfig,
}

impl Dispatcher {
    /// Build a dispatcher bounded to `concurrency` simultaneous in-flight
    /// fetches.
    #[must_use]
    pub fn new(
        shape: Shape,
        state: Arc<State>,
        transport: Arc<dyn Transport>,
        cache: Arc<CacheFile>,
        concurrency: usize,
        retry: RetryConfig,
    ) -> Self {
        Self {
            shape,
            state,
            transport,
            cache,
            futures: Arc::new(Mutex::new(HashMap::new())),
            senders: Arc::new(Mutex::new(HashMap::new())),
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            retry,
        }
    }

    /// Number of node fetches currently in flight.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.futures.lock().len()
    }

    /// Await every currently in-flight task, up to `timeout`. Any task
    /// still outstanding when the timeout elapses is forcibly completed
    /// with [`ChannelError::ChannelClosed`] for its waiters (the
    /// underlying spawned work is not cancelled; it may still finish and
    /// update state, per §5's cancellation semantics).
    pub async fn drain(&self, timeout: Duration) {
        let outstanding: Vec<SharedChunkFuture> = self.futures.lock().values().cloned().collect();
        if outstanding.is_empty() {
            return;
        }
        let joined = futures::future::join_all(outstanding);
        if tokio::time::timeout(timeout, joined).await.is_err() {
            warn!("dispatcher drain timed out with tasks still outstanding");
        }
    }

    fn complete(&self, node_index: u64, outcome: SharedFetchOutcome) {
        self.futures.lock().remove(&node_index);
        if let Some(tx) = self.senders.lock().remove(&node_index) {
            let _ = tx.send(outcome);
        }
    }

    async fn execute(self, task: NodeDownloadTask) {
        let _permit = self.semaphore.acquire().await;
        let (a, b) = task.leaf_range;
        let invalid_chunks: Vec<u64> = (a..b).filter(|k| !self.state.is_valid(*k)).collect();
        if invalid_chunks.is_empty() {
            self.complete(task.node_index, Ok(()));
            return;
        }

        for (run_start, run_end) in contiguous_runs(&invalid_chunks) {
            if let Err(err) = self.fetch_and_verify_run(run_start, run_end).await {
                self.complete(task.node_index, Err(Arc::new(err)));
                return;
            }
        }

        if let Err(err) = self.state.flush() {
            self.complete(task.node_index, Err(Arc::new(err)));
            return;
        }

        self.complete(task.node_index, Ok(()));
    }

    async fn fetch_and_verify_run(&self, run_start: u64, run_end: u64) -> Result<(), ChannelError> {
        let chunk_size = self.shape.chunk_size();
        let byte_start = run_start * chunk_size;
        let byte_end = (run_end * chunk_size).min(self.shape.total_size());
        let length = byte_end - byte_start;

        let bytes = self.fetch_with_retry(byte_start, length).await?;

        let mut offset_in_run = 0usize;
        for k in run_start..run_end {
            let piece_start = (k * chunk_size).saturating_sub(byte_start) as usize;
            let piece_end = (((k + 1) * chunk_size).min(self.shape.total_size()))
                .saturating_sub(byte_start) as usize;
            let piece = &bytes[piece_start..piece_end];
            debug_assert_eq!(piece_start, offset_in_run);
            offset_in_run = piece_end;

            let cache = Arc::clone(&self.cache);
            let state = Arc::clone(&self.state);
            let offset = k * chunk_size;
            let owned_piece = piece.to_vec();
            let outcome = tokio::task::spawn_blocking(move || {
                state.save_if_valid(k, &owned_piece, |bytes| cache.write_at(offset, bytes))
            })
            .await
            .map_err(|e| ChannelError::Io(io_error_from_join(&e)))??;

            if outcome == SaveOutcome::HashMismatch {
                return Err(ChannelError::Integrity { chunk_index: k });
            }
        }
        Ok(())
    }

    async fn fetch_with_retry(&self, offset: u64, length: u64) -> Result<bytes::Bytes, ChannelError> {
        let mut attempt = 0;
        loop {
            let result = tokio::time::timeout(
                self.retry.fetch_timeout,
                self.transport.fetch(offset, length),
            )
            .await;

            match result {
                Ok(Ok(bytes)) => return Ok(bytes),
                Ok(Err(transport_err)) => {
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        return Err(ChannelError::Transport {
                            url: "<transport>".to_string(),
                            range: ByteRange {
                                start: offset,
                                end: offset + length,
                            },
                            source: Box::new(transport_err),
                        });
                    }
                    let delay = self.retry.backoff_for(attempt - 1);
                    debug!(attempt, ?delay, "transport fetch failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(_elapsed) => {
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        return Err(ChannelError::Transport {
                            url: "<transport>".to_string(),
                            range: ByteRange {
                                start: offset,
                                end: offset + length,
                            },
                            source: Box::new(std::io::Error::new(
                                std::io::ErrorKind::TimedOut,
                                "transport fetch timed out",
                            )),
                        });
                    }
                    let delay = self.retry.backoff_for(attempt - 1);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl SchedulingTarget for Dispatcher {
    fn offer_task(&self, task: NodeDownloadTask) {
        let this = self.clone();
        tokio::spawn(this.execute(task));
    }

    fn get_or_create_future(&self, node_index: u64) -> (SharedChunkFuture, bool) {
        let mut futures = self.futures.lock();
        if let Some(existing) = futures.get(&node_index) {
            return (existing.clone(), false);
        }
        let (tx, rx) = oneshot::channel::<SharedFetchOutcome>();
        let shared: SharedChunkFuture = async move {
            rx.await
                .unwrap_or_else(|_| Err(Arc::new(ChannelError::ChannelClosed)))
        }
        .boxed()
        .shared();
        futures.insert(node_index, shared.clone());
        self.senders.lock().insert(node_index, tx);
        (shared, true)
    }
}

/// Group a sorted, deduplicated slice of chunk indices into maximal runs
/// of consecutive integers, e.g. `[2, 3, 4, 7]` -> `[(2, 5), (7, 8)]`.
fn contiguous_runs(chunks: &[u64]) -> Vec<(u64, u64)> {
    let mut runs = Vec::new();
    let mut iter = chunks.iter().copied();
    let Some(mut start) = iter.next() else {
        return runs;
    };
    let mut prev = start;
    for k in iter {
        if k == prev + 1 {
            prev = k;
            continue;
        }
        runs.push((start, prev + 1));
        start = k;
        prev = k;
    }
    runs.push((start, prev + 1));
    runs
}

fn io_error_from_join(e: &tokio::task::JoinError) -> std::io::Error {
    std::io::Error::other(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_runs_groups_consecutive_indices() {
        assert_eq!(contiguous_runs(&[2, 3, 4, 7]), vec![(2, 5), (7, 8)]);
        assert_eq!(contiguous_runs(&[]), Vec::<(u64, u64)>::new());
        assert_eq!(contiguous_runs(&[5]), vec![(5, 6)]);
        assert_eq!(contiguous_runs(&[0, 1, 2]), vec![(0, 3)]);
        assert_eq!(contiguous_runs(&[0, 2, 4]), vec![(0, 1), (2, 3), (4, 5)]);
    }
}
