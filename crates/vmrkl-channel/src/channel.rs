//! The public verified file channel (§4.6): the concurrency core that
//! turns a `(offset, length)` read into a scheduled set of verified,
//! cached chunk fetches.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument};

use vmrkl_core::error::{ByteRange, ChannelError, ChannelResult};
use vmrkl_core::shape::Shape;
use vmrkl_core::transport::Transport;
use vmrkl_merkle::{Reference, State};
use vmrkl_scheduler::{Aggressive, SchedulingTarget, Strategy};

use crate::cache_file::CacheFile;
use crate::dispatcher::Dispatcher;
use crate::retry::RetryConfig;

/// Tunables for [`VerifiedFileChannel::open`] beyond the required paths,
/// reference, transport, and strategy.
#[derive(Clone, Copy, Debug)]
pub struct ChannelConfig {
    /// Maximum number of node fetches in flight at once.
    pub concurrency: usize,
    /// Transport retry/backoff policy (§4.6.3).
    pub retry: RetryConfig,
    /// How long [`VerifiedFileChannel::close`] waits for outstanding
    /// tasks to drain before forcibly completing their waiters (§5).
    pub close_drain_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            retry: RetryConfig::default(),
            close_drain_timeout: Duration::from_secs(30),
        }
    }
}

/// The public async read surface: integrates the scheduler, transport,
/// state, and local cache file behind `(cachePath, statePath,
/// remoteUrl)` (§4.6, §6.4).
pub struct VerifiedFileChannel {
    shape: Shape,
    state: Arc<State>,
    cache: Arc<CacheFile>,
    dispatcher: Dispatcher,
    strategy: Arc<dyn Strategy>,
    closed: AtomicBool,
    close_drain_timeout: Duration,
}

impl VerifiedFileChannel {
    /// Open (or create) a channel backed by `cache_path`/`state_path`,
    /// fetching from `transport` and scheduling via `strategy`.
    ///
    /// Fails with [`ChannelError::ShapeMismatch`] if `transport`'s
    /// reported size disagrees with `reference`'s, or if a state file
    /// already on disk was built from a different shape.
    #[instrument(skip(reference, transport, strategy), fields(size = reference.shape().total_size()))]
    pub async fn open(
        cache_path: impl AsRef<Path>,
        state_path: impl AsRef<Path>,
        reference: Arc<Reference>,
        transport: Arc<dyn Transport>,
        strategy: Arc<dyn Strategy>,
        config: ChannelConfig,
    ) -> ChannelResult<Self> {
        let shape = reference.shape();

        let remote_size = transport.size().await.map_err(|source| ChannelError::Transport {
            url: "<transport>".to_string(),
            range: ByteRange { start: 0, end: 0 },
            source: Box::new(source),
        })?;
        if remote_size != shape.total_size() {
            return Err(ChannelError::ShapeMismatch {
                reason: format!(
                    "transport reports size {remote_size}, reference expects {}",
                    shape.total_size()
                ),
            });
        }

        let cache = Arc::new(CacheFile::open(cache_path.as_ref(), shape.total_size())?);

        let state_path = state_path.as_ref();
        let state = if state_path.exists() {
            let loaded = State::load(state_path)?;
            if loaded.shape() != shape {
                return Err(ChannelError::ShapeMismatch {
                    reason: "on-disk state shape disagrees with reference shape".to_string(),
                });
            }
            loaded
        } else {
            let fresh = State::from_reference(&reference, state_path);
            fresh.flush()?;
            fresh
        };
        let state = Arc::new(state);

        let dispatcher = Dispatcher::new(
            shape,
            Arc::clone(&state),
            transport,
            Arc::clone(&cache),
            config.concurrency,
            config.retry,
        );

        info!(valid_chunks = state.valid_chunk_count(), "channel opened");

        Ok(Self {
            shape,
            state,
            cache,
            dispatcher,
            strategy,
            closed: AtomicBool::new(false),
            close_drain_timeout: config.close_drain_timeout,
        })
    }

    /// Total size of the artifact, in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.shape.total_size()
    }

    /// Fill `buf` with bytes starting at `position`, downloading and
    /// verifying whatever chunks aren't already valid (§4.6.1). Returns
    /// the number of bytes read, which is `buf.len()` unless the read
    /// runs past EOF.
    #[instrument(skip(self, buf), fields(position, requested = buf.len()))]
    pub async fn read(&self, buf: &mut [u8], position: u64) -> ChannelResult<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::ChannelClosed);
        }
        let size = self.shape.total_size();
        if position >= size {
            return Ok(0);
        }
        let length = (buf.len() as u64).min(size - position);
        if length == 0 {
            return Ok(0);
        }

        let first_chunk = self
            .shape
            .chunk_index_for_position(position)
            .map_err(ChannelError::InvalidShape)?;
        let last_chunk = self
            .shape
            .chunk_index_for_position(position + length - 1)
            .map_err(ChannelError::InvalidShape)?;

        let missing: BTreeSet<u64> = (first_chunk..=last_chunk)
            .filter(|k| !self.state.is_valid(*k))
            .collect();
        let was_already_cached = missing.is_empty();

        if !was_already_cached {
            self.schedule_and_await(position, length, &missing).await?;
        }

        if let Some(&k) = (first_chunk..=last_chunk)
            .find(|k| !self.state.is_valid(*k))
            .as_ref()
        {
            self.strategy.observe_outcome(false);
            return Err(ChannelError::ReadIncomplete { chunk_index: k });
        }
        self.strategy.observe_outcome(was_already_cached);

        let cache = Arc::clone(&self.cache);
        let len = length as usize;
        let bytes = tokio::task::spawn_blocking(move || cache.read_at(position, len))
            .await
            .map_err(|e| ChannelError::Io(std::io::Error::other(e.to_string())))??;
        buf[..len].copy_from_slice(&bytes);
        Ok(len)
    }

    /// Ensure every chunk covering `[position, position+length)` is
    /// valid, using an aggressive schedule regardless of the channel's
    /// configured strategy. Re-checks the validity bitmap after awaiting
    /// every scheduled fetch and fails with
    /// [`ChannelError::PrebufferIncomplete`] if anything remains unset —
    /// an explicit correctness gate independent of scheduling (§4.6).
    #[instrument(skip(self))]
    pub async fn prebuffer(&self, position: u64, length: u64) -> ChannelResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::ChannelClosed);
        }
        let size = self.shape.total_size();
        if position >= size || length == 0 {
            return Ok(());
        }
        let length = length.min(size - position);

        let first_chunk = self
            .shape
            .chunk_index_for_position(position)
            .map_err(ChannelError::InvalidShape)?;
        let last_chunk = self
            .shape
            .chunk_index_for_position(position + length - 1)
            .map_err(ChannelError::InvalidShape)?;

        let missing: BTreeSet<u64> = (first_chunk..=last_chunk)
            .filter(|k| !self.state.is_valid(*k))
            .collect();

        if !missing.is_empty() {
            let aggressive = Aggressive;
            let tasks =
                aggressive.schedule_downloads(position, length, &self.shape, &self.state, &self.dispatcher);
            self.await_tasks_covering(&tasks, &missing).await?;
        }

        let still_missing: Vec<u64> = (first_chunk..=last_chunk)
            .filter(|k| !self.state.is_valid(*k))
            .collect();
        if !still_missing.is_empty() {
            return Err(ChannelError::PrebufferIncomplete {
                missing: still_missing,
            });
        }
        Ok(())
    }

    /// Flush the cache file and state file durably. When `metadata` is
    /// `true`, also fsyncs the cache file (not just the state footer).
    pub async fn force(&self, metadata: bool) -> ChannelResult<()> {
        self.state.flush()?;
        if metadata {
            let cache = Arc::clone(&self.cache);
            tokio::task::spawn_blocking(move || cache.sync())
                .await
                .map_err(|e| ChannelError::Io(std::io::Error::other(e.to_string())))??;
        }
        Ok(())
    }

    /// Drain outstanding tasks (bounded by the configured timeout), flush
    /// durably, and mark the channel closed. Further `read`/`prebuffer`
    /// calls fail with [`ChannelError::ChannelClosed`].
    pub async fn close(&self) -> ChannelResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.dispatcher.drain(self.close_drain_timeout).await;
        self.force(true).await
    }

    async fn schedule_and_await(
        &self,
        position: u64,
        length: u64,
        missing: &BTreeSet<u64>,
    ) -> ChannelResult<()> {
        let tasks = self.strategy.schedule_downloads(
            position,
            length,
            &self.shape,
            &self.state,
            &self.dispatcher,
        );
        self.await_tasks_covering(&tasks, missing).await
    }

    async fn await_tasks_covering(
        &self,
        tasks: &[vmrkl_scheduler::NodeDownloadTask],
        missing: &BTreeSet<u64>,
    ) -> ChannelResult<()> {
        let mut pending = Vec::new();
        for task in tasks {
            let (a, b) = task.leaf_range;
            if (a..b).any(|k| missing.contains(&k)) {
                let (future, _created) = self.dispatcher.get_or_create_future(task.node_index);
                pending.push(future);
            }
        }
        for result in futures::future::join_all(pending).await {
            result.map_err(ChannelError::Shared)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use vmrkl_core::hash::hash_leaf;
    use vmrkl_scheduler::DefaultStrategy;

    async fn build_reference(source: &[u8], chunk_size: u64) -> Arc<Reference> {
        let shape = Shape::new(source.len() as u64, chunk_size).unwrap();
        let leaves: Vec<_> = (0..shape.leaf_count())
            .map(|k| {
                let start = (k * chunk_size) as usize;
                let end = ((k + 1) * chunk_size).min(source.len() as u64) as usize;
                hash_leaf(&source[start..end])
            })
            .collect();
        Arc::new(Reference::from_leaf_hashes(shape, leaves).unwrap())
    }

    #[tokio::test]
    async fn sequential_read_populates_cache_and_state() {
        let source: Vec<u8> = (0..12u8).flat_map(|b| vec![b; 1024]).collect(); // 12 KiB, 3*4KiB chunks... use 3 chunks of 4096
        let source: Vec<u8> = (0u8..3).flat_map(|b| vec![b; 4096]).collect();
        let reference = build_reference(&source, 4096).await;
        let transport = Arc::new(MockTransport::new(source.clone()));

        let dir = tempfile::tempdir().unwrap();
        let channel = VerifiedFileChannel::open(
            dir.path().join("cache.bin"),
            dir.path().join("state.mrkl"),
            Arc::clone(&reference),
            transport.clone(),
            Arc::new(DefaultStrategy),
            ChannelConfig::default(),
        )
        .await
        .unwrap();

        let mut buf = vec![0u8; source.len()];
        let n = channel.read(&mut buf, 0).await.unwrap();
        assert_eq!(n, source.len());
        assert_eq!(buf, source);
    }

    #[tokio::test]
    async fn read_past_eof_returns_zero() {
        let source = vec![7u8; 4096];
        let reference = build_reference(&source, 4096).await;
        let transport = Arc::new(MockTransport::new(source));

        let dir = tempfile::tempdir().unwrap();
        let channel = VerifiedFileChannel::open(
            dir.path().join("cache.bin"),
            dir.path().join("state.mrkl"),
            reference,
            transport,
            Arc::new(DefaultStrategy),
            ChannelConfig::default(),
        )
        .await
        .unwrap();

        let mut buf = vec![0u8; 16];
        let n = channel.read(&mut buf, 4096).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn corrupted_chunk_surfaces_integrity_error() {
        let source = vec![9u8; 4 * 4096];
        let reference = build_reference(&source, 4096).await;
        let mut transport = MockTransport::new(source.clone());
        transport.corrupt_range(2 * 4096, 4096);
        let transport = Arc::new(transport);

        let dir = tempfile::tempdir().unwrap();
        let channel = VerifiedFileChannel::open(
            dir.path().join("cache.bin"),
            dir.path().join("state.mrkl"),
            reference,
            transport,
            Arc::new(DefaultStrategy),
            ChannelConfig::default(),
        )
        .await
        .unwrap();

        let mut buf = vec![0u8; 4 * 4096];
        let err = channel.read(&mut buf, 0).await.unwrap_err();
        match err {
            ChannelError::Shared(inner) => {
                assert!(matches!(*inner, ChannelError::Integrity { chunk_index: 2 }));
            }
            other => panic!("expected a shared Integrity error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn prebuffer_then_read_issues_no_further_fetches() {
        let source = vec![3u8; 4 * 4096];
        let reference = build_reference(&source, 4096).await;
        let transport = Arc::new(MockTransport::new(source.clone()));

        let dir = tempfile::tempdir().unwrap();
        let channel = VerifiedFileChannel::open(
            dir.path().join("cache.bin"),
            dir.path().join("state.mrkl"),
            reference,
            transport.clone(),
            Arc::new(DefaultStrategy),
            ChannelConfig::default(),
        )
        .await
        .unwrap();

        channel.prebuffer(0, source.len() as u64).await.unwrap();
        let fetches_after_prebuffer = transport.fetch_count();
        assert!(fetches_after_prebuffer > 0);

        let mut buf = vec![0u8; source.len()];
        channel.read(&mut buf, 0).await.unwrap();
        assert_eq!(transport.fetch_count(), fetches_after_prebuffer);
        assert_eq!(buf, source);
    }

    #[tokio::test]
    async fn concurrent_overlapping_reads_dedup_fetches() {
        let source: Vec<u8> = (0u8..4).flat_map(|b| vec![b; 4096]).collect();
        let reference = build_reference(&source, 4096).await;
        let transport = Arc::new(MockTransport::new(source.clone()));

        let dir = tempfile::tempdir().unwrap();
        let channel = Arc::new(
            VerifiedFileChannel::open(
                dir.path().join("cache.bin"),
                dir.path().join("state.mrkl"),
                reference,
                transport.clone(),
                Arc::new(DefaultStrategy),
                ChannelConfig::default(),
            )
            .await
            .unwrap(),
        );

        // Four single-chunk reads plus one full-range read, all launched
        // concurrently against an empty cache: every chunk must still be
        // fetched exactly once no matter how many in-flight readers want it.
        let mut handles = Vec::new();
        for i in 0..4u64 {
            let channel = Arc::clone(&channel);
            handles.push(tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                channel.read(&mut buf, i * 4096).await.unwrap();
                buf
            }));
        }
        let full_channel = Arc::clone(&channel);
        let full_handle = tokio::spawn(async move {
            let mut buf = vec![0u8; source.len()];
            full_channel.read(&mut buf, 0).await.unwrap();
            buf
        });

        for (i, handle) in handles.into_iter().enumerate() {
            let buf = handle.await.unwrap();
            assert_eq!(buf, vec![i as u8; 4096]);
        }
        let full = full_handle.await.unwrap();
        assert_eq!(full, (0u8..4).flat_map(|b| vec![b; 4096]).collect::<Vec<u8>>());

        // Dedup means no more than one fetch call per chunk, regardless of
        // how many overlapping readers asked for it.
        assert!(transport.fetch_count() <= 4);

        // Repeating either kind of read now issues zero further fetches.
        let before = transport.fetch_count();
        let mut buf = vec![0u8; 4096];
        channel.read(&mut buf, 0).await.unwrap();
        assert_eq!(transport.fetch_count(), before);
    }

    #[tokio::test]
    async fn identical_concurrent_reads_issue_exactly_one_fetch_per_chunk() {
        // Four chunks, but every reader below asks for the same single
        // chunk: with an empty cache and the default strategy's
        // efficiency threshold, that never consolidates into a wider
        // internal-node task, so all ten readers race for exactly one
        // node (leaf 1). That isolates the get_or_create_future dedup
        // point from any node-consolidation behavior.
        let source: Vec<u8> = (0u8..4).flat_map(|b| vec![b; 4096]).collect();
        let reference = build_reference(&source, 4096).await;
        let transport = Arc::new(MockTransport::new(source.clone()));

        let dir = tempfile::tempdir().unwrap();
        let channel = Arc::new(
            VerifiedFileChannel::open(
                dir.path().join("cache.bin"),
                dir.path().join("state.mrkl"),
                reference,
                transport.clone(),
                Arc::new(DefaultStrategy),
                ChannelConfig::default(),
            )
            .await
            .unwrap(),
        );

        let mut handles = Vec::new();
        for _ in 0..10 {
            let channel = Arc::clone(&channel);
            handles.push(tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                channel.read(&mut buf, 4096).await.unwrap();
                assert_eq!(buf, vec![1u8; 4096]);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Ten readers raced for the same node; exactly one of them must
        // have actually created the in-flight future and offered the
        // fetch, so the transport sees exactly one call for this chunk.
        assert_eq!(transport.fetch_count(), 1);
    }

    #[tokio::test]
    async fn restart_resumability_only_fetches_missing_chunks() {
        let source = vec![5u8; 4 * 4096];
        let reference = build_reference(&source, 4096).await;
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("cache.bin");
        let state_path = dir.path().join("state.mrkl");

        {
            let transport = Arc::new(MockTransport::new(source.clone()));
            let channel = VerifiedFileChannel::open(
                &cache_path,
                &state_path,
                Arc::clone(&reference),
                transport,
                Arc::new(DefaultStrategy),
                ChannelConfig::default(),
            )
            .await
            .unwrap();
            let mut buf = vec![0u8; 4096];
            channel.read(&mut buf, 0).await.unwrap();
            channel.read(&mut buf, 2 * 4096).await.unwrap();
            channel.force(true).await.unwrap();
            channel.close().await.unwrap();
        }

        let transport = Arc::new(MockTransport::new(source.clone()));
        let channel = VerifiedFileChannel::open(
            &cache_path,
            &state_path,
            reference,
            transport.clone(),
            Arc::new(DefaultStrategy),
            ChannelConfig::default(),
        )
        .await
        .unwrap();
        let mut buf = vec![0u8; source.len()];
        channel.read(&mut buf, 0).await.unwrap();
        assert_eq!(buf, source);
        assert!(transport.fetch_count() >= 1);
        assert!(transport.fetch_count() <= 2);
    }
}
