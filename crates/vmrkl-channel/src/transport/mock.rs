//! An in-memory [`Transport`] for tests: serves byte ranges from a
//! `Vec<u8>`, can flip bytes to simulate corruption, fail a bounded
//! number of times to exercise retry, and counts calls so dedup and
//! resumability tests can assert on exact fetch counts.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use vmrkl_core::transport::{Transport, TransportError};

/// An in-memory transport backed by a fixed byte buffer.
#[derive(Debug)]
pub struct MockTransport {
    data: Vec<u8>,
    fetch_count: AtomicU64,
    /// Number of times each subsequent `fetch` should fail before
    /// succeeding (consumed one-by-one; `0` means never fail).
    remaining_failures: Mutex<u32>,
}

impl MockTransport {
    /// Serve `data` verbatim.
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            fetch_count: AtomicU64::new(0),
            remaining_failures: Mutex::new(0),
        }
    }

    /// Flip every bit in the byte range `[offset, offset+length)` of the
    /// underlying buffer, simulating corrupted source data.
    pub fn corrupt_range(&mut self, offset: usize, length: usize) {
        for b in &mut self.data[offset..offset + length] {
            *b = !*b;
        }
    }

    /// Make the next `n` `fetch` calls fail with a transport error before
    /// any subsequent call succeeds.
    pub fn fail_next(&self, n: u32) {
        *self.remaining_failures.lock() = n;
    }

    /// Total number of `fetch` calls made so far (including ones that
    /// failed), for dedup/resumability assertions.
    #[must_use]
    pub fn fetch_count(&self) -> u64 {
        self.fetch_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn size(&self) -> Result<u64, TransportError> {
        Ok(self.data.len() as u64)
    }

    async fn supports_ranges(&self) -> Result<bool, TransportError> {
        Ok(true)
    }

    async fn fetch(&self, offset: u64, length: u64) -> Result<Bytes, TransportError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        {
            let mut remaining = self.remaining_failures.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::Other("injected failure".to_string()));
            }
        }
        let start = offset as usize;
        let end = start + length as usize;
        if end > self.data.len() {
            return Err(TransportError::Other(format!(
                "range [{start}, {end}) exceeds artifact size {}",
                self.data.len()
            )));
        }
        Ok(Bytes::copy_from_slice(&self.data[start..end]))
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serves_exact_requested_range() {
        let transport = MockTransport::new((0..20u8).collect());
        let bytes = transport.fetch(5, 4).await.unwrap();
        assert_eq!(&bytes[..], &[5, 6, 7, 8]);
        assert_eq!(transport.fetch_count(), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_then_succeed() {
        let transport = MockTransport::new(vec![1, 2, 3, 4]);
        transport.fail_next(2);
        assert!(transport.fetch(0, 1).await.is_err());
        assert!(transport.fetch(0, 1).await.is_err());
        assert!(transport.fetch(0, 1).await.is_ok());
    }
}
