//! Abstract range-fetch contract (§4.4).
//!
//! The core depends only on [`Transport`]; concrete schemes (`http://`,
//! `file://`, or an in-memory mock for tests) live in `vmrkl-channel` and
//! register themselves in a [`TransportRegistry`] keyed by URL scheme.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

/// A pluggable range-fetch client over a single remote artifact.
///
/// Implementations are expected to be cheaply cloneable handles (e.g. an
/// `Arc`-wrapped HTTP client) since the dispatcher may drive many
/// concurrent fetches through the same transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Total size of the remote artifact, in bytes.
    async fn size(&self) -> Result<u64, TransportError>;

    /// Whether the remote end honors partial range requests.
    async fn supports_ranges(&self) -> Result<bool, TransportError>;

    /// Fetch exactly `length` bytes starting at `offset`. Callers must
    /// ensure `offset + length <= size()`; implementations may clip at EOF
    /// but are not required to pad short reads.
    async fn fetch(&self, offset: u64, length: u64) -> Result<Bytes, TransportError>;

    /// Release any held resources (connections, file handles).
    async fn close(&self) -> Result<(), TransportError>;
}

/// Error surfaced by a [`Transport`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The scheme is not registered with any provider.
    #[error("no transport registered for scheme {scheme:?}")]
    UnknownScheme {
        /// The unrecognized scheme, e.g. `"ftp"`.
        scheme: String,
    },
    /// The remote URL could not be parsed or opened.
    #[error("invalid remote url {url}: {reason}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },
    /// Network or protocol failure during a fetch.
    #[error("fetch failed: {0}")]
    Io(#[from] std::io::Error),
    /// Any other transport-specific failure (HTTP status, timeout, etc).
    #[error("{0}")]
    Other(String),
}

/// A constructor function for a transport, given the remote URL.
pub type TransportFactory =
    Arc<dyn Fn(&str) -> Result<Arc<dyn Transport>, TransportError> + Send + Sync>;

/// Registry of [`Transport`] providers keyed by URL scheme (e.g. `"http"`,
/// `"file"`). Concrete providers register themselves at startup; the core
/// never hard-codes a scheme.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    factories: HashMap<String, TransportFactory>,
}

impl TransportRegistry {
    /// An empty registry with no providers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a provider for `scheme`. A later registration for the same
    /// scheme replaces the earlier one.
    pub fn register(&mut self, scheme: impl Into<String>, factory: TransportFactory) {
        self.factories.insert(scheme.into(), factory);
    }

    /// Open a transport for `url`, dispatching on its scheme
    /// (`scheme://...`).
    pub fn open(&self, url: &str) -> Result<Arc<dyn Transport>, TransportError> {
        let scheme = url
            .split_once("://")
            .map(|(scheme, _)| scheme)
            .ok_or_else(|| TransportError::InvalidUrl {
                url: url.to_string(),
                reason: "missing scheme separator \"://\"".to_string(),
            })?;
        let factory = self
            .factories
            .get(scheme)
            .ok_or_else(|| TransportError::UnknownScheme {
                scheme: scheme.to_string(),
            })?;
        factory(url)
    }
}
