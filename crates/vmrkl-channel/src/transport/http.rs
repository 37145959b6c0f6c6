//! `http(s)://` transport via `reqwest`, using `Range` GET requests.
//! Feature-gated behind `http-transport` so the core build carries no
//! network stack by default.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;

use vmrkl_core::transport::{Transport, TransportError};

/// Fetches byte ranges from a remote HTTP(S) URL using `Range` headers.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    url: String,
}

impl HttpTransport {
    /// Build a transport for `url` using a fresh default-configured
    /// client.
    #[must_use]
    pub fn new(url: String) -> Self {
        Self {
            client: Client::new(),
            url,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn size(&self) -> Result<u64, TransportError> {
        let resp = self
            .client
            .head(&self.url)
            .send()
            .await
            .map_err(|e| TransportError::Other(e.to_string()))?;
        resp.content_length()
            .ok_or_else(|| TransportError::Other("response missing Content-Length".to_string()))
    }

    async fn supports_ranges(&self) -> Result<bool, TransportError> {
        let resp = self
            .client
            .head(&self.url)
            .send()
            .await
            .map_err(|e| TransportError::Other(e.to_string()))?;
        Ok(resp
            .headers()
            .get(reqwest::header::ACCEPT_RANGES)
            .is_some_and(|v| v.as_bytes() == b"bytes"))
    }

    async fn fetch(&self, offset: u64, length: u64) -> Result<Bytes, TransportError> {
        let end = offset + length.saturating_sub(1);
        let resp = self
            .client
            .get(&self.url)
            .header(reqwest::header::RANGE, format!("bytes={offset}-{end}"))
            .send()
            .await
            .map_err(|e| TransportError::Other(e.to_string()))?
            .error_for_status()
            .map_err(|e| TransportError::Other(e.to_string()))?;
        resp.bytes()
            .await
            .map_err(|e| TransportError::Other(e.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
