//! `file://` transport: range-fetch from a local path, used both for
//! local-artifact testing and for `file://`-addressed publication trees.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;

use vmrkl_core::transport::{Transport, TransportError};

/// Reads byte ranges from a local file via `std::fs`, off the async
/// executor (each call runs inside [`tokio::task::spawn_blocking`]).
#[derive(Debug, Clone)]
pub struct FileTransport {
    path: PathBuf,
}

impl FileTransport {
    /// Build a transport reading from `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// Strip the `file://` scheme from `url`, yielding the local path.
pub(crate) fn path_from_file_url(url: &str) -> Result<PathBuf, TransportError> {
    url.strip_prefix("file://")
        .map(PathBuf::from)
        .ok_or_else(|| TransportError::InvalidUrl {
            url: url.to_string(),
            reason: "expected a file:// url".to_string(),
        })
}

#[async_trait]
impl Transport for FileTransport {
    async fn size(&self) -> Result<u64, TransportError> {
        let path = self.path.clone();
        let meta = tokio::task::spawn_blocking(move || std::fs::metadata(path))
            .await
            .map_err(|e| TransportError::Other(e.to_string()))?
            .map_err(TransportError::Io)?;
        Ok(meta.len())
    }

    async fn supports_ranges(&self) -> Result<bool, TransportError> {
        Ok(true)
    }

    async fn fetch(&self, offset: u64, length: u64) -> Result<Bytes, TransportError> {
        let path = self.path.clone();
        let bytes = tokio::task::spawn_blocking(move || read_range(&path, offset, length))
            .await
            .map_err(|e| TransportError::Other(e.to_string()))?
            .map_err(TransportError::Io)?;
        Ok(Bytes::from(bytes))
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

fn read_range(path: &Path, offset: u64, length: u64) -> std::io::Result<Vec<u8>> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; length as usize];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetches_expected_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("source.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        let transport = FileTransport::new(&path);
        assert_eq!(transport.size().await.unwrap(), 10);
        let bytes = transport.fetch(3, 4).await.unwrap();
        assert_eq!(&bytes[..], b"3456");
    }

    #[test]
    fn rejects_non_file_scheme() {
        assert!(path_from_file_url("http://example.com").is_err());
    }
}
