//! The local sparse cache file backing a channel (§3.4, §6.3).

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use parking_lot::Mutex;

/// A plain sparse file of logical length `total_size`. No header; chunk
/// `k`'s bytes occupy `[k*C, min((k+1)*C, total_size))` once valid.
///
/// Access is serialized behind a single lock rather than using
/// platform-specific positioned I/O (`pread`/`pwrite`): callers already
/// cross an async boundary (via [`tokio::task::spawn_blocking`]) for
/// every access, so the extra lock contention is negligible next to the
/// syscall itself, and this keeps the implementation portable.
#[derive(Debug)]
pub struct CacheFile {
    file: Mutex<File>,
}

impl CacheFile {
    /// Open (creating if necessary) the cache file at `path`, forcing its
    /// size to exactly `total_size` bytes (sparse zero-fill of any new
    /// tail, per §3.4's invariant).
    pub fn open(path: impl AsRef<Path>, total_size: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.set_len(total_size)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Write `bytes` at `offset`.
    pub fn write_at(&self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)
    }

    /// Read exactly `len` bytes starting at `offset`.
    pub fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Flush and fsync the cache file, ensuring every write issued so far
    /// is durable.
    pub fn sync(&self) -> io::Result<()> {
        let file = self.file.lock();
        file.sync_all()
    }
}
