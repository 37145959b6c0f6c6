//! The mutable validity bitmap paired with a [`Reference`] (§3.3, §4.3).

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use vmrkl_core::error::ChannelError;
use vmrkl_core::hash::hash_leaf;
use vmrkl_core::shape::Shape;

use crate::footer::{self, GeometryFields};
use crate::reference::{sibling_temp_path, Reference};

/// Result of a [`State::save_if_valid`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The bytes hashed to the expected leaf and chunk `k` was flipped
    /// `0 -> 1`; `persist` was invoked exactly once, before the flip.
    Saved,
    /// Chunk `k` was already valid; `persist` was not invoked.
    AlreadyValid,
    /// The bytes did not hash to the reference's leaf hash for chunk `k`;
    /// neither `persist` nor the bitmap were touched.
    HashMismatch,
}

/// Per-chunk validity plus a copy of the reference's hash array, persisted
/// alongside it in a `.mrkl` file so that a resumed process can tell which
/// chunks of its local cache file are already verified.
///
/// Bit `k` of the bitmap is set once chunk `k` has been fetched and its
/// hash verified against the reference. Transitions are one-way:
/// `0 -> 1` only, guarded by [`State::save_if_valid`] so that concurrent
/// readers racing to fetch the same chunk never observe a torn bit.
pub struct State {
    shape: Shape,
    hashes: Vec<[u8; 32]>,
    bitmap: Mutex<Vec<u8>>,
    path: Option<PathBuf>,
}

impl State {
    /// Start tracking a fresh (all-invalid) state for `reference`, to be
    /// persisted at `path`.
    #[must_use]
    pub fn from_reference(reference: &Reference, path: impl Into<PathBuf>) -> Self {
        let shape = reference.shape();
        let bitmap_len = bitmap_byte_len(shape.leaf_count());
        let mut hashes = Vec::with_capacity(shape.node_count() as usize);
        for n in 0..shape.node_count() {
            hashes.push(reference.hash(n));
        }
        Self {
            shape,
            hashes,
            bitmap: Mutex::new(vec![0u8; bitmap_len]),
            path: Some(path.into()),
        }
    }

    /// This state's shape.
    #[must_use]
    pub const fn shape(&self) -> Shape {
        self.shape
    }

    /// Hash of `node_index`, as recorded in the reference this state was
    /// built from.
    #[must_use]
    pub fn hash(&self, node_index: u64) -> [u8; 32] {
        self.hashes[node_index as usize]
    }

    /// Whether chunk `k` has been fetched and verified.
    #[must_use]
    pub fn is_valid(&self, k: u64) -> bool {
        let bitmap = self.bitmap.lock();
        bit_is_set(&bitmap, k)
    }

    /// A defensive copy of the chunk indices currently marked valid.
    #[must_use]
    pub fn valid_chunks(&self) -> Vec<u64> {
        let bitmap = self.bitmap.lock();
        (0..self.shape.leaf_count())
            .filter(|&k| bit_is_set(&bitmap, k))
            .collect()
    }

    /// Count of chunks currently marked valid.
    #[must_use]
    pub fn valid_chunk_count(&self) -> u64 {
        let bitmap = self.bitmap.lock();
        (0..self.shape.leaf_count())
            .filter(|&k| bit_is_set(&bitmap, k))
            .count() as u64
    }

    /// Mark chunk `k` valid. The transition is `0 -> 1` only: marking an
    /// already-valid chunk again is a harmless no-op, never an error, so
    /// concurrent fetches of the same chunk can both call this safely.
    /// Returns `true` if this call performed the transition (i.e. the
    /// chunk was not already valid).
    pub fn mark_valid(&self, k: u64) -> bool {
        let mut bitmap = self.bitmap.lock();
        if bit_is_set(&bitmap, k) {
            return false;
        }
        set_bit(&mut bitmap, k);
        true
    }

    /// Verify `bytes` against chunk `chunk_index`'s reference hash and,
    /// only if it matches, run `persist` and flip the bit (§4.3.1's
    /// `saveIfValid`): the sole path by which a bit transitions `0 -> 1`.
    /// `mark_valid` is the primitive this is built on; callers outside
    /// this crate should go through `save_if_valid` rather than comparing
    /// hashes themselves and calling `mark_valid` directly.
    ///
    /// `persist` runs at most once, strictly after the hash matches and
    /// strictly before the bit is set, so a reader that observes
    /// `is_valid(chunk_index)` is guaranteed the bytes are already
    /// durable. An already-valid chunk short-circuits before either the
    /// hash is recomputed or `persist` is invoked.
    pub fn save_if_valid(
        &self,
        chunk_index: u64,
        bytes: &[u8],
        persist: impl FnOnce(&[u8]) -> std::io::Result<()>,
    ) -> Result<SaveOutcome, ChannelError> {
        if self.is_valid(chunk_index) {
            return Ok(SaveOutcome::AlreadyValid);
        }
        let leaf_node = self
            .shape
            .chunk_index_to_leaf_node(chunk_index)
            .map_err(ChannelError::InvalidShape)?;
        if hash_leaf(bytes) != self.hashes[leaf_node as usize] {
            return Ok(SaveOutcome::HashMismatch);
        }
        persist(bytes).map_err(ChannelError::Io)?;
        self.mark_valid(chunk_index);
        Ok(SaveOutcome::Saved)
    }

    /// Persist the current bitmap (and hash array) to this state's backing
    /// file, atomically (write to a sibling temp file, then rename).
    pub fn flush(&self) -> Result<(), ChannelError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bitmap = self.bitmap.lock().clone();
        let valid_chunk_count = (0..self.shape.leaf_count())
            .filter(|&k| bit_is_set(&bitmap, k))
            .count() as u64;

        let mut payload = Vec::with_capacity(self.hashes.len() * 32 + bitmap.len());
        for h in &self.hashes {
            payload.extend_from_slice(h);
        }
        payload.extend_from_slice(&bitmap);

        footer::write_state_footer(
            &mut payload,
            GeometryFields {
                chunk_size: self.shape.chunk_size(),
                total_content_size: self.shape.total_size(),
                leaf_count: self.shape.leaf_count(),
                node_count: self.shape.node_count(),
            },
            valid_chunk_count,
        )
        .map_err(ChannelError::Io)?;

        let tmp = sibling_temp_path(path);
        fs::write(&tmp, &payload).map_err(ChannelError::Io)?;
        fs::rename(&tmp, path).map_err(ChannelError::Io)?;
        Ok(())
    }

    /// Load a state from a `.mrkl` file previously written by [`Self::flush`].
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ChannelError> {
        let path = path.into();
        let path_str = path.display().to_string();
        let data = fs::read(&path).map_err(ChannelError::Io)?;
        let parsed = footer::read_state_footer(&path_str, &data)?;

        let shape = Shape::new(parsed.geometry.total_content_size, parsed.geometry.chunk_size)
            .map_err(ChannelError::InvalidShape)?;
        if shape.node_count() != parsed.geometry.node_count {
            return Err(ChannelError::CorruptState {
                path: path_str,
                reason: "geometry in footer disagrees with recomputed shape".to_string(),
            });
        }

        let hash_bytes = shape.node_count() as usize * 32;
        let bitmap_len = bitmap_byte_len(shape.leaf_count());
        let payload = &data[..parsed.footer_start as usize];
        if payload.len() != hash_bytes + bitmap_len {
            return Err(ChannelError::CorruptState {
                path: path_str,
                reason: "payload length does not match expected hash array + bitmap size"
                    .to_string(),
            });
        }

        let mut hashes = Vec::with_capacity(shape.node_count() as usize);
        for chunk in payload[..hash_bytes].chunks_exact(32) {
            let mut h = [0u8; 32];
            h.copy_from_slice(chunk);
            hashes.push(h);
        }
        let bitmap = payload[hash_bytes..].to_vec();

        let actual_valid = (0..shape.leaf_count())
            .filter(|&k| bit_is_set(&bitmap, k))
            .count() as u64;
        if actual_valid != parsed.valid_chunk_count {
            return Err(ChannelError::CorruptState {
                path: path_str,
                reason: format!(
                    "footer claims {} valid chunks but bitmap has {}",
                    parsed.valid_chunk_count, actual_valid
                ),
            });
        }

        Ok(Self {
            shape,
            hashes,
            bitmap: Mutex::new(bitmap),
            path: Some(path),
        })
    }

    /// The backing file path, if any (an in-memory state built without one
    /// has none).
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn bitmap_byte_len(leaf_count: u64) -> usize {
    leaf_count.div_ceil(8) as usize
}

fn bit_is_set(bitmap: &[u8], k: u64) -> bool {
    let byte = k / 8;
    let bit = k % 8;
    bitmap
        .get(byte as usize)
        .is_some_and(|b| b & (1 << bit) != 0)
}

fn set_bit(bitmap: &mut [u8], k: u64) {
    let byte = k / 8;
    let bit = k % 8;
    bitmap[byte as usize] |= 1 << bit;
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmrkl_core::hash::hash_leaf;

    fn sample_state(dir: &std::path::Path) -> (Reference, State) {
        let shape = Shape::new(5 * 1024, 1024).unwrap();
        let leaves: Vec<_> = (0..5).map(|i| hash_leaf(&[i as u8])).collect();
        let reference = Reference::from_leaf_hashes(shape, leaves).unwrap();
        let state = State::from_reference(&reference, dir.join("artifact.mrkl"));
        (reference, state)
    }

    #[test]
    fn fresh_state_is_all_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let (_r, state) = sample_state(dir.path());
        for k in 0..5 {
            assert!(!state.is_valid(k));
        }
        assert_eq!(state.valid_chunk_count(), 0);
    }

    #[test]
    fn mark_valid_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (_r, state) = sample_state(dir.path());
        assert!(state.mark_valid(2));
        assert!(!state.mark_valid(2));
        assert!(state.is_valid(2));
        assert_eq!(state.valid_chunk_count(), 1);
    }

    #[test]
    fn flush_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (_r, state) = sample_state(dir.path());
        state.mark_valid(0);
        state.mark_valid(3);
        state.flush().unwrap();

        let path = state.path().unwrap().to_path_buf();
        let loaded = State::load(&path).unwrap();
        assert!(loaded.is_valid(0));
        assert!(loaded.is_valid(3));
        assert!(!loaded.is_valid(1));
        assert_eq!(loaded.valid_chunk_count(), 2);
        assert_eq!(loaded.hash(0), state.hash(0));
    }

    #[test]
    fn save_if_valid_accepts_matching_bytes_and_persists_once() {
        let dir = tempfile::tempdir().unwrap();
        let (_r, state) = sample_state(dir.path());
        let persisted = std::cell::Cell::new(0u32);

        let outcome = state
            .save_if_valid(2, &[2u8], |_| {
                persisted.set(persisted.get() + 1);
                Ok(())
            })
            .unwrap();
        assert_eq!(outcome, SaveOutcome::Saved);
        assert!(state.is_valid(2));
        assert_eq!(persisted.get(), 1);
    }

    #[test]
    fn save_if_valid_rejects_mismatching_bytes_without_persisting_or_marking() {
        let dir = tempfile::tempdir().unwrap();
        let (_r, state) = sample_state(dir.path());
        let persisted = std::cell::Cell::new(0u32);

        let outcome = state
            .save_if_valid(2, b"not the right bytes", |_| {
                persisted.set(persisted.get() + 1);
                Ok(())
            })
            .unwrap();
        assert_eq!(outcome, SaveOutcome::HashMismatch);
        assert!(!state.is_valid(2));
        assert_eq!(persisted.get(), 0);
    }

    #[test]
    fn save_if_valid_is_idempotent_after_success() {
        let dir = tempfile::tempdir().unwrap();
        let (_r, state) = sample_state(dir.path());
        let persisted = std::cell::Cell::new(0u32);

        let first = state
            .save_if_valid(1, &[1u8], |_| {
                persisted.set(persisted.get() + 1);
                Ok(())
            })
            .unwrap();
        assert_eq!(first, SaveOutcome::Saved);

        let second = state
            .save_if_valid(1, &[1u8], |_| {
                persisted.set(persisted.get() + 1);
                Ok(())
            })
            .unwrap();
        assert_eq!(second, SaveOutcome::AlreadyValid);
        assert_eq!(persisted.get(), 1);
    }

    #[test]
    fn tampered_bitmap_vs_footer_count_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (_r, state) = sample_state(dir.path());
        state.mark_valid(0);
        state.flush().unwrap();

        let path = state.path().unwrap().to_path_buf();
        let mut bytes = fs::read(&path).unwrap();
        // Flip the bitmap byte (just before the hash-array-sized footer
        // payload boundary is awkward to locate generically here, so
        // instead corrupt a byte known to fall in the bitmap region: right
        // before the footer trailer).
        let footer_len = *bytes.last().unwrap() as usize;
        let bitmap_byte_idx = bytes.len() - 1 - footer_len - 1;
        bytes[bitmap_byte_idx] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        assert!(State::load(&path).is_err());
    }
}
