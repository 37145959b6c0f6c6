//! The trusted, immutable tree of hashes (§3.2, §4.2).

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use vmrkl_core::error::ChannelError;
use vmrkl_core::hash::{hash_internal, virtual_leaf_sentinel, Digest32};
use vmrkl_core::shape::Shape;

use crate::footer::{self, GeometryFields};

/// The trusted, complete tree: a [`Shape`] plus one SHA-256 hash per node,
/// in heap order (root first). Built once — from a full set of leaf
/// hashes, or loaded from a `.mref` file — and immutable thereafter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reference {
    shape: Shape,
    hashes: Vec<Digest32>,
}

impl Reference {
    /// Build a reference from a complete set of `shape.leaf_count()` leaf
    /// hashes, computing internal hashes bottom-up. Virtual leaves (past
    /// `leaf_count`, up to `cap_leaf`) are assigned the well-known sentinel
    /// so that construction is deterministic regardless of padding.
    pub fn from_leaf_hashes(
        shape: Shape,
        leaf_hashes: Vec<Digest32>,
    ) -> Result<Self, ChannelError> {
        if leaf_hashes.len() as u64 != shape.leaf_count() {
            return Err(ChannelError::ShapeMismatch {
                reason: format!(
                    "expected {} leaf hashes, got {}",
                    shape.leaf_count(),
                    leaf_hashes.len()
                ),
            });
        }

        let node_count = shape.node_count() as usize;
        let mut hashes = vec![[0u8; 32]; node_count];
        let first_leaf = shape.internal_node_count() as usize;
        let sentinel = virtual_leaf_sentinel();

        for (k, h) in leaf_hashes.into_iter().enumerate() {
            hashes[first_leaf + k] = h;
        }
        for k in leaf_hashes_len(&shape)..cap_leaf_len(&shape) {
            hashes[first_leaf + k] = sentinel;
        }

        if node_count > 1 {
            // Bottom-up pairwise hashing over internal indices [I-1, 0].
            let internal_count = shape.internal_node_count() as usize;
            for node in (0..internal_count).rev() {
                let left = 2 * node + 1;
                let right = 2 * node + 2;
                hashes[node] = hash_internal(&hashes[left], &hashes[right]);
            }
        }

        Ok(Self { shape, hashes })
    }

    /// Hash of `node_index`, in heap order.
    #[must_use]
    pub fn hash(&self, node_index: u64) -> Digest32 {
        self.hashes[node_index as usize]
    }

    /// This reference's shape.
    #[must_use]
    pub const fn shape(&self) -> Shape {
        self.shape
    }

    /// The Merkle root hash (node `0`).
    #[must_use]
    pub fn root_hash(&self) -> Digest32 {
        self.hashes[0]
    }

    /// Atomically write this reference to `path` (write to a sibling temp
    /// file, then rename over the destination).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ChannelError> {
        let path = path.as_ref();
        let mut payload = Vec::with_capacity(self.hashes.len() * 32);
        for h in &self.hashes {
            payload.extend_from_slice(h);
        }
        footer::write_reference_footer(
            &mut payload,
            GeometryFields {
                chunk_size: self.shape.chunk_size(),
                total_content_size: self.shape.total_size(),
                leaf_count: self.shape.leaf_count(),
                node_count: self.shape.node_count(),
            },
        )
        .map_err(ChannelError::Io)?;

        let tmp = sibling_temp_path(path);
        fs::write(&tmp, &payload).map_err(ChannelError::Io)?;
        fs::rename(&tmp, path).map_err(ChannelError::Io)?;
        Ok(())
    }

    /// Load a reference from a `.mref` file, validating magic, version,
    /// and footer checksum.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ChannelError> {
        let path = path.as_ref();
        let path_str = path.display().to_string();
        let data = fs::read(path).map_err(ChannelError::Io)?;
        let parsed = footer::read_reference_footer(&path_str, &data)?;

        let shape = Shape::new(parsed.geometry.total_content_size, parsed.geometry.chunk_size)
            .map_err(ChannelError::InvalidShape)?;
        if shape.node_count() != parsed.geometry.node_count
            || shape.leaf_count() != parsed.geometry.leaf_count
        {
            return Err(ChannelError::CorruptReference {
                path: path_str,
                reason: "geometry in footer disagrees with recomputed shape".to_string(),
            });
        }

        let payload = &data[..parsed.footer_start as usize];
        let expected_len = parsed.geometry.node_count as usize * 32;
        if payload.len() != expected_len {
            return Err(ChannelError::CorruptReference {
                path: path_str,
                reason: format!(
                    "hash array length {} does not match expected {}",
                    payload.len(),
                    expected_len
                ),
            });
        }

        let mut hashes = Vec::with_capacity(parsed.geometry.node_count as usize);
        for chunk in payload.chunks_exact(32) {
            let mut h = [0u8; 32];
            h.copy_from_slice(chunk);
            hashes.push(h);
        }

        Ok(Self { shape, hashes })
    }
}

impl fmt::Display for Reference {
    /// Short diagnostic form: `<leaf_count> leaves, root <hex root hash>`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} leaves, root {}",
            self.shape.leaf_count(),
            hex::encode(self.root_hash())
        )
    }
}

fn leaf_hashes_len(shape: &Shape) -> usize {
    shape.leaf_count() as usize
}

fn cap_leaf_len(shape: &Shape) -> usize {
    shape.cap_leaf() as usize
}

/// A sibling path `<path>.tmp-<pid>` used for atomic write-then-rename.
pub(crate) fn sibling_temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".tmp-{}", std::process::id()));
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmrkl_core::hash::hash_leaf;

    fn leaves(n: u64) -> Vec<Digest32> {
        (0..n).map(|i| hash_leaf(&i.to_le_bytes())).collect()
    }

    #[test]
    fn round_trip_persistence() {
        let shape = Shape::new(5 * 1024, 1024).unwrap();
        let r = Reference::from_leaf_hashes(shape, leaves(5)).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.mref");
        r.save(&path).unwrap();

        let loaded = Reference::load(&path).unwrap();
        assert_eq!(loaded.shape(), r.shape());
        assert_eq!(loaded.root_hash(), r.root_hash());
        for n in 0..shape.node_count() {
            assert_eq!(loaded.hash(n), r.hash(n));
        }
    }

    #[test]
    fn empty_artifact_has_all_zero_root() {
        let shape = Shape::new(0, 1024).unwrap();
        let r = Reference::from_leaf_hashes(shape, vec![]).unwrap();
        assert_eq!(r.root_hash(), virtual_leaf_sentinel());
        assert_eq!(r.root_hash(), [0u8; 32]);
    }

    #[test]
    fn virtual_leaves_use_sentinel() {
        // L=5, Lcap=8: leaves 5,6,7 are virtual.
        let shape = Shape::new(5 * 1024, 1024).unwrap();
        let r = Reference::from_leaf_hashes(shape, leaves(5)).unwrap();
        let first_leaf = shape.internal_node_count();
        for k in 5..8 {
            assert_eq!(r.hash(first_leaf + k), virtual_leaf_sentinel());
        }
    }

    #[test]
    fn rejects_wrong_leaf_count() {
        let shape = Shape::new(5 * 1024, 1024).unwrap();
        assert!(Reference::from_leaf_hashes(shape, leaves(4)).is_err());
    }

    #[test]
    fn display_shows_leaf_count_and_hex_root() {
        let shape = Shape::new(5 * 1024, 1024).unwrap();
        let r = Reference::from_leaf_hashes(shape, leaves(5)).unwrap();
        let shown = r.to_string();
        assert!(shown.starts_with("5 leaves, root "));
        assert!(shown.contains(&hex::encode(r.root_hash())));
    }

    #[test]
    fn corrupt_file_fails_to_load() {
        let shape = Shape::new(1024, 1024).unwrap();
        let r = Reference::from_leaf_hashes(shape, leaves(1)).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.mref");
        r.save(&path).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        assert!(Reference::load(&path).is_err());
    }
}
