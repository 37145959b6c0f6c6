//! Pure geometry of the fixed-size binary tree over power-of-two-aligned
//! chunks (§3.1, §4.1 of the design).
//!
//! [`Shape`] has no I/O and no concurrency concerns: it is a plain value
//! that answers questions about node indices, chunk indices, and byte
//! ranges for a given `(total_size, chunk_size)` pair.

use crate::error::{CoreError, CoreResult};

/// Geometry of a content-addressed tree over an artifact of `total_size`
/// bytes, chunked at `chunk_size` bytes.
///
/// Node indices use heap order over a complete binary tree of `cap_leaf`
/// leaves: the root is `0`, internal nodes occupy `[0, internal_node_count)`,
/// and leaves occupy `[internal_node_count, node_count)`. Leaves at or past
/// `leaf_count` are *virtual*: padding that makes the tree complete, but
/// with no backing chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Shape {
    total_size: u64,
    chunk_size: u64,
    leaf_count: u64,
    cap_leaf: u64,
}

impl Shape {
    /// Build a shape for `total_size` bytes split into `chunk_size`-byte
    /// chunks. `chunk_size` must be a positive power of two.
    pub fn new(total_size: u64, chunk_size: u64) -> CoreResult<Self> {
        if chunk_size == 0 || !chunk_size.is_power_of_two() {
            return Err(CoreError::InvalidShape {
                reason: format!("chunk_size {chunk_size} must be a positive power of two"),
            });
        }
        let leaf_count = if total_size == 0 {
            0
        } else {
            total_size.div_ceil(chunk_size)
        };
        let cap_leaf = next_power_of_two_u64(leaf_count.max(1));
        Ok(Self {
            total_size,
            chunk_size,
            leaf_count,
            cap_leaf,
        })
    }

    /// Total content size in bytes.
    #[must_use]
    pub const fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Chunk size in bytes.
    #[must_use]
    pub const fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Number of actual (non-virtual) chunks / leaves.
    #[must_use]
    pub const fn leaf_count(&self) -> u64 {
        self.leaf_count
    }

    /// Padded leaf width: the next power of two at or above `leaf_count`
    /// (`1` when `leaf_count <= 1`).
    #[must_use]
    pub const fn cap_leaf(&self) -> u64 {
        self.cap_leaf
    }

    /// Number of internal nodes (`cap_leaf - 1`).
    #[must_use]
    pub const fn internal_node_count(&self) -> u64 {
        self.cap_leaf - 1
    }

    /// Total node count (`2 * cap_leaf - 1`).
    #[must_use]
    pub const fn node_count(&self) -> u64 {
        2 * self.cap_leaf - 1
    }

    /// Whether `node` indexes a leaf (actual or virtual).
    #[must_use]
    pub const fn is_leaf_node(&self, node: u64) -> bool {
        node >= self.internal_node_count()
    }

    /// Map a leaf-node index to its chunk index. Panics (via `CoreError`)
    /// if `node` is not a leaf index covering an actual chunk.
    pub fn leaf_node_to_chunk_index(&self, node: u64) -> CoreResult<u64> {
        let first_leaf = self.internal_node_count();
        if node < first_leaf || node >= self.node_count() {
            return Err(CoreError::OutOfRange {
                what: "leaf node index",
                value: node,
                bound: self.node_count(),
            });
        }
        let k = node - first_leaf;
        if k >= self.leaf_count {
            return Err(CoreError::OutOfRange {
                what: "virtual leaf has no chunk",
                value: node,
                bound: first_leaf + self.leaf_count,
            });
        }
        Ok(k)
    }

    /// Map a chunk index `k` (`0 <= k < leaf_count`) to its leaf-node index.
    pub fn chunk_index_to_leaf_node(&self, k: u64) -> CoreResult<u64> {
        if k >= self.leaf_count {
            return Err(CoreError::OutOfRange {
                what: "chunk index",
                value: k,
                bound: self.leaf_count,
            });
        }
        Ok(self.internal_node_count() + k)
    }

    /// The chunk index covering byte position `p`.
    pub fn chunk_index_for_position(&self, p: u64) -> CoreResult<u64> {
        if p >= self.total_size {
            return Err(CoreError::OutOfRange {
                what: "byte position",
                value: p,
                bound: self.total_size,
            });
        }
        Ok(p / self.chunk_size)
    }

    /// The clipped leaf-index range `[a, b)` (in chunk space, `b <=
    /// leaf_count`) covered by `node`. Never returns indices `>= leaf_count`:
    /// any virtual tail past `leaf_count` is clipped away. This is the
    /// fix point for the classic off-by-one at the non-power-of-two
    /// boundary: callers must always go through this function rather than
    /// computing the unclipped heap-order range themselves.
    #[must_use]
    pub fn leaf_range_for_node(&self, node: u64) -> (u64, u64) {
        let (a, b) = self.unclipped_leaf_range(node);
        (a.min(self.leaf_count), b.min(self.leaf_count))
    }

    /// The byte range `[offset, offset+len)` covered by `node`, clipped to
    /// `total_size`.
    #[must_use]
    pub fn byte_range_for_node(&self, node: u64) -> (u64, u64) {
        let (a, b) = self.leaf_range_for_node(node);
        let start = a * self.chunk_size;
        let end = (b * self.chunk_size).min(self.total_size);
        (start, end.max(start))
    }

    /// A minimal set of node indices whose (clipped) byte ranges cover
    /// `[offset, offset+length)`. Leaves are used unless an internal node's
    /// clipped range sits entirely inside the requested span, in which
    /// case the internal node is returned instead (exact consolidation
    /// only; schedulers build on top of this for partial coverage).
    pub fn nodes_for_byte_range(&self, offset: u64, length: u64) -> CoreResult<Vec<u64>> {
        if length == 0 {
            return Ok(Vec::new());
        }
        let end = offset
            .checked_add(length)
            .ok_or(CoreError::InvalidShape {
                reason: "offset + length overflows u64".into(),
            })?
            .min(self.total_size);
        if offset >= end {
            return Ok(Vec::new());
        }
        let first_chunk = self.chunk_index_for_position(offset)?;
        let last_chunk = self.chunk_index_for_position(end - 1)?;

        let mut nodes = Vec::new();
        let mut k = first_chunk;
        while k <= last_chunk {
            // Walk up from the leaf as long as the parent's clipped range
            // stays within [first_chunk, last_chunk].
            let mut node = self.chunk_index_to_leaf_node(k)?;
            loop {
                if node == 0 {
                    break;
                }
                let parent = (node - 1) / 2;
                let (pa, pb) = self.leaf_range_for_node(parent);
                if pa < first_chunk || pb > last_chunk + 1 {
                    break;
                }
                node = parent;
            }
            let (_, b) = self.leaf_range_for_node(node);
            nodes.push(node);
            k = b;
        }
        Ok(nodes)
    }

    /// Unclipped heap-order leaf range `[a, b)` for `node`, in units of
    /// cap-leaf-space leaf indices (may extend past `leaf_count`).
    fn unclipped_leaf_range(&self, node: u64) -> (u64, u64) {
        if self.cap_leaf <= 1 {
            return (0, self.cap_leaf);
        }
        // Heap-order: level of `node` is floor(log2(node+1)); its span at
        // the leaf level has width cap_leaf >> level.
        let level = 64 - (node + 1).leading_zeros() as u64 - 1;
        let total_levels = self.cap_leaf.trailing_zeros() as u64;
        let width = self.cap_leaf >> level;
        let first_at_level = (1u64 << level) - 1;
        let offset_in_level = node - first_at_level;
        debug_assert!(level <= total_levels);
        let a = offset_in_level * width;
        (a, a + width)
    }
}

#[must_use]
fn next_power_of_two_u64(mut x: u64) -> u64 {
    if x <= 1 {
        return 1;
    }
    x -= 1;
    x |= x >> 1;
    x |= x >> 2;
    x |= x >> 4;
    x |= x >> 8;
    x |= x >> 16;
    x |= x >> 32;
    x + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_size_file() {
        let s = Shape::new(0, 1024).unwrap();
        assert_eq!(s.leaf_count(), 0);
        assert_eq!(s.cap_leaf(), 1);
        assert_eq!(s.node_count(), 1);
    }

    #[test]
    fn exactly_one_chunk() {
        let s = Shape::new(1024, 1024).unwrap();
        assert_eq!(s.leaf_count(), 1);
        assert_eq!(s.cap_leaf(), 1);
        assert_eq!(s.internal_node_count(), 0);
        assert_eq!(s.node_count(), 1);
        assert!(s.is_leaf_node(0));
    }

    #[test]
    fn rejects_non_power_of_two_chunk() {
        assert!(Shape::new(100, 3).is_err());
        assert!(Shape::new(100, 0).is_err());
    }

    #[test]
    fn bijection_chunk_leaf_node() {
        let s = Shape::new(5 * 1024, 1024).unwrap();
        for k in 0..s.leaf_count() {
            let n = s.chunk_index_to_leaf_node(k).unwrap();
            assert_eq!(s.leaf_node_to_chunk_index(n).unwrap(), k);
        }
    }

    #[test]
    fn non_power_of_two_leaf_count_clips_virtual_tail() {
        // S = 5*C -> L=5, Lcap=8, I=7, N=15.
        let s = Shape::new(5 * 1024, 1024).unwrap();
        assert_eq!(s.leaf_count(), 5);
        assert_eq!(s.cap_leaf(), 8);
        assert_eq!(s.internal_node_count(), 7);
        assert_eq!(s.node_count(), 15);

        // Every clipped leaf range must stay within [0, leaf_count).
        for node in 0..s.node_count() {
            let (a, b) = s.leaf_range_for_node(node);
            assert!(a <= s.leaf_count());
            assert!(b <= s.leaf_count());
        }

        // The root covers all 5 real chunks, not 8.
        let (a, b) = s.leaf_range_for_node(0);
        assert_eq!((a, b), (0, 5));
    }

    #[test]
    fn node_coverage_is_contiguous_and_gap_free() {
        let s = Shape::new(5 * 1024, 1024).unwrap();
        let nodes = s.nodes_for_byte_range(0, 5 * 1024).unwrap();
        let mut covered = vec![false; 5];
        for n in nodes {
            let (a, b) = s.leaf_range_for_node(n);
            for k in a..b {
                covered[k as usize] = true;
            }
        }
        assert!(covered.iter().all(|&c| c));
    }

    #[test]
    fn last_real_chunk_never_yields_virtual_indices() {
        let s = Shape::new(5 * 1024, 1024).unwrap();
        let nodes = s.nodes_for_byte_range(4 * 1024, 1024).unwrap();
        for n in nodes {
            let (a, b) = s.leaf_range_for_node(n);
            assert_eq!((a, b), (4, 5));
        }
    }

    #[test]
    fn byte_range_for_node_clips_to_total_size() {
        // S not a multiple of C: last chunk is short.
        let s = Shape::new(1024 + 100, 1024).unwrap();
        assert_eq!(s.leaf_count(), 2);
        let last_leaf = s.chunk_index_to_leaf_node(1).unwrap();
        let (start, end) = s.byte_range_for_node(last_leaf);
        assert_eq!(start, 1024);
        assert_eq!(end, 1024 + 100);
    }

    #[test]
    fn position_out_of_range_errors() {
        let s = Shape::new(1024, 1024).unwrap();
        assert!(s.chunk_index_for_position(1024).is_err());
        assert!(s.chunk_index_for_position(1023).is_ok());
    }

    proptest::proptest! {
        #[test]
        fn clip_correctness_never_exceeds_leaf_count(total in 0u64..20_000, chunk_pow in 0u32..14) {
            let chunk = 1u64 << chunk_pow;
            if let Ok(s) = Shape::new(total, chunk) {
                for node in 0..s.node_count() {
                    let (_a, b) = s.leaf_range_for_node(node);
                    proptest::prop_assert!(b <= s.leaf_count());
                }
            }
        }
    }
}
