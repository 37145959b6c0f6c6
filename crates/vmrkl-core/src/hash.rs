//! SHA-256 primitives shared by the Reference, State, and build pipeline.

use sha2::{Digest, Sha256};

/// A 32-byte SHA-256 digest.
pub type Digest32 = [u8; 32];

/// The sentinel hash assigned to virtual leaves (indices `[L, Lcap)`): 32
/// zero bytes. Both the build pipeline and the on-disk loader agree on
/// this value so that padding is deterministic regardless of whether a
/// tree was just built or reloaded from disk.
#[must_use]
pub const fn virtual_leaf_sentinel() -> Digest32 {
    [0u8; 32]
}

/// Hash a leaf chunk's bytes.
#[must_use]
pub fn hash_leaf(bytes: &[u8]) -> Digest32 {
    let mut h = Sha256::new();
    h.update(bytes);
    h.finalize().into()
}

/// Hash an internal node from its two children's hashes
/// (`SHA-256(left ‖ right)`).
#[must_use]
pub fn hash_internal(left: &Digest32, right: &Digest32) -> Digest32 {
    let mut h = Sha256::new();
    h.update(left);
    h.update(right);
    h.finalize().into()
}
