//! # Tree Hashing
//!
//! Every hash in Omega is BLAKE3. Leaves, parents and the tree hash over the
//! roots each get a one-byte type prefix so a leaf can never be confused with
//! a parent of the same bytes (the classic second-preimage trick against
//! naive Merkle trees).
//!
//! ```text
//! leaf   = BLAKE3(0x00 || size_le64 || data)
//! parent = BLAKE3(0x01 || size_le64 || left.hash || right.hash)
//! tree   = BLAKE3(0x02 || (root.hash || root.index_le64 || root.size_le64)*)
//! ```
//!
//! Sizes are mixed into every node so a proof also authenticates byte
//! offsets, which is what makes `seek` verifiable.

use crate::config::HASH_LENGTH;

/// A 32-byte BLAKE3 digest.
pub type Hash = [u8; HASH_LENGTH];

const LEAF_TYPE: [u8; 1] = [0x00];
const PARENT_TYPE: [u8; 1] = [0x01];
const ROOT_TYPE: [u8; 1] = [0x02];

/// Context string for the message a writer signs.
const SIGNATURE_CONTEXT: &str = "omega 2026-01-01 tree signature";

/// Context string for discovery keys.
const DISCOVERY_CONTEXT: &str = "omega 2026-01-01 discovery key";

/// Compute the BLAKE3 hash of the input data.
pub fn blake3_hash(data: &[u8]) -> Hash {
    *blake3::hash(data).as_bytes()
}

/// Hash multiple byte slices together without concatenating them first.
pub fn blake3_hash_multi(parts: &[&[u8]]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Domain-separated hash using BLAKE3's `derive_key` mode.
///
/// Different contexts produce unrelated outputs for the same data, so a
/// signature over a tree hash can never be replayed as anything else.
pub fn domain_separated_hash(context: &str, data: &[u8]) -> Hash {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Hash of a single block.
pub fn hash_leaf(data: &[u8]) -> Hash {
    let size = (data.len() as u64).to_le_bytes();
    blake3_hash_multi(&[&LEAF_TYPE, &size, data])
}

/// Hash of an internal node from its two children.
pub fn hash_parent(left: &Hash, right: &Hash, size: u64) -> Hash {
    blake3_hash_multi(&[&PARENT_TYPE, &size.to_le_bytes(), left, right])
}

/// Tree hash over an ordered set of roots given as `(hash, index, size)`.
pub fn hash_roots<'a, I>(roots: I) -> Hash
where
    I: IntoIterator<Item = (&'a Hash, u64, u64)>,
{
    let mut hasher = blake3::Hasher::new();
    hasher.update(&ROOT_TYPE);
    for (hash, index, size) in roots {
        hasher.update(hash);
        hasher.update(&index.to_le_bytes());
        hasher.update(&size.to_le_bytes());
    }
    *hasher.finalize().as_bytes()
}

/// The message a writer signs to authenticate a tree of `length` blocks.
pub fn signable(tree_hash: &Hash, length: u64) -> Hash {
    let mut message = [0u8; HASH_LENGTH + 8];
    message[..HASH_LENGTH].copy_from_slice(tree_hash);
    message[HASH_LENGTH..].copy_from_slice(&length.to_le_bytes());
    domain_separated_hash(SIGNATURE_CONTEXT, &message)
}

/// Public identifier peers can use to find each other without revealing
/// the writer key itself.
pub fn discovery_key(public_key: &[u8; 32]) -> Hash {
    domain_separated_hash(DISCOVERY_CONTEXT, public_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_and_parent_never_collide() {
        // Same 72 bytes fed as a leaf and as a parent body must differ.
        let left = [1u8; 32];
        let right = [2u8; 32];
        let mut body = Vec::new();
        body.extend_from_slice(&left);
        body.extend_from_slice(&right);
        assert_ne!(hash_leaf(&body), hash_parent(&left, &right, 64));
    }

    #[test]
    fn leaf_hash_commits_to_size() {
        assert_ne!(hash_leaf(b""), hash_leaf(b"\0"));
        assert_eq!(hash_leaf(b"abc"), hash_leaf(b"abc"));
    }

    #[test]
    fn parent_hash_is_order_sensitive() {
        let a = hash_leaf(b"a");
        let b = hash_leaf(b"b");
        assert_ne!(hash_parent(&a, &b, 2), hash_parent(&b, &a, 2));
        assert_ne!(hash_parent(&a, &b, 2), hash_parent(&a, &b, 3));
    }

    #[test]
    fn root_hash_binds_index_and_size() {
        let h = hash_leaf(b"x");
        let one = hash_roots([(&h, 0, 1)]);
        let moved = hash_roots([(&h, 2, 1)]);
        let resized = hash_roots([(&h, 0, 2)]);
        assert_ne!(one, moved);
        assert_ne!(one, resized);
        assert_ne!(hash_roots(std::iter::empty()), one);
    }

    #[test]
    fn signable_depends_on_length() {
        let tree = blake3_hash(b"tree");
        assert_ne!(signable(&tree, 1), signable(&tree, 2));
    }

    #[test]
    fn test_blake3_hash_multi() {
        let multi = blake3_hash_multi(&[b"hello", b" world"]);
        assert_eq!(multi, blake3_hash(b"hello world"));
    }

    #[test]
    fn discovery_key_is_not_plain_blake3() {
        let key = [7u8; 32];
        assert_ne!(discovery_key(&key), blake3_hash(&key));
        assert_eq!(discovery_key(&key), discovery_key(&key));
    }
}
