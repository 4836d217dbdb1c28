//! # Cryptographic Primitives
//!
//! BLAKE3 for every hash in the tree, Ed25519 for the optional writer
//! signature over tree upgrades. Both are thin wrappers over audited crates.

pub mod hash;
pub mod keys;

pub use hash::{discovery_key, hash_leaf, hash_parent, hash_roots, Hash};
pub use keys::{Authority, KeyError, Keypair, PublicKey, Signature};
