//! Tree nodes and their fixed-size on-disk record.

use serde::{Deserialize, Serialize};

use super::flat;
use crate::config::{HASH_LENGTH, NODE_RECORD_SIZE};
use crate::crypto::hash::{hash_leaf, hash_parent, Hash};
use crate::error::{Error, Result};

/// One node of the Merkle tree.
///
/// `size` is the number of payload bytes under the node, so a leaf's size is
/// its block length and a root's size is the byte length of its subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub index: u64,
    pub size: u64,
    pub hash: Hash,
}

impl Node {
    /// Leaf for block `block` holding `data`.
    pub fn leaf(block: u64, data: &[u8]) -> Self {
        Self {
            index: block * 2,
            size: data.len() as u64,
            hash: hash_leaf(data),
        }
    }

    /// Parent of two siblings. `left` must be the left child.
    pub fn parent(left: &Node, right: &Node) -> Self {
        let size = left.size + right.size;
        Self {
            index: flat::parent(left.index),
            size,
            hash: hash_parent(&left.hash, &right.hash, size),
        }
    }

    /// Parent of `self` and its sibling, in whichever order the flat layout
    /// dictates.
    pub fn join(&self, sibling: &Node) -> Self {
        if flat::is_left(self.index) {
            Self::parent(self, sibling)
        } else {
            Self::parent(sibling, self)
        }
    }

    pub fn depth(&self) -> u64 {
        flat::depth(self.index)
    }

    /// Fixed 40-byte record: hash followed by little-endian size.
    pub fn encode(&self) -> [u8; NODE_RECORD_SIZE as usize] {
        let mut record = [0u8; NODE_RECORD_SIZE as usize];
        record[..HASH_LENGTH].copy_from_slice(&self.hash);
        record[HASH_LENGTH..].copy_from_slice(&self.size.to_le_bytes());
        record
    }

    /// Decode a record read from storage. An all-zero record is a hole and
    /// decodes to `None`; no real node hashes to zero.
    pub fn decode(index: u64, record: &[u8]) -> Result<Option<Self>> {
        if record.len() != NODE_RECORD_SIZE as usize {
            return Err(Error::Corrupt(format!(
                "node record {} has {} bytes",
                index,
                record.len()
            )));
        }
        if record.iter().all(|b| *b == 0) {
            return Ok(None);
        }
        let mut hash = [0u8; HASH_LENGTH];
        hash.copy_from_slice(&record[..HASH_LENGTH]);
        let mut size = [0u8; 8];
        size.copy_from_slice(&record[HASH_LENGTH..]);
        Ok(Some(Self {
            index,
            size: u64::from_le_bytes(size),
            hash,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_orders_children() {
        let a = Node::leaf(0, b"a");
        let b = Node::leaf(1, b"b");
        let p = a.join(&b);
        assert_eq!(p, b.join(&a));
        assert_eq!(p.index, 1);
        assert_eq!(p.size, 2);
        assert_eq!(p.depth(), 1);
    }

    #[test]
    fn record_decodes_back() {
        let node = Node::leaf(3, b"payload");
        let decoded = Node::decode(6, &node.encode()).unwrap();
        assert_eq!(decoded, Some(node));
    }

    #[test]
    fn zero_record_is_a_hole() {
        assert_eq!(Node::decode(0, &[0u8; 40]).unwrap(), None);
        assert!(Node::decode(0, &[0u8; 12]).is_err());
    }
}
