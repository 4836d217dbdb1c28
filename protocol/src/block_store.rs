//! # Block Store
//!
//! Raw payload bytes, concatenated in index order. The store keeps no index
//! of its own: every offset comes from the tree, which knows the size of each
//! leaf and of every subtree to its left.
//!
//! Sparse replicas leave zero-filled holes for blocks they never fetched, so
//! reads are checked against the leaf hash. A hole never reads back as data.

use tracing::trace;

use crate::crypto::hash::hash_leaf;
use crate::error::{Error, Result};
use crate::storage::RandomAccess;
use crate::tree::MerkleTree;

pub struct BlockStore {
    storage: Box<dyn RandomAccess>,
}

impl BlockStore {
    pub fn new(storage: Box<dyn RandomAccess>) -> Self {
        Self { storage }
    }

    /// Payload of block `index`. `NotFound` when it isn't stored here.
    pub async fn get(&self, tree: &MerkleTree, index: u64) -> Result<Vec<u8>> {
        let missing = || Error::NotFound(format!("block {}", index));
        if index >= tree.length() {
            return Err(missing());
        }
        let (offset, size) = match tree.byte_range(index).await {
            Ok(range) => range,
            Err(Error::NotFound(_)) => return Err(missing()),
            Err(e) => return Err(e),
        };
        if offset + size > self.storage.len().await? {
            return Err(missing());
        }
        let data = self.storage.read(offset, size).await?;
        let leaf = tree.get_node(index * 2).await?.ok_or_else(missing)?;
        if hash_leaf(&data) != leaf.hash {
            return Err(missing());
        }
        Ok(data)
    }

    /// Write one block at its tree-derived offset.
    pub async fn put(&self, tree: &MerkleTree, index: u64, data: &[u8]) -> Result<()> {
        let offset = tree.byte_offset(index).await?;
        trace!(index, offset, size = data.len(), "writing block");
        self.storage.write(offset, data).await
    }

    /// Write a contiguous run of blocks starting at `start` in one pass.
    ///
    /// For appends, call this before committing the batch: `start` then
    /// equals the tree length and the run lands at the current byte length.
    pub async fn put_batch<B: AsRef<[u8]>>(
        &self,
        tree: &MerkleTree,
        start: u64,
        blocks: &[B],
    ) -> Result<()> {
        if blocks.is_empty() {
            return Ok(());
        }
        let offset = tree.byte_offset(start).await?;
        let total: usize = blocks.iter().map(|b| b.as_ref().len()).sum();
        let mut run = Vec::with_capacity(total);
        for block in blocks {
            run.extend_from_slice(block.as_ref());
        }
        trace!(start, count = blocks.len(), offset, "writing block run");
        self.storage.write(offset, &run).await
    }

    pub async fn flush(&self) -> Result<()> {
        self.storage.flush().await
    }
}
