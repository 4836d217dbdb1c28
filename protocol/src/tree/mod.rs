//! # Merkle Tree
//!
//! The integrity structure of a log. Every block is a leaf; every pair of
//! complete subtrees gets a parent; the roots of the largest complete
//! subtrees (the "peaks") authenticate the whole sequence.
//!
//! ## Storage Layout
//!
//! ```text
//! [0..128)              header: magic "OMGT", version, length, signature
//! [128 + 40·i ..)       node i: hash(32) || size_le(8), zeros = absent
//! ```
//!
//! A sparse replica only holds the nodes on the paths it has verified, so
//! holes are normal. Flat-tree indexing means a node's position never
//! depends on which other nodes exist.
//!
//! ## Design Decisions
//!
//! 1. **Staged batches.** Appends and verifications accumulate in a
//!    [`TreeBatch`] that borrows nothing from the tree. Readers never see
//!    half-applied state, and a failed verification just drops the batch.
//!
//! 2. **Trust is anchored, never assumed.** A proof for a tree we already
//!    know must hash up to nodes we hold. A longer tree must hash down to
//!    every root we already trust, and its peaks must satisfy the log's
//!    [`Authority`].
//!
//! 3. **Flush is explicit.** Commit only moves nodes into an in-memory
//!    overlay. `flush()` writes nodes first and the header last, so a crash
//!    mid-flush leaves the previous header pointing at complete nodes.

pub mod flat;
pub mod node;
pub mod proof;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::{debug, trace};

pub use node::Node;
pub use proof::{BlockProof, Proof, ProofRequest, SeekProof};

use crate::config::{
    NODE_RECORD_SIZE, SIGNATURE_LENGTH, TREE_FORMAT_VERSION, TREE_HEADER_SIZE, TREE_MAGIC,
};
use crate::crypto::hash::{hash_roots, Hash};
use crate::crypto::keys::{Authority, Signature};
use crate::error::{Error, Result};
use crate::storage::{read_padded, RandomAccess};

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Header {
    length: u64,
    signature: Option<Signature>,
}

impl Header {
    fn encode(&self) -> [u8; TREE_HEADER_SIZE as usize] {
        let mut out = [0u8; TREE_HEADER_SIZE as usize];
        out[0..4].copy_from_slice(&TREE_MAGIC);
        out[4..8].copy_from_slice(&TREE_FORMAT_VERSION.to_le_bytes());
        out[8..16].copy_from_slice(&self.length.to_le_bytes());
        if let Some(sig) = &self.signature {
            if sig.as_bytes().len() == SIGNATURE_LENGTH {
                out[16] = 1;
                out[17..17 + SIGNATURE_LENGTH].copy_from_slice(sig.as_bytes());
            }
        }
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        // Nodes are written before the first header, so a crash in between
        // leaves a zeroed header over an otherwise empty tree.
        if bytes.iter().all(|b| *b == 0) {
            return Ok(Self::default());
        }
        if bytes[0..4] != TREE_MAGIC {
            return Err(Error::Corrupt("bad tree magic".to_string()));
        }
        let mut word = [0u8; 4];
        word.copy_from_slice(&bytes[4..8]);
        let version = u32::from_le_bytes(word);
        if version != TREE_FORMAT_VERSION {
            return Err(Error::Corrupt(format!(
                "unsupported tree version {}",
                version
            )));
        }
        let mut long = [0u8; 8];
        long.copy_from_slice(&bytes[8..16]);
        let signature = match bytes[16] {
            0 => None,
            _ => Some(Signature::from_bytes(&bytes[17..17 + SIGNATURE_LENGTH])),
        };
        Ok(Self {
            length: u64::from_le_bytes(long),
            signature,
        })
    }
}

// ---------------------------------------------------------------------------
// MerkleTree
// ---------------------------------------------------------------------------

/// The authoritative tree over a log's blocks.
pub struct MerkleTree {
    storage: Box<dyn RandomAccess>,
    authority: Authority,
    length: u64,
    byte_length: u64,
    roots: Vec<Node>,
    signature: Option<Signature>,
    /// Committed nodes not yet written to storage.
    unflushed: BTreeMap<u64, Node>,
    header_dirty: bool,
}

impl MerkleTree {
    /// Load a persisted tree, or start an empty one on empty storage.
    pub async fn open(storage: Box<dyn RandomAccess>, authority: Authority) -> Result<Self> {
        let mut tree = Self {
            storage,
            authority,
            length: 0,
            byte_length: 0,
            roots: Vec::new(),
            signature: None,
            unflushed: BTreeMap::new(),
            header_dirty: false,
        };

        let header = Header::decode(&read_padded(tree.storage.as_ref(), 0, TREE_HEADER_SIZE).await?)?;
        let mut roots = Vec::new();
        for index in flat::full_roots(header.length * 2) {
            let root = tree
                .stored_node(index)
                .await?
                .ok_or_else(|| Error::Corrupt(format!("missing root node {}", index)))?;
            roots.push(root);
        }

        tree.length = header.length;
        tree.byte_length = roots.iter().map(|r| r.size).sum();
        tree.roots = roots;
        tree.signature = header.signature;

        if tree.signature.is_some()
            && !tree
                .authority
                .verify_tree(&tree.tree_hash(), tree.length, tree.signature.as_ref())
        {
            return Err(Error::Corrupt(
                "stored signature does not match the tree".to_string(),
            ));
        }

        debug!(length = tree.length, byte_length = tree.byte_length, "tree opened");
        Ok(tree)
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn byte_length(&self) -> u64 {
        self.byte_length
    }

    /// Current peaks, left to right.
    pub fn roots(&self) -> &[Node] {
        &self.roots
    }

    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Hash over the current peaks. This is what a writer signs.
    pub fn tree_hash(&self) -> Hash {
        hash_roots(self.roots.iter().map(|r| (&r.hash, r.index, r.size)))
    }

    /// Look up a node, committed or persisted. `None` for holes.
    pub async fn get_node(&self, index: u64) -> Result<Option<Node>> {
        if let Some(node) = self.unflushed.get(&index) {
            return Ok(Some(*node));
        }
        self.stored_node(index).await
    }

    async fn stored_node(&self, index: u64) -> Result<Option<Node>> {
        let offset = TREE_HEADER_SIZE + NODE_RECORD_SIZE * index;
        let record = read_padded(self.storage.as_ref(), offset, NODE_RECORD_SIZE).await?;
        Node::decode(index, &record)
    }

    async fn require_node(&self, index: u64) -> Result<Node> {
        self.get_node(index)
            .await?
            .ok_or_else(|| Error::NotFound(format!("tree node {}", index)))
    }

    /// Start a staged transaction against the current state.
    pub fn batch(&self) -> TreeBatch {
        TreeBatch {
            base_length: self.length,
            length: self.length,
            byte_length: self.byte_length,
            roots: self.roots.clone(),
            nodes: BTreeMap::new(),
            signature: self.signature.clone(),
            appended: false,
            upgraded: false,
        }
    }

    /// Apply a batch atomically. Nothing is durable until [`flush`].
    ///
    /// [`flush`]: MerkleTree::flush
    pub fn commit(&mut self, batch: TreeBatch) -> Result<()> {
        if batch.base_length != self.length {
            return Err(Error::StaleBatch {
                expected: batch.base_length,
                actual: self.length,
            });
        }
        if batch.appended && !self.authority.is_writable() {
            return Err(Error::NotWritable);
        }

        let grew = batch.length != self.length;
        self.unflushed.extend(batch.nodes);
        if grew {
            self.length = batch.length;
            self.byte_length = batch.byte_length;
            self.roots = batch.roots;
            self.signature = if batch.appended {
                self.authority.sign_tree(&self.tree_hash(), self.length)
            } else {
                batch.signature
            };
            self.header_dirty = true;
        }

        debug!(
            length = self.length,
            byte_length = self.byte_length,
            upgraded = batch.upgraded,
            "tree batch committed"
        );
        Ok(())
    }

    /// Persist committed nodes and the header. A no-op when nothing changed.
    pub async fn flush(&mut self) -> Result<()> {
        if self.unflushed.is_empty() && !self.header_dirty {
            return Ok(());
        }

        // Coalesce consecutive indices into single writes.
        let mut run = Vec::new();
        let mut run_start = 0;
        let mut next = None;
        for (index, node) in &self.unflushed {
            if next != Some(*index) && !run.is_empty() {
                self.write_nodes(run_start, &run).await?;
                run.clear();
            }
            if run.is_empty() {
                run_start = *index;
            }
            run.extend_from_slice(&node.encode());
            next = Some(index + 1);
        }
        if !run.is_empty() {
            self.write_nodes(run_start, &run).await?;
        }

        if self.header_dirty {
            let header = Header {
                length: self.length,
                signature: self.signature.clone(),
            };
            self.storage.write(0, &header.encode()).await?;
        }
        self.storage.flush().await?;

        trace!(nodes = self.unflushed.len(), length = self.length, "tree flushed");
        self.unflushed.clear();
        self.header_dirty = false;
        Ok(())
    }

    async fn write_nodes(&self, start: u64, records: &[u8]) -> Result<()> {
        self.storage
            .write(TREE_HEADER_SIZE + NODE_RECORD_SIZE * start, records)
            .await
    }

    // -- Proofs -------------------------------------------------------------

    /// Build a proof answering `request` from the current tree.
    ///
    /// Block payloads are never read here; `value` comes back `None` and the
    /// caller fills it in when bytes were requested.
    pub async fn proof(&self, request: &ProofRequest) -> Result<Proof> {
        let mut proof = Proof {
            length: self.length,
            peaks: self.roots.clone(),
            signature: self.signature.clone(),
            upgrade: Vec::new(),
            block: None,
            seek: None,
        };

        if request.known_length < self.length {
            proof.upgrade = self.upgrade_nodes(request.known_length).await?;
        }

        if let Some(index) = request.block_index {
            if index >= self.length {
                return Err(Error::NotFound(format!("block {}", index)));
            }
            let mut nodes = Vec::new();
            if !request.include_bytes {
                nodes.push(self.require_node(index * 2).await?);
            }
            nodes.extend(self.path_nodes(index * 2).await?);
            proof.block = Some(BlockProof {
                index,
                value: None,
                nodes,
            });
        }

        if let Some(bytes) = request.seek_offset {
            let (index, _) = self
                .seek(bytes)
                .update(self)
                .await?
                .ok_or_else(|| Error::NotFound(format!("byte offset {}", bytes)))?;
            let mut nodes = vec![self.require_node(index * 2).await?];
            nodes.extend(self.path_nodes(index * 2).await?);
            proof.seek = Some(SeekProof { bytes, nodes });
        }

        Ok(proof)
    }

    /// Siblings from `index` up to the peak covering it.
    async fn path_nodes(&self, mut index: u64) -> Result<Vec<Node>> {
        let peaks: HashSet<u64> = self.roots.iter().map(|r| r.index).collect();
        let mut nodes = Vec::new();
        while !peaks.contains(&index) {
            nodes.push(self.require_node(flat::sibling(index)).await?);
            index = flat::parent(index);
        }
        Ok(nodes)
    }

    /// Nodes a holder of the `known` roots needs to reach the current peaks.
    /// Anything on a climb path is recomputed by the receiver and left out.
    async fn upgrade_nodes(&self, known: u64) -> Result<Vec<Node>> {
        let peaks: HashSet<u64> = self.roots.iter().map(|r| r.index).collect();
        let mut on_path = BTreeSet::new();
        let mut siblings = BTreeSet::new();

        for root in flat::full_roots(known * 2) {
            let mut index = root;
            while !peaks.contains(&index) {
                on_path.insert(index);
                siblings.insert(flat::sibling(index));
                index = flat::parent(index);
            }
            on_path.insert(index);
        }

        let mut nodes = Vec::new();
        for index in siblings.difference(&on_path) {
            nodes.push(self.require_node(*index).await?);
        }
        Ok(nodes)
    }

    // -- Offsets ------------------------------------------------------------

    /// Byte offset of block `index` in the data resource.
    ///
    /// Needs only the left siblings along the block's path, so it works on
    /// sparse replicas for any block they have verified.
    pub async fn byte_offset(&self, index: u64) -> Result<u64> {
        if index == self.length {
            return Ok(self.byte_length);
        }
        let leaf = index * 2;
        let mut offset = 0;
        for root in &self.roots {
            if flat::right_span(root.index) < leaf {
                offset += root.size;
                continue;
            }
            let mut cursor = leaf;
            while cursor != root.index {
                if !flat::is_left(cursor) {
                    offset += self.require_node(flat::sibling(cursor)).await?.size;
                }
                cursor = flat::parent(cursor);
            }
            return Ok(offset);
        }
        Err(Error::NotFound(format!("block {}", index)))
    }

    /// `(offset, size)` of block `index`.
    pub async fn byte_range(&self, index: u64) -> Result<(u64, u64)> {
        let offset = self.byte_offset(index).await?;
        let size = self.require_node(index * 2).await?.size;
        Ok((offset, size))
    }

    /// Begin resolving which block owns byte `bytes`.
    pub fn seek(&self, bytes: u64) -> Seeker {
        Seeker { bytes }
    }
}

// ---------------------------------------------------------------------------
// Seeker
// ---------------------------------------------------------------------------

/// A pending byte-offset lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Seeker {
    bytes: u64,
}

impl Seeker {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Try to resolve against the local tree. Returns
    /// `Some((block, offset_within_block))`, or `None` when a node needed for
    /// the descent is missing and must be fetched from a peer.
    pub async fn update(&self, tree: &MerkleTree) -> Result<Option<(u64, u64)>> {
        if self.bytes >= tree.byte_length {
            return Err(Error::OutOfBounds(self.bytes));
        }

        let mut bytes = self.bytes;
        for root in &tree.roots {
            if bytes >= root.size {
                bytes -= root.size;
                continue;
            }
            let mut index = root.index;
            while let Some(left_index) = flat::left_child(index) {
                let Some(left) = tree.get_node(left_index).await? else {
                    return Ok(None);
                };
                if bytes < left.size {
                    index = left_index;
                } else {
                    bytes -= left.size;
                    index = flat::sibling(left_index);
                }
            }
            return Ok(Some((index / 2, bytes)));
        }
        Err(Error::OutOfBounds(self.bytes))
    }
}

// ---------------------------------------------------------------------------
// TreeBatch
// ---------------------------------------------------------------------------

/// Staged mutations against a [`MerkleTree`], applied by
/// [`MerkleTree::commit`].
#[derive(Debug)]
pub struct TreeBatch {
    base_length: u64,
    length: u64,
    byte_length: u64,
    roots: Vec<Node>,
    nodes: BTreeMap<u64, Node>,
    signature: Option<Signature>,
    appended: bool,
    upgraded: bool,
}

impl TreeBatch {
    /// Length the tree will have after commit.
    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn byte_length(&self) -> u64 {
        self.byte_length
    }

    /// True when a verified proof extended the tree.
    pub fn is_upgraded(&self) -> bool {
        self.upgraded
    }

    /// Stage one block.
    pub fn append(&mut self, data: &[u8]) {
        let leaf = Node::leaf(self.length, data);
        self.nodes.insert(leaf.index, leaf);
        self.length += 1;
        self.byte_length += leaf.size;
        self.roots.push(leaf);

        while let [.., left, right] = self.roots.as_slice() {
            if left.depth() != right.depth() {
                break;
            }
            let parent = Node::parent(left, right);
            let len = self.roots.len();
            self.roots.truncate(len - 2);
            self.nodes.insert(parent.index, parent);
            self.roots.push(parent);
        }
        self.appended = true;
    }

    /// Check `proof` against what `tree` trusts and stage everything it
    /// proves. On error the batch is left exactly as it was.
    pub async fn verify(&mut self, proof: &Proof, tree: &MerkleTree) -> Result<()> {
        let expected = flat::full_roots(proof.length * 2);
        if proof.peaks.len() != expected.len()
            || proof.peaks.iter().zip(&expected).any(|(p, i)| p.index != *i)
        {
            return Err(Error::verification(format!(
                "peaks do not describe a tree of length {}",
                proof.length
            )));
        }

        let provided: HashMap<u64, Node> = proof
            .upgrade
            .iter()
            .chain(proof.block.iter().flat_map(|b| b.nodes.iter()))
            .chain(proof.seek.iter().flat_map(|s| s.nodes.iter()))
            .map(|n| (n.index, *n))
            .collect();
        let peaks: HashMap<u64, Node> = proof.peaks.iter().map(|p| (p.index, *p)).collect();
        let mut staged = BTreeMap::new();
        let upgrading = proof.length > self.length;

        if upgrading {
            let tree_hash = hash_roots(proof.peaks.iter().map(|p| (&p.hash, p.index, p.size)));
            if !tree
                .authority()
                .verify_tree(&tree_hash, proof.length, proof.signature.as_ref())
            {
                return Err(Error::verification("upgrade signature is missing or invalid"));
            }
            for root in self.roots.iter().rev() {
                self.climb(*root, &peaks, &provided, &mut staged, tree, proof.length)
                    .await?;
            }
            for peak in &proof.peaks {
                staged.insert(peak.index, *peak);
            }
        } else {
            for peak in &proof.peaks {
                match self.lookup(peak.index, &staged, tree).await? {
                    Some(known) if known == *peak => {}
                    _ => {
                        return Err(Error::verification(format!(
                            "peak {} is not part of the trusted tree",
                            peak.index
                        )))
                    }
                }
            }
        }

        if let Some(block) = &proof.block {
            let leaf = match &block.value {
                Some(value) => Node::leaf(block.index, value),
                None => *provided.get(&(block.index * 2)).ok_or_else(|| {
                    Error::verification(format!("missing leaf for block {}", block.index))
                })?,
            };
            self.climb(leaf, &peaks, &provided, &mut staged, tree, proof.length)
                .await?;
            staged.insert(leaf.index, leaf);
        }

        if let Some(seek) = &proof.seek {
            let leaf = match seek.nodes.first() {
                Some(leaf) if flat::depth(leaf.index) == 0 => *leaf,
                _ => return Err(Error::verification("seek proof does not start at a leaf")),
            };
            self.climb(leaf, &peaks, &provided, &mut staged, tree, proof.length)
                .await?;
            staged.insert(leaf.index, leaf);
        }

        self.nodes.extend(staged);
        if upgrading {
            self.length = proof.length;
            self.byte_length = proof.byte_length();
            self.roots = proof.peaks.clone();
            self.signature = match tree.authority().public_key() {
                Some(_) => proof.signature.clone(),
                None => None,
            };
            self.upgraded = true;
        }
        Ok(())
    }

    /// Hash `start` upwards until it lands on one of `peaks`, staging every
    /// sibling used and parent computed.
    async fn climb(
        &self,
        start: Node,
        peaks: &HashMap<u64, Node>,
        provided: &HashMap<u64, Node>,
        staged: &mut BTreeMap<u64, Node>,
        tree: &MerkleTree,
        length: u64,
    ) -> Result<()> {
        let mut node = start;
        loop {
            if let Some(peak) = peaks.get(&node.index) {
                if *peak != node {
                    return Err(Error::verification(format!(
                        "node {} does not hash to its peak",
                        start.index
                    )));
                }
                return Ok(());
            }
            if flat::right_span(node.index) >= length * 2 {
                return Err(Error::verification(format!(
                    "node {} lies outside a tree of length {}",
                    start.index, length
                )));
            }

            let sibling_index = flat::sibling(node.index);
            let sibling = match self.lookup(sibling_index, staged, tree).await? {
                Some(known) => known,
                None => *provided.get(&sibling_index).ok_or_else(|| {
                    Error::verification(format!("proof is missing node {}", sibling_index))
                })?,
            };
            let parent = node.join(&sibling);
            staged.insert(sibling.index, sibling);
            staged.insert(parent.index, parent);
            node = parent;
        }
    }

    async fn lookup(
        &self,
        index: u64,
        staged: &BTreeMap<u64, Node>,
        tree: &MerkleTree,
    ) -> Result<Option<Node>> {
        if let Some(node) = staged.get(&index).or_else(|| self.nodes.get(&index)) {
            return Ok(Some(*node));
        }
        tree.get_node(index).await
    }
}
