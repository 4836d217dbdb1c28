//! Proof requests and responses exchanged between trees.
//!
//! A [`Proof`] always carries the responder's peaks, so the receiver can
//! anchor any node path it contains. Paths are plain node lists; the
//! verifier recomputes every index itself and never trusts positions taken
//! from the wire.

use serde::{Deserialize, Serialize};

use super::node::Node;
use crate::crypto::keys::Signature;

/// What a peer is asked to prove.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofRequest {
    /// Prove membership of this block.
    pub block_index: Option<u64>,
    /// Ship the block payload along with its path.
    pub include_bytes: bool,
    /// Prove which block owns this byte offset.
    pub seek_offset: Option<u64>,
    /// Length the requester already trusts. Longer trees come with the
    /// nodes needed to extend that trust.
    pub known_length: u64,
}

impl ProofRequest {
    /// Proof and payload for one block.
    pub fn block(index: u64, known_length: u64) -> Self {
        Self {
            block_index: Some(index),
            include_bytes: true,
            seek_offset: None,
            known_length,
        }
    }

    pub fn seek(bytes: u64, known_length: u64) -> Self {
        Self {
            seek_offset: Some(bytes),
            known_length,
            ..Self::default()
        }
    }

    /// Just the responder's latest tree.
    pub fn upgrade(known_length: u64) -> Self {
        Self {
            known_length,
            ..Self::default()
        }
    }
}

/// Membership path for a single block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockProof {
    pub index: u64,
    /// Payload, filled in by the log when bytes were requested. The tree
    /// itself never touches payloads.
    pub value: Option<Vec<u8>>,
    /// Siblings from the leaf upwards. Starts with the leaf itself when
    /// `value` is absent.
    pub nodes: Vec<Node>,
}

/// Path to the leaf owning a byte offset, leaf first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeekProof {
    pub bytes: u64,
    pub nodes: Vec<Node>,
}

/// A responder's answer to a [`ProofRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    /// Block count of the responder's tree.
    pub length: u64,
    /// Roots of the responder's tree, left to right.
    pub peaks: Vec<Node>,
    /// Writer signature over the peaks, if the log is signed.
    pub signature: Option<Signature>,
    /// Nodes linking the requester's known roots to `peaks`.
    pub upgrade: Vec<Node>,
    pub block: Option<BlockProof>,
    pub seek: Option<SeekProof>,
}

impl Proof {
    pub fn byte_length(&self) -> u64 {
        self.peaks.iter().map(|n| n.size).sum()
    }

    /// Number of nodes carried besides the peaks.
    pub fn path_len(&self) -> usize {
        self.upgrade.len()
            + self.block.as_ref().map_or(0, |b| b.nodes.len())
            + self.seek.as_ref().map_or(0, |s| s.nodes.len())
    }
}
