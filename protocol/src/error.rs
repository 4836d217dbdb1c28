//! # Error Taxonomy
//!
//! One error type for the whole crate. It is `Clone` because a single network
//! resolution is shared by every caller waiting on the same block index, and
//! each of them gets its own copy of the outcome.
//!
//! The variants split into "the data is wrong" (`VerificationFailed`,
//! `Corrupt`), "we don't have it" (`NotFound`, `OutOfBounds`), "the network
//! let us down" (`Timeout`, `NoPeer`, `Unavailable`, `PeerDisconnected`) and
//! "the disk let us down" (`StorageIo`). Verification and storage errors abort
//! a tree batch wholesale, so none of them ever leaves partial state behind.

use std::fmt;
use std::io;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// What a network request was trying to obtain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    /// A block (and its proof) by index.
    Block(u64),
    /// The block owning a byte offset.
    Bytes(u64),
    /// A longer tree than the one we trust.
    Upgrade,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Block(index) => write!(f, "block {}", index),
            Self::Bytes(offset) => write!(f, "byte offset {}", offset),
            Self::Upgrade => write!(f, "tree upgrade"),
        }
    }
}

/// Errors produced by the log, its storage and the replicator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A proof did not hash up to a trusted root. Never mutates state and is
    /// safe to retry against another peer.
    #[error("verification failed: {0}")]
    VerificationFailed(String),

    /// Local lookup miss.
    #[error("not found: {0}")]
    NotFound(String),

    /// A peer did not answer within the request timeout.
    #[error("request for {0} timed out")]
    Timeout(Target),

    /// No connected peer is known to hold the target.
    #[error("no peer holds {0}")]
    NoPeer(Target),

    /// Every attempt failed.
    #[error("{target} unavailable after {attempts} attempts")]
    Unavailable { target: Target, attempts: u32 },

    /// The storage backend failed a read, write or flush.
    #[error("storage i/o error: {0}")]
    StorageIo(Arc<io::Error>),

    /// Seek past the end of the known byte length.
    #[error("byte offset {0} is out of bounds")]
    OutOfBounds(u64),

    /// A block bigger than a single wire message can carry.
    #[error("block of {size} bytes exceeds the {max} byte limit")]
    BlockTooLarge { size: usize, max: usize },

    /// Append on a log opened with a reader key.
    #[error("log is not writable")]
    NotWritable,

    /// The tree moved on between `batch()` and `commit()`.
    #[error("stale batch: created at length {expected}, tree is at {actual}")]
    StaleBatch { expected: u64, actual: u64 },

    /// The peer session ended while a request was outstanding.
    #[error("peer disconnected")]
    PeerDisconnected,

    /// Persisted state failed a structural check.
    #[error("corrupt storage: {0}")]
    Corrupt(String),

    /// Wire encoding or decoding failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// The log was dropped while the operation was running.
    #[error("log closed")]
    Closed,
}

impl Error {
    /// Errors worth retrying against a different peer.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::VerificationFailed(_)
                | Self::NotFound(_)
                | Self::Timeout(_)
                | Self::PeerDisconnected
        )
    }

    pub(crate) fn verification(reason: impl Into<String>) -> Self {
        Self::VerificationFailed(reason.into())
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::StorageIo(Arc::new(e))
    }
}

impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        Self::StorageIo(Arc::new(io::Error::other(e)))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Self::Encoding(e.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verification_failures_are_retryable() {
        assert!(Error::verification("bad root").is_retryable());
        assert!(Error::Timeout(Target::Block(3)).is_retryable());
        assert!(!Error::NotWritable.is_retryable());
        assert!(!Error::from(io::Error::other("disk on fire")).is_retryable());
    }

    #[test]
    fn targets_render_readably() {
        let err = Error::Unavailable {
            target: Target::Block(7),
            attempts: 3,
        };
        assert_eq!(err.to_string(), "block 7 unavailable after 3 attempts");
        assert_eq!(
            Error::NoPeer(Target::Bytes(100)).to_string(),
            "no peer holds byte offset 100"
        );
    }
}
