//! # Protocol Configuration & Constants
//!
//! Every magic number in Omega lives here: on-disk layout constants, default
//! network timeouts, and the tunables for the replicator and the log facade.
//!
//! The on-disk constants are part of the storage format. Changing them makes
//! existing logs unreadable, so bump `TREE_FORMAT_VERSION` if you must.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::keys::Authority;

// ---------------------------------------------------------------------------
// Storage Names
// ---------------------------------------------------------------------------

/// Resource holding the tree header and node records.
pub const TREE_STORAGE: &str = "tree";

/// Resource holding raw block payloads.
pub const DATA_STORAGE: &str = "data";

/// Resource holding the "block is stored locally" bit-vector.
pub const BITFIELD_STORAGE: &str = "bitfield";

// ---------------------------------------------------------------------------
// On-Disk Layout
// ---------------------------------------------------------------------------

/// Magic bytes at the start of the tree resource.
pub const TREE_MAGIC: [u8; 4] = *b"OMGT";

/// Tree format version written into the header.
pub const TREE_FORMAT_VERSION: u32 = 1;

/// Size of the tree header. Node records start right after it.
pub const TREE_HEADER_SIZE: u64 = 128;

/// One node record: 32-byte hash followed by the little-endian byte size.
pub const NODE_RECORD_SIZE: u64 = 40;

/// Hash output length in bytes. BLAKE3, like SHA-256, produces 32 bytes.
pub const HASH_LENGTH: usize = 32;

/// Ed25519 signature length.
pub const SIGNATURE_LENGTH: usize = 64;

/// Bitfield persistence granularity, in bytes.
pub const BITFIELD_PAGE_SIZE: usize = 4096;

/// Page size used by the sled storage backend.
pub const SLED_PAGE_SIZE: u64 = 4096;

// ---------------------------------------------------------------------------
// Network Defaults
// ---------------------------------------------------------------------------

/// How long a single proof request may stay unanswered.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for any peer to announce a block before giving up.
pub const DEFAULT_AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum attempts per block before surfacing `Unavailable`.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Maximum size of a single framed wire message (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Largest block `append` accepts (8 MiB). Leaves room for the proof nodes
/// that travel with a block inside one message.
pub const MAX_BLOCK_SIZE: usize = 8 * 1024 * 1024;

/// Longest `Have` run accepted from a peer (16M blocks, 2 MiB of bits).
/// Longer local runs are announced in pieces.
pub const DEFAULT_MAX_HAVE_RUN: u64 = 1 << 24;

// ---------------------------------------------------------------------------
// ReplicatorConfig
// ---------------------------------------------------------------------------

/// Tuning knobs for the replicator.
///
/// Defaults suit a LAN. Flaky peers? Raise `max_attempts`. Memory tight?
/// Lower `max_inflight_per_peer`, which bounds the number of buffered,
/// not-yet-verified responses per connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    /// Per-request timeout in milliseconds.
    pub request_timeout_ms: u64,

    /// How long a request waits for some peer to advertise the block.
    pub availability_timeout_ms: u64,

    /// Attempts per block, across peers, before the request fails.
    pub max_attempts: u32,

    /// Concurrent in-flight requests allowed per peer.
    pub max_inflight_per_peer: usize,

    /// Concurrent block fetches for a non-linear range download.
    pub max_parallel_requests: usize,

    /// Capacity of each session's message channels.
    pub channel_capacity: usize,

    /// Peer requests we hold for blocks we don't have yet, across all peers.
    pub max_parked_requests: usize,

    /// Longest `Have` run we send or accept. Longer announcements from a
    /// peer are ignored.
    pub max_have_run: u64,

    /// Answers whose encoding would exceed this many bytes go out as
    /// `NoData` instead.
    pub max_message_size: usize,
}

impl ReplicatorConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn availability_timeout(&self) -> Duration {
        Duration::from_millis(self.availability_timeout_ms)
    }
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
            availability_timeout_ms: DEFAULT_AVAILABILITY_TIMEOUT.as_millis() as u64,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_inflight_per_peer: 16,
            max_parallel_requests: 32,
            channel_capacity: 256,
            max_parked_requests: 1024,
            max_have_run: DEFAULT_MAX_HAVE_RUN,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

// ---------------------------------------------------------------------------
// OmegaOptions
// ---------------------------------------------------------------------------

/// Options for opening a log.
#[derive(Debug, Clone, Default)]
pub struct OmegaOptions {
    /// Who may append, and how tree upgrades from peers are trusted.
    pub authority: Authority,

    /// Replicator tunables.
    pub replicator: ReplicatorConfig,

    /// Capacity of the event broadcast channel. Slow subscribers that fall
    /// further behind than this miss events (they see `Lagged`).
    pub event_capacity: usize,
}

impl OmegaOptions {
    pub fn with_authority(authority: Authority) -> Self {
        Self {
            authority,
            ..Self::default()
        }
    }

    pub(crate) fn event_capacity(&self) -> usize {
        if self.event_capacity == 0 {
            256
        } else {
            self.event_capacity
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fits_a_signature() {
        // magic + version + length + flag + signature
        assert!(4 + 4 + 8 + 1 + SIGNATURE_LENGTH as u64 <= TREE_HEADER_SIZE);
        assert_eq!(NODE_RECORD_SIZE as usize, HASH_LENGTH + 8);
    }

    #[test]
    fn replicator_config_round_trips_through_json() {
        let config = ReplicatorConfig {
            max_attempts: 7,
            ..ReplicatorConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: ReplicatorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
        assert_eq!(back.request_timeout(), DEFAULT_REQUEST_TIMEOUT);
    }

    #[test]
    fn zero_event_capacity_falls_back() {
        assert_eq!(OmegaOptions::default().event_capacity(), 256);
    }
}
