//! # Network Module
//!
//! The replication protocol. Peers exchange announcements about what they
//! hold and answer each other's proof requests; every answer is verified
//! against the local tree before a single byte of it is trusted.
//!
//! ## Architecture
//!
//! ```text
//! message.rs    - Wire messages (status, have, request, response, range)
//! stream.rs     - In-process endpoint of one peer session, plus `connect`
//! peer.rs       - Remote view and request/response correlation per session
//! replicator.rs - Sessions, serving, fetching, dedup, retry, broadcast
//! ```
//!
//! ## Design Decisions
//!
//! - The protocol crate stays transport-agnostic. A session is a pair of
//!   tokio channels; the node binary pumps them over TCP, tests pump them
//!   into each other with [`connect`].
//! - Remote availability is tracked with the same sparse [`Bits`] type the
//!   local bitfield uses, so a `Have` run of a million blocks costs a handful
//!   of page writes.
//! - Each peer's view sits behind a `parking_lot::Mutex`. It is touched on
//!   every announcement and every peer selection, never across an `.await`.
//!
//! [`Bits`]: crate::bitfield::Bits

pub mod message;
pub(crate) mod peer;
pub mod replicator;
pub mod stream;

pub use message::{Message, RangeRequest};
pub use replicator::{Download, DownloadReport, ReplicationHost, Replicator};
pub use stream::{connect, ProtocolStream};
