//! Replication wire messages.
//!
//! The enum is transport-agnostic. In-process streams move it as a value;
//! the node binary frames it with bincode over TCP.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::tree::{Proof, ProofRequest};

/// A span of blocks, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeRequest {
    pub start: u64,
    pub end: u64,
    /// Fetch strictly in index order instead of fanning out.
    pub linear: bool,
}

impl RangeRequest {
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            linear: false,
        }
    }

    pub fn linear(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            linear: true,
        }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Sender's tree length. Sent on connect and whenever it grows.
    Status { length: u64 },
    /// Sender now stores blocks `[start, start + length)`.
    Have { start: u64, length: u64 },
    /// Ask for a proof. `id` is echoed in the answer.
    Request { id: u64, request: ProofRequest },
    Response { id: u64, proof: Proof },
    /// Sender cannot answer request `id`.
    NoData { id: u64 },
    /// Ask the receiver to announce what it holds in a span.
    Range(RangeRequest),
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Size of [`encode`](Self::encode)'s output, without encoding.
    pub fn encoded_len(&self) -> Result<u64> {
        Ok(bincode::serialized_size(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Short name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Have { .. } => "have",
            Self::Request { .. } => "request",
            Self::Response { .. } => "response",
            Self::NoData { .. } => "no-data",
            Self::Range(_) => "range",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn request_survives_bincode() {
        let msg = Message::Request {
            id: 42,
            request: ProofRequest::block(7, 3),
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
        assert_eq!(msg.kind(), "request");
    }

    #[test]
    fn garbage_is_an_encoding_error() {
        let err = Message::decode(&[0xff, 0xff, 0xff, 0xff, 0x01]).unwrap_err();
        assert!(matches!(err, Error::Encoding(_)));
    }

    #[test]
    fn range_lengths() {
        assert_eq!(RangeRequest::linear(2, 5).len(), 3);
        assert!(RangeRequest::new(5, 2).is_empty());
    }
}
