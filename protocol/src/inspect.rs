//! Human-readable snapshot of a log, for the CLI and debug output.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Point-in-time summary of a log. Produced by [`Omega::info`].
///
/// [`Omega::info`]: crate::omega::Omega::info
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogInfo {
    /// Writer public key, hex. `None` for unsigned logs.
    pub key: Option<String>,
    pub discovery_key: Option<String>,
    pub length: u64,
    pub byte_length: u64,
    /// Blocks held locally.
    pub stored: u64,
    pub writable: bool,
    /// Whether the tree header carries a writer signature.
    pub signed: bool,
    pub peers: usize,
}

impl fmt::Display for LogInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Omega(")?;
        writeln!(f, "  key: {}", self.key.as_deref().unwrap_or("(unsigned)"))?;
        writeln!(
            f,
            "  discoveryKey: {}",
            self.discovery_key.as_deref().unwrap_or("(none)")
        )?;
        writeln!(f, "  length: {}", self.length)?;
        writeln!(f, "  byteLength: {}", self.byte_length)?;
        writeln!(f, "  stored: {}/{}", self.stored, self.length)?;
        writeln!(f, "  writable: {}", self.writable)?;
        writeln!(f, "  signed: {}", self.signed)?;
        writeln!(f, "  peers: {}", self.peers)?;
        write!(f, ")")
    }
}
