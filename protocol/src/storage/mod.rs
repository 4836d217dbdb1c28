//! # Storage Module
//!
//! Byte-addressed persistence for a log. A log keeps three named resources
//! (tree, data, bitfield) and never asks more of the backend than "read these
//! bytes, write these bytes, how long are you, make it durable".
//!
//! ## Architecture
//!
//! ```text
//! memory.rs - in-process buffers, shared by name (tests, ephemeral replicas)
//! file.rs   - one file per resource under a directory (tokio::fs)
//! db.rs     - one sled tree per resource, split into fixed-size pages
//! ```
//!
//! ## Design Decisions
//!
//! 1. **Async trait objects.** Every layer above holds a
//!    `Box<dyn RandomAccess>`, so swapping backends never touches the tree or
//!    replicator code. File and sled I/O are naturally async; the memory
//!    backend just never awaits.
//!
//! 2. **Reads are exact.** Asking for bytes past the end is an error, not a
//!    short read. Callers reading sparse regions check `len()` first.
//!
//! 3. **Durability is explicit.** Writes may sit in OS or sled buffers until
//!    `flush()`. The log flushes data before it flushes the tree, so a crash
//!    never leaves a committed node pointing at missing bytes.

pub mod db;
pub mod file;
pub mod memory;

use async_trait::async_trait;

use crate::error::Result;

pub use db::SledStorage;
pub use file::FileStorage;
pub use memory::MemoryStorage;

/// A single growable byte resource.
#[async_trait]
pub trait RandomAccess: Send + Sync {
    /// Read exactly `len` bytes starting at `offset`.
    async fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>>;

    /// Write `data` at `offset`, growing the resource (zero-filled) as needed.
    async fn write(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Current length in bytes.
    async fn len(&self) -> Result<u64>;

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Make every previous write durable.
    async fn flush(&self) -> Result<()>;

    /// Release the resource. Flushes by default.
    async fn close(&self) -> Result<()> {
        self.flush().await
    }
}

/// Factory for the named resources a log needs.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Open (creating if missing) the resource called `name`.
    async fn open(&self, name: &str) -> Result<Box<dyn RandomAccess>>;
}

/// Read a range that may extend past the end of the resource. Bytes beyond
/// the end come back as zeros.
pub(crate) async fn read_padded(
    resource: &dyn RandomAccess,
    offset: u64,
    len: u64,
) -> Result<Vec<u8>> {
    let end = resource.len().await?;
    if offset >= end {
        return Ok(vec![0; len as usize]);
    }
    let available = len.min(end - offset);
    let mut bytes = resource.read(offset, available).await?;
    bytes.resize(len as usize, 0);
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn padded_read_fills_past_the_end() {
        let storage = MemoryStorage::new();
        let res = storage.open("x").await.unwrap();
        res.write(0, b"abc").await.unwrap();

        assert_eq!(read_padded(res.as_ref(), 1, 4).await.unwrap(), b"bc\0\0");
        assert_eq!(read_padded(res.as_ref(), 10, 2).await.unwrap(), vec![0, 0]);
        assert!(!res.is_empty().await.unwrap());
    }
}
