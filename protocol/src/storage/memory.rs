//! In-memory storage backend.
//!
//! Resources are shared by name: opening "tree" twice on the same
//! `MemoryStorage` hands back views of one buffer. That lets tests drop a
//! log and reopen it against the same storage to check persistence.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{RandomAccess, Storage};
use crate::error::Result;

type Buffer = Arc<Mutex<Vec<u8>>>;

/// Storage that lives in the process heap.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    resources: Arc<Mutex<HashMap<String, Buffer>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite raw bytes of a resource. Test hook for corruption scenarios.
    pub fn poke(&self, name: &str, offset: usize, data: &[u8]) {
        let buffer = self.buffer(name);
        let mut bytes = buffer.lock();
        if bytes.len() < offset + data.len() {
            bytes.resize(offset + data.len(), 0);
        }
        bytes[offset..offset + data.len()].copy_from_slice(data);
    }

    fn buffer(&self, name: &str) -> Buffer {
        self.resources
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn open(&self, name: &str) -> Result<Box<dyn RandomAccess>> {
        Ok(Box::new(MemoryResource {
            bytes: self.buffer(name),
        }))
    }
}

struct MemoryResource {
    bytes: Buffer,
}

#[async_trait]
impl RandomAccess for MemoryResource {
    async fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let bytes = self.bytes.lock();
        let start = offset as usize;
        let end = start + len as usize;
        if end > bytes.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("read {}..{} past end {}", start, end, bytes.len()),
            )
            .into());
        }
        Ok(bytes[start..end].to_vec())
    }

    async fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        let start = offset as usize;
        let end = start + data.len();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(data);
        Ok(())
    }

    async fn len(&self) -> Result<u64> {
        Ok(self.bytes.lock().len() as u64)
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
