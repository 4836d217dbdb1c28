//! # SledStorage: Embedded Key-Value Backend
//!
//! Maps each byte resource onto its own sled tree. The resource is cut into
//! fixed-size pages so a 40-byte node write touches one small value instead
//! of rewriting a blob.
//!
//! ## Tree Layout
//!
//! | Tree       | Key                   | Value                       |
//! |------------|-----------------------|-----------------------------|
//! | `<name>`   | `page` (8B BE)        | page bytes (≤ 4 KiB)        |
//! | `<name>`   | `"length"`            | logical length (8B BE)      |
//!
//! Page numbers are big-endian so sled's lexicographic order matches numeric
//! order. The `"length"` key is 6 bytes long and can never collide with an
//! 8-byte page key.
//!
//! ## Atomicity
//!
//! A write that spans several pages lands as a single `Batch` together with
//! the new length. Either every page and the length change, or none do.

use std::io;
use std::path::Path;

use async_trait::async_trait;
use sled::{Batch, Db, Tree};

use super::{RandomAccess, Storage};
use crate::config::SLED_PAGE_SIZE;
use crate::error::{Error, Result};

/// Well-known key holding a resource's logical length.
const META_LENGTH: &[u8] = b"length";

/// Storage engine backed by a sled database.
///
/// sled handles are cheap to clone and thread-safe, so `SledStorage` can be
/// shared freely.
#[derive(Debug, Clone)]
pub struct SledStorage {
    db: Db,
}

impl SledStorage {
    /// Open or create a database at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }

    /// A database that is deleted when the last handle drops. For tests.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }
}

#[async_trait]
impl Storage for SledStorage {
    async fn open(&self, name: &str) -> Result<Box<dyn RandomAccess>> {
        Ok(Box::new(SledResource {
            db: self.db.clone(),
            tree: self.db.open_tree(name)?,
        }))
    }
}

struct SledResource {
    db: Db,
    tree: Tree,
}

impl SledResource {
    fn length(&self) -> Result<u64> {
        match self.tree.get(META_LENGTH)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| Error::Corrupt("invalid length bytes".to_string()))?;
                Ok(u64::from_be_bytes(raw))
            }
            None => Ok(0),
        }
    }

    fn page(&self, number: u64) -> Result<Vec<u8>> {
        let mut page = self
            .tree
            .get(number.to_be_bytes())?
            .map(|v| v.to_vec())
            .unwrap_or_default();
        page.resize(SLED_PAGE_SIZE as usize, 0);
        Ok(page)
    }
}

#[async_trait]
impl RandomAccess for SledResource {
    async fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let end = offset + len;
        let length = self.length()?;
        if end > length {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("read {}..{} past end {}", offset, end, length),
            )
            .into());
        }

        let mut out = Vec::with_capacity(len as usize);
        let mut pos = offset;
        while pos < end {
            let number = pos / SLED_PAGE_SIZE;
            let start = (pos % SLED_PAGE_SIZE) as usize;
            let take = ((SLED_PAGE_SIZE - pos % SLED_PAGE_SIZE).min(end - pos)) as usize;
            let page = self.page(number)?;
            out.extend_from_slice(&page[start..start + take]);
            pos += take as u64;
        }
        Ok(out)
    }

    async fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset + data.len() as u64;
        let mut batch = Batch::default();

        let mut pos = offset;
        let mut written = 0usize;
        while pos < end {
            let number = pos / SLED_PAGE_SIZE;
            let start = (pos % SLED_PAGE_SIZE) as usize;
            let take = ((SLED_PAGE_SIZE - pos % SLED_PAGE_SIZE).min(end - pos)) as usize;
            let mut page = self.page(number)?;
            page[start..start + take].copy_from_slice(&data[written..written + take]);
            batch.insert(&number.to_be_bytes(), page);
            pos += take as u64;
            written += take;
        }

        if end > self.length()? {
            batch.insert(META_LENGTH, &end.to_be_bytes());
        }
        self.tree.apply_batch(batch)?;
        Ok(())
    }

    async fn len(&self) -> Result<u64> {
        self.length()
    }

    async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}
