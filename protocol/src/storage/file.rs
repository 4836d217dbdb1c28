//! File-backed storage: one regular file per resource.
//!
//! ```text
//! <dir>/tree
//! <dir>/data
//! <dir>/bitfield
//! ```
//!
//! Each handle serializes its own seek+read/write pairs behind an async
//! mutex, so concurrent readers on one resource never interleave seeks.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use super::{RandomAccess, Storage};
use crate::error::Result;

/// Storage rooted at a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Use `dir` for all resources. The directory is created on first open.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn open(&self, name: &str) -> Result<Box<dyn RandomAccess>> {
        fs::create_dir_all(&self.dir).await?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.dir.join(name))
            .await?;
        Ok(Box::new(FileResource {
            file: Mutex::new(file),
        }))
    }
}

struct FileResource {
    file: Mutex<File>,
}

#[async_trait]
impl RandomAccess for FileResource {
    async fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    async fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        Ok(())
    }

    async fn len(&self) -> Result<u64> {
        let file = self.file.lock().await;
        Ok(file.metadata().await?.len())
    }

    async fn flush(&self) -> Result<()> {
        let mut file = self.file.lock().await;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("log"));
        {
            let res = storage.open("data").await.unwrap();
            res.write(0, b"hello").await.unwrap();
            res.write(10, b"world").await.unwrap();
            res.close().await.unwrap();
        }

        let res = storage.open("data").await.unwrap();
        assert_eq!(res.len().await.unwrap(), 15);
        assert_eq!(res.read(10, 5).await.unwrap(), b"world");
        assert_eq!(res.read(5, 5).await.unwrap(), vec![0u8; 5]);
    }

    #[tokio::test]
    async fn short_read_errors() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let res = storage.open("tree").await.unwrap();
        res.write(0, b"ab").await.unwrap();
        assert!(res.read(0, 3).await.is_err());
    }
}
