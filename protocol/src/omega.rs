//! # Omega: the Log Facade
//!
//! Wires a [`MerkleTree`], a [`BlockStore`] and a [`Bitfield`] to a
//! [`Replicator`] and exposes the handful of operations applications use.
//!
//! ## Commit Ordering
//!
//! Every mutation, local or remote, goes through one `RwLock` write guard
//! and runs the same sequence:
//!
//! ```text
//! append:  batch.append → blocks.put_batch → tree.commit → tree.flush
//!          → bitfield.set → bitfield.flush → event → broadcast
//! verify:  batch.verify → tree.commit → blocks.put → tree.flush
//!          → bitfield.set → bitfield.flush → event → broadcast
//! ```
//!
//! A set bit therefore always points at durable bytes under a durable tree,
//! and anyone reacting to an event can read the block straight away.
//!
//! ## Design Decisions
//!
//! - **Lazy open.** [`Omega::new`] returns immediately. The first operation
//!   (or an explicit [`ready`](Omega::ready)) opens storage through a
//!   `tokio::sync::OnceCell`, so any number of concurrent callers share one
//!   initialisation.
//! - **Readers don't wait for the network.** `get` releases the read guard
//!   before asking the replicator, so a slow fetch never blocks appends or
//!   other reads.
//! - **Typed events.** Subscribers get a `tokio::sync::broadcast` receiver
//!   of [`Event`] values instead of string-keyed callbacks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::{broadcast, OnceCell, RwLock};
use tracing::{debug, info};

use crate::bitfield::Bitfield;
use crate::block_store::BlockStore;
use crate::config::{
    OmegaOptions, BITFIELD_STORAGE, DATA_STORAGE, MAX_BLOCK_SIZE, TREE_STORAGE,
};
use crate::crypto::hash::{discovery_key, Hash};
use crate::crypto::keys::PublicKey;
use crate::error::{Error, Result};
use crate::inspect::LogInfo;
use crate::network::{Download, ProtocolStream, RangeRequest, ReplicationHost, Replicator};
use crate::storage::Storage;
use crate::tree::{BlockProof, MerkleTree, Proof, ProofRequest};

/// Something observable happened to the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The tree grew, by local append or by a verified upgrade.
    Append { length: u64, byte_length: u64 },
    /// A block arrived from `peer` and is now stored and verified.
    Download {
        index: u64,
        value: Vec<u8>,
        peer: Option<u64>,
    },
}

struct Core {
    tree: MerkleTree,
    blocks: BlockStore,
    bitfield: Bitfield,
}

struct Inner {
    storage: Arc<dyn Storage>,
    options: OmegaOptions,
    core: OnceCell<RwLock<Core>>,
    length: AtomicU64,
    byte_length: AtomicU64,
    events: broadcast::Sender<Event>,
    replicator: Arc<Replicator>,
}

/// A verifiable append-only log. Cheap to clone; clones share one log.
#[derive(Clone)]
pub struct Omega {
    inner: Arc<Inner>,
}

impl Omega {
    /// Create a log over `storage` without touching it yet.
    pub fn new(storage: Arc<dyn Storage>, options: OmegaOptions) -> Self {
        let (events, _) = broadcast::channel(options.event_capacity());
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let host: Weak<dyn ReplicationHost> = weak.clone();
            let replicator = Arc::new(Replicator::new(host, options.replicator.clone()));
            Inner {
                storage,
                options,
                core: OnceCell::new(),
                length: AtomicU64::new(0),
                byte_length: AtomicU64::new(0),
                events,
                replicator,
            }
        });
        Self { inner }
    }

    /// Create and open a log.
    pub async fn open(storage: Arc<dyn Storage>, options: OmegaOptions) -> Result<Self> {
        let log = Self::new(storage, options);
        log.ready().await?;
        Ok(log)
    }

    /// Wait for storage to be opened. Idempotent.
    pub async fn ready(&self) -> Result<()> {
        self.inner.core().await.map(|_| ())
    }

    /// Append blocks as one atomic batch. Returns the new length.
    pub async fn append<I>(&self, blocks: I) -> Result<u64>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        self.inner.append(blocks.into_iter().collect()).await
    }

    /// Payload of block `index`, fetched from peers if it isn't stored here.
    pub async fn get(&self, index: u64) -> Result<Vec<u8>> {
        self.inner.get(index).await
    }

    /// Is block `index` verified and stored locally?
    pub async fn has(&self, index: u64) -> Result<bool> {
        let core = self.inner.core().await?.read().await;
        Ok(core.bitfield.get(index))
    }

    /// Which block holds byte `bytes`, and where inside it.
    pub async fn seek(&self, bytes: u64) -> Result<(u64, u64)> {
        self.inner.ready().await?;
        self.inner.replicator.request_seek(bytes).await
    }

    /// Start fetching a range of blocks in the background.
    pub fn download(&self, range: RangeRequest) -> Download {
        self.inner.replicator.request_range(range)
    }

    /// Open a replication session. Feed it to a transport, or pipe two logs
    /// together with [`connect`](crate::network::connect).
    pub fn replicate(&self) -> ProtocolStream {
        self.inner.replicator.create_stream()
    }

    /// Build a proof from local state, with the block payload filled in
    /// when `include_bytes` is set.
    pub async fn proof(&self, request: &ProofRequest) -> Result<Proof> {
        self.inner.proof(request).await
    }

    /// Verify a proof against the local tree and persist what it proves.
    pub async fn verify(&self, proof: Proof, peer: Option<u64>) -> Result<()> {
        self.inner.verify(proof, peer).await
    }

    /// Fetch a longer tree from peers. Returns whether the length grew.
    pub async fn update(&self) -> Result<bool> {
        self.inner.replicator.request_upgrade().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    /// Writer public key. `None` for unsigned logs.
    pub fn key(&self) -> Option<PublicKey> {
        self.inner.options.authority.public_key()
    }

    /// Topic under which peers can find each other without revealing the
    /// key itself.
    pub fn discovery_key(&self) -> Option<Hash> {
        self.key().map(|key| discovery_key(key.as_bytes()))
    }

    pub fn writable(&self) -> bool {
        self.inner.options.authority.is_writable()
    }

    /// Block count. Zero until the log is open.
    pub fn length(&self) -> u64 {
        self.inner.length.load(Ordering::Acquire)
    }

    /// Total payload bytes. Zero until the log is open.
    pub fn byte_length(&self) -> u64 {
        self.inner.byte_length.load(Ordering::Acquire)
    }

    pub fn peer_count(&self) -> usize {
        self.inner.replicator.peer_count()
    }

    /// Proof requests this log has sent to peers.
    pub fn requests_sent(&self) -> u64 {
        self.inner.replicator.requests_sent()
    }

    #[cfg(test)]
    pub(crate) fn replicator(&self) -> &Arc<Replicator> {
        &self.inner.replicator
    }

    /// Snapshot for humans and dashboards.
    pub async fn info(&self) -> Result<LogInfo> {
        let core = self.inner.core().await?.read().await;
        Ok(LogInfo {
            key: self.key().map(|k| k.to_hex()),
            discovery_key: self.discovery_key().map(hex::encode),
            length: core.tree.length(),
            byte_length: core.tree.byte_length(),
            stored: core.bitfield.bits().count(),
            writable: self.writable(),
            signed: core.tree.signature().is_some(),
            peers: self.peer_count(),
        })
    }
}

// ---------------------------------------------------------------------------
// Inner
// ---------------------------------------------------------------------------

impl Inner {
    async fn core(&self) -> Result<&RwLock<Core>> {
        self.core.get_or_try_init(|| self.open_core()).await
    }

    async fn open_core(&self) -> Result<RwLock<Core>> {
        let authority = self.options.authority.clone();
        let tree = MerkleTree::open(self.storage.open(TREE_STORAGE).await?, authority).await?;
        let blocks = BlockStore::new(self.storage.open(DATA_STORAGE).await?);
        let bitfield = Bitfield::open(self.storage.open(BITFIELD_STORAGE).await?).await?;

        self.publish(tree.length(), tree.byte_length());
        info!(
            length = tree.length(),
            byte_length = tree.byte_length(),
            stored = bitfield.bits().count(),
            writable = self.options.authority.is_writable(),
            "log opened"
        );
        Ok(RwLock::new(Core {
            tree,
            blocks,
            bitfield,
        }))
    }

    fn publish(&self, length: u64, byte_length: u64) {
        self.length.store(length, Ordering::Release);
        self.byte_length.store(byte_length, Ordering::Release);
    }

    fn emit(&self, event: Event) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn append<B: AsRef<[u8]>>(&self, blocks: Vec<B>) -> Result<u64> {
        if !self.options.authority.is_writable() {
            return Err(Error::NotWritable);
        }
        if let Some(block) = blocks.iter().find(|b| b.as_ref().len() > MAX_BLOCK_SIZE) {
            return Err(Error::BlockTooLarge {
                size: block.as_ref().len(),
                max: MAX_BLOCK_SIZE,
            });
        }
        let mut guard = self.core().await?.write().await;
        let core = &mut *guard;
        let start = core.tree.length();
        if blocks.is_empty() {
            return Ok(start);
        }

        let mut batch = core.tree.batch();
        for block in &blocks {
            batch.append(block.as_ref());
        }

        core.blocks.put_batch(&core.tree, start, &blocks).await?;
        core.blocks.flush().await?;
        core.tree.commit(batch)?;
        core.tree.flush().await?;
        for index in start..core.tree.length() {
            core.bitfield.set(index, true);
        }
        core.bitfield.flush().await?;

        let (length, byte_length) = (core.tree.length(), core.tree.byte_length());
        drop(guard);

        self.publish(length, byte_length);
        debug!(start, length, byte_length, "blocks appended");
        self.emit(Event::Append {
            length,
            byte_length,
        });
        self.replicator.broadcast_length(length);
        self.replicator.broadcast_range(start, length - start);
        Ok(length)
    }

    async fn get(&self, index: u64) -> Result<Vec<u8>> {
        {
            let core = self.core().await?.read().await;
            if core.bitfield.get(index) {
                return core.blocks.get(&core.tree, index).await;
            }
        }
        debug!(index, "block not stored, asking peers");
        self.replicator.request_block(index).await
    }

    async fn proof(&self, request: &ProofRequest) -> Result<Proof> {
        let core = self.core().await?.read().await;
        let mut proof = core.tree.proof(request).await?;
        if request.include_bytes {
            if let Some(block) = proof.block.as_mut() {
                if !core.bitfield.get(block.index) {
                    return Err(Error::NotFound(format!("block {}", block.index)));
                }
                block.value = Some(core.blocks.get(&core.tree, block.index).await?);
            }
        }
        Ok(proof)
    }

    async fn verify(&self, proof: Proof, peer: Option<u64>) -> Result<()> {
        let mut guard = self.core().await?.write().await;
        let core = &mut *guard;
        let before = core.tree.length();

        let mut batch = core.tree.batch();
        batch.verify(&proof, &core.tree).await?;
        core.tree.commit(batch)?;

        let mut downloaded = None;
        if let Some(BlockProof {
            index,
            value: Some(value),
            ..
        }) = proof.block
        {
            if !core.bitfield.get(index) {
                core.blocks.put(&core.tree, index, &value).await?;
                core.blocks.flush().await?;
                downloaded = Some((index, value));
            }
        }
        core.tree.flush().await?;

        if let Some((index, _)) = &downloaded {
            core.bitfield.set(*index, true);
            core.bitfield.flush().await?;
        }

        let (length, byte_length) = (core.tree.length(), core.tree.byte_length());
        drop(guard);
        self.publish(length, byte_length);

        if let Some((index, value)) = downloaded {
            debug!(index, ?peer, "block downloaded");
            self.emit(Event::Download { index, value, peer });
            self.replicator.broadcast_block(index);
        }
        if length > before {
            info!(from = before, to = length, ?peer, "tree upgraded");
            self.emit(Event::Append {
                length,
                byte_length,
            });
            self.replicator.broadcast_length(length);
        }
        Ok(())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.replicator.shutdown();
    }
}

#[async_trait]
impl ReplicationHost for Inner {
    async fn ready(&self) -> Result<()> {
        self.core().await.map(|_| ())
    }

    fn length(&self) -> u64 {
        self.length.load(Ordering::Acquire)
    }

    async fn has(&self, index: u64) -> Result<bool> {
        let core = self.core().await?.read().await;
        Ok(core.bitfield.get(index))
    }

    async fn block(&self, index: u64) -> Result<Vec<u8>> {
        let core = self.core().await?.read().await;
        core.blocks.get(&core.tree, index).await
    }

    async fn answer(&self, request: &ProofRequest) -> Result<Proof> {
        self.proof(request).await
    }

    async fn apply(&self, proof: Proof, peer: Option<u64>) -> Result<()> {
        self.verify(proof, peer).await
    }

    async fn seek_local(&self, bytes: u64) -> Result<Option<(u64, u64)>> {
        let core = self.core().await?.read().await;
        core.tree.seek(bytes).update(&core.tree).await
    }

    async fn local_runs(&self, start: u64, end: u64) -> Result<Vec<(u64, u64)>> {
        let core = self.core().await?.read().await;
        Ok(core.bitfield.bits().runs(start, end))
    }
}
