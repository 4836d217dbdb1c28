//! # Replicator
//!
//! The peer-facing half of a log. It runs one session per connected peer,
//! answers their proof requests, and fetches blocks, byte offsets and tree
//! upgrades on behalf of the local log.
//!
//! ## Request Lifecycle
//!
//! ```text
//! Idle ──select peer──> Requested(peer) ──proof──> Verifying ──ok──> Fulfilled
//!                            │                         │
//!                            └── timeout / no-data ────┴── bad proof ──> Failed
//!                                                                         │
//!                                   retry with another peer <─────────────┘
//!                                   (Unavailable after max_attempts)
//! ```
//!
//! ## Design Decisions
//!
//! - **One resolution per block.** Concurrent callers asking for the same
//!   index join a shared in-flight entry. The fetch itself runs on a spawned
//!   task, so a caller giving up never cancels it for the others.
//!
//! - **The replicator never mutates the log.** Every proof goes back through
//!   [`ReplicationHost::apply`], which owns the verify, commit, store and
//!   flush sequence. Here we only move messages and pick peers.
//!
//! - **Deterministic peer choice.** Among peers advertising the block: prefer
//!   ones whose tree is at least as long as ours, then ones not yet tried
//!   for this block, then the least busy, then the lowest id. Once every
//!   candidate has been tried, rotate through them by attempt number.
//!
//! - **Parked requests.** A peer asking for a block we don't have yet gets
//!   parked (bounded) and served the moment we announce the block, instead
//!   of bouncing off with `NoData`.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::message::{Message, RangeRequest};
use super::peer::Peer;
use super::stream::ProtocolStream;
use crate::config::ReplicatorConfig;
use crate::error::{Error, Result, Target};
use crate::tree::{Proof, ProofRequest};

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

/// What the replicator needs from the log it serves.
#[async_trait]
pub trait ReplicationHost: Send + Sync + 'static {
    /// Wait until the log is open.
    async fn ready(&self) -> Result<()>;

    /// Trusted tree length.
    fn length(&self) -> u64;

    /// Is block `index` stored locally?
    async fn has(&self, index: u64) -> Result<bool>;

    /// Local payload of a stored block.
    async fn block(&self, index: u64) -> Result<Vec<u8>>;

    /// Answer a peer's proof request from local state.
    async fn answer(&self, request: &ProofRequest) -> Result<Proof>;

    /// Verify a proof and, on success, persist everything it proves.
    async fn apply(&self, proof: Proof, peer: Option<u64>) -> Result<()>;

    /// Resolve a byte offset from local tree nodes only.
    async fn seek_local(&self, bytes: u64) -> Result<Option<(u64, u64)>>;

    /// Runs of locally stored blocks in `[start, end)`.
    async fn local_runs(&self, start: u64, end: u64) -> Result<Vec<(u64, u64)>>;
}

// ---------------------------------------------------------------------------
// Download
// ---------------------------------------------------------------------------

/// Outcome of a range download.
#[derive(Debug, Default)]
pub struct DownloadReport {
    /// Blocks fetched from peers, in completion order.
    pub downloaded: Vec<u64>,
    /// Blocks that could not be fetched and why.
    pub failed: Vec<(u64, Error)>,
}

impl DownloadReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Handle to a background range download.
pub struct Download {
    range: RangeRequest,
    task: JoinHandle<DownloadReport>,
}

impl Download {
    pub fn range(&self) -> RangeRequest {
        self.range
    }

    /// Wait for every block in the range to be fetched or given up on.
    pub async fn wait(self) -> Result<DownloadReport> {
        self.task.await.map_err(|_| Error::Closed)
    }

    /// Stop issuing new requests. Blocks already in flight still land.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

// ---------------------------------------------------------------------------
// Replicator
// ---------------------------------------------------------------------------

type Waiter = oneshot::Sender<Result<Vec<u8>>>;

struct Parked {
    peer_id: u64,
    peer: Weak<Peer>,
    id: u64,
    request: ProofRequest,
}

pub struct Replicator {
    host: Weak<dyn ReplicationHost>,
    config: ReplicatorConfig,
    peers: RwLock<BTreeMap<u64, Arc<Peer>>>,
    inflight: DashMap<u64, Vec<Waiter>>,
    parked: DashMap<u64, Vec<Parked>>,
    parked_count: AtomicUsize,
    /// Woken whenever a peer connects or announces something.
    availability: Notify,
    next_peer: AtomicU64,
    requests_sent: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl Replicator {
    pub fn new(host: Weak<dyn ReplicationHost>, config: ReplicatorConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            host,
            config,
            peers: RwLock::new(BTreeMap::new()),
            inflight: DashMap::new(),
            parked: DashMap::new(),
            parked_count: AtomicUsize::new(0),
            availability: Notify::new(),
            next_peer: AtomicU64::new(0),
            requests_sent: AtomicU64::new(0),
            shutdown,
        }
    }

    pub fn config(&self) -> &ReplicatorConfig {
        &self.config
    }

    /// Proof requests sent to peers so far.
    pub fn requests_sent(&self) -> u64 {
        self.requests_sent.load(Ordering::Relaxed)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Longest tree any connected peer has reported.
    pub fn max_peer_length(&self) -> u64 {
        self.peers
            .read()
            .values()
            .map(|p| p.length())
            .max()
            .unwrap_or(0)
    }

    /// End every session. Called when the owning log goes away.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.availability.notify_waiters();
    }

    fn host(&self) -> Result<Arc<dyn ReplicationHost>> {
        self.host.upgrade().ok_or(Error::Closed)
    }

    // -- Sessions -----------------------------------------------------------

    /// Open a new peer session and return its transport endpoint.
    pub fn create_stream(self: &Arc<Self>) -> ProtocolStream {
        let capacity = self.config.channel_capacity.max(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let id = self.next_peer.fetch_add(1, Ordering::Relaxed);
        let peer = Arc::new(Peer::new(
            id,
            outbound_tx,
            self.config.max_inflight_per_peer,
            self.config.max_have_run,
        ));

        let this = self.clone();
        tokio::spawn(async move { this.run_session(peer, inbound_rx).await });
        ProtocolStream::new(inbound_tx, outbound_rx)
    }

    async fn run_session(self: Arc<Self>, peer: Arc<Peer>, mut inbound: mpsc::Receiver<Message>) {
        let mut shutdown = self.shutdown.subscribe();
        self.peers.write().insert(peer.id, peer.clone());
        info!(peer = peer.id, "peer session opened");

        if let Err(e) = self.greet(&peer).await {
            warn!(peer = peer.id, error = %e, "failed to greet peer");
        }
        self.availability.notify_waiters();

        loop {
            tokio::select! {
                message = inbound.recv() => match message {
                    Some(message) => self.handle(&peer, message).await,
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }

        self.release_parked(peer.id);
        self.peers.write().remove(&peer.id);
        peer.close();
        self.availability.notify_waiters();
        info!(peer = peer.id, "peer session closed");
    }

    /// Tell a new peer our length and everything we hold.
    async fn greet(&self, peer: &Peer) -> Result<()> {
        let host = self.host()?;
        host.ready().await?;
        peer.send(Message::Status {
            length: host.length(),
        })
        .await?;
        for (start, length) in host.local_runs(0, u64::MAX).await? {
            for (start, length) in split_run(start, length, self.config.max_have_run) {
                peer.send(Message::Have { start, length }).await?;
            }
        }
        Ok(())
    }

    async fn handle(self: &Arc<Self>, peer: &Arc<Peer>, message: Message) {
        debug!(peer = peer.id, kind = message.kind(), "message received");
        match message {
            Message::Status { length } => {
                peer.on_status(length);
                self.availability.notify_waiters();
            }
            Message::Have { start, length } => {
                if peer.on_have(start, length) {
                    self.availability.notify_waiters();
                } else {
                    warn!(peer = peer.id, start, length, "ignoring oversized have run");
                }
            }
            Message::Request { id, request } => {
                let this = self.clone();
                let peer = peer.clone();
                tokio::spawn(async move { this.serve(peer, id, request).await });
            }
            Message::Response { id, proof } => peer.resolve(id, Some(proof)),
            Message::NoData { id } => peer.resolve(id, None),
            Message::Range(range) => {
                let runs = match self.host() {
                    Ok(host) => host.local_runs(range.start, range.end).await,
                    Err(e) => Err(e),
                };
                match runs {
                    Ok(runs) => {
                        for (start, length) in runs {
                            self.announce_have(peer, start, length);
                        }
                    }
                    Err(e) => warn!(peer = peer.id, error = %e, "cannot answer range"),
                }
            }
        }
    }

    async fn serve(&self, peer: Arc<Peer>, id: u64, request: ProofRequest) {
        let answer = match self.host() {
            Ok(host) => host.answer(&request).await,
            Err(e) => Err(e),
        };
        let reply = match answer {
            Ok(proof) => {
                let response = Message::Response { id, proof };
                match response.encoded_len() {
                    Ok(len) if len <= self.config.max_message_size as u64 => response,
                    Ok(len) => {
                        warn!(peer = peer.id, id, len, "answer too large to send");
                        Message::NoData { id }
                    }
                    Err(e) => {
                        warn!(peer = peer.id, id, error = %e, "failed to size answer");
                        Message::NoData { id }
                    }
                }
            }
            Err(Error::NotFound(what)) => match request.block_index {
                Some(index) if self.try_park(index, &peer, id, &request) => {
                    debug!(peer = peer.id, index, "request parked");
                    return;
                }
                _ => {
                    debug!(peer = peer.id, %what, "cannot serve request");
                    Message::NoData { id }
                }
            },
            Err(e) => {
                warn!(peer = peer.id, error = %e, "failed to build proof");
                Message::NoData { id }
            }
        };
        if peer.send(reply).await.is_err() {
            debug!(peer = peer.id, id, "peer left before the answer");
        }
    }

    fn try_park(&self, index: u64, peer: &Arc<Peer>, id: u64, request: &ProofRequest) -> bool {
        let reserved = self
            .parked_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.config.max_parked_requests).then_some(n + 1)
            })
            .is_ok();
        if reserved {
            self.parked.entry(index).or_default().push(Parked {
                peer_id: peer.id,
                peer: Arc::downgrade(peer),
                id,
                request: request.clone(),
            });
        }
        reserved
    }

    /// Drop everything a departing peer had parked and free its slots.
    fn release_parked(&self, peer_id: u64) {
        let mut released = 0;
        self.parked.retain(|_, waiting| {
            let before = waiting.len();
            waiting.retain(|parked| parked.peer_id != peer_id);
            released += before - waiting.len();
            !waiting.is_empty()
        });
        if released > 0 {
            self.parked_count.fetch_sub(released, Ordering::AcqRel);
            debug!(peer = peer_id, released, "parked requests released");
        }
    }

    /// Parked peer requests, across all sessions.
    pub fn parked_requests(&self) -> usize {
        self.parked_count.load(Ordering::Acquire)
    }

    /// Announce `[start, start + length)` to one peer, split into runs the
    /// peer will accept.
    fn announce_have(&self, peer: &Peer, start: u64, length: u64) {
        for (start, length) in split_run(start, length, self.config.max_have_run) {
            peer.announce(Message::Have { start, length });
        }
    }

    // -- Broadcast ----------------------------------------------------------

    /// Announce a new tree length to every peer.
    pub fn broadcast_length(&self, length: u64) {
        for peer in self.peers.read().values() {
            peer.announce(Message::Status { length });
        }
    }

    /// Announce newly stored blocks and serve any requests parked on them.
    pub fn broadcast_range(self: &Arc<Self>, start: u64, length: u64) {
        for peer in self.peers.read().values() {
            self.announce_have(peer, start, length);
        }

        if self.parked.is_empty() {
            return;
        }
        for index in start..start + length {
            let Some((_, waiting)) = self.parked.remove(&index) else {
                continue;
            };
            self.parked_count.fetch_sub(waiting.len(), Ordering::AcqRel);
            for parked in waiting {
                if let Some(peer) = parked.peer.upgrade() {
                    let this = self.clone();
                    tokio::spawn(async move { this.serve(peer, parked.id, parked.request).await });
                }
            }
        }
    }

    pub fn broadcast_block(self: &Arc<Self>, index: u64) {
        self.broadcast_range(index, 1);
    }

    // -- Fetching -----------------------------------------------------------

    /// Fetch, verify and store block `index`, returning its payload.
    ///
    /// At most one network resolution per index is ever in flight; later
    /// callers wait on the same outcome.
    pub async fn request_block(self: &Arc<Self>, index: u64) -> Result<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        let first = match self.inflight.entry(index) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().push(tx);
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(vec![tx]);
                true
            }
        };

        if first {
            let this = self.clone();
            tokio::spawn(async move {
                let result = this.fetch_block(index).await;
                if let Some((_, waiters)) = this.inflight.remove(&index) {
                    for waiter in waiters {
                        let _ = waiter.send(result.clone());
                    }
                }
            });
        } else {
            debug!(index, "joining in-flight request");
        }

        rx.await.map_err(|_| Error::Closed)?
    }

    async fn fetch_block(&self, index: u64) -> Result<Vec<u8>> {
        let target = Target::Block(index);
        let mut tried = HashSet::new();

        for attempt in 0..self.config.max_attempts {
            let host = self.host()?;
            if host.has(index).await? {
                return host.block(index).await;
            }

            let peer = self
                .wait_for_peer(target, |p| p.has(index), &tried, attempt)
                .await?;
            tried.insert(peer.id);

            let request = ProofRequest::block(index, host.length());
            let proof = match self.request_from(&peer, request, target).await {
                Ok(proof) => proof,
                Err(e) if e.is_retryable() => {
                    warn!(peer = peer.id, index, attempt, error = %e, "block request failed");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let value = match &proof.block {
                Some(block) if block.index == index => block.value.clone(),
                _ => None,
            };
            let Some(value) = value else {
                warn!(peer = peer.id, index, "answer did not carry the block");
                continue;
            };

            match host.apply(proof, Some(peer.id)).await {
                Ok(()) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    warn!(peer = peer.id, index, attempt, error = %e, "proof rejected");
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::Unavailable {
            target,
            attempts: self.config.max_attempts,
        })
    }

    /// Resolve a byte offset, fetching tree nodes (and a longer tree if the
    /// offset lies beyond ours) as needed.
    pub async fn request_seek(&self, bytes: u64) -> Result<(u64, u64)> {
        let target = Target::Bytes(bytes);
        let mut tried = HashSet::new();
        let mut upgraded = false;

        for attempt in 0..self.config.max_attempts {
            let host = self.host()?;
            match host.seek_local(bytes).await {
                Ok(Some(found)) => return Ok(found),
                Ok(None) => {}
                Err(Error::OutOfBounds(_)) if !upgraded => {
                    upgraded = true;
                    if self.request_upgrade().await? {
                        continue;
                    }
                    return Err(Error::OutOfBounds(bytes));
                }
                Err(e) => return Err(e),
            }

            let local = host.length();
            let peer = self
                .wait_for_peer(target, |p| p.length() >= local, &tried, attempt)
                .await?;
            tried.insert(peer.id);

            let request = ProofRequest::seek(bytes, local);
            match self.request_from(&peer, request, target).await {
                Ok(proof) => match host.apply(proof, Some(peer.id)).await {
                    Ok(()) => {}
                    Err(e) if e.is_retryable() => {
                        warn!(peer = peer.id, bytes, error = %e, "seek proof rejected")
                    }
                    Err(e) => return Err(e),
                },
                Err(e) if e.is_retryable() => {
                    warn!(peer = peer.id, bytes, error = %e, "seek request failed")
                }
                Err(e) => return Err(e),
            }
        }

        let host = self.host()?;
        match host.seek_local(bytes).await? {
            Some(found) => Ok(found),
            None => Err(Error::Unavailable {
                target,
                attempts: self.config.max_attempts,
            }),
        }
    }

    /// Ask the peer with the longest tree for it. Returns whether our length
    /// grew.
    pub async fn request_upgrade(&self) -> Result<bool> {
        let host = self.host()?;
        host.ready().await?;
        self.wait_for_status().await;

        let local = host.length();
        let mut candidates: Vec<Arc<Peer>> = self
            .peers
            .read()
            .values()
            .filter(|p| p.length() > local)
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Ok(false);
        }
        candidates.sort_by_key(|p| (std::cmp::Reverse(p.length()), p.id));

        for peer in candidates.iter().take(self.config.max_attempts as usize) {
            let known = host.length();
            let proof = match self
                .request_from(peer, ProofRequest::upgrade(known), Target::Upgrade)
                .await
            {
                Ok(proof) => proof,
                Err(e) if e.is_retryable() => {
                    warn!(peer = peer.id, error = %e, "upgrade request failed");
                    continue;
                }
                Err(e) => return Err(e),
            };
            match host.apply(proof, Some(peer.id)).await {
                Ok(()) if host.length() > local => return Ok(true),
                Ok(()) => {}
                Err(e) if e.is_retryable() => {
                    warn!(peer = peer.id, error = %e, "upgrade rejected")
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::Unavailable {
            target: Target::Upgrade,
            attempts: candidates.len().min(self.config.max_attempts as usize) as u32,
        })
    }

    /// Fetch every missing block in the range on a background task.
    pub fn request_range(self: &Arc<Self>, range: RangeRequest) -> Download {
        let this = self.clone();
        let task = tokio::spawn(async move { this.run_download(range).await });
        Download { range, task }
    }

    async fn run_download(self: Arc<Self>, range: RangeRequest) -> DownloadReport {
        let mut report = DownloadReport::default();
        for peer in self.peers.read().values() {
            peer.announce(Message::Range(range));
        }

        let Ok(host) = self.host() else {
            return report;
        };
        let mut missing = Vec::new();
        for index in range.start..range.end {
            match host.has(index).await {
                Ok(true) => {}
                Ok(false) => missing.push(index),
                Err(e) => report.failed.push((index, e)),
            }
        }
        drop(host);
        info!(
            start = range.start,
            end = range.end,
            missing = missing.len(),
            linear = range.linear,
            "download started"
        );

        if range.linear {
            for index in missing {
                match self.request_block(index).await {
                    Ok(_) => report.downloaded.push(index),
                    Err(e) => report.failed.push((index, e)),
                }
            }
        } else {
            let mut results = futures::stream::iter(missing)
                .map(|index| {
                    let this = self.clone();
                    async move { (index, this.request_block(index).await) }
                })
                .buffer_unordered(self.config.max_parallel_requests.max(1));
            while let Some((index, result)) = results.next().await {
                match result {
                    Ok(_) => report.downloaded.push(index),
                    Err(e) => report.failed.push((index, e)),
                }
            }
        }

        info!(
            downloaded = report.downloaded.len(),
            failed = report.failed.len(),
            "download finished"
        );
        report
    }

    // -- Peer selection -----------------------------------------------------

    fn select_peer(
        &self,
        eligible: impl Fn(&Peer) -> bool,
        tried: &HashSet<u64>,
        attempt: u32,
        local: u64,
    ) -> Option<Arc<Peer>> {
        let peers = self.peers.read();
        let candidates: Vec<&Arc<Peer>> = peers.values().filter(|p| eligible(&***p)).collect();
        if candidates.is_empty() {
            return None;
        }

        // Candidates come out of the BTreeMap ordered by id.
        if candidates.iter().all(|p| tried.contains(&p.id)) {
            let pick = attempt as usize % candidates.len();
            return Some(candidates[pick].clone());
        }
        candidates
            .into_iter()
            .min_by_key(|p| {
                (
                    p.length() < local,
                    tried.contains(&p.id),
                    p.inflight(),
                    p.id,
                )
            })
            .cloned()
    }

    /// Select a peer, waiting up to the availability timeout for one to
    /// show up.
    async fn wait_for_peer(
        &self,
        target: Target,
        eligible: impl Fn(&Peer) -> bool,
        tried: &HashSet<u64>,
        attempt: u32,
    ) -> Result<Arc<Peer>> {
        let deadline = tokio::time::Instant::now() + self.config.availability_timeout();
        loop {
            let notified = self.availability.notified();
            let local = self.host()?.length();
            if let Some(peer) = self.select_peer(&eligible, tried, attempt, local) {
                return Ok(peer);
            }
            if *self.shutdown.borrow() {
                return Err(Error::Closed);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                debug!(%target, "no peer became available");
                return Err(Error::NoPeer(target));
            }
        }
    }

    /// Give freshly connected peers a moment to report their length.
    async fn wait_for_status(&self) {
        let deadline = tokio::time::Instant::now() + self.config.availability_timeout();
        loop {
            let notified = self.availability.notified();
            let pending = self.peers.read().values().any(|p| !p.status_seen());
            if !pending || *self.shutdown.borrow() {
                return;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return;
            }
        }
    }

    async fn request_from(&self, peer: &Peer, request: ProofRequest, target: Target) -> Result<Proof> {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
        debug!(peer = peer.id, %target, "requesting proof");
        peer.request(request, self.config.request_timeout(), target)
            .await
    }
}

/// Cut a run into pieces of at most `max` blocks.
fn split_run(start: u64, length: u64, max: u64) -> impl Iterator<Item = (u64, u64)> {
    let max = max.max(1);
    let end = start.saturating_add(length);
    std::iter::successors(Some(start), move |&at| at.checked_add(max))
        .take_while(move |&at| at < end)
        .map(move |at| (at, max.min(end - at)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OmegaOptions;
    use crate::omega::Omega;
    use crate::storage::MemoryStorage;
    use std::time::Duration;

    struct NullHost;

    #[async_trait]
    impl ReplicationHost for NullHost {
        async fn ready(&self) -> Result<()> {
            Ok(())
        }
        fn length(&self) -> u64 {
            0
        }
        async fn has(&self, _: u64) -> Result<bool> {
            Ok(false)
        }
        async fn block(&self, index: u64) -> Result<Vec<u8>> {
            Err(Error::NotFound(format!("block {}", index)))
        }
        async fn answer(&self, _: &ProofRequest) -> Result<Proof> {
            Err(Error::NotFound("nothing here".to_string()))
        }
        async fn apply(&self, _: Proof, _: Option<u64>) -> Result<()> {
            Err(Error::verification("null host"))
        }
        async fn seek_local(&self, bytes: u64) -> Result<Option<(u64, u64)>> {
            Err(Error::OutOfBounds(bytes))
        }
        async fn local_runs(&self, _: u64, _: u64) -> Result<Vec<(u64, u64)>> {
            Ok(Vec::new())
        }
    }

    fn options(config: ReplicatorConfig) -> OmegaOptions {
        OmegaOptions {
            replicator: config,
            ..OmegaOptions::default()
        }
    }

    async fn open(config: ReplicatorConfig) -> Omega {
        Omega::open(Arc::new(MemoryStorage::new()), options(config))
            .await
            .unwrap()
    }

    fn add_peer(replicator: &Replicator, id: u64, length: u64) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(8);
        let peer = Arc::new(Peer::new(id, tx, 4, crate::config::DEFAULT_MAX_HAVE_RUN));
        peer.on_status(length);
        peer.on_have(0, length);
        replicator.peers.write().insert(id, peer);
        rx
    }

    #[test]
    fn selection_prefers_untried_then_rotates() {
        let host: Weak<dyn ReplicationHost> = Weak::<NullHost>::new();
        let replicator = Replicator::new(host, ReplicatorConfig::default());
        let _a = add_peer(&replicator, 0, 4);
        let _b = add_peer(&replicator, 1, 4);
        let _c = add_peer(&replicator, 2, 1);

        let mut tried = HashSet::new();
        let pick = |tried: &HashSet<u64>, attempt| {
            replicator
                .select_peer(|p| p.has(0), tried, attempt, 2)
                .map(|p| p.id)
        };

        assert_eq!(pick(&tried, 0), Some(0));
        tried.insert(0);
        assert_eq!(pick(&tried, 1), Some(1));
        tried.insert(1);

        // Peer 2 is shorter than our tree, so a tried long peer still wins.
        assert_eq!(pick(&tried, 2), Some(0));
        tried.insert(2);

        // Everyone tried: rotate by attempt number.
        assert_eq!(pick(&tried, 3), Some(0));
        assert_eq!(pick(&tried, 4), Some(1));
        assert_eq!(pick(&tried, 5), Some(2));
        assert_eq!(
            replicator.select_peer(|p| p.has(9), &tried, 0, 2).map(|p| p.id),
            None
        );
    }

    #[tokio::test(start_paused = true)]
    async fn no_peer_surfaces_after_the_availability_timeout() {
        let log = open(ReplicatorConfig {
            availability_timeout_ms: 100,
            ..ReplicatorConfig::default()
        })
        .await;
        let err = log.get(0).await.unwrap_err();
        assert!(matches!(err, Error::NoPeer(Target::Block(0))));
    }

    #[tokio::test]
    async fn concurrent_gets_share_one_request() {
        let source = open(ReplicatorConfig::default()).await;
        source.append((0..8).map(|i| vec![i as u8; 3])).await.unwrap();
        let replica = open(ReplicatorConfig::default()).await;
        crate::network::connect(source.replicate(), replica.replicate());

        let (a, b) = tokio::join!(replica.get(5), replica.get(5));
        assert_eq!(a.unwrap(), vec![5u8; 3]);
        assert_eq!(b.unwrap(), vec![5u8; 3]);
        assert_eq!(replica.requests_sent(), 1);
    }

    #[tokio::test]
    async fn requests_for_missing_blocks_are_parked_until_append() {
        let log = open(ReplicatorConfig::default()).await;
        let mut remote = log.replicate();
        remote
            .send(Message::Request {
                id: 7,
                request: ProofRequest::block(0, 0),
            })
            .await
            .unwrap();

        log.append(["late"]).await.unwrap();
        loop {
            match remote.recv().await {
                Some(Message::Response { id, proof }) => {
                    assert_eq!(id, 7);
                    let block = proof.block.unwrap();
                    assert_eq!(block.value.as_deref(), Some(b"late".as_slice()));
                    break;
                }
                Some(Message::NoData { .. }) => panic!("request should have been parked"),
                Some(_) => continue,
                None => panic!("session closed"),
            }
        }
    }

    #[tokio::test]
    async fn full_parking_answers_no_data() {
        let log = open(ReplicatorConfig {
            max_parked_requests: 0,
            ..ReplicatorConfig::default()
        })
        .await;
        let mut remote = log.replicate();
        remote
            .send(Message::Request {
                id: 3,
                request: ProofRequest::block(3, 0),
            })
            .await
            .unwrap();

        loop {
            match remote.recv().await {
                Some(Message::NoData { id }) => {
                    assert_eq!(id, 3);
                    break;
                }
                Some(Message::Response { .. }) => panic!("nothing to serve"),
                Some(_) => continue,
                None => panic!("session closed"),
            }
        }
    }

    #[tokio::test]
    async fn bad_proofs_exhaust_attempts() {
        let source = open(ReplicatorConfig::default()).await;
        source.append(["a", "b", "c"]).await.unwrap();
        let replica = open(ReplicatorConfig {
            max_attempts: 2,
            ..ReplicatorConfig::default()
        })
        .await;

        let mut remote = replica.replicate();
        remote.send(Message::Status { length: 3 }).await.unwrap();
        remote
            .send(Message::Have {
                start: 0,
                length: 3,
            })
            .await
            .unwrap();

        let liar = tokio::spawn(async move {
            while let Some(message) = remote.recv().await {
                if let Message::Request { id, request } = message {
                    let mut proof = source.proof(&request).await.unwrap();
                    if let Some(block) = proof.block.as_mut() {
                        block.value = Some(b"evil".to_vec());
                    }
                    let _ = remote.send(Message::Response { id, proof }).await;
                }
            }
        });

        let err = replica.get(1).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Unavailable {
                target: Target::Block(1),
                attempts: 2
            }
        ));
        assert_eq!(replica.length(), 0);
        assert!(!replica.has(1).await.unwrap());
        assert_eq!(replica.requests_sent(), 2);
        liar.abort();
    }

    /// Next `Request` the log sends on `remote`, skipping announcements.
    async fn next_request(remote: &mut ProtocolStream) -> (u64, ProofRequest) {
        loop {
            match remote.recv().await {
                Some(Message::Request { id, request }) => return (id, request),
                Some(_) => continue,
                None => panic!("session closed"),
            }
        }
    }

    async fn advertise(remote: &ProtocolStream, length: u64) {
        remote.send(Message::Status { length }).await.unwrap();
        remote
            .send(Message::Have { start: 0, length })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn answers_too_large_for_a_message_become_no_data() {
        let log = open(ReplicatorConfig {
            max_message_size: 256,
            ..ReplicatorConfig::default()
        })
        .await;
        log.append([vec![7u8; 1024]]).await.unwrap();

        let mut remote = log.replicate();
        remote
            .send(Message::Request {
                id: 1,
                request: ProofRequest::block(0, 0),
            })
            .await
            .unwrap();
        loop {
            match remote.recv().await {
                Some(Message::NoData { id }) => {
                    assert_eq!(id, 1);
                    break;
                }
                Some(Message::Response { .. }) => panic!("oversized answer was sent"),
                Some(_) => continue,
                None => panic!("session closed"),
            }
        }
        // The session survives and keeps answering.
        assert_eq!(log.peer_count(), 1);
    }

    #[tokio::test]
    async fn range_downloads_respect_the_per_peer_cap() {
        let replica = open(ReplicatorConfig {
            max_inflight_per_peer: 2,
            max_parallel_requests: 8,
            request_timeout_ms: 60_000,
            ..ReplicatorConfig::default()
        })
        .await;
        let mut remote = replica.replicate();
        advertise(&remote, 10).await;

        let download = replica.download(RangeRequest::new(0, 10));
        let mut outstanding = 0;
        loop {
            match tokio::time::timeout(Duration::from_millis(200), next_request(&mut remote)).await
            {
                Ok(_) => outstanding += 1,
                Err(_) => break,
            }
        }
        assert_eq!(outstanding, 2);
        assert_eq!(replica.requests_sent(), 2);
        download.cancel();
    }

    #[tokio::test]
    async fn dropping_one_waiter_keeps_the_shared_fetch_alive() {
        let source = open(ReplicatorConfig::default()).await;
        source.append(["a", "b", "c"]).await.unwrap();
        let replica = open(ReplicatorConfig::default()).await;
        let mut remote = replica.replicate();
        advertise(&remote, 3).await;

        let first = tokio::spawn({
            let replica = replica.clone();
            async move { replica.get(1).await }
        });
        let (id, request) = next_request(&mut remote).await;

        let second = tokio::spawn({
            let replica = replica.clone();
            async move { replica.get(1).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        first.abort();
        assert!(first.await.unwrap_err().is_cancelled());

        let proof = source.proof(&request).await.unwrap();
        remote.send(Message::Response { id, proof }).await.unwrap();

        assert_eq!(second.await.unwrap().unwrap(), b"b");
        assert_eq!(replica.requests_sent(), 1);
        assert!(replica.has(1).await.unwrap());
    }

    #[tokio::test]
    async fn cancelled_downloads_report_closed() {
        let replica = open(ReplicatorConfig {
            request_timeout_ms: 60_000,
            ..ReplicatorConfig::default()
        })
        .await;
        let mut remote = replica.replicate();
        advertise(&remote, 4).await;

        let download = replica.download(RangeRequest {
            linear: true,
            ..RangeRequest::new(0, 4)
        });
        next_request(&mut remote).await;
        download.cancel();
        assert!(matches!(download.wait().await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn parked_slots_are_freed_when_the_peer_leaves() {
        let log = open(ReplicatorConfig {
            max_parked_requests: 1,
            ..ReplicatorConfig::default()
        })
        .await;

        let leaver = log.replicate();
        leaver
            .send(Message::Request {
                id: 1,
                request: ProofRequest::block(1_000, 0),
            })
            .await
            .unwrap();
        while log.replicator().parked_requests() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        drop(leaver);
        while log.peer_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(log.replicator().parked_requests(), 0);

        // The freed slot is available to the next peer.
        let mut stayer = log.replicate();
        stayer
            .send(Message::Request {
                id: 2,
                request: ProofRequest::block(0, 0),
            })
            .await
            .unwrap();
        while log.replicator().parked_requests() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        log.append(["now"]).await.unwrap();
        loop {
            match stayer.recv().await {
                Some(Message::Response { id, .. }) => {
                    assert_eq!(id, 2);
                    break;
                }
                Some(Message::NoData { .. }) => panic!("request should have been parked"),
                Some(_) => continue,
                None => panic!("session closed"),
            }
        }
        assert_eq!(log.replicator().parked_requests(), 0);
    }

    #[test]
    fn long_runs_are_split_for_announcement() {
        assert_eq!(split_run(0, 10, 4).collect::<Vec<_>>(), vec![(0, 4), (4, 4), (8, 2)]);
        assert_eq!(split_run(5, 0, 4).count(), 0);
        assert_eq!(
            split_run(u64::MAX - 3, 3, 2).collect::<Vec<_>>(),
            vec![(u64::MAX - 3, 2), (u64::MAX - 1, 1)]
        );
    }
}
