//! Per-connection peer state.
//!
//! Tracks what the remote has announced and correlates our outstanding
//! requests with its answers. The semaphore bounds how many of our requests
//! (and so how many unverified responses) can be in flight on one
//! connection.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, trace};

use super::message::Message;
use crate::bitfield::Bits;
use crate::error::{Error, Result, Target};
use crate::tree::{Proof, ProofRequest};

#[derive(Debug, Default)]
struct Remote {
    length: u64,
    have: Bits,
}

pub(crate) struct Peer {
    pub id: u64,
    outbound: mpsc::Sender<Message>,
    remote: Mutex<Remote>,
    /// Set once the remote has told us its length.
    status_seen: AtomicBool,
    pending: DashMap<u64, oneshot::Sender<Option<Proof>>>,
    permits: Arc<Semaphore>,
    next_request: AtomicU64,
    max_have_run: u64,
}

impl Peer {
    pub fn new(
        id: u64,
        outbound: mpsc::Sender<Message>,
        max_inflight: usize,
        max_have_run: u64,
    ) -> Self {
        Self {
            id,
            outbound,
            remote: Mutex::new(Remote::default()),
            status_seen: AtomicBool::new(false),
            pending: DashMap::new(),
            permits: Arc::new(Semaphore::new(max_inflight.max(1))),
            next_request: AtomicU64::new(0),
            max_have_run,
        }
    }

    /// Tree length the remote last reported.
    pub fn length(&self) -> u64 {
        self.remote.lock().length
    }

    pub fn status_seen(&self) -> bool {
        self.status_seen.load(Ordering::Acquire)
    }

    pub fn has(&self, index: u64) -> bool {
        self.remote.lock().have.get(index)
    }

    /// Requests sent and not yet answered.
    pub fn inflight(&self) -> usize {
        self.pending.len()
    }

    pub fn on_status(&self, length: u64) {
        let mut remote = self.remote.lock();
        remote.length = remote.length.max(length);
        self.status_seen.store(true, Ordering::Release);
    }

    /// Record a `Have` run. Runs that overflow or exceed `max_have_run` are
    /// ignored; returns whether the run was accepted.
    pub fn on_have(&self, start: u64, length: u64) -> bool {
        let end = match start.checked_add(length) {
            Some(end) if length <= self.max_have_run => end,
            _ => return false,
        };
        let mut remote = self.remote.lock();
        remote.have.set_range(start, end);
        remote.length = remote.length.max(end);
        true
    }

    pub async fn send(&self, message: Message) -> Result<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| Error::PeerDisconnected)
    }

    /// Best-effort send for announcements. A full channel drops the message;
    /// the remote can always ask again with `Range`.
    pub fn announce(&self, message: Message) {
        if let Err(e) = self.outbound.try_send(message) {
            debug!(peer = self.id, error = %e, "announcement dropped");
        }
    }

    /// Send a proof request and wait for the matching answer.
    ///
    /// `NoData` surfaces as `NotFound`, a closed session as
    /// `PeerDisconnected`, silence as `Timeout`.
    pub async fn request(
        &self,
        request: ProofRequest,
        timeout: Duration,
        target: Target,
    ) -> Result<Proof> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::PeerDisconnected)?;

        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        trace!(peer = self.id, id, %target, "request sent");

        if let Err(e) = self.send(Message::Request { id, request }).await {
            self.pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Some(proof))) => Ok(proof),
            Ok(Ok(None)) => Err(Error::NotFound(format!(
                "peer {} has no {}",
                self.id, target
            ))),
            Ok(Err(_)) => Err(Error::PeerDisconnected),
            Err(_) => {
                self.pending.remove(&id);
                Err(Error::Timeout(target))
            }
        }
    }

    /// Route an answer to whoever is waiting on request `id`. Answers to
    /// requests that already timed out are dropped.
    pub fn resolve(&self, id: u64, proof: Option<Proof>) {
        match self.pending.remove(&id) {
            Some((_, waiter)) => {
                let _ = waiter.send(proof);
            }
            None => trace!(peer = self.id, id, "late answer dropped"),
        }
    }

    /// Fail every outstanding request with `PeerDisconnected`.
    pub fn close(&self) {
        self.permits.close();
        self.pending.clear();
    }
}
