//! # Data Broadcaster
//!
//! Hands out exclusive, bounded, reusable buffers to any number of concurrent
//! producers and forwards the filled buffers to a [`TransportSink`].
//!
//! ## Design
//!
//! ```text
//! acquire() ──request──┐                      ┌──> SlotHandle (oneshot)
//!                      ├──> worker task ──────┤
//! release / complete ──┘   (owns SlotPool)    └──> stale-lease timer
//! ```
//!
//! A single worker task owns the [`SlotPool`]; every other party talks to it
//! through channels, so the table, the pending queue and the in-flight index
//! need no lock. On every wake the worker first serves waiting requests in
//! arrival order, then drains completions, and serves again if a completion
//! freed a slot.
//!
//! Releases travel on two queues. Handles and completions release their own
//! lease exactly once, so their queue needs no bound; a late release from a
//! lease that was already reclaimed is dropped by the worker as unknown. Ids
//! released by hand through [`Broadcaster::release`] go through a queue
//! bounded to the pool capacity, and overflowing it is reported.
//!
//! When the pool is saturated the requesters simply wait. That wait is the
//! only backpressure in the bridge: producers stall instead of the pool
//! growing. The worker does not poll while starving; it sleeps until either
//! a request or completion arrives or the oldest lease turns stale.

use std::mem;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::configs::bridge_config::BridgeConfig;
use crate::core::error::BroadcastError;
use crate::core::slot_pool::{Lease, MessageId, PoolSnapshot, SlotPool};
use crate::core::transport::{Completion, OutboundFrame, SessionId, TransportSink};

/// A finished lease travelling back to the worker.
struct Released {
    id: MessageId,
    storage: Option<BytesMut>,
}

enum WorkerRequest {
    Acquire(oneshot::Sender<SlotHandle>),
    Snapshot(oneshot::Sender<PoolSnapshot>),
}

/// Milliseconds of `duration`, saturating at `u64::MAX`.
fn whole_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Release of a handle or completion. Each lease yields at most one of these,
/// revoked leases included, so the queue is not bounded.
fn send_lease_release(releases: &mpsc::UnboundedSender<Released>, id: MessageId, storage: Option<BytesMut>) {
    if releases.send(Released { id, storage }).is_err() {
        log::debug!("Release of message id {} after the broadcaster stopped.", id);
    }
}

/// # Slot Handle
///
/// Exclusive write access to one leased slot. Fill it, then pass it to
/// [`Broadcaster::publish_filled`]. A handle dropped without publishing gives
/// its slot back.
pub struct SlotHandle {
    id: MessageId,
    index: usize,
    storage: BytesMut,
    releases: mpsc::UnboundedSender<Released>,
    done: bool,
}

impl SlotHandle {
    fn new(lease: Lease, releases: mpsc::UnboundedSender<Released>) -> Self {
        Self {
            id: lease.id,
            index: lease.index,
            storage: lease.storage,
            releases,
            done: false,
        }
    }

    /// Lease id, unique while the slot is FILLING.
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Position of the slot in the pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Replaces the buffer contents with `payload`.
    pub fn fill(&mut self, payload: &[u8]) {
        if payload.len() > self.storage.capacity() {
            log::debug!(
                "Payload of {} bytes exceeds slot capacity {}; growing buffer for message id {}.",
                payload.len(),
                self.storage.capacity(),
                self.id
            );
        }
        self.storage.clear();
        self.storage.extend_from_slice(payload);
    }

    /// Direct access for producers that serialise straight into the slot.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.storage
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    fn into_parts(mut self) -> (MessageId, BytesMut, mpsc::UnboundedSender<Released>) {
        self.done = true;
        (self.id, mem::take(&mut self.storage), self.releases.clone())
    }

    fn into_lease(mut self) -> Lease {
        self.done = true;
        Lease {
            id: self.id,
            index: self.index,
            storage: mem::take(&mut self.storage),
        }
    }
}

impl Drop for SlotHandle {
    fn drop(&mut self) {
        if !self.done {
            send_lease_release(&self.releases, self.id, Some(mem::take(&mut self.storage)));
        }
    }
}

/// # Broadcaster
///
/// Front end of the slot pool. Cheap to share behind an `Arc`.
pub struct Broadcaster {
    requests: mpsc::UnboundedSender<WorkerRequest>,
    /// Ids released by hand through [`Broadcaster::release`]. Bounded to the
    /// pool capacity.
    manual_releases: mpsc::Sender<MessageId>,
    transport: Arc<dyn TransportSink>,
    capacity: usize,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Broadcaster {
    /// Builds the pool and spawns its worker task. Must be called from within
    /// a tokio runtime.
    pub fn new(config: &BridgeConfig, transport: Arc<dyn TransportSink>) -> Result<Self, BroadcastError> {
        config.validate()?;

        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (lease_releases_tx, lease_releases_rx) = mpsc::unbounded_channel();
        let (manual_releases_tx, manual_releases_rx) = mpsc::channel(config.pool_capacity);
        let shutdown = CancellationToken::new();

        let worker = Worker {
            pool: SlotPool::new(config.pool_capacity, config.slot_size_bytes, config.max_lease()),
            pending: Default::default(),
            snapshot_waiters: Vec::new(),
            requests: requests_rx,
            lease_releases_rx,
            lease_releases_tx,
            manual_releases_rx,
            shutdown: shutdown.clone(),
            retry_wait: config.retry_wait(),
            last_scan: Instant::now(),
            starving: false,
        };

        log::debug!(
            "Start broadcaster worker with {} slots of {} bytes.",
            config.pool_capacity,
            config.slot_size_bytes
        );
        let handle = tokio::spawn(worker.run());

        Ok(Self {
            requests: requests_tx,
            manual_releases: manual_releases_tx,
            transport,
            capacity: config.pool_capacity,
            shutdown,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Waits for a free slot.
    ///
    /// Under saturation this waits until a lease is released or turns stale.
    /// Fails only when the worker is gone.
    pub async fn acquire(&self) -> Result<SlotHandle, BroadcastError> {
        if self.shutdown.is_cancelled() {
            return Err(BroadcastError::ShutDown);
        }

        let (tx, rx) = oneshot::channel();
        if self.requests.send(WorkerRequest::Acquire(tx)).is_err() {
            log::error!("Broadcaster worker is not running; memory request rejected.");
            return Err(BroadcastError::OutOfResources);
        }

        rx.await.map_err(|_| {
            if self.shutdown.is_cancelled() {
                BroadcastError::ShutDown
            } else {
                log::error!("Broadcaster worker dropped a memory request.");
                BroadcastError::OutOfResources
            }
        })
    }

    /// [`acquire`](Self::acquire) bounded by `timeout`. A request that times
    /// out is withdrawn; it never holds a slot afterwards.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<SlotHandle, BroadcastError> {
        match tokio::time::timeout(timeout, self.acquire()).await {
            Ok(result) => result,
            Err(_) => Err(BroadcastError::AcquireTimeout(whole_millis(timeout))),
        }
    }

    /// Copies `payload` into the slot and forwards it.
    pub fn publish(&self, mut handle: SlotHandle, payload: &[u8], destinations: Vec<SessionId>, binary: bool) {
        handle.fill(payload);
        self.publish_filled(handle, destinations, binary);
    }

    /// Forwards an already filled slot to the transport. The slot stays
    /// FILLING until the transport completes the frame.
    pub fn publish_filled(&self, handle: SlotHandle, destinations: Vec<SessionId>, binary: bool) {
        let (id, mut storage, releases) = handle.into_parts();
        let payload = storage.split().freeze();

        let completion = Completion::with_storage(
            id,
            storage,
            Box::new(move |id, storage| {
                send_lease_release(&releases, id, storage);
            }),
        );

        self.transport.send(
            OutboundFrame {
                id,
                payload,
                destinations,
                binary,
            },
            completion,
        );
    }

    /// Marks the lease `id` as finished. Unknown ids are ignored by the worker.
    ///
    /// At most `capacity` such releases can be queued at once; beyond that the
    /// caller is releasing ids it never held.
    pub fn release(&self, id: MessageId) -> Result<(), BroadcastError> {
        match self.manual_releases.try_send(id) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                log::error!(
                    "Completion queue full while releasing message id {}. More releases are outstanding than the pool has slots.",
                    id
                );
                Err(BroadcastError::CompletionOverflow { id })
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("Release of message id {} after the broadcaster stopped.", id);
                Err(BroadcastError::ShutDown)
            }
        }
    }

    /// Copy of the pool bookkeeping, taken by the worker between two cycles.
    pub async fn snapshot(&self) -> Result<PoolSnapshot, BroadcastError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(WorkerRequest::Snapshot(tx))
            .map_err(|_| BroadcastError::ShutDown)?;
        rx.await.map_err(|_| BroadcastError::ShutDown)
    }

    /// Stops the worker and waits for it. Outstanding requests fail with
    /// [`BroadcastError::ShutDown`].
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self
            .worker
            .lock()
            .expect("Broadcaster worker lock poisoned")
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::error!("Broadcaster worker ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Worker {
    pool: SlotPool,
    pending: std::collections::VecDeque<oneshot::Sender<SlotHandle>>,
    snapshot_waiters: Vec<oneshot::Sender<PoolSnapshot>>,
    requests: mpsc::UnboundedReceiver<WorkerRequest>,
    lease_releases_rx: mpsc::UnboundedReceiver<Released>,
    lease_releases_tx: mpsc::UnboundedSender<Released>,
    manual_releases_rx: mpsc::Receiver<MessageId>,
    shutdown: CancellationToken,
    retry_wait: Duration,
    last_scan: Instant,
    starving: bool,
}

impl Worker {
    async fn run(mut self) {
        loop {
            let wake_at = self.stale_deadline();
            let mut first_release = None;

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                request = self.requests.recv() => match request {
                    Some(request) => self.accept(request),
                    None => break,
                },
                Some(released) = self.lease_releases_rx.recv() => first_release = Some(released),
                Some(id) = self.manual_releases_rx.recv() => first_release = Some(Released { id, storage: None }),
                _ = sleep_until(wake_at.unwrap_or_else(Instant::now)), if wake_at.is_some() => {}
            }

            while let Ok(request) = self.requests.try_recv() {
                self.accept(request);
            }

            loop {
                self.handle_requester_requests();
                if self.handle_publisher_requests(first_release.take()) == 0 {
                    break;
                }
            }

            self.answer_snapshots();
        }

        log::info!(
            "Broadcaster worker stopped with {} requests still waiting.",
            self.pending.len()
        );
    }

    fn accept(&mut self, request: WorkerRequest) {
        match request {
            WorkerRequest::Acquire(requester) => self.pending.push_back(requester),
            WorkerRequest::Snapshot(waiter) => self.snapshot_waiters.push(waiter),
        }
    }

    /// Serves waiting requests in arrival order until the pool runs dry.
    fn handle_requester_requests(&mut self) {
        let now = Instant::now();
        self.last_scan = now;

        while let Some(requester) = self.pending.pop_front() {
            if requester.is_closed() {
                continue;
            }

            let Some(index) = self.pool.find_next_free_slot(now) else {
                self.pending.push_front(requester);
                if !self.starving {
                    log::info!(
                        "No free memory slot at the moment, {} requests waiting.",
                        self.pending.len()
                    );
                    self.starving = true;
                }
                return;
            };
            self.starving = false;

            let lease = self.pool.assign(index, now);
            let handle = SlotHandle::new(lease, self.lease_releases_tx.clone());
            if let Err(handle) = requester.send(handle) {
                log::debug!("Requester for message id {} went away; slot returned.", handle.id());
                self.pool.revert(handle.into_lease());
            }
        }
    }

    /// Drains all queued completions. Returns how many slots were freed.
    fn handle_publisher_requests(&mut self, first: Option<Released>) -> usize {
        let mut freed = 0;
        if let Some(released) = first {
            freed += usize::from(self.pool.release(released.id, released.storage));
        }
        while let Ok(released) = self.lease_releases_rx.try_recv() {
            freed += usize::from(self.pool.release(released.id, released.storage));
        }
        while let Ok(id) = self.manual_releases_rx.try_recv() {
            freed += usize::from(self.pool.release(id, None));
        }
        freed
    }

    fn answer_snapshots(&mut self) {
        if self.snapshot_waiters.is_empty() {
            return;
        }
        self.pending.retain(|requester| !requester.is_closed());
        let snapshot = self.pool.snapshot(self.pending.len());
        for waiter in self.snapshot_waiters.drain(..) {
            let _ = waiter.send(snapshot.clone());
        }
    }

    /// When requests are starving, the moment the oldest lease may be
    /// reclaimed, but never sooner than `retry_wait` after the last scan.
    fn stale_deadline(&self) -> Option<Instant> {
        if self.pending.is_empty() || self.pool.has_free_slot() {
            return None;
        }
        let expiry = self.pool.earliest_expiry()? + Duration::from_millis(1);
        Some(expiry.max(self.last_scan + self.retry_wait))
    }
}
