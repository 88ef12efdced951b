//! # Slot Pool
//!
//! A fixed-size circular table of reusable byte buffers. The pool is owned by
//! the broadcaster's worker task and never shared, so none of its methods
//! synchronise.
//!
//! ## Slot lifecycle
//!
//! - `FREE -> FILLING` when a lease is assigned to a waiting producer.
//! - `FILLING -> FREE` when the lease is released by its id.
//! - `FILLING -> FREE` when the lease is older than `max_lease` and the scan
//!   needs the slot. The holder's data is lost; this is logged as an error.
//!
//! Slots are created once and live as long as the pool.

use std::collections::HashMap;
use std::time::Duration;

use bytes::BytesMut;
use serde::Serialize;
use tokio::time::Instant;

/// Id of one lease. Monotonic for the lifetime of the pool.
pub type MessageId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SlotStatus {
    Free,
    Filling,
}

#[derive(Debug)]
struct Slot {
    id: MessageId,
    status: SlotStatus,
    acquired_at: Option<Instant>,
    /// `None` while the buffer is out with a lease holder.
    storage: Option<BytesMut>,
    leases: u64,
}

/// A slot handed out by the pool: its id, its table position and the buffer.
#[derive(Debug)]
pub struct Lease {
    pub id: MessageId,
    pub index: usize,
    pub storage: BytesMut,
}

/// Per-slot view used by [`PoolSnapshot`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotInfo {
    pub index: usize,
    pub id: MessageId,
    pub status: SlotStatus,
    /// How many leases this slot has served so far.
    pub leases: u64,
}

/// Point-in-time copy of the pool bookkeeping.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSnapshot {
    pub slots: Vec<SlotInfo>,
    pub in_flight: usize,
    pub pending_requests: usize,
    pub next_id: MessageId,
    pub stale_reclaims: u64,
    pub unknown_releases: u64,
}

impl PoolSnapshot {
    /// Number of slots currently leased.
    pub fn filling(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.status == SlotStatus::Filling)
            .count()
    }
}

pub struct SlotPool {
    slots: Vec<Slot>,
    /// Lease id -> slot index, for completions that only carry an id.
    in_flight: HashMap<MessageId, usize>,
    /// Index of the last slot handed out.
    cursor: usize,
    next_id: MessageId,
    slot_size: usize,
    max_lease: Duration,
    stale_reclaims: u64,
    unknown_releases: u64,
}

impl SlotPool {
    pub fn new(capacity: usize, slot_size: usize, max_lease: Duration) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                id: 0,
                status: SlotStatus::Free,
                acquired_at: None,
                storage: Some(BytesMut::with_capacity(slot_size)),
                leases: 0,
            })
            .collect();

        Self {
            slots,
            in_flight: HashMap::with_capacity(capacity),
            // The first scan starts one past the cursor, i.e. at slot 0.
            cursor: capacity.saturating_sub(1),
            next_id: 0,
            slot_size,
            max_lease,
            stale_reclaims: 0,
            unknown_releases: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Walks the table once, starting one past the last slot handed out.
    ///
    /// A FREE slot is taken as is. A FILLING slot whose lease is older than
    /// `max_lease` is reclaimed first. Returns `None` when every slot holds a
    /// live lease.
    pub fn find_next_free_slot(&mut self, now: Instant) -> Option<usize> {
        let capacity = self.slots.len();
        for offset in 1..=capacity {
            let index = (self.cursor + offset) % capacity;
            match self.slots[index].status {
                SlotStatus::Free => {
                    self.cursor = index;
                    return Some(index);
                }
                SlotStatus::Filling => {
                    if self.is_stale(index, now) {
                        self.reclaim(index, now);
                        self.cursor = index;
                        return Some(index);
                    }
                }
            }
        }
        None
    }

    /// Leases the slot at `index` with the next id.
    pub fn assign(&mut self, index: usize, now: Instant) -> Lease {
        let id = self.next_id;
        self.next_id += 1;
        let slot_size = self.slot_size;

        let slot = &mut self.slots[index];
        slot.status = SlotStatus::Filling;
        slot.id = id;
        slot.acquired_at = Some(now);
        slot.leases += 1;

        let mut storage = slot
            .storage
            .take()
            .unwrap_or_else(|| BytesMut::with_capacity(slot_size));
        storage.clear();
        storage.reserve(slot_size);

        self.in_flight.insert(id, index);
        Lease { id, index, storage }
    }

    /// Undoes an assignment whose requester went away before receiving it.
    pub fn revert(&mut self, lease: Lease) {
        self.in_flight.remove(&lease.id);
        let slot = &mut self.slots[lease.index];
        if slot.id == lease.id && slot.status == SlotStatus::Filling {
            slot.status = SlotStatus::Free;
            slot.acquired_at = None;
            slot.leases = slot.leases.saturating_sub(1);
            slot.storage = Some(lease.storage);
        }
    }

    /// Frees the slot leased under `id`. Returns `false` for ids that are not
    /// in flight (already reclaimed, or released twice).
    pub fn release(&mut self, id: MessageId, storage: Option<BytesMut>) -> bool {
        let Some(index) = self.in_flight.remove(&id) else {
            self.unknown_releases += 1;
            log::debug!("Release for unknown message id {} ignored.", id);
            return false;
        };

        let slot = &mut self.slots[index];
        slot.status = SlotStatus::Free;
        slot.acquired_at = None;
        if let Some(mut storage) = storage {
            storage.clear();
            slot.storage = Some(storage);
        }
        true
    }

    /// Instant at which the oldest live lease turns stale.
    pub fn earliest_expiry(&self) -> Option<Instant> {
        self.slots
            .iter()
            .filter(|slot| slot.status == SlotStatus::Filling)
            .filter_map(|slot| slot.acquired_at)
            .min()
            .map(|acquired_at| acquired_at + self.max_lease)
    }

    pub fn has_free_slot(&self) -> bool {
        self.slots.iter().any(|slot| slot.status == SlotStatus::Free)
    }

    pub fn snapshot(&self, pending_requests: usize) -> PoolSnapshot {
        PoolSnapshot {
            slots: self
                .slots
                .iter()
                .enumerate()
                .map(|(index, slot)| SlotInfo {
                    index,
                    id: slot.id,
                    status: slot.status,
                    leases: slot.leases,
                })
                .collect(),
            in_flight: self.in_flight.len(),
            pending_requests,
            next_id: self.next_id,
            stale_reclaims: self.stale_reclaims,
            unknown_releases: self.unknown_releases,
        }
    }

    fn is_stale(&self, index: usize, now: Instant) -> bool {
        self.slots[index]
            .acquired_at
            .is_some_and(|acquired_at| now.saturating_duration_since(acquired_at) > self.max_lease)
    }

    fn reclaim(&mut self, index: usize, now: Instant) {
        let slot = &mut self.slots[index];
        let held_for = slot
            .acquired_at
            .map(|acquired_at| now.saturating_duration_since(acquired_at))
            .unwrap_or_default();

        log::error!(
            "Data loss due to memory slot override: slot {} (message id {}) held for {} ms, limit {} ms.",
            index,
            slot.id,
            held_for.as_millis(),
            self.max_lease.as_millis()
        );

        self.in_flight.remove(&slot.id);
        slot.status = SlotStatus::Free;
        slot.acquired_at = None;
        self.stale_reclaims += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::thread::{self, ThreadId};

    const LEASE: Duration = Duration::from_millis(2000);

    /// Records every log line with the thread that emitted it, so parallel
    /// tests can each look at their own.
    struct CaptureLogger;

    static CAPTURE_LOGGER: CaptureLogger = CaptureLogger;
    static CAPTURED: Mutex<Vec<(ThreadId, log::Level, String)>> = Mutex::new(Vec::new());

    impl log::Log for CaptureLogger {
        fn enabled(&self, _metadata: &log::Metadata<'_>) -> bool {
            true
        }

        fn log(&self, record: &log::Record<'_>) {
            let line = (thread::current().id(), record.level(), record.args().to_string());
            CAPTURED.lock().unwrap().push(line);
        }

        fn flush(&self) {}
    }

    fn capture_logs() {
        // Another test may have installed it already.
        let _ = log::set_logger(&CAPTURE_LOGGER);
        log::set_max_level(log::LevelFilter::Trace);
    }

    fn captured_errors() -> Vec<String> {
        let me = thread::current().id();
        CAPTURED
            .lock()
            .unwrap()
            .iter()
            .filter(|(thread, level, _)| *thread == me && *level == log::Level::Error)
            .map(|(_, _, line)| line.clone())
            .collect()
    }

    fn lease(pool: &mut SlotPool, now: Instant) -> Lease {
        let index = pool.find_next_free_slot(now).expect("free slot");
        pool.assign(index, now)
    }

    #[test]
    fn test_round_robin_starts_at_zero_and_wraps() {
        let mut pool = SlotPool::new(3, 16, LEASE);
        let now = Instant::now();

        let mut order = Vec::new();
        for _ in 0..3 {
            let held = lease(&mut pool, now);
            order.push(held.index);
            assert!(pool.release(held.id, Some(held.storage)));
        }
        // Slot 0 is free again but the scan continues past the last position.
        let index = pool.find_next_free_slot(now).expect("free slot");
        order.push(index);

        assert_eq!(order, vec![0, 1, 2, 0]);
    }

    #[test]
    fn test_ids_are_monotonic_across_reuse() {
        let mut pool = SlotPool::new(1, 16, LEASE);
        let now = Instant::now();
        for expected in 0..5 {
            let held = lease(&mut pool, now);
            assert_eq!(held.id, expected);
            pool.release(held.id, None);
        }
    }

    #[test]
    fn test_full_pool_has_no_free_slot_until_lease_is_stale() {
        let mut pool = SlotPool::new(2, 16, LEASE);
        let t0 = Instant::now();
        let first = lease(&mut pool, t0);
        let _second = lease(&mut pool, t0);

        assert_eq!(pool.find_next_free_slot(t0 + LEASE), None);
        assert_eq!(pool.earliest_expiry(), Some(t0 + LEASE));

        let later = t0 + LEASE + Duration::from_millis(1);
        assert_eq!(pool.find_next_free_slot(later), Some(first.index));
        let snapshot = pool.snapshot(0);
        assert_eq!(snapshot.stale_reclaims, 1);
        // The reclaimed lease is no longer tracked.
        assert!(!pool.release(first.id, None));
    }

    #[test]
    fn test_double_release_is_a_counted_no_op() {
        let mut pool = SlotPool::new(2, 16, LEASE);
        let now = Instant::now();
        let held = lease(&mut pool, now);

        assert!(pool.release(held.id, None));
        assert!(!pool.release(held.id, None));

        let snapshot = pool.snapshot(0);
        assert_eq!(snapshot.filling(), 0);
        assert_eq!(snapshot.in_flight, 0);
        assert_eq!(snapshot.unknown_releases, 1);
    }

    #[test]
    fn test_revert_returns_slot_without_consuming_a_lease_count() {
        let mut pool = SlotPool::new(1, 16, LEASE);
        let now = Instant::now();
        let held = lease(&mut pool, now);
        pool.revert(held);

        let snapshot = pool.snapshot(0);
        assert_eq!(snapshot.filling(), 0);
        assert_eq!(snapshot.slots[0].leases, 0);
        assert_eq!(snapshot.next_id, 1);
    }

    #[test]
    fn test_each_stale_reclaim_logs_one_error() {
        capture_logs();
        let mut pool = SlotPool::new(1, 16, LEASE);
        let start = Instant::now();
        let stale = lease(&mut pool, start);

        let later = start + LEASE + Duration::from_millis(1);
        let fresh = lease(&mut pool, later);
        assert_eq!(fresh.index, stale.index);
        // The new lease is not stale: another scan finds nothing and logs nothing.
        assert_eq!(pool.find_next_free_slot(later), None);
        assert!(!pool.release(stale.id, None));

        let errors = captured_errors();
        assert_eq!(errors.len(), 1, "{:?}", errors);
        assert!(errors[0].contains("Data loss due to memory slot override"));
        assert!(errors[0].contains(&format!("message id {}", stale.id)));
    }
}
