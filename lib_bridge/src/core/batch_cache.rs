//! # Batch Cache
//!
//! Collects many small outbound packages and emits them as fewer, larger
//! array-shaped messages, bounding both message count and latency.
//!
//! ```text
//! add() ──> [ A | B | bin | C ] ──flush──> bin            (published alone)
//!                                 └──────> "[A,B,C]"      (one slot, one frame)
//! ```
//!
//! A flush happens when the cache reaches `max_entries`, on every tick of the
//! background timer, or when `flush()` is called directly. Binary packages are
//! never concatenated. Text packages are merged per destination set, so a
//! merged message never reaches a session that only one of its parts was
//! meant for.
//!
//! The cache is emptied by every flush, whether or not each message found a
//! slot. Messages that time out waiting for a slot are dropped and counted.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::configs::bridge_config::BridgeConfig;
use crate::core::broadcaster::Broadcaster;
use crate::core::error::BroadcastError;
use crate::core::transport::SessionId;

const OPENING_BRACKET: u8 = b'[';
const CLOSING_BRACKET: u8 = b']';
const SEPARATOR: u8 = b',';

/// Anything that can take a finished payload to the viewers.
pub trait PayloadPublisher: Send + Sync + 'static {
    /// Gets a slot within `timeout`, copies `payload` into it and forwards it.
    fn publish_payload(
        &self,
        payload: Bytes,
        destinations: Vec<SessionId>,
        timeout: Duration,
        binary: bool,
    ) -> impl Future<Output = Result<(), BroadcastError>> + Send;
}

impl PayloadPublisher for Broadcaster {
    fn publish_payload(
        &self,
        payload: Bytes,
        destinations: Vec<SessionId>,
        timeout: Duration,
        binary: bool,
    ) -> impl Future<Output = Result<(), BroadcastError>> + Send {
        async move {
            let handle = self.acquire_timeout(timeout).await?;
            self.publish(handle, &payload, destinations, binary);
            Ok(())
        }
    }
}

/// One queued package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub payload: Bytes,
    /// Sorted, without duplicates. Empty means every session.
    pub destinations: Vec<SessionId>,
    pub binary: bool,
}

impl CacheEntry {
    pub fn new(payload: Bytes, mut destinations: Vec<SessionId>, binary: bool) -> Self {
        destinations.sort_unstable();
        destinations.dedup();
        Self {
            payload,
            destinations,
            binary,
        }
    }
}

/// Counters reported by [`BatchCache::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub cached: usize,
    pub flushes: u64,
    pub published: u64,
    pub dropped: u64,
    pub merge_failures: u64,
}

/// Exact size of `[p0,p1,...,pn]`.
pub fn merged_message_size<'a>(payloads: impl IntoIterator<Item = &'a Bytes>) -> usize {
    let mut size = 1; // opening bracket
    for payload in payloads {
        size += payload.len() + 1; // payload and its separator
    }
    // The closing bracket takes the place of the last separator; "[]" when
    // there is nothing to join.
    size.max(2)
}

/// Joins payloads into one JSON-array-shaped message in a buffer sized up
/// front.
pub fn merge_payloads(payloads: &[&Bytes]) -> Result<Bytes, BroadcastError> {
    let expected = merged_message_size(payloads.iter().copied());
    let mut merged = BytesMut::with_capacity(expected);

    merged.put_u8(OPENING_BRACKET);
    for payload in payloads {
        merged.extend_from_slice(payload);
        merged.put_u8(SEPARATOR);
    }
    if !payloads.is_empty() {
        merged.truncate(merged.len() - 1);
    }
    merged.put_u8(CLOSING_BRACKET);

    if merged.len() != expected {
        return Err(BroadcastError::MergeSizeMismatch {
            expected,
            actual: merged.len(),
        });
    }
    Ok(merged.freeze())
}

struct CacheShared<P> {
    publisher: Arc<P>,
    entries: tokio::sync::Mutex<VecDeque<CacheEntry>>,
    max_entries: AtomicUsize,
    flush_interval_ms: AtomicU64,
    flushing_enabled: AtomicBool,
    publish_timeout: Duration,
    flushes: AtomicU64,
    published: AtomicU64,
    dropped: AtomicU64,
    merge_failures: AtomicU64,
}

impl<P: PayloadPublisher> CacheShared<P> {
    /// Publishes one message. A slot timeout drops the message and is only
    /// counted; every other failure is returned.
    async fn publish_one(
        &self,
        payload: Bytes,
        destinations: Vec<SessionId>,
        timeout: Duration,
        binary: bool,
    ) -> Result<(), BroadcastError> {
        let size = payload.len();
        let targets = format!("{:?}", destinations);
        match self
            .publisher
            .publish_payload(payload, destinations, timeout, binary)
            .await
        {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                if matches!(e, BroadcastError::AcquireTimeout(_)) {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "Dropped message of {} bytes for sessions {}: {}",
                        size,
                        targets,
                        e
                    );
                }
                Err(e)
            }
        }
    }

    async fn flush(&self) -> Result<usize, BroadcastError> {
        let mut entries = self.entries.lock().await;
        if entries.is_empty() {
            return Ok(0);
        }
        self.flushes.fetch_add(1, Ordering::Relaxed);

        let mut batch: Vec<CacheEntry> = entries.drain(..).collect();
        let timeout = self.publish_timeout;
        let mut published = 0;
        let mut first_error = None;
        let mut record = |result: Result<(), BroadcastError>, published: &mut usize| match result {
            Ok(()) => *published += 1,
            Err(BroadcastError::AcquireTimeout(_)) => {}
            Err(e) => {
                first_error.get_or_insert(e);
            }
        };

        if batch.len() == 1 {
            let entry = batch.remove(0);
            let result = self
                .publish_one(entry.payload, entry.destinations, timeout, entry.binary)
                .await;
            record(result, &mut published);
        } else {
            let (binaries, texts): (Vec<_>, Vec<_>) = batch.into_iter().partition(|entry| entry.binary);

            for entry in binaries {
                let result = self
                    .publish_one(entry.payload, entry.destinations, timeout, true)
                    .await;
                record(result, &mut published);
            }

            for (destinations, group) in group_by_destinations(texts) {
                let payloads: Vec<&Bytes> = group.iter().map(|entry| &entry.payload).collect();
                match merge_payloads(&payloads) {
                    Ok(merged) => {
                        let result = self.publish_one(merged, destinations, timeout, false).await;
                        record(result, &mut published);
                    }
                    Err(e) => {
                        self.merge_failures.fetch_add(1, Ordering::Relaxed);
                        log::error!(
                            "Issue with sending cache of {} entries, first message: {}: {}",
                            group.len(),
                            String::from_utf8_lossy(&group[0].payload),
                            e
                        );
                        record(Err(e), &mut published);
                    }
                }
            }
        }
        drop(entries);

        match first_error {
            Some(e) => Err(e),
            None => Ok(published),
        }
    }
}

/// Splits text entries by destination set, in order of first appearance.
fn group_by_destinations(entries: Vec<CacheEntry>) -> Vec<(Vec<SessionId>, Vec<CacheEntry>)> {
    let mut groups: Vec<(Vec<SessionId>, Vec<CacheEntry>)> = Vec::new();
    for entry in entries {
        match groups.iter_mut().find(|(destinations, _)| *destinations == entry.destinations) {
            Some((_, group)) => group.push(entry),
            None => groups.push((entry.destinations.clone(), vec![entry])),
        }
    }
    groups
}

async fn flush_loop<P: PayloadPublisher>(shared: Arc<CacheShared<P>>, shutdown: CancellationToken) {
    loop {
        let interval = Duration::from_millis(shared.flush_interval_ms.load(Ordering::Relaxed));
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {
                if shared.flushing_enabled.load(Ordering::Relaxed) {
                    if let Err(e) = shared.flush().await {
                        log::error!("Periodic cache flush failed: {}", e);
                    }
                }
            }
        }
    }
    log::debug!("Cache flush loop stopped.");
}

/// # Batch Cache
///
/// Sits in front of a [`PayloadPublisher`] (normally the [`Broadcaster`])
/// and batches text packages. Owns a background flush task for its lifetime.
pub struct BatchCache<P: PayloadPublisher = Broadcaster> {
    shared: Arc<CacheShared<P>>,
    shutdown: CancellationToken,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl<P: PayloadPublisher> BatchCache<P> {
    /// Creates the cache and starts its flush timer. Must be called from
    /// within a tokio runtime.
    pub fn new(publisher: Arc<P>, config: &BridgeConfig) -> Result<Self, BroadcastError> {
        config.validate()?;

        let shared = Arc::new(CacheShared {
            publisher,
            entries: tokio::sync::Mutex::new(VecDeque::with_capacity(config.cache_max_entries)),
            max_entries: AtomicUsize::new(config.cache_max_entries),
            flush_interval_ms: AtomicU64::new(config.cache_flush_interval_ms),
            flushing_enabled: AtomicBool::new(config.cache_flush_enabled),
            publish_timeout: config.cache_publish_timeout(),
            flushes: AtomicU64::new(0),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            merge_failures: AtomicU64::new(0),
        });
        let shutdown = CancellationToken::new();
        let flush_task = tokio::spawn(flush_loop(Arc::clone(&shared), shutdown.clone()));

        Ok(Self {
            shared,
            shutdown,
            flush_task: Mutex::new(Some(flush_task)),
        })
    }

    /// Queues a package, or publishes it at once when `force_immediate` is
    /// set. Reaching `max_entries` flushes before returning.
    ///
    /// `timeout` bounds the slot wait of an immediate publish.
    pub async fn add(
        &self,
        payload: impl Into<Bytes>,
        destinations: Vec<SessionId>,
        binary: bool,
        force_immediate: bool,
        timeout: Duration,
    ) -> Result<(), BroadcastError> {
        let payload = payload.into();
        if force_immediate {
            return self
                .shared
                .publish_one(payload, destinations, timeout, binary)
                .await;
        }

        let cached = {
            let mut entries = self.shared.entries.lock().await;
            entries.push_back(CacheEntry::new(payload, destinations, binary));
            entries.len()
        };

        if cached >= self.max_entries() {
            self.flush().await?;
        }
        Ok(())
    }

    /// Publishes everything cached and empties the cache. Returns the number
    /// of messages handed to the publisher.
    pub async fn flush(&self) -> Result<usize, BroadcastError> {
        self.shared.flush().await
    }

    pub fn set_max_entries(&self, max_entries: usize) {
        self.shared.max_entries.store(max_entries.max(1), Ordering::Relaxed);
    }

    pub fn max_entries(&self) -> usize {
        self.shared.max_entries.load(Ordering::Relaxed)
    }

    /// Takes effect from the next timer cycle.
    pub fn set_flush_interval_ms(&self, interval_ms: u64) {
        self.shared
            .flush_interval_ms
            .store(interval_ms.max(1), Ordering::Relaxed);
    }

    pub fn flush_interval_ms(&self) -> u64 {
        self.shared.flush_interval_ms.load(Ordering::Relaxed)
    }

    /// Turns the background timer's flushes on or off; the timer keeps
    /// running either way.
    pub fn set_flushing_enabled(&self, enabled: bool) {
        self.shared.flushing_enabled.store(enabled, Ordering::Relaxed);
    }

    pub async fn len(&self) -> usize {
        self.shared.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            cached: self.len().await,
            flushes: self.shared.flushes.load(Ordering::Relaxed),
            published: self.shared.published.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            merge_failures: self.shared.merge_failures.load(Ordering::Relaxed),
        }
    }

    /// Stops the flush timer and waits for it. Does not flush.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self
            .flush_task
            .lock()
            .expect("Cache flush task lock poisoned")
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::error!("Cache flush loop ended abnormally: {}", e);
            }
        }
    }
}

impl<P: PayloadPublisher> Drop for BatchCache<P> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(500);

    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<(String, Vec<SessionId>, bool)>>,
        time_out: AtomicBool,
    }

    impl RecordingPublisher {
        fn messages(&self) -> Vec<String> {
            self.published
                .lock()
                .unwrap()
                .iter()
                .map(|(payload, _, _)| payload.clone())
                .collect()
        }
    }

    impl PayloadPublisher for RecordingPublisher {
        fn publish_payload(
            &self,
            payload: Bytes,
            destinations: Vec<SessionId>,
            timeout: Duration,
            binary: bool,
        ) -> impl Future<Output = Result<(), BroadcastError>> + Send {
            async move {
                if self.time_out.load(Ordering::SeqCst) {
                    return Err(BroadcastError::AcquireTimeout(timeout.as_millis() as u64));
                }
                let text = String::from_utf8_lossy(&payload).into_owned();
                self.published.lock().unwrap().push((text, destinations, binary));
                Ok(())
            }
        }
    }

    fn cache(max_entries: usize) -> (BatchCache<RecordingPublisher>, Arc<RecordingPublisher>) {
        let publisher = Arc::new(RecordingPublisher::default());
        let config = BridgeConfig {
            cache_max_entries: max_entries,
            cache_flush_enabled: false,
            ..Default::default()
        };
        let cache = BatchCache::new(Arc::clone(&publisher), &config).expect("valid config");
        (cache, publisher)
    }

    #[tokio::test]
    async fn test_set_flush_interval() {
        let (cache, _) = cache(100);
        cache.set_flush_interval_ms(12345);
        assert_eq!(cache.flush_interval_ms(), 12345);
    }

    #[tokio::test]
    async fn test_add_keeps_package_cached() {
        let (cache, publisher) = cache(100);
        cache.add("Hello World!", vec![], false, false, TIMEOUT).await.unwrap();

        assert_eq!(cache.len().await, 1);
        assert!(publisher.messages().is_empty());
    }

    #[tokio::test]
    async fn test_two_packages_reach_threshold_and_merge() {
        let (cache, publisher) = cache(2);
        cache.add("A", vec![], false, false, TIMEOUT).await.unwrap();
        cache.add("B", vec![], false, false, TIMEOUT).await.unwrap();

        assert_eq!(publisher.messages(), vec!["[A,B]".to_string()]);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_threshold_flushes_leave_remainder_cached() {
        let (cache, publisher) = cache(100);
        let package = "Hello World!";
        let stitched = format!("[{}]", vec![package; 100].join(","));

        for _ in 0..101 {
            cache.add(package, vec![], false, false, TIMEOUT).await.unwrap();
        }

        assert_eq!(cache.len().await, 1);
        assert_eq!(publisher.messages(), vec![stitched]);
    }

    #[tokio::test]
    async fn test_single_entry_is_published_unwrapped() {
        let (cache, publisher) = cache(100);
        cache.add("{\"x\":1}", vec![4], false, false, TIMEOUT).await.unwrap();
        assert_eq!(cache.flush().await.unwrap(), 1);

        let published = publisher.published.lock().unwrap().clone();
        assert_eq!(published, vec![("{\"x\":1}".to_string(), vec![4], false)]);
    }

    #[tokio::test]
    async fn test_force_immediate_bypasses_queue() {
        let (cache, publisher) = cache(100);
        cache.add("A", vec![], false, false, TIMEOUT).await.unwrap();
        cache.add("X", vec![], false, true, TIMEOUT).await.unwrap();

        assert_eq!(publisher.messages(), vec!["X".to_string()]);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_binary_entries_are_never_concatenated() {
        let (cache, publisher) = cache(100);
        cache.add("A", vec![], false, false, TIMEOUT).await.unwrap();
        cache.add("B", vec![], true, false, TIMEOUT).await.unwrap();
        cache.add("C", vec![], false, false, TIMEOUT).await.unwrap();
        assert_eq!(cache.flush().await.unwrap(), 2);

        let published = publisher.published.lock().unwrap().clone();
        assert_eq!(
            published,
            vec![
                ("B".to_string(), vec![], true),
                ("[A,C]".to_string(), vec![], false),
            ]
        );
    }

    #[tokio::test]
    async fn test_text_entries_merge_per_destination_set() {
        let (cache, publisher) = cache(100);
        cache.add("A", vec![1], false, false, TIMEOUT).await.unwrap();
        cache.add("B", vec![2], false, false, TIMEOUT).await.unwrap();
        cache.add("C", vec![1, 1], false, false, TIMEOUT).await.unwrap();
        cache.flush().await.unwrap();

        let published = publisher.published.lock().unwrap().clone();
        assert_eq!(
            published,
            vec![
                ("[A,C]".to_string(), vec![1], false),
                ("[B]".to_string(), vec![2], false),
            ]
        );
    }

    #[tokio::test]
    async fn test_timed_out_messages_are_dropped_and_counted() {
        let (cache, publisher) = cache(100);
        publisher.time_out.store(true, Ordering::SeqCst);
        cache.add("A", vec![], false, false, TIMEOUT).await.unwrap();
        cache.add("B", vec![], false, false, TIMEOUT).await.unwrap();

        assert_eq!(cache.flush().await.unwrap(), 0);
        let stats = cache.stats().await;
        assert_eq!(stats.cached, 0);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.flushes, 1);
    }

    #[tokio::test]
    async fn test_immediate_timeout_is_reported_to_caller() {
        let (cache, publisher) = cache(100);
        publisher.time_out.store(true, Ordering::SeqCst);
        let result = cache.add("X", vec![], false, true, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(BroadcastError::AcquireTimeout(20))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flushes_when_enabled() {
        let (cache, publisher) = cache(100);
        cache.set_flush_interval_ms(200);
        cache.add("A", vec![], false, false, TIMEOUT).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(publisher.messages().is_empty(), "timer must not flush while disabled");

        cache.set_flushing_enabled(true);
        tokio::time::sleep(Duration::from_millis(450)).await;
        assert_eq!(publisher.messages(), vec!["A".to_string()]);
    }

    #[test]
    fn test_merge_size_is_exact() {
        let parts = [Bytes::from_static(b"ab"), Bytes::from_static(b"c"), Bytes::from_static(b"")];
        let refs: Vec<&Bytes> = parts.iter().collect();

        let merged = merge_payloads(&refs).unwrap();
        assert_eq!(&merged[..], b"[ab,c,]");
        assert_eq!(merged.len(), merged_message_size(parts.iter()));
    }
}
