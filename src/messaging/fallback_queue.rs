//! # In-Process Fallback Queue
//!
//! Bounded in-memory queue used when the durable job store is unreachable.
//! High-priority items go to the head of the waiting list, everything else
//! is appended. When the list grows past capacity the oldest item of the
//! lowest priority present is evicted and counted.
//!
//! A single worker drains the list while items remain. It stops itself when
//! the list is empty and is restarted by the next enqueue. Failed items are
//! re-inserted at the head after a per-retry delay until the retry budget is
//! spent, then dropped and counted as permanently failed. Re-insertion is
//! subject to the same capacity limit as enqueue. Non-retryable errors are
//! dropped on the first failure.

use crate::config::FallbackQueueConfig;
use crate::constants::FALLBACK_ID_PREFIX;
use crate::error::DeliveryError;
use crate::messaging::{MessagingError, MessagingResult, Priority};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// One item held by the fallback queue
#[derive(Debug, Clone)]
pub struct QueueItem<P> {
    pub id: String,
    pub payload: P,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub correlation_id: String,
    enqueued: Instant,
    seq: u64,
}

impl<P> QueueItem<P> {
    fn age(&self) -> Duration {
        self.enqueued.elapsed()
    }
}

/// Processes items drained from a [`FallbackQueue`]
#[async_trait]
pub trait FallbackHandler<P>: Send + Sync + 'static {
    async fn handle(&self, item: &QueueItem<P>) -> Result<(), DeliveryError>;
}

/// Snapshot of the fallback queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackStats {
    pub total: usize,
    pub processing: bool,
    pub paused: bool,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub oldest_item_at: Option<DateTime<Utc>>,
    pub capacity: usize,
    pub max_retries: u32,
    pub evicted: u64,
    pub permanently_failed: u64,
    pub processed: u64,
    /// Failed items sleeping before re-insertion
    pub pending_retries: usize,
}

#[derive(Debug)]
struct FallbackState<P> {
    waiting: VecDeque<QueueItem<P>>,
    processing: bool,
    paused: bool,
    shut_down: bool,
    next_seq: u64,
    evicted: u64,
    permanently_failed: u64,
    processed: u64,
    pending_retries: usize,
}

impl<P> FallbackState<P> {
    fn new() -> Self {
        Self {
            waiting: VecDeque::new(),
            processing: false,
            paused: false,
            shut_down: false,
            next_seq: 0,
            evicted: 0,
            permanently_failed: 0,
            processed: 0,
            pending_retries: 0,
        }
    }

    /// Index of the oldest item among the lowest priority present
    fn eviction_candidate(&self) -> Option<usize> {
        self.waiting
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                a.priority
                    .rank()
                    .cmp(&b.priority.rank())
                    .then_with(|| b.seq.cmp(&a.seq))
            })
            .map(|(index, _)| index)
    }

    /// Evict until the waiting list fits `capacity`, returning how many went
    fn enforce_capacity(&mut self, capacity: usize, name: &str) -> usize {
        let mut removed = 0;
        while self.waiting.len() > capacity {
            let Some(index) = self.eviction_candidate() else {
                break;
            };
            if let Some(evicted) = self.waiting.remove(index) {
                self.evicted += 1;
                removed += 1;
                warn!(
                    queue = %name,
                    event = "fallback_queue_eviction",
                    item_id = %evicted.id,
                    priority = %evicted.priority,
                    capacity = capacity,
                    evicted_total = self.evicted,
                    "Fallback queue full, evicted oldest lowest-priority item"
                );
            }
        }
        removed
    }
}

struct FallbackInner<P> {
    name: String,
    config: FallbackQueueConfig,
    handler: Arc<dyn FallbackHandler<P>>,
    state: Mutex<FallbackState<P>>,
    shutdown: watch::Sender<bool>,
}

/// Bounded in-memory priority queue with its own retry scheduling
pub struct FallbackQueue<P> {
    inner: Arc<FallbackInner<P>>,
}

impl<P> Clone for FallbackQueue<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: Clone + Send + Sync + 'static> FallbackQueue<P> {
    pub fn new(
        name: impl Into<String>,
        config: FallbackQueueConfig,
        handler: Arc<dyn FallbackHandler<P>>,
    ) -> Self {
        let name = name.into();
        let (shutdown, _) = watch::channel(false);
        info!(
            queue = %name,
            capacity = config.capacity,
            max_retries = config.max_retries,
            "📦 Fallback queue initialized"
        );
        Self {
            inner: Arc::new(FallbackInner {
                name,
                config,
                handler,
                state: Mutex::new(FallbackState::new()),
                shutdown,
            }),
        }
    }

    /// Add an item and start the worker if it is idle
    ///
    /// Returns the new item id. Fails only after [`FallbackQueue::shutdown`].
    pub fn enqueue(
        &self,
        payload: P,
        priority: Priority,
        correlation_id: Option<&str>,
    ) -> MessagingResult<String> {
        let inner = &self.inner;
        let id = new_item_id();

        {
            let mut state = inner.state.lock();
            if state.shut_down {
                return Err(MessagingError::lane_stopped(&inner.name));
            }

            let seq = state.next_seq;
            state.next_seq += 1;
            let item = QueueItem {
                id: id.clone(),
                payload,
                priority,
                created_at: Utc::now(),
                retry_count: 0,
                last_attempt_at: None,
                correlation_id: correlation_id
                    .map(str::to_string)
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
                enqueued: Instant::now(),
                seq,
            };

            if priority == Priority::High {
                state.waiting.push_front(item);
            } else {
                state.waiting.push_back(item);
            }

            state.enforce_capacity(inner.config.capacity, &inner.name);

            debug!(
                queue = %inner.name,
                item_id = %id,
                priority = %priority,
                waiting = state.waiting.len(),
                "Item added to fallback queue"
            );
        }

        FallbackInner::ensure_worker(inner);
        Ok(id)
    }

    /// Stop draining; items are still accepted
    pub fn pause(&self) {
        self.inner.state.lock().paused = true;
        info!(queue = %self.inner.name, "Fallback queue paused");
    }

    pub fn resume(&self) {
        self.inner.state.lock().paused = false;
        info!(queue = %self.inner.name, "Fallback queue resumed");
        FallbackInner::ensure_worker(&self.inner);
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> FallbackStats {
        let state = self.inner.state.lock();
        let count = |priority: Priority| {
            state
                .waiting
                .iter()
                .filter(|item| item.priority == priority)
                .count()
        };

        FallbackStats {
            total: state.waiting.len(),
            processing: state.processing,
            paused: state.paused,
            high: count(Priority::High),
            normal: count(Priority::Normal),
            low: count(Priority::Low),
            oldest_item_at: state.waiting.iter().map(|item| item.created_at).min(),
            capacity: self.inner.config.capacity,
            max_retries: self.inner.config.max_retries,
            evicted: state.evicted,
            permanently_failed: state.permanently_failed,
            processed: state.processed,
            pending_retries: state.pending_retries,
        }
    }

    /// Drop waiting items older than `max_age`
    pub fn cleanup_older_than(&self, max_age: Duration) -> usize {
        let mut state = self.inner.state.lock();
        let before = state.waiting.len();
        state.waiting.retain(|item| item.age() <= max_age);
        let removed = before - state.waiting.len();
        if removed > 0 {
            info!(queue = %self.inner.name, removed = removed, "Removed stale fallback queue items");
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<QueueItem<P>> {
        self.inner
            .state
            .lock()
            .waiting
            .iter()
            .find(|item| item.id == id)
            .cloned()
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut state = self.inner.state.lock();
        match state.waiting.iter().position(|item| item.id == id) {
            Some(index) => state.waiting.remove(index).is_some(),
            None => false,
        }
    }

    pub fn clear(&self) -> usize {
        let mut state = self.inner.state.lock();
        let removed = state.waiting.len();
        state.waiting.clear();
        info!(queue = %self.inner.name, removed = removed, "Fallback queue cleared");
        removed
    }

    /// Reject new items, cancel pending retries and drop waiting items
    pub fn shutdown(&self) -> usize {
        let dropped = {
            let mut state = self.inner.state.lock();
            state.shut_down = true;
            let dropped = state.waiting.len();
            state.waiting.clear();
            dropped
        };
        self.inner.shutdown.send_replace(true);
        info!(queue = %self.inner.name, dropped = dropped, "Fallback queue shut down");
        dropped
    }

    /// Accept items again after [`FallbackQueue::shutdown`]
    pub fn reopen(&self) {
        let was_shut_down = std::mem::replace(&mut self.inner.state.lock().shut_down, false);
        if was_shut_down {
            self.inner.shutdown.send_replace(false);
            info!(queue = %self.inner.name, "Fallback queue reopened");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.state.lock().shut_down
    }
}

impl<P: Clone + Send + Sync + 'static> FallbackInner<P> {
    fn ensure_worker(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.processing || state.paused || state.shut_down || state.waiting.is_empty() {
                return;
            }
            state.processing = true;
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.drain().await });
    }

    async fn drain(self: Arc<Self>) {
        debug!(queue = %self.name, "Fallback queue worker started");

        loop {
            let next = {
                let mut state = self.state.lock();
                let next = if state.paused || state.shut_down {
                    None
                } else {
                    state.waiting.pop_front()
                };
                if next.is_none() {
                    state.processing = false;
                }
                next
            };

            let Some(mut item) = next else {
                break;
            };

            item.last_attempt_at = Some(Utc::now());
            let result = AssertUnwindSafe(self.handler.handle(&item))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(DeliveryError::transient(self.name.clone(), "fallback handler panicked")));

            match result {
                Ok(()) => {
                    self.state.lock().processed += 1;
                    debug!(queue = %self.name, item_id = %item.id, "🟢 Fallback item processed");
                }
                Err(error) => self.handle_failure(item, error),
            }
        }

        debug!(queue = %self.name, "Fallback queue worker stopped");
    }

    fn handle_failure(self: &Arc<Self>, mut item: QueueItem<P>, error: DeliveryError) {
        if !error.is_retryable() {
            self.state.lock().permanently_failed += 1;
            error!(
                queue = %self.name,
                item_id = %item.id,
                correlation_id = %item.correlation_id,
                error_class = %error.class(),
                error = %error,
                "💀 Fallback item rejected with non-retryable error"
            );
            return;
        }

        if item.retry_count >= self.config.max_retries {
            self.state.lock().permanently_failed += 1;
            error!(
                queue = %self.name,
                item_id = %item.id,
                correlation_id = %item.correlation_id,
                retries = item.retry_count,
                error = %error,
                "💀 Fallback item permanently failed"
            );
            return;
        }

        item.retry_count += 1;
        let delay = self.config.retry_delay(item.retry_count);
        warn!(
            queue = %self.name,
            item_id = %item.id,
            retry = item.retry_count,
            max_retries = self.config.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Fallback item failed, retry scheduled"
        );

        self.state.lock().pending_retries += 1;
        let inner = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let cancelled = tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                _ = shutdown.wait_for(|stopped| *stopped) => true,
            };

            {
                let mut state = inner.state.lock();
                state.pending_retries = state.pending_retries.saturating_sub(1);
                if cancelled || state.shut_down {
                    return;
                }
                state.waiting.push_front(item);
                state.enforce_capacity(inner.config.capacity, &inner.name);
            }
            inner.ensure_worker();
        });
    }
}

fn new_item_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{FALLBACK_ID_PREFIX}{}_{}",
        Utc::now().timestamp_millis(),
        &suffix[..9]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<u32>>,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl FallbackHandler<u32> for RecordingHandler {
        async fn handle(&self, item: &QueueItem<u32>) -> Result<(), DeliveryError> {
            self.seen.lock().push(item.payload);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(DeliveryError::transient("engine", "unavailable"));
            }
            Ok(())
        }
    }

    fn queue_with(capacity: usize, handler: Arc<RecordingHandler>) -> FallbackQueue<u32> {
        let config = FallbackQueueConfig {
            capacity,
            ..FallbackQueueConfig::default()
        };
        FallbackQueue::new("test-fallback", config, handler)
    }

    #[tokio::test]
    async fn test_overflow_evicts_oldest_normal_item() {
        let queue = queue_with(1000, Arc::new(RecordingHandler::default()));
        queue.pause();

        let first = queue.enqueue(0, Priority::Normal, None).unwrap();
        for n in 1..=1000 {
            queue.enqueue(n, Priority::Normal, None).unwrap();
        }

        let stats = queue.stats();
        assert_eq!(stats.total, 1000);
        assert_eq!(stats.evicted, 1);
        assert!(queue.get(&first).is_none());
    }

    #[tokio::test]
    async fn test_eviction_prefers_lowest_priority() {
        let queue = queue_with(3, Arc::new(RecordingHandler::default()));
        queue.pause();

        queue.enqueue(1, Priority::High, None).unwrap();
        let low = queue.enqueue(2, Priority::Low, None).unwrap();
        queue.enqueue(3, Priority::Normal, None).unwrap();
        queue.enqueue(4, Priority::Normal, None).unwrap();

        assert!(queue.get(&low).is_none());
        let stats = queue.stats();
        assert_eq!((stats.high, stats.normal, stats.low), (1, 2, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_priority_goes_to_head() {
        let handler = Arc::new(RecordingHandler::default());
        let queue = queue_with(10, handler.clone());
        queue.pause();

        queue.enqueue(1, Priority::Normal, None).unwrap();
        queue.enqueue(2, Priority::Low, None).unwrap();
        queue.enqueue(3, Priority::High, None).unwrap();
        queue.resume();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*handler.seen.lock(), vec![3, 1, 2]);
        assert_eq!(queue.stats().processed, 3);
        assert!(!queue.stats().processing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_permanent_failure() {
        let handler = Arc::new(RecordingHandler {
            failures_left: AtomicU32::new(10),
            ..RecordingHandler::default()
        });
        let queue = queue_with(10, handler.clone());
        queue.enqueue(7, Priority::Normal, None).unwrap();

        // 1 attempt + retries after 1s, 2s and 4s
        tokio::time::sleep(Duration::from_millis(7_500)).await;
        assert_eq!(handler.seen.lock().len(), 4);

        let stats = queue.stats();
        assert_eq!(stats.permanently_failed, 1);
        assert_eq!(stats.total, 0);
        assert_eq!(stats.pending_retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_delay() {
        let handler = Arc::new(RecordingHandler {
            failures_left: AtomicU32::new(1),
            ..RecordingHandler::default()
        });
        let queue = queue_with(10, handler.clone());
        queue.enqueue(5, Priority::Low, None).unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(queue.stats().pending_retries, 1);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(*handler.seen.lock(), vec![5, 5]);
        assert_eq!(queue.stats().processed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_reinsertion_respects_capacity() {
        let handler = Arc::new(RecordingHandler {
            failures_left: AtomicU32::new(1),
            ..RecordingHandler::default()
        });
        let queue = queue_with(3, handler.clone());
        queue.enqueue(0, Priority::Normal, None).unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.stats().pending_retries, 1);

        queue.pause();
        for n in 1..=3 {
            queue.enqueue(n, Priority::Normal, None).unwrap();
        }
        assert_eq!(queue.stats().evicted, 0);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        let stats = queue.stats();
        assert_eq!(stats.pending_retries, 0);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.evicted, 1);
        assert_eq!(*handler.seen.lock(), vec![0]);
    }

    struct RejectingHandler {
        calls: AtomicU32,
    }

    #[async_trait]
    impl FallbackHandler<u32> for RejectingHandler {
        async fn handle(&self, _item: &QueueItem<u32>) -> Result<(), DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(DeliveryError::client_status(422, "invalid recipient"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_is_not_retried() {
        let handler = Arc::new(RejectingHandler {
            calls: AtomicU32::new(0),
        });
        let queue = FallbackQueue::new("test-fallback", FallbackQueueConfig::default(), handler.clone());
        queue.enqueue(9, Priority::Normal, None).unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        let stats = queue.stats();
        assert_eq!(stats.permanently_failed, 1);
        assert_eq!(stats.pending_retries, 0);
        assert_eq!(stats.total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_get_remove_clear() {
        let queue = queue_with(10, Arc::new(RecordingHandler::default()));
        queue.pause();

        let old = queue.enqueue(1, Priority::Normal, Some("corr-1")).unwrap();
        tokio::time::advance(Duration::from_secs(120)).await;
        let fresh = queue.enqueue(2, Priority::Normal, None).unwrap();

        assert_eq!(queue.get(&old).unwrap().correlation_id, "corr-1");
        assert_eq!(queue.cleanup_older_than(Duration::from_secs(60)), 1);
        assert!(queue.get(&old).is_none());

        assert!(queue.remove(&fresh));
        assert!(!queue.remove(&fresh));

        queue.enqueue(3, Priority::Normal, None).unwrap();
        assert_eq!(queue.clear(), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_items() {
        let queue = queue_with(10, Arc::new(RecordingHandler::default()));
        queue.pause();
        queue.enqueue(1, Priority::Normal, None).unwrap();

        assert_eq!(queue.shutdown(), 1);
        assert!(matches!(
            queue.enqueue(2, Priority::Normal, None),
            Err(MessagingError::LaneStopped { .. })
        ));

        queue.reopen();
        assert!(!queue.is_shut_down());
        assert!(queue.enqueue(3, Priority::Normal, None).is_ok());
    }

    #[test]
    fn test_item_id_format() {
        let id = new_item_id();
        assert!(id.starts_with(FALLBACK_ID_PREFIX));
        assert_eq!(id.split('_').count(), 3);
    }
}
