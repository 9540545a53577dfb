//! # Dead-Letter Retry Service
//!
//! Periodically re-attempts persisted failures. Each cycle fetches a bounded
//! batch of failed records still below the retry cap and processes them in
//! paced sub-batches. The retry counter is persisted before every attempt
//! so that a crash mid-attempt still counts toward the cap.

use crate::collaborators::StatusNotifier;
use crate::config::DeadLetterConfig;
use crate::constants::notifications;
use crate::dead_letter::{
    DeadLetterError, DeadLetterFilter, DeadLetterId, DeadLetterRecord, DeadLetterResult,
    DeadLetterStatus, DeadLetterStore,
};
use crate::error::DeliveryError;
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Re-invokes the original delivery for a dead-letter record
#[async_trait]
pub trait DeadLetterReplay: Send + Sync {
    /// Deliver the record's payload again, returning a transport id when there is one
    async fn replay(&self, record: &DeadLetterRecord) -> Result<Option<String>, DeliveryError>;
}

/// Outcome of one re-attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryResult {
    pub record_id: DeadLetterId,
    pub success: bool,
    pub delivery_id: Option<String>,
    pub error: Option<String>,
    /// Retry count after this attempt
    pub retry_count: u32,
    /// Whether the record reached the automatic retry cap without success
    pub exhausted: bool,
}

/// Summary of one retry cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub fetched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub exhausted: usize,
}

/// Aggregate dead-letter statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryStats {
    pub total_failed: usize,
    pub total_retried: usize,
    pub total_deleted: usize,
    /// Resolved records over resolved plus failed, 0.0 to 1.0
    pub success_rate: f64,
    /// Mean retry count across all records
    pub average_retries: f64,
    pub cycles_run: u64,
    pub attempts_made: u64,
}

pub struct DeadLetterRetryService {
    store: Arc<dyn DeadLetterStore>,
    replay: Arc<dyn DeadLetterReplay>,
    notifier: Arc<dyn StatusNotifier>,
    config: DeadLetterConfig,
    /// Held for the duration of a cycle so cycles never overlap
    cycle_lock: Mutex<()>,
    cycles_run: AtomicU64,
    attempts_made: AtomicU64,
}

impl std::fmt::Debug for DeadLetterRetryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterRetryService")
            .field("config", &self.config)
            .field("cycles_run", &self.cycles_run.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl DeadLetterRetryService {
    pub fn new(
        store: Arc<dyn DeadLetterStore>,
        replay: Arc<dyn DeadLetterReplay>,
        notifier: Arc<dyn StatusNotifier>,
        config: DeadLetterConfig,
    ) -> Self {
        Self {
            store,
            replay,
            notifier,
            config,
            cycle_lock: Mutex::new(()),
            cycles_run: AtomicU64::new(0),
            attempts_made: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &DeadLetterConfig {
        &self.config
    }

    /// Spawn the periodic loop; the first cycle runs immediately
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let interval = self.config.retry_interval();
        info!(
            interval_ms = interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            max_retries = self.config.max_retries,
            "🔁 Dead-letter retry service started"
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_cycle().await {
                            error!(error = %e, "Dead-letter retry cycle failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Dead-letter retry service stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Fetch one batch of eligible records and re-attempt them
    ///
    /// A cycle that starts while another is still running does nothing.
    pub async fn run_cycle(&self) -> DeadLetterResult<CycleReport> {
        let Ok(_running) = self.cycle_lock.try_lock() else {
            debug!("Dead-letter retry cycle already running, skipping");
            return Ok(CycleReport::default());
        };
        self.cycles_run.fetch_add(1, Ordering::Relaxed);

        let candidates = self
            .store
            .fetch(&DeadLetterFilter::retry_candidates(
                self.config.max_retries,
                self.config.batch_size,
            ))
            .await?;

        let mut report = CycleReport {
            fetched: candidates.len(),
            ..CycleReport::default()
        };
        if candidates.is_empty() {
            debug!("No dead-letter records eligible for retry");
            return Ok(report);
        }

        info!(count = candidates.len(), "🔁 Retrying dead-letter records");

        for (index, chunk) in candidates.chunks(self.config.concurrency.max(1)).enumerate() {
            if index > 0 {
                tokio::time::sleep(self.config.batch_pause()).await;
            }

            let results = join_all(chunk.iter().cloned().map(|record| self.attempt(record))).await;
            for result in results {
                if result.success {
                    report.succeeded += 1;
                } else {
                    report.failed += 1;
                    if result.exhausted {
                        report.exhausted += 1;
                    }
                }
            }
        }

        info!(
            fetched = report.fetched,
            succeeded = report.succeeded,
            failed = report.failed,
            exhausted = report.exhausted,
            "Dead-letter retry cycle complete"
        );
        Ok(report)
    }

    /// Operator-triggered re-attempt, not bound by the automatic cap
    pub async fn retry_by_id(&self, id: &DeadLetterId) -> DeadLetterResult<RetryResult> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| DeadLetterError::not_found(id))?;

        if record.status != DeadLetterStatus::Failed {
            return Err(DeadLetterError::NotRetryable {
                id: id.to_string(),
                status: record.status,
            });
        }

        info!(record_id = %id, retry_count = record.retry_count, "Manual dead-letter retry requested");
        Ok(self.attempt(record).await)
    }

    async fn attempt(&self, mut record: DeadLetterRecord) -> RetryResult {
        record.begin_retry();
        self.attempts_made.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self.store.update(&record).await {
            error!(
                record_id = %record.id,
                error = %e,
                "Could not persist retry count, skipping attempt"
            );
            return RetryResult {
                record_id: record.id,
                success: false,
                delivery_id: None,
                error: Some(e.to_string()),
                retry_count: record.retry_count - 1,
                exhausted: false,
            };
        }

        match self.replay.replay(&record).await {
            Ok(delivery_id) => {
                record.mark_resolved(delivery_id.clone());
                if let Err(e) = self.store.update(&record).await {
                    error!(record_id = %record.id, error = %e, "Could not mark dead-letter record resolved");
                }

                info!(
                    record_id = %record.id,
                    lane = %record.lane,
                    retry_count = record.retry_count,
                    delivery_id = ?delivery_id,
                    "✅ Dead-letter record re-delivered"
                );
                self.notifier.notify(
                    notifications::DEAD_LETTER_RESOLVED,
                    &json!({
                        "recordId": record.id.to_string(),
                        "lane": record.lane,
                        "deliveryId": delivery_id,
                    }),
                );

                RetryResult {
                    record_id: record.id,
                    success: true,
                    delivery_id,
                    error: None,
                    retry_count: record.retry_count,
                    exhausted: false,
                }
            }
            Err(err) => {
                record.record_failure(&err);
                if let Err(e) = self.store.update(&record).await {
                    error!(record_id = %record.id, error = %e, "Could not record dead-letter retry failure");
                }

                let exhausted = record.retry_count >= self.config.max_retries;
                if exhausted {
                    warn!(
                        record_id = %record.id,
                        lane = %record.lane,
                        retry_count = record.retry_count,
                        error = %err,
                        "💀 Dead-letter record permanently failed, left for manual action"
                    );
                } else {
                    warn!(
                        record_id = %record.id,
                        retry_count = record.retry_count,
                        error = %err,
                        "Dead-letter retry failed"
                    );
                }

                RetryResult {
                    record_id: record.id,
                    success: false,
                    delivery_id: None,
                    error: Some(err.to_string()),
                    retry_count: record.retry_count,
                    exhausted,
                }
            }
        }
    }

    /// Logically delete failed records whose last attempt is older than `max_age`
    pub async fn cleanup_older_than(&self, max_age: Duration) -> DeadLetterResult<usize> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| DeadLetterError::persistence("cleanup", e.to_string()))?;
        let cutoff = Utc::now() - max_age;
        let removed = self.store.purge_older_than(cutoff).await?;
        if removed > 0 {
            info!(removed = removed, cutoff = %cutoff.to_rfc3339(), "🧹 Purged old dead-letter records");
        }
        Ok(removed)
    }

    /// Newest-first page of records in any status
    pub async fn list(&self, limit: usize, offset: usize) -> DeadLetterResult<Vec<DeadLetterRecord>> {
        self.store.fetch(&DeadLetterFilter::page(limit, offset)).await
    }

    /// Logically delete one record
    pub async fn discard(&self, id: &DeadLetterId) -> DeadLetterResult<()> {
        let mut record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| DeadLetterError::not_found(id))?;
        record.mark_deleted();
        self.store.update(&record).await
    }

    /// Logically delete every record still in failed status
    pub async fn discard_all_failed(&self) -> DeadLetterResult<usize> {
        let filter = DeadLetterFilter {
            status: Some(DeadLetterStatus::Failed),
            limit: usize::MAX,
            ..DeadLetterFilter::default()
        };
        let failed = self.store.fetch(&filter).await?;
        let count = failed.len();
        for mut record in failed {
            record.mark_deleted();
            self.store.update(&record).await?;
        }
        info!(count = count, "Discarded all failed dead-letter records");
        Ok(count)
    }

    pub async fn stats(&self) -> DeadLetterResult<RetryStats> {
        let counts = self.store.counts().await?;
        let decided = counts.failed + counts.retried;
        let success_rate = if decided == 0 {
            0.0
        } else {
            counts.retried as f64 / decided as f64
        };
        let average_retries = if counts.total() == 0 {
            0.0
        } else {
            counts.total_retries as f64 / counts.total() as f64
        };

        Ok(RetryStats {
            total_failed: counts.failed,
            total_retried: counts.retried,
            total_deleted: counts.deleted,
            success_rate,
            average_retries,
            cycles_run: self.cycles_run.load(Ordering::Relaxed),
            attempts_made: self.attempts_made.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::NoopNotifier;
    use crate::dead_letter::InMemoryDeadLetterStore;
    use crate::messaging::{JobEnvelope, Priority, QueuedJob};
    use parking_lot::Mutex as SyncMutex;
    use std::collections::HashSet;

    /// Replay that fails for ids in `failing` and records call order
    #[derive(Default)]
    struct ScriptedReplay {
        failing: SyncMutex<HashSet<DeadLetterId>>,
        calls: SyncMutex<Vec<(DeadLetterId, u32)>>,
    }

    #[async_trait]
    impl DeadLetterReplay for ScriptedReplay {
        async fn replay(&self, record: &DeadLetterRecord) -> Result<Option<String>, DeliveryError> {
            self.calls.lock().push((record.id, record.retry_count));
            if self.failing.lock().contains(&record.id) {
                Err(DeliveryError::transient("whatsapp", "still down"))
            } else {
                Ok(Some(format!("wamid.{}", record.id)))
            }
        }
    }

    fn record() -> DeadLetterRecord {
        let envelope = JobEnvelope::wrap("send_message", &serde_json::json!({})).unwrap();
        let mut job = QueuedJob::new("message", envelope, Priority::Normal, 5);
        job.begin_attempt();
        DeadLetterRecord::from_job(&job, &DeliveryError::transient("whatsapp", "down"))
    }

    fn service(
        store: Arc<InMemoryDeadLetterStore>,
        replay: Arc<ScriptedReplay>,
        config: DeadLetterConfig,
    ) -> DeadLetterRetryService {
        DeadLetterRetryService::new(store, replay, Arc::new(NoopNotifier), config)
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_resolves_and_increments_first() {
        let store = Arc::new(InMemoryDeadLetterStore::new());
        let replay = Arc::new(ScriptedReplay::default());
        let ok = record();
        let bad = record();
        replay.failing.lock().insert(bad.id);
        store.persist(ok.clone()).await.unwrap();
        store.persist(bad.clone()).await.unwrap();

        let svc = service(store.clone(), replay.clone(), DeadLetterConfig::default());
        let report = svc.run_cycle().await.unwrap();
        assert_eq!(report.fetched, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);

        // replay saw the already-incremented counter
        assert!(replay.calls.lock().iter().all(|(_, count)| *count == 1));

        let ok = store.get(&ok.id).await.unwrap().unwrap();
        assert_eq!(ok.status, DeadLetterStatus::Retried);
        assert!(ok.delivery_id.is_some());
        let bad = store.get(&bad.id).await.unwrap().unwrap();
        assert_eq!(bad.status, DeadLetterStatus::Failed);
        assert_eq!(bad.retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cap_stops_automatic_attempts() {
        let store = Arc::new(InMemoryDeadLetterStore::new());
        let replay = Arc::new(ScriptedReplay::default());
        let stuck = record();
        replay.failing.lock().insert(stuck.id);
        store.persist(stuck.clone()).await.unwrap();

        let svc = service(store.clone(), replay.clone(), DeadLetterConfig::default());
        for _ in 0..3 {
            svc.run_cycle().await.unwrap();
        }
        let report = svc.run_cycle().await.unwrap();
        assert_eq!(report.fetched, 0);
        assert_eq!(replay.calls.lock().len(), 3);

        let stuck_now = store.get(&stuck.id).await.unwrap().unwrap();
        assert_eq!(stuck_now.retry_count, 3);
        assert_eq!(stuck_now.status, DeadLetterStatus::Failed);

        // operators can still retry past the cap
        replay.failing.lock().clear();
        let result = svc.retry_by_id(&stuck.id).await.unwrap();
        assert!(result.success);
        assert_eq!(result.retry_count, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sub_batches_are_paced() {
        let store = Arc::new(InMemoryDeadLetterStore::new());
        let replay = Arc::new(ScriptedReplay::default());
        for _ in 0..6 {
            store.persist(record()).await.unwrap();
        }

        let config = DeadLetterConfig {
            concurrency: 2,
            batch_pause_ms: 1_000,
            ..DeadLetterConfig::default()
        };
        let svc = service(store, replay, config);

        let started = tokio::time::Instant::now();
        let report = svc.run_cycle().await.unwrap();
        assert_eq!(report.succeeded, 6);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_size_bounds_cycle() {
        let store = Arc::new(InMemoryDeadLetterStore::new());
        let replay = Arc::new(ScriptedReplay::default());
        for _ in 0..15 {
            store.persist(record()).await.unwrap();
        }

        let svc = service(store, replay, DeadLetterConfig::default());
        assert_eq!(svc.run_cycle().await.unwrap().fetched, 10);
        assert_eq!(svc.run_cycle().await.unwrap().fetched, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_retry_errors() {
        let store = Arc::new(InMemoryDeadLetterStore::new());
        let svc = service(store.clone(), Arc::new(ScriptedReplay::default()), DeadLetterConfig::default());

        let missing = svc.retry_by_id(&DeadLetterId::new()).await;
        assert!(matches!(missing, Err(DeadLetterError::NotFound { .. })));

        let r = record();
        store.persist(r.clone()).await.unwrap();
        svc.discard(&r.id).await.unwrap();
        let deleted = svc.retry_by_id(&r.id).await;
        assert!(matches!(
            deleted,
            Err(DeadLetterError::NotRetryable {
                status: DeadLetterStatus::Deleted,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_and_cleanup() {
        let store = Arc::new(InMemoryDeadLetterStore::new());
        let replay = Arc::new(ScriptedReplay::default());
        let mut old = record();
        old.last_attempt_at = Utc::now() - chrono::Duration::hours(30);
        store.persist(old).await.unwrap();
        store.persist(record()).await.unwrap();

        let svc = service(store.clone(), replay, DeadLetterConfig::default());
        let stats = svc.stats().await.unwrap();
        assert_eq!(stats.total_failed, 2);
        assert_eq!(stats.success_rate, 0.0);

        let removed = svc.cleanup_older_than(Duration::from_secs(24 * 3600)).await.unwrap();
        assert_eq!(removed, 1);

        svc.run_cycle().await.unwrap();
        let stats = svc.stats().await.unwrap();
        assert_eq!(stats.total_retried, 1);
        assert_eq!(stats.total_deleted, 1);
        assert_eq!(stats.success_rate, 1.0);
        assert_eq!(stats.average_retries, 0.5);

        let listed = svc.list(10, 0).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().any(|r| r.status == DeadLetterStatus::Deleted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_discard_all_failed() {
        let store = Arc::new(InMemoryDeadLetterStore::new());
        for _ in 0..3 {
            store.persist(record()).await.unwrap();
        }
        let svc = service(store.clone(), Arc::new(ScriptedReplay::default()), DeadLetterConfig::default());

        assert_eq!(svc.discard_all_failed().await.unwrap(), 3);
        assert_eq!(svc.run_cycle().await.unwrap().fetched, 0);
        assert_eq!(store.counts().await.unwrap().deleted, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_runs_immediately_and_stops() {
        let store = Arc::new(InMemoryDeadLetterStore::new());
        let replay = Arc::new(ScriptedReplay::default());
        store.persist(record()).await.unwrap();
        let svc = Arc::new(service(store.clone(), replay.clone(), DeadLetterConfig::default()));

        let (tx, rx) = watch::channel(false);
        let handle = Arc::clone(&svc).start(rx);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(replay.calls.lock().len(), 1);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
