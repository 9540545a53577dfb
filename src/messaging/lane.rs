//! # Queue Lane
//!
//! One class of durable work (inbound webhooks or outbound messages) with
//! its own concurrency limit, retry budget and backoff.
//!
//! ## Processing
//!
//! The worker loop acquires a semaphore permit before claiming a job, so at
//! most `concurrency` jobs are ever in flight. Each claimed job runs on its
//! own task with a timeout and panic catching. Outcomes:
//!
//! - success: the job is marked completed
//! - retryable failure with budget left: rescheduled with exponential backoff
//! - anything else: marked failed, written to the dead-letter store and
//!   announced as a terminal failure

use crate::collaborators::StatusNotifier;
use crate::config::LaneConfig;
use crate::dead_letter::{DeadLetterId, DeadLetterRecord, DeadLetterStore};
use crate::error::DeliveryError;
use crate::logging::{log_error, log_queue_operation};
use crate::messaging::{JobEnvelope, JobId, JobStore, MessagingResult, Priority, QueuedJob};
use crate::resilience::BackoffPolicy;
use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Processes the typed payload of one lane
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    type Payload: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Envelope tag for this lane's jobs
    const KIND: &'static str;

    async fn handle(&self, payload: &Self::Payload, job: &QueuedJob) -> Result<(), DeliveryError>;

    /// Notification to publish when a job fails permanently
    ///
    /// `payload` is `None` when the stored envelope could not be decoded.
    fn failure_notification(
        &self,
        _payload: Option<&Self::Payload>,
        _error: &DeliveryError,
    ) -> Option<(&'static str, Value)> {
        None
    }
}

/// Lifecycle events published by a lane
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Enqueued {
        lane: String,
        job_id: JobId,
        priority: Priority,
    },
    Completed {
        lane: String,
        job_id: JobId,
        attempts: u32,
    },
    RetryScheduled {
        lane: String,
        job_id: JobId,
        attempt: u32,
        delay: Duration,
    },
    TerminalFailure {
        lane: String,
        job_id: JobId,
        attempts: u32,
        error: DeliveryError,
        dead_letter_id: Option<DeadLetterId>,
    },
}

/// Point-in-time lane statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneStats {
    pub lane: String,
    pub paused: bool,
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
    pub total: usize,
    pub concurrency: usize,
    /// Jobs completed since the lane was created
    pub completed_total: u64,
    /// Jobs dead-lettered since the lane was created
    pub failed_total: u64,
    /// Retries scheduled since the lane was created
    pub retries_total: u64,
}

struct LaneInner<H: JobHandler> {
    name: String,
    config: LaneConfig,
    policy: BackoffPolicy,
    store: Arc<dyn JobStore>,
    handler: Arc<H>,
    dead_letters: Arc<dyn DeadLetterStore>,
    notifier: Arc<dyn StatusNotifier>,
    semaphore: Arc<Semaphore>,
    paused: AtomicBool,
    wake: Notify,
    events: broadcast::Sender<QueueEvent>,
    completed_total: AtomicU64,
    failed_total: AtomicU64,
    retries_total: AtomicU64,
}

/// A durable, priority-ordered work lane with bounded concurrency
pub struct QueueLane<H: JobHandler> {
    inner: Arc<LaneInner<H>>,
}

impl<H: JobHandler> Clone for QueueLane<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: JobHandler> std::fmt::Debug for QueueLane<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueLane")
            .field("name", &self.inner.name)
            .field("concurrency", &self.inner.config.concurrency)
            .field("paused", &self.is_paused())
            .finish()
    }
}

impl<H: JobHandler> QueueLane<H> {
    pub fn new(
        name: impl Into<String>,
        config: LaneConfig,
        store: Arc<dyn JobStore>,
        handler: Arc<H>,
        dead_letters: Arc<dyn DeadLetterStore>,
        notifier: Arc<dyn StatusNotifier>,
    ) -> Self {
        let name = name.into();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        info!(
            lane = %name,
            concurrency = config.concurrency,
            max_attempts = config.max_attempts,
            backoff_base_ms = config.backoff_base_ms,
            "📦 Queue lane initialized"
        );

        Self {
            inner: Arc::new(LaneInner {
                policy: config.backoff_policy(),
                semaphore: Arc::new(Semaphore::new(config.concurrency)),
                name,
                config,
                store,
                handler,
                dead_letters,
                notifier,
                paused: AtomicBool::new(false),
                wake: Notify::new(),
                events,
                completed_total: AtomicU64::new(0),
                failed_total: AtomicU64::new(0),
                retries_total: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Store a job for this lane and wake the worker
    pub async fn enqueue(&self, payload: &H::Payload, priority: Priority) -> MessagingResult<JobId> {
        self.enqueue_with_correlation(payload, priority, None).await
    }

    /// Store a job, reusing a correlation id from the caller when given
    pub async fn enqueue_with_correlation(
        &self,
        payload: &H::Payload,
        priority: Priority,
        correlation_id: Option<&str>,
    ) -> MessagingResult<JobId> {
        let inner = &self.inner;
        let envelope = JobEnvelope::wrap(H::KIND, payload)?;
        let mut job = QueuedJob::new(&inner.name, envelope, priority, inner.config.max_attempts);
        if let Some(correlation_id) = correlation_id {
            job = job.with_correlation_id(correlation_id);
        }
        let job_id = job.id;

        inner.store.push(job).await?;
        inner.wake.notify_one();

        log_queue_operation("enqueue", &inner.name, Some(job_id.to_string().as_str()), "queued", None);
        let _ = inner.events.send(QueueEvent::Enqueued {
            lane: inner.name.clone(),
            job_id,
            priority,
        });
        Ok(job_id)
    }

    /// Stop claiming new jobs; in-flight jobs run to completion
    pub fn pause(&self) {
        if !self.inner.paused.swap(true, Ordering::SeqCst) {
            log_queue_operation("pause", &self.inner.name, None, "paused", None);
        }
    }

    pub fn resume(&self) {
        if self.inner.paused.swap(false, Ordering::SeqCst) {
            self.inner.wake.notify_one();
            log_queue_operation("resume", &self.inner.name, None, "resumed", None);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Drop every waiting and delayed job
    pub async fn clear(&self) -> MessagingResult<usize> {
        let removed = self.inner.store.clear(&self.inner.name).await?;
        log_queue_operation(
            "clear",
            &self.inner.name,
            None,
            "cleared",
            Some(format!("{removed} jobs removed").as_str()),
        );
        Ok(removed)
    }

    /// Drop finished job records older than `older_than`
    pub async fn purge_finished(&self, older_than: Duration) -> MessagingResult<usize> {
        let purged = self.inner.store.purge_finished(&self.inner.name, older_than).await?;
        if purged > 0 {
            debug!(lane = %self.inner.name, purged = purged, "Purged finished job records");
        }
        Ok(purged)
    }

    pub async fn stats(&self) -> MessagingResult<LaneStats> {
        let inner = &self.inner;
        let counts = inner.store.counts(&inner.name).await?;
        Ok(LaneStats {
            lane: inner.name.clone(),
            paused: self.is_paused(),
            waiting: counts.waiting,
            active: counts.active,
            completed: counts.completed,
            failed: counts.failed,
            delayed: counts.delayed,
            total: counts.total(),
            concurrency: inner.config.concurrency,
            completed_total: inner.completed_total.load(Ordering::Relaxed),
            failed_total: inner.failed_total.load(Ordering::Relaxed),
            retries_total: inner.retries_total.load(Ordering::Relaxed),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Spawn the worker loop; it exits when `shutdown` turns true
    pub fn spawn_worker(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { LaneInner::run(inner, shutdown).await })
    }
}

impl<H: JobHandler> LaneInner<H> {
    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(lane = %self.name, "Queue lane worker starting");

        loop {
            if *shutdown.borrow() {
                break;
            }

            if self.paused.load(Ordering::SeqCst) {
                if !self.idle(&mut shutdown).await {
                    break;
                }
                continue;
            }

            let permit = tokio::select! {
                permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        error!(lane = %self.name, "Lane semaphore closed, stopping worker");
                        break;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            match self.store.claim_next(&self.name).await {
                Ok(Some(job)) => {
                    let inner = Arc::clone(&self);
                    tokio::spawn(async move {
                        inner.process(job).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    if !self.idle(&mut shutdown).await {
                        break;
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(lane = %self.name, error = %e, "Failed to claim next job");
                    if !self.idle(&mut shutdown).await {
                        break;
                    }
                }
            }
        }

        info!(lane = %self.name, "Queue lane worker stopped");
    }

    /// Wait for new work, the poll interval or shutdown; false means stop
    async fn idle(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = self.wake.notified() => true,
            _ = tokio::time::sleep(self.config.poll_interval()) => true,
            changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
        }
    }

    async fn process(&self, mut job: QueuedJob) {
        let attempt = job.begin_attempt();
        let payload = job.envelope.unwrap_as::<H::Payload>(H::KIND);

        debug!(
            lane = %self.name,
            job_id = %job.id,
            correlation_id = %job.correlation_id,
            attempt = attempt,
            max_attempts = job.max_attempts,
            "Processing job"
        );

        let result = match &payload {
            Ok(payload) => self.invoke(payload, &job).await,
            Err(e) => Err(DeliveryError::client(format!("undecodable job payload: {e}"))),
        };

        match result {
            Ok(()) => {
                if let Err(e) = self.store.complete(&job).await {
                    error!(lane = %self.name, job_id = %job.id, error = %e, "Failed to mark job completed");
                }
                self.completed_total.fetch_add(1, Ordering::Relaxed);
                debug!(lane = %self.name, job_id = %job.id, attempt = attempt, "🟢 Job completed");
                let _ = self.events.send(QueueEvent::Completed {
                    lane: self.name.clone(),
                    job_id: job.id,
                    attempts: attempt,
                });
            }
            Err(error) if error.is_retryable() && self.policy.should_retry(attempt) => {
                let delay = self.policy.delay_for_attempt(attempt);
                warn!(
                    lane = %self.name,
                    job_id = %job.id,
                    attempt = attempt,
                    max_attempts = job.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Job failed, retry scheduled"
                );

                let job_id = job.id;
                match self.store.retry_later(job, delay).await {
                    Ok(()) => {
                        self.retries_total.fetch_add(1, Ordering::Relaxed);
                        let _ = self.events.send(QueueEvent::RetryScheduled {
                            lane: self.name.clone(),
                            job_id,
                            attempt,
                            delay,
                        });
                    }
                    Err(e) => {
                        error!(lane = %self.name, job_id = %job_id, error = %e, "Failed to schedule retry");
                    }
                }
            }
            Err(error) => {
                self.fail_permanently(job, error, payload.ok()).await;
            }
        }
    }

    async fn invoke(&self, payload: &H::Payload, job: &QueuedJob) -> Result<(), DeliveryError> {
        let timeout = self.config.handler_timeout();
        let call = AssertUnwindSafe(self.handler.handle(payload, job)).catch_unwind();

        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(_panic)) => Err(DeliveryError::transient(
                self.name.clone(),
                "job handler panicked",
            )),
            Err(_elapsed) => Err(DeliveryError::transient(
                self.name.clone(),
                format!("job handler timed out after {}ms", timeout.as_millis()),
            )),
        }
    }

    async fn fail_permanently(&self, job: QueuedJob, error: DeliveryError, payload: Option<H::Payload>) {
        let summary = if error.is_retryable() {
            DeliveryError::retry_exhausted(job.attempts, error.to_string())
        } else {
            error.clone()
        };

        if let Err(e) = self.store.fail(&job, &summary.to_string()).await {
            error!(lane = %self.name, job_id = %job.id, error = %e, "Failed to mark job failed");
        }

        let record = DeadLetterRecord::from_job(&job, &error);
        let record_id = record.id;
        let dead_letter_id = match self.dead_letters.persist(record).await {
            Ok(()) => Some(record_id),
            Err(e) => {
                log_error(
                    &self.name,
                    "persist_dead_letter",
                    &DeliveryError::from(e),
                    Some(job.id.to_string().as_str()),
                );
                None
            }
        };

        error!(
            lane = %self.name,
            job_id = %job.id,
            correlation_id = %job.correlation_id,
            attempts = job.attempts,
            error = %summary,
            dead_letter_id = ?dead_letter_id,
            "💀 Job permanently failed"
        );

        if self.config.notify_on_terminal_failure {
            if let Some((event, data)) = self.handler.failure_notification(payload.as_ref(), &error) {
                self.notifier.notify(event, &data);
            }
        }

        self.failed_total.fetch_add(1, Ordering::Relaxed);
        let _ = self.events.send(QueueEvent::TerminalFailure {
            lane: self.name.clone(),
            job_id: job.id,
            attempts: job.attempts,
            error,
            dead_letter_id,
        });
    }
}
