//! # Delivery Pipeline
//!
//! Wires the deduplication cache, circuit breakers, the two durable lanes,
//! the fallback queue and the dead-letter retry service into one facade.
//!
//! ## Lifecycle
//!
//! [`DeliveryPipeline::builder`] assembles the components without spawning
//! anything. [`DeliveryPipeline::start`] spawns the lane workers, the breaker
//! monitor, the dead-letter retry loop and the maintenance loop. All of them
//! stop when [`DeliveryPipeline::shutdown`] flips the shared watch channel.
//!
//! ## Flow
//!
//! ```text
//! submit_inbound ─▶ dedup ─▶ webhook lane ─▶ InboundEventHandler
//!                              │ store down
//!                              └──────────▶ fallback queue ─▶ InboundEventHandler
//!
//! submit_outbound ─▶ message lane ─▶ circuit breaker ─▶ OutboundTransport
//!
//! terminal failure ─▶ DeadLetterStore ◀─▶ DeadLetterRetryService
//! ```

use crate::collaborators::{
    ChatWebhookIdentifier, InboundEventHandler, InboundIdentifier, NoopNotifier,
    OutboundTransport, SendReceipt, StatusNotifier,
};
use crate::config::{ConfigurationError, PipelineConfig};
use crate::constants::{job_kinds, lanes, notifications};
use crate::dead_letter::{
    DeadLetterError, DeadLetterId, DeadLetterRecord, DeadLetterReplay, DeadLetterRetryService,
    DeadLetterStore, InMemoryDeadLetterStore, RetryResult, RetryStats,
};
use crate::error::DeliveryError;
use crate::messaging::{
    DeduplicationCache, FallbackHandler, FallbackQueue, FallbackStats, InMemoryJobStore,
    InboundEvent, JobHandler, JobId, JobStore, LaneStats, MessagingError, OutboundMessage,
    Priority, QueueEvent, QueueItem, QueueLane, QueuedJob, Submission,
};
use crate::resilience::{CircuitBreaker, CircuitBreakerManager, CircuitStats, CircuitStatsMap, HealthSummary};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Pipeline component not configured: {0}")]
    MissingComponent(&'static str),

    #[error("Unknown lane: {0}")]
    UnknownLane(String),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error(transparent)]
    DeadLetter(#[from] DeadLetterError),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Snapshot of every queue the pipeline owns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineQueueStats {
    pub webhook: LaneStats,
    pub message: LaneStats,
    pub fallback: FallbackStats,
    pub dedup_cache_size: usize,
}

/// Runs inbound events through the conversation engine
pub struct InboundJobHandler {
    handler: Arc<dyn InboundEventHandler>,
}

#[async_trait]
impl JobHandler for InboundJobHandler {
    type Payload = InboundEvent;
    const KIND: &'static str = job_kinds::WEBHOOK;

    async fn handle(&self, event: &InboundEvent, _job: &QueuedJob) -> Result<(), DeliveryError> {
        self.handler.handle_inbound_event(event).await
    }
}

#[async_trait]
impl FallbackHandler<InboundEvent> for InboundJobHandler {
    async fn handle(&self, item: &QueueItem<InboundEvent>) -> Result<(), DeliveryError> {
        self.handler.handle_inbound_event(&item.payload).await
    }
}

/// Sends outbound messages through the transport's circuit breaker
pub struct OutboundJobHandler {
    transport: Arc<dyn OutboundTransport>,
    breaker: Arc<CircuitBreaker>,
}

impl OutboundJobHandler {
    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, DeliveryError> {
        let transport = Arc::clone(&self.transport);
        self.breaker
            .call(|| async move { transport.send_outbound(&message.to, &message.content).await })
            .await
            .map_err(DeliveryError::from)
    }
}

#[async_trait]
impl JobHandler for OutboundJobHandler {
    type Payload = OutboundMessage;
    const KIND: &'static str = job_kinds::SEND_MESSAGE;

    async fn handle(&self, message: &OutboundMessage, job: &QueuedJob) -> Result<(), DeliveryError> {
        let receipt = self.send(message).await?;
        debug!(
            job_id = %job.id,
            to = %message.to,
            message_id = %receipt.message_id,
            "🟢 Outbound message sent"
        );
        Ok(())
    }

    fn failure_notification(
        &self,
        message: Option<&OutboundMessage>,
        error: &DeliveryError,
    ) -> Option<(&'static str, Value)> {
        let message = message?;
        Some((
            notifications::MESSAGE_FAILED,
            json!({
                "to": message.to,
                "clientId": message.client_id,
                "error": error.to_string(),
                "errorClass": error.class(),
            }),
        ))
    }
}

/// Re-delivers dead-letter records through the handler matching their kind
struct PipelineReplay {
    inbound: Arc<InboundJobHandler>,
    outbound: Arc<OutboundJobHandler>,
}

#[async_trait]
impl DeadLetterReplay for PipelineReplay {
    async fn replay(&self, record: &DeadLetterRecord) -> Result<Option<String>, DeliveryError> {
        let undecodable = |e: MessagingError| DeliveryError::client(format!("undecodable dead-letter payload: {e}"));

        match record.envelope.kind.as_str() {
            job_kinds::WEBHOOK => {
                let event: InboundEvent = record.envelope.unwrap_as(job_kinds::WEBHOOK).map_err(undecodable)?;
                self.inbound.handler.handle_inbound_event(&event).await?;
                Ok(None)
            }
            job_kinds::SEND_MESSAGE => {
                let message: OutboundMessage =
                    record.envelope.unwrap_as(job_kinds::SEND_MESSAGE).map_err(undecodable)?;
                let receipt = self.outbound.send(&message).await?;
                Ok(Some(receipt.message_id))
            }
            other => Err(DeadLetterError::UnknownKind {
                kind: other.to_string(),
            }
            .into()),
        }
    }
}

/// Assembles a [`DeliveryPipeline`]
pub struct PipelineBuilder {
    config: PipelineConfig,
    inbound_handler: Option<Arc<dyn InboundEventHandler>>,
    outbound_transport: Option<Arc<dyn OutboundTransport>>,
    identifier: Option<Arc<dyn InboundIdentifier>>,
    notifier: Option<Arc<dyn StatusNotifier>>,
    job_store: Option<Arc<dyn JobStore>>,
    dead_letter_store: Option<Arc<dyn DeadLetterStore>>,
}

impl std::fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("inbound_handler", &self.inbound_handler.as_ref().map(|_| "<InboundEventHandler>"))
            .field(
                "outbound_transport",
                &self.outbound_transport.as_ref().map(|_| "<OutboundTransport>"),
            )
            .field("job_store", &self.job_store.as_ref().map(|_| "<JobStore>"))
            .field(
                "dead_letter_store",
                &self.dead_letter_store.as_ref().map(|_| "<DeadLetterStore>"),
            )
            .finish()
    }
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            inbound_handler: None,
            outbound_transport: None,
            identifier: None,
            notifier: None,
            job_store: None,
            dead_letter_store: None,
        }
    }

    /// Conversation engine receiving inbound events (required)
    pub fn inbound_handler(mut self, handler: Arc<dyn InboundEventHandler>) -> Self {
        self.inbound_handler = Some(handler);
        self
    }

    /// Messaging transport for outbound sends (required)
    pub fn outbound_transport(mut self, transport: Arc<dyn OutboundTransport>) -> Self {
        self.outbound_transport = Some(transport);
        self
    }

    /// Defaults to [`ChatWebhookIdentifier`]
    pub fn identifier(mut self, identifier: Arc<dyn InboundIdentifier>) -> Self {
        self.identifier = Some(identifier);
        self
    }

    /// Defaults to [`NoopNotifier`]
    pub fn notifier(mut self, notifier: Arc<dyn StatusNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Defaults to an [`InMemoryJobStore`] with the configured retention
    pub fn job_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.job_store = Some(store);
        self
    }

    /// Defaults to an [`InMemoryDeadLetterStore`]
    pub fn dead_letter_store(mut self, store: Arc<dyn DeadLetterStore>) -> Self {
        self.dead_letter_store = Some(store);
        self
    }

    pub fn build(self) -> PipelineResult<DeliveryPipeline> {
        let config = self.config;
        config.validate()?;

        let inbound = self
            .inbound_handler
            .ok_or(PipelineError::MissingComponent("inbound_handler"))?;
        let transport = self
            .outbound_transport
            .ok_or(PipelineError::MissingComponent("outbound_transport"))?;
        let identifier = self
            .identifier
            .unwrap_or_else(|| Arc::new(ChatWebhookIdentifier));
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(NoopNotifier));
        let dead_letter_store = self
            .dead_letter_store
            .unwrap_or_else(|| Arc::new(InMemoryDeadLetterStore::new()));
        let job_store = self.job_store.unwrap_or_else(|| {
            let store = InMemoryJobStore::new();
            let webhook = &config.lanes.webhook;
            let message = &config.lanes.message;
            store.configure_retention(lanes::WEBHOOK, webhook.retain_completed, webhook.retain_failed);
            store.configure_retention(lanes::MESSAGE, message.retain_completed, message.retain_failed);
            Arc::new(store)
        });

        let circuit_breakers = Arc::new(CircuitBreakerManager::from_config(&config.circuit_breakers));
        let transport_breaker = circuit_breakers.get_circuit_breaker(&config.transport_component);

        let inbound_handler = Arc::new(InboundJobHandler { handler: inbound });
        let outbound_handler = Arc::new(OutboundJobHandler {
            transport,
            breaker: transport_breaker,
        });

        let webhook_lane = QueueLane::new(
            lanes::WEBHOOK,
            config.lanes.webhook.clone(),
            Arc::clone(&job_store),
            Arc::clone(&inbound_handler),
            Arc::clone(&dead_letter_store),
            Arc::clone(&notifier),
        );
        let message_lane = QueueLane::new(
            lanes::MESSAGE,
            config.lanes.message.clone(),
            Arc::clone(&job_store),
            Arc::clone(&outbound_handler),
            Arc::clone(&dead_letter_store),
            Arc::clone(&notifier),
        );

        let fallback = FallbackQueue::new(
            "inbound_fallback",
            config.fallback_queue.clone(),
            Arc::clone(&inbound_handler) as Arc<dyn FallbackHandler<InboundEvent>>,
        );

        let replay = Arc::new(PipelineReplay {
            inbound: inbound_handler,
            outbound: outbound_handler,
        });
        let dead_letters = Arc::new(DeadLetterRetryService::new(
            dead_letter_store,
            replay,
            notifier,
            config.dead_letter.clone(),
        ));

        let (shutdown, _) = watch::channel(false);

        info!(
            transport_component = %config.transport_component,
            webhook_concurrency = config.lanes.webhook.concurrency,
            message_concurrency = config.lanes.message.concurrency,
            fallback_enabled = config.fallback_queue.enabled,
            dead_letter_enabled = config.dead_letter.enabled,
            "✅ Delivery pipeline assembled"
        );

        Ok(DeliveryPipeline {
            dedup: Arc::new(DeduplicationCache::new(config.deduplication.ttl())),
            config,
            identifier,
            circuit_breakers,
            webhook_lane,
            message_lane,
            fallback,
            dead_letters,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }
}

/// The caller-facing delivery pipeline
pub struct DeliveryPipeline {
    config: PipelineConfig,
    dedup: Arc<DeduplicationCache>,
    identifier: Arc<dyn InboundIdentifier>,
    circuit_breakers: Arc<CircuitBreakerManager>,
    webhook_lane: QueueLane<InboundJobHandler>,
    message_lane: QueueLane<OutboundJobHandler>,
    fallback: FallbackQueue<InboundEvent>,
    dead_letters: Arc<DeadLetterRetryService>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl std::fmt::Debug for DeliveryPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryPipeline")
            .field("running", &self.is_running())
            .field("webhook_lane", &self.webhook_lane)
            .field("message_lane", &self.message_lane)
            .finish()
    }
}

enum LaneRef<'a> {
    Webhook(&'a QueueLane<InboundJobHandler>),
    Message(&'a QueueLane<OutboundJobHandler>),
}

impl DeliveryPipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn circuit_breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.circuit_breakers
    }

    pub fn dead_letter_service(&self) -> &Arc<DeadLetterRetryService> {
        &self.dead_letters
    }

    pub fn fallback_queue(&self) -> &FallbackQueue<InboundEvent> {
        &self.fallback
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn every background task; calling it again is a no-op
    ///
    /// A stopped pipeline can be started again. The fallback queue accepts
    /// items again once it restarts.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Delivery pipeline already running");
            return;
        }
        self.shutdown.send_replace(false);
        self.fallback.reopen();

        let mut tasks = Vec::with_capacity(5);
        tasks.push(self.webhook_lane.spawn_worker(self.shutdown.subscribe()));
        tasks.push(self.message_lane.spawn_worker(self.shutdown.subscribe()));
        tasks.push(Arc::clone(&self.circuit_breakers).spawn_monitor(self.shutdown.subscribe()));
        if self.config.dead_letter.enabled {
            tasks.push(Arc::clone(&self.dead_letters).start(self.shutdown.subscribe()));
        }

        let maintenance = Maintenance {
            config: self.config.clone(),
            dedup: Arc::clone(&self.dedup),
            webhook_lane: self.webhook_lane.clone(),
            message_lane: self.message_lane.clone(),
            fallback: self.fallback.clone(),
            dead_letters: Arc::clone(&self.dead_letters),
        };
        tasks.push(tokio::spawn(maintenance.run(self.shutdown.subscribe())));

        self.tasks.lock().extend(tasks);
        info!("🚀 Delivery pipeline started");
    }

    /// Signal every background task to stop and wait for them
    ///
    /// In-flight jobs already handed to a handler finish on their own tasks.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("🛑 Delivery pipeline shutdown requested");
        self.shutdown.send_replace(true);

        let dropped = self.fallback.shutdown();
        if dropped > 0 {
            warn!(dropped = dropped, "Fallback queue items dropped at shutdown");
        }

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Pipeline background task ended abnormally");
            }
        }
        info!("Delivery pipeline stopped");
    }

    /// Accept an inbound event payload at normal priority
    pub async fn submit_inbound(&self, payload: Value) -> PipelineResult<Submission> {
        self.submit_inbound_with_priority(payload, Priority::Normal).await
    }

    /// Accept an inbound event payload
    ///
    /// Duplicates within the deduplication window are acknowledged without
    /// queueing. When the durable store is unavailable the event goes to the
    /// fallback queue, if enabled.
    pub async fn submit_inbound_with_priority(
        &self,
        payload: Value,
        priority: Priority,
    ) -> PipelineResult<Submission> {
        let message_id = self.identifier.decode_inbound_identifier(&payload);

        if !self.dedup.should_process(message_id.as_deref()) {
            let id = message_id.unwrap_or_default();
            info!(message_id = %id, "Duplicate inbound event ignored");
            return Ok(Submission::Duplicate(id));
        }

        let event = InboundEvent::new(payload, message_id.clone());
        let request_id = event.request_id.clone();

        match self
            .webhook_lane
            .enqueue_with_correlation(&event, priority, Some(request_id.as_str()))
            .await
        {
            Ok(job_id) => Ok(Submission::Enqueued(job_id)),
            Err(e) if e.is_store_unavailable() && self.config.fallback_queue.enabled => {
                warn!(
                    request_id = %request_id,
                    error = %e,
                    "Durable store unavailable, routing inbound event to fallback queue"
                );
                match self.fallback.enqueue(event, priority, Some(request_id.as_str())) {
                    Ok(item_id) => Ok(Submission::Fallback(item_id)),
                    Err(fallback_error) => {
                        if let Some(id) = &message_id {
                            self.dedup.forget(id);
                        }
                        error!(
                            request_id = %request_id,
                            error = %fallback_error,
                            "Fallback queue rejected inbound event"
                        );
                        Err(fallback_error.into())
                    }
                }
            }
            Err(e) => {
                // Nothing was queued, so a redelivery by the provider must not be rejected
                if let Some(id) = &message_id {
                    self.dedup.forget(id);
                }
                error!(request_id = %request_id, error = %e, "Failed to enqueue inbound event");
                Err(e.into())
            }
        }
    }

    /// Queue an outbound message for the transport
    pub async fn submit_outbound(
        &self,
        to: impl Into<String>,
        content: impl Into<String>,
        priority: Priority,
    ) -> PipelineResult<JobId> {
        self.submit_outbound_message(OutboundMessage::new(to, content), priority)
            .await
    }

    pub async fn submit_outbound_message(
        &self,
        message: OutboundMessage,
        priority: Priority,
    ) -> PipelineResult<JobId> {
        Ok(self.message_lane.enqueue(&message, priority).await?)
    }

    pub async fn queue_stats(&self) -> PipelineResult<PipelineQueueStats> {
        Ok(PipelineQueueStats {
            webhook: self.webhook_lane.stats().await?,
            message: self.message_lane.stats().await?,
            fallback: self.fallback.stats(),
            dedup_cache_size: self.dedup.len(),
        })
    }

    pub fn circuit_stats(&self, name: &str) -> Option<CircuitStats> {
        self.circuit_breakers.stats(name)
    }

    pub fn all_circuit_stats(&self) -> CircuitStatsMap {
        self.circuit_breakers.all_stats()
    }

    pub fn circuit_health(&self) -> HealthSummary {
        self.circuit_breakers.health_summary()
    }

    fn lane(&self, name: &str) -> PipelineResult<LaneRef<'_>> {
        match name {
            lanes::WEBHOOK => Ok(LaneRef::Webhook(&self.webhook_lane)),
            lanes::MESSAGE => Ok(LaneRef::Message(&self.message_lane)),
            other => Err(PipelineError::UnknownLane(other.to_string())),
        }
    }

    pub fn pause(&self, lane: &str) -> PipelineResult<()> {
        match self.lane(lane)? {
            LaneRef::Webhook(lane) => lane.pause(),
            LaneRef::Message(lane) => lane.pause(),
        }
        Ok(())
    }

    pub fn resume(&self, lane: &str) -> PipelineResult<()> {
        match self.lane(lane)? {
            LaneRef::Webhook(lane) => lane.resume(),
            LaneRef::Message(lane) => lane.resume(),
        }
        Ok(())
    }

    /// Drop waiting and delayed jobs from a lane
    ///
    /// Clearing the webhook lane also empties the deduplication cache so the
    /// dropped events can be redelivered.
    pub async fn clear(&self, lane: &str) -> PipelineResult<usize> {
        let removed = match self.lane(lane)? {
            LaneRef::Webhook(lane) => {
                let removed = lane.clear().await?;
                self.dedup.clear();
                removed
            }
            LaneRef::Message(lane) => lane.clear().await?,
        };
        Ok(removed)
    }

    pub fn subscribe(&self, lane: &str) -> PipelineResult<broadcast::Receiver<QueueEvent>> {
        Ok(match self.lane(lane)? {
            LaneRef::Webhook(lane) => lane.subscribe(),
            LaneRef::Message(lane) => lane.subscribe(),
        })
    }

    /// Re-attempt one dead-letter record now, regardless of its retry count
    pub async fn retry_dead_letter(&self, id: &DeadLetterId) -> PipelineResult<RetryResult> {
        Ok(self.dead_letters.retry_by_id(id).await?)
    }

    pub async fn list_dead_letters(
        &self,
        limit: usize,
        offset: usize,
    ) -> PipelineResult<Vec<DeadLetterRecord>> {
        Ok(self.dead_letters.list(limit, offset).await?)
    }

    pub async fn purge_dead_letters(&self, older_than: Duration) -> PipelineResult<usize> {
        Ok(self.dead_letters.cleanup_older_than(older_than).await?)
    }

    pub async fn dead_letter_stats(&self) -> PipelineResult<RetryStats> {
        Ok(self.dead_letters.stats().await?)
    }
}

/// Periodic housekeeping: finished-job purge, dedup sweep, stale item cleanup and stats logging
struct Maintenance {
    config: PipelineConfig,
    dedup: Arc<DeduplicationCache>,
    webhook_lane: QueueLane<InboundJobHandler>,
    message_lane: QueueLane<OutboundJobHandler>,
    fallback: FallbackQueue<InboundEvent>,
    dead_letters: Arc<DeadLetterRetryService>,
}

impl Maintenance {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let maintenance = &self.config.maintenance;
        let mut cleanup = delayed_interval(maintenance.cleanup_interval());
        let mut stats = delayed_interval(maintenance.stats_log_interval());
        let mut sweep = delayed_interval(self.config.deduplication.sweep_interval());

        loop {
            tokio::select! {
                _ = cleanup.tick() => self.cleanup().await,
                _ = stats.tick() => self.log_stats().await,
                _ = sweep.tick() => {
                    let removed = self.dedup.sweep_expired();
                    if removed > 0 {
                        debug!(removed = removed, remaining = self.dedup.len(), "Swept expired dedup entries");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Pipeline maintenance loop stopping");
                        break;
                    }
                }
            }
        }
    }

    async fn cleanup(&self) {
        let retention = self.config.maintenance.finished_job_retention();
        for result in [
            self.webhook_lane.purge_finished(retention).await,
            self.message_lane.purge_finished(retention).await,
        ] {
            if let Err(e) = result {
                error!(error = %e, "Failed to purge finished jobs");
            }
        }

        self.fallback
            .cleanup_older_than(self.config.fallback_queue.max_item_age());

        if let Err(e) = self
            .dead_letters
            .cleanup_older_than(self.config.dead_letter.retention())
            .await
        {
            error!(error = %e, "Failed to purge old dead-letter records");
        }
    }

    async fn log_stats(&self) {
        match (self.webhook_lane.stats().await, self.message_lane.stats().await) {
            (Ok(webhook), Ok(message)) => {
                let fallback = self.fallback.stats();
                info!(
                    webhook_waiting = webhook.waiting,
                    webhook_active = webhook.active,
                    webhook_delayed = webhook.delayed,
                    webhook_failed = webhook.failed,
                    message_waiting = message.waiting,
                    message_active = message.active,
                    message_delayed = message.delayed,
                    message_failed = message.failed,
                    fallback_waiting = fallback.total,
                    fallback_evicted = fallback.evicted,
                    dedup_cache_size = self.dedup.len(),
                    "📊 Queue statistics"
                );
            }
            (Err(e), _) | (_, Err(e)) => warn!(error = %e, "Failed to collect queue statistics"),
        }
    }
}

fn delayed_interval(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dead_letter::DeadLetterStatus;
    use std::sync::atomic::AtomicUsize;

    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl InboundEventHandler for CountingHandler {
        async fn handle_inbound_event(&self, _event: &InboundEvent) -> Result<(), DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingTransport;

    #[async_trait]
    impl OutboundTransport for FailingTransport {
        async fn send_outbound(&self, _target: &str, _content: &str) -> Result<SendReceipt, DeliveryError> {
            Err(DeliveryError::client_status(400, "invalid recipient"))
        }
    }

    fn chat_payload(id: &str) -> Value {
        json!({"entry": [{"changes": [{"value": {"messages": [{"id": id}]}}]}]})
    }

    fn pipeline() -> (DeliveryPipeline, Arc<CountingHandler>) {
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
        });
        let pipeline = DeliveryPipeline::builder(PipelineConfig::default())
            .inbound_handler(handler.clone())
            .outbound_transport(Arc::new(FailingTransport))
            .build()
            .unwrap();
        (pipeline, handler)
    }

    #[test]
    fn test_build_requires_collaborators() {
        let result = DeliveryPipeline::builder(PipelineConfig::default()).build();
        assert!(matches!(
            result,
            Err(PipelineError::MissingComponent("inbound_handler"))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_submission_is_not_queued() {
        let (pipeline, _) = pipeline();

        let first = pipeline.submit_inbound(chat_payload("m1")).await.unwrap();
        assert!(matches!(first, Submission::Enqueued(_)));

        let second = pipeline.submit_inbound(chat_payload("m1")).await.unwrap();
        assert_eq!(second.to_string(), "duplicate_m1");

        let stats = pipeline.queue_stats().await.unwrap();
        assert_eq!(stats.webhook.waiting, 1);
        assert_eq!(stats.dedup_cache_size, 1);
    }

    #[tokio::test]
    async fn test_unknown_lane_is_rejected() {
        let (pipeline, _) = pipeline();
        assert!(matches!(
            pipeline.pause("carrier-pigeon"),
            Err(PipelineError::UnknownLane(_))
        ));
        assert!(pipeline.subscribe(lanes::MESSAGE).is_ok());
    }

    #[tokio::test]
    async fn test_clear_webhook_lane_resets_dedup() {
        let (pipeline, _) = pipeline();
        pipeline.pause(lanes::WEBHOOK).unwrap();
        pipeline.submit_inbound(chat_payload("m2")).await.unwrap();

        assert_eq!(pipeline.clear(lanes::WEBHOOK).await.unwrap(), 1);
        let again = pipeline.submit_inbound(chat_payload("m2")).await.unwrap();
        assert!(!again.is_duplicate());
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_failure_dead_letters_without_retry() {
        let (pipeline, _) = pipeline();
        let mut events = pipeline.subscribe(lanes::MESSAGE).unwrap();
        pipeline.start().await;

        pipeline
            .submit_outbound("+15550001", "hello", Priority::High)
            .await
            .unwrap();

        loop {
            if let QueueEvent::TerminalFailure { attempts, .. } = events.recv().await.unwrap() {
                assert_eq!(attempts, 1);
                break;
            }
        }

        let records = pipeline.list_dead_letters(10, 0).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, DeadLetterStatus::Failed);
        assert_eq!(
            pipeline.circuit_stats("whatsapp").unwrap().failure_count,
            0
        );

        pipeline.shutdown().await;
        assert!(!pipeline.is_running());
    }
}
