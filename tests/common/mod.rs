//! Shared collaborators and helpers for integration tests
#![allow(dead_code)]

pub mod strategies;

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_core::collaborators::{InboundEventHandler, OutboundTransport, SendReceipt, StatusNotifier};
use relay_core::config::PipelineConfig;
use relay_core::messaging::{
    InMemoryJobStore, InboundEvent, JobId, JobStore, LaneCounts, MessagingError, MessagingResult,
    QueueEvent, QueuedJob,
};
use relay_core::DeliveryError;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

/// Chat webhook payload carrying a natural message id
pub fn chat_payload(message_id: &str) -> Value {
    json!({
        "object": "whatsapp_business_account",
        "entry": [{
            "changes": [{
                "value": {
                    "messages": [{"id": message_id, "from": "15550001111", "text": {"body": "hola"}}]
                }
            }]
        }]
    })
}

/// Pipeline configuration with millisecond-scale backoff
pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    for lane in [&mut config.lanes.webhook, &mut config.lanes.message] {
        lane.backoff_base_ms = 10;
        lane.backoff_max_ms = 100;
        lane.poll_interval_ms = 10;
        lane.handler_timeout_ms = 1_000;
    }
    config.fallback_queue.retry_delays_ms = vec![10, 20, 40];
    config
}

/// Wait for the next completion or terminal failure on a lane
pub async fn next_outcome(events: &mut broadcast::Receiver<QueueEvent>) -> QueueEvent {
    loop {
        match events.recv().await {
            Ok(event @ (QueueEvent::Completed { .. } | QueueEvent::TerminalFailure { .. })) => return event,
            Ok(_) => continue,
            Err(e) => panic!("queue event channel failed: {e}"),
        }
    }
}

/// Conversation engine double counting the events it receives
#[derive(Default)]
pub struct RecordingInboundHandler {
    pub events: Mutex<Vec<InboundEvent>>,
    failures: Mutex<VecDeque<DeliveryError>>,
}

impl RecordingInboundHandler {
    pub fn fail_next(&self, error: DeliveryError) {
        self.failures.lock().push_back(error);
    }

    pub fn calls(&self) -> usize {
        self.events.lock().len()
    }
}

#[async_trait]
impl InboundEventHandler for RecordingInboundHandler {
    async fn handle_inbound_event(&self, event: &InboundEvent) -> Result<(), DeliveryError> {
        self.events.lock().push(event.clone());
        match self.failures.lock().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Messaging transport double that can be switched between failing and healthy
#[derive(Default)]
pub struct ScriptedTransport {
    failing: AtomicBool,
    pub sends: AtomicUsize,
    pub delivered: Mutex<Vec<(String, String)>>,
}

impl ScriptedTransport {
    pub fn failing() -> Self {
        let transport = Self::default();
        transport.failing.store(true, Ordering::SeqCst);
        transport
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OutboundTransport for ScriptedTransport {
    async fn send_outbound(&self, target: &str, content: &str) -> Result<SendReceipt, DeliveryError> {
        let n = self.sends.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing.load(Ordering::SeqCst) {
            return Err(DeliveryError::transient_with_code(
                "whatsapp",
                "ECONNRESET",
                "socket hang up",
            ));
        }
        self.delivered
            .lock()
            .push((target.to_string(), content.to_string()));
        Ok(SendReceipt {
            message_id: format!("wamid.{n}"),
        })
    }
}

/// Notifier double keeping every published event
#[derive(Default)]
pub struct RecordingNotifier {
    pub events: Mutex<Vec<(String, Value)>>,
}

impl RecordingNotifier {
    pub fn events_named(&self, name: &str) -> Vec<Value> {
        self.events
            .lock()
            .iter()
            .filter(|(event, _)| event == name)
            .map(|(_, data)| data.clone())
            .collect()
    }
}

impl StatusNotifier for RecordingNotifier {
    fn notify(&self, event: &str, data: &Value) {
        self.events.lock().push((event.to_string(), data.clone()));
    }
}

/// Job store whose pushes fail as if the backing service were down
#[derive(Default)]
pub struct UnavailableJobStore {
    inner: InMemoryJobStore,
}

#[async_trait]
impl JobStore for UnavailableJobStore {
    async fn push(&self, job: QueuedJob) -> MessagingResult<()> {
        Err(MessagingError::store_unavailable(job.lane, "connection refused"))
    }

    async fn claim_next(&self, lane: &str) -> MessagingResult<Option<QueuedJob>> {
        self.inner.claim_next(lane).await
    }

    async fn retry_later(&self, job: QueuedJob, delay: Duration) -> MessagingResult<()> {
        self.inner.retry_later(job, delay).await
    }

    async fn complete(&self, job: &QueuedJob) -> MessagingResult<()> {
        self.inner.complete(job).await
    }

    async fn fail(&self, job: &QueuedJob, error: &str) -> MessagingResult<()> {
        self.inner.fail(job, error).await
    }

    async fn counts(&self, lane: &str) -> MessagingResult<LaneCounts> {
        self.inner.counts(lane).await
    }

    async fn purge_finished(&self, lane: &str, older_than: Duration) -> MessagingResult<usize> {
        self.inner.purge_finished(lane, older_than).await
    }

    async fn clear(&self, lane: &str) -> MessagingResult<usize> {
        self.inner.clear(lane).await
    }

    async fn get(&self, id: &JobId) -> MessagingResult<Option<QueuedJob>> {
        self.inner.get(id).await
    }
}
