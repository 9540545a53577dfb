//! # External Collaborators
//!
//! Narrow interfaces to the systems around the pipeline: the inbound
//! payload decoder, the conversation engine that handles inbound events,
//! the outbound messaging transport and the live-status notifier. The
//! dead-letter record store lives in [`crate::dead_letter::DeadLetterStore`].

use crate::error::DeliveryError;
use crate::messaging::InboundEvent;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub use crate::dead_letter::DeadLetterStore;

/// Extracts the natural identifier used for deduplication
pub trait InboundIdentifier: Send + Sync {
    fn decode_inbound_identifier(&self, payload: &Value) -> Option<String>;
}

/// Reads `entry[0].changes[0].value.messages[0].id` from chat webhook payloads
#[derive(Debug, Clone, Copy, Default)]
pub struct ChatWebhookIdentifier;

impl InboundIdentifier for ChatWebhookIdentifier {
    fn decode_inbound_identifier(&self, payload: &Value) -> Option<String> {
        payload
            .pointer("/entry/0/changes/0/value/messages/0/id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
    }
}

/// Conversation engine entry point for inbound events
#[async_trait]
pub trait InboundEventHandler: Send + Sync {
    async fn handle_inbound_event(&self, event: &InboundEvent) -> Result<(), DeliveryError>;
}

/// Transport acknowledgement for a sent message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub message_id: String,
}

/// Outbound messaging transport
#[async_trait]
pub trait OutboundTransport: Send + Sync {
    async fn send_outbound(&self, target: &str, content: &str) -> Result<SendReceipt, DeliveryError>;
}

/// Best-effort push of status events to connected clients
///
/// Implementations swallow their own failures; nothing is reported back.
pub trait StatusNotifier: Send + Sync {
    fn notify(&self, event: &str, data: &Value);
}

/// Notifier used when no live clients are attached
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl StatusNotifier for NoopNotifier {
    fn notify(&self, event: &str, _data: &Value) {
        debug!(event = %event, "Status notification dropped (no notifier configured)");
    }
}
