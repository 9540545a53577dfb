//! # Queue Message Types
//!
//! Jobs stored by the durable lanes and the typed payloads carried inside
//! their envelopes.

use crate::constants::DUPLICATE_PREFIX;
use crate::messaging::{MessagingError, MessagingResult};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Scheduling priority; declaration order is most to least urgent
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    /// Numeric rank, 1 being the most urgent
    pub fn rank(self) -> u8 {
        match self {
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    pub(crate) fn index(self) -> usize {
        usize::from(self.rank() - 1)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        };
        f.write_str(label)
    }
}

/// Unique identifier of a durable job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Type-tagged JSON envelope stored with every job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub kind: String,
    pub payload: serde_json::Value,
}

impl JobEnvelope {
    /// Serialize a typed payload under the given tag
    pub fn wrap<P: Serialize>(kind: impl Into<String>, payload: &P) -> MessagingResult<Self> {
        Ok(Self {
            kind: kind.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Deserialize the payload, checking the tag first
    pub fn unwrap_as<P: DeserializeOwned>(&self, expected_kind: &str) -> MessagingResult<P> {
        if self.kind != expected_kind {
            return Err(MessagingError::envelope_mismatch(expected_kind, &self.kind));
        }
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            MessagingError::message_deserialization(format!("{expected_kind} payload: {e}"))
        })
    }
}

/// A unit of work held by a durable lane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: JobId,
    pub lane: String,
    pub priority: Priority,
    pub envelope: JobEnvelope,
    /// Attempts made so far
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub correlation_id: String,
}

impl QueuedJob {
    pub fn new(lane: impl Into<String>, envelope: JobEnvelope, priority: Priority, max_attempts: u32) -> Self {
        Self {
            id: JobId::new(),
            lane: lane.into(),
            priority,
            envelope,
            attempts: 0,
            max_attempts,
            created_at: Utc::now(),
            last_attempt_at: None,
            correlation_id: Uuid::new_v4().to_string(),
        }
    }

    /// Use an existing correlation id instead of a generated one
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// Record the start of an attempt, returning its 1-indexed number
    ///
    /// The count never exceeds `max_attempts`.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts = (self.attempts + 1).min(self.max_attempts);
        self.last_attempt_at = Some(Utc::now());
        self.attempts
    }

    pub fn is_retry_budget_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Inbound chat event as handed to the conversation engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub request_id: String,
    /// Natural identifier extracted from the payload, used for deduplication
    pub message_id: Option<String>,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl InboundEvent {
    pub fn new(payload: serde_json::Value, message_id: Option<String>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            message_id,
            payload,
            received_at: Utc::now(),
        }
    }
}

/// Outbound send request for the messaging transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub to: String,
    pub content: String,
    pub client_id: Option<String>,
}

impl OutboundMessage {
    pub fn new(to: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            content: content.into(),
            client_id: None,
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}

/// Outcome of an inbound submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// Stored in the durable webhook lane
    Enqueued(JobId),
    /// Natural id seen within the deduplication window; nothing was queued
    Duplicate(String),
    /// Durable store unavailable; accepted by the in-process fallback queue
    Fallback(String),
}

impl Submission {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Submission::Duplicate(_))
    }
}

impl fmt::Display for Submission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Submission::Enqueued(id) => write!(f, "{id}"),
            Submission::Duplicate(id) => write!(f, "{DUPLICATE_PREFIX}{id}"),
            Submission::Fallback(id) => f.write_str(id),
        }
    }
}
