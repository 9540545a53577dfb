//! Dead-letter record model.

use crate::error::{DeliveryError, ErrorClass};
use crate::messaging::{JobEnvelope, JobId, QueuedJob};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeadLetterId(Uuid);

impl DeadLetterId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for DeadLetterId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for DeadLetterId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for DeadLetterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of a dead-letter record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterStatus {
    /// Waiting for an automatic or manual re-attempt
    Failed,
    /// Re-delivered successfully (resolved)
    Retried,
    /// Logically deleted by an operator
    Deleted,
}

impl fmt::Display for DeadLetterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeadLetterStatus::Failed => "failed",
            DeadLetterStatus::Retried => "retried",
            DeadLetterStatus::Deleted => "deleted",
        };
        f.write_str(label)
    }
}

/// A permanently failed queue item kept for inspection and re-delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: DeadLetterId,
    /// Lane the item failed on
    pub lane: String,
    pub job_id: Option<JobId>,
    pub correlation_id: String,
    /// Original payload with its type tag
    pub envelope: JobEnvelope,
    pub error_message: String,
    pub error_class: ErrorClass,
    /// Delivery attempts made, queue attempts and re-attempts together
    pub attempts: u32,
    /// Re-attempts made by the retry service
    pub retry_count: u32,
    pub first_seen_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
    pub status: DeadLetterStatus,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Transport message id from a successful re-delivery
    pub delivery_id: Option<String>,
}

impl DeadLetterRecord {
    /// Build a record for a job that exhausted its retry budget
    pub fn from_job(job: &QueuedJob, error: &DeliveryError) -> Self {
        let now = Utc::now();
        Self {
            id: DeadLetterId::new(),
            lane: job.lane.clone(),
            job_id: Some(job.id),
            correlation_id: job.correlation_id.clone(),
            envelope: job.envelope.clone(),
            error_message: error.to_string(),
            error_class: error.class(),
            attempts: job.attempts,
            retry_count: 0,
            first_seen_at: job.created_at,
            last_attempt_at: job.last_attempt_at.unwrap_or(now),
            status: DeadLetterStatus::Failed,
            resolved_at: None,
            delivery_id: None,
        }
    }

    /// Whether the automatic retry service may still pick this record up
    pub fn is_retry_eligible(&self, max_retries: u32) -> bool {
        self.status == DeadLetterStatus::Failed && self.retry_count < max_retries
    }

    /// Count a re-attempt before it is made
    pub fn begin_retry(&mut self) {
        self.retry_count += 1;
        self.attempts += 1;
        self.last_attempt_at = Utc::now();
    }

    pub fn mark_resolved(&mut self, delivery_id: Option<String>) {
        self.status = DeadLetterStatus::Retried;
        self.resolved_at = Some(Utc::now());
        self.delivery_id = delivery_id;
    }

    pub fn record_failure(&mut self, error: &DeliveryError) {
        self.error_message = error.to_string();
        self.error_class = error.class();
    }

    pub fn mark_deleted(&mut self) {
        self.status = DeadLetterStatus::Deleted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::Priority;
    use serde_json::json;

    fn failed_job() -> QueuedJob {
        let envelope = JobEnvelope::wrap("send_message", &json!({"to": "+1555"})).unwrap();
        let mut job = QueuedJob::new("message", envelope, Priority::Normal, 5);
        for _ in 0..5 {
            job.begin_attempt();
        }
        job
    }

    #[test]
    fn test_record_from_exhausted_job() {
        let job = failed_job();
        let record = DeadLetterRecord::from_job(&job, &DeliveryError::transient("whatsapp", "timeout"));

        assert_eq!(record.attempts, 5);
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.status, DeadLetterStatus::Failed);
        assert_eq!(record.error_class, ErrorClass::Transient);
        assert_eq!(record.job_id, Some(job.id));
        assert_eq!(record.correlation_id, job.correlation_id);
    }

    #[test]
    fn test_retry_lifecycle() {
        let mut record =
            DeadLetterRecord::from_job(&failed_job(), &DeliveryError::transient("whatsapp", "timeout"));
        assert!(record.is_retry_eligible(3));

        record.begin_retry();
        record.begin_retry();
        record.begin_retry();
        assert_eq!(record.retry_count, 3);
        assert_eq!(record.attempts, 8);
        assert!(!record.is_retry_eligible(3));

        record.mark_resolved(Some("wamid.1".to_string()));
        assert_eq!(record.status, DeadLetterStatus::Retried);
        assert!(record.resolved_at.is_some());
        assert!(!record.is_retry_eligible(10));
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_value(DeadLetterStatus::Retried).unwrap(),
            json!("retried")
        );
        assert_eq!(DeadLetterStatus::Deleted.to_string(), "deleted");
    }
}
