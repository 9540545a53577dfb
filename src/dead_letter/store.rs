//! # Dead-Letter Store
//!
//! Persistence seam for permanently failed items. The production backend is
//! an external record store; [`InMemoryDeadLetterStore`] serves single-process
//! deployments and tests.

use crate::dead_letter::{DeadLetterError, DeadLetterId, DeadLetterRecord, DeadLetterResult, DeadLetterStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Selection criteria for [`DeadLetterStore::fetch`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterFilter {
    pub status: Option<DeadLetterStatus>,
    /// Only records whose retry count is strictly below this value
    pub retry_count_below: Option<u32>,
    pub lane: Option<String>,
    pub newest_first: bool,
    pub limit: usize,
    pub offset: usize,
}

impl Default for DeadLetterFilter {
    fn default() -> Self {
        Self {
            status: None,
            retry_count_below: None,
            lane: None,
            newest_first: true,
            limit: 50,
            offset: 0,
        }
    }
}

impl DeadLetterFilter {
    /// Oldest failed records still below the retry cap
    pub fn retry_candidates(max_retries: u32, limit: usize) -> Self {
        Self {
            status: Some(DeadLetterStatus::Failed),
            retry_count_below: Some(max_retries),
            newest_first: false,
            limit,
            ..Self::default()
        }
    }

    /// Newest-first page over every record
    pub fn page(limit: usize, offset: usize) -> Self {
        Self {
            limit,
            offset,
            ..Self::default()
        }
    }

    fn matches(&self, record: &DeadLetterRecord) -> bool {
        self.status.map_or(true, |status| record.status == status)
            && self
                .retry_count_below
                .map_or(true, |cap| record.retry_count < cap)
            && self.lane.as_ref().map_or(true, |lane| &record.lane == lane)
    }
}

/// Record counts by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterCounts {
    pub failed: usize,
    pub retried: usize,
    pub deleted: usize,
    /// Sum of retry counts across all records
    pub total_retries: u64,
}

impl DeadLetterCounts {
    pub fn total(&self) -> usize {
        self.failed + self.retried + self.deleted
    }
}

/// Durable storage for dead-letter records
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Store a new record
    async fn persist(&self, record: DeadLetterRecord) -> DeadLetterResult<()>;

    async fn fetch(&self, filter: &DeadLetterFilter) -> DeadLetterResult<Vec<DeadLetterRecord>>;

    async fn get(&self, id: &DeadLetterId) -> DeadLetterResult<Option<DeadLetterRecord>>;

    /// Replace an existing record
    async fn update(&self, record: &DeadLetterRecord) -> DeadLetterResult<()>;

    /// Move failed records whose last attempt is before `cutoff` to `deleted`
    ///
    /// Records stay visible to operators. Returns how many changed status.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> DeadLetterResult<usize>;

    async fn counts(&self) -> DeadLetterResult<DeadLetterCounts>;
}

#[derive(Debug, Default)]
pub struct InMemoryDeadLetterStore {
    records: RwLock<HashMap<DeadLetterId, DeadLetterRecord>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn persist(&self, record: DeadLetterRecord) -> DeadLetterResult<()> {
        self.records.write().insert(record.id, record);
        Ok(())
    }

    async fn fetch(&self, filter: &DeadLetterFilter) -> DeadLetterResult<Vec<DeadLetterRecord>> {
        let records = self.records.read();
        let mut matching: Vec<&DeadLetterRecord> =
            records.values().filter(|record| filter.matches(record)).collect();

        matching.sort_by_key(|record| (record.first_seen_at, record.id));
        if filter.newest_first {
            matching.reverse();
        }

        Ok(matching
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .cloned()
            .collect())
    }

    async fn get(&self, id: &DeadLetterId) -> DeadLetterResult<Option<DeadLetterRecord>> {
        Ok(self.records.read().get(id).cloned())
    }

    async fn update(&self, record: &DeadLetterRecord) -> DeadLetterResult<()> {
        let mut records = self.records.write();
        match records.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(DeadLetterError::not_found(record.id)),
        }
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> DeadLetterResult<usize> {
        let mut records = self.records.write();
        let mut purged = 0;
        for record in records.values_mut() {
            if record.status == DeadLetterStatus::Failed && record.last_attempt_at < cutoff {
                record.mark_deleted();
                purged += 1;
            }
        }
        Ok(purged)
    }

    async fn counts(&self) -> DeadLetterResult<DeadLetterCounts> {
        let records = self.records.read();
        let mut counts = DeadLetterCounts::default();
        for record in records.values() {
            match record.status {
                DeadLetterStatus::Failed => counts.failed += 1,
                DeadLetterStatus::Retried => counts.retried += 1,
                DeadLetterStatus::Deleted => counts.deleted += 1,
            }
            counts.total_retries += u64::from(record.retry_count);
        }
        Ok(counts)
    }
}
