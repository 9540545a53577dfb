//! # Job Store
//!
//! Storage seam behind the durable lanes. A [`JobStore`] holds waiting,
//! delayed, active and finished jobs per lane and hands out the next job
//! according to priority. [`InMemoryJobStore`] is the single-process
//! implementation used by default and in tests.

use crate::messaging::{JobId, MessagingResult, Priority, QueuedJob};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Job counts for one lane
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneCounts {
    pub waiting: usize,
    pub active: usize,
    /// Retained completed records
    pub completed: usize,
    /// Retained failed records
    pub failed: usize,
    pub delayed: usize,
}

impl LaneCounts {
    /// Jobs not yet finished
    pub fn total(&self) -> usize {
        self.waiting + self.active + self.delayed
    }
}

/// Durable backend for queue lanes
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Add a new job to the waiting list of its lane
    async fn push(&self, job: QueuedJob) -> MessagingResult<()>;

    /// Move the next ready job into the active set
    async fn claim_next(&self, lane: &str) -> MessagingResult<Option<QueuedJob>>;

    /// Schedule another attempt of an active job after `delay`
    async fn retry_later(&self, job: QueuedJob, delay: Duration) -> MessagingResult<()>;

    /// Mark an active job completed
    async fn complete(&self, job: &QueuedJob) -> MessagingResult<()>;

    /// Mark an active job permanently failed
    async fn fail(&self, job: &QueuedJob, error: &str) -> MessagingResult<()>;

    async fn counts(&self, lane: &str) -> MessagingResult<LaneCounts>;

    /// Drop finished records older than `older_than`
    async fn purge_finished(&self, lane: &str, older_than: Duration) -> MessagingResult<usize>;

    /// Drop waiting and delayed jobs; active jobs are left to finish
    async fn clear(&self, lane: &str) -> MessagingResult<usize>;

    async fn get(&self, id: &JobId) -> MessagingResult<Option<QueuedJob>>;
}

/// Weighted round-robin over priority classes (4:2:1)
///
/// Higher priorities are served more often but a waiting low-priority job
/// is reached within one full cycle of the schedule.
#[derive(Debug, Default)]
struct PriorityScheduler {
    cursor: usize,
}

impl PriorityScheduler {
    const SCHEDULE: [Priority; 7] = [
        Priority::High,
        Priority::Normal,
        Priority::High,
        Priority::Low,
        Priority::High,
        Priority::Normal,
        Priority::High,
    ];

    fn next(&mut self, has_ready: impl Fn(Priority) -> bool) -> Option<Priority> {
        let len = Self::SCHEDULE.len();
        for offset in 0..len {
            let slot = (self.cursor + offset) % len;
            let priority = Self::SCHEDULE[slot];
            if has_ready(priority) {
                self.cursor = (slot + 1) % len;
                return Some(priority);
            }
        }
        None
    }
}

#[derive(Debug)]
struct FinishedJob {
    job: QueuedJob,
    finished_at: Instant,
    error: Option<String>,
}

#[derive(Debug)]
struct LaneState {
    ready: [VecDeque<QueuedJob>; 3],
    delayed: Vec<(Instant, QueuedJob)>,
    active: HashMap<JobId, QueuedJob>,
    completed: VecDeque<FinishedJob>,
    failed: VecDeque<FinishedJob>,
    scheduler: PriorityScheduler,
    retain_completed: usize,
    retain_failed: usize,
}

impl Default for LaneState {
    fn default() -> Self {
        Self {
            ready: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            delayed: Vec::new(),
            active: HashMap::new(),
            completed: VecDeque::new(),
            failed: VecDeque::new(),
            scheduler: PriorityScheduler::default(),
            retain_completed: usize::MAX,
            retain_failed: usize::MAX,
        }
    }
}

impl LaneState {
    /// Move due retries to the front of their priority class, earliest first
    fn promote_due(&mut self, now: Instant) {
        if self.delayed.is_empty() {
            return;
        }

        let (mut due, pending): (Vec<_>, Vec<_>) =
            self.delayed.drain(..).partition(|(ready_at, _)| *ready_at <= now);
        self.delayed = pending;

        due.sort_by_key(|(ready_at, _)| *ready_at);
        for (_, job) in due.into_iter().rev() {
            self.ready[job.priority.index()].push_front(job);
        }
    }

    fn finish(&mut self, job: &QueuedJob, error: Option<&str>) {
        let job = self.active.remove(&job.id).unwrap_or_else(|| job.clone());
        let record = FinishedJob {
            job,
            finished_at: Instant::now(),
            error: error.map(str::to_string),
        };

        let (list, retain) = if record.error.is_some() {
            (&mut self.failed, self.retain_failed)
        } else {
            (&mut self.completed, self.retain_completed)
        };
        list.push_back(record);
        while list.len() > retain {
            list.pop_front();
        }
    }

    fn waiting(&self) -> usize {
        self.ready.iter().map(VecDeque::len).sum()
    }
}

/// Single-process [`JobStore`]
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    lanes: Mutex<HashMap<String, LaneState>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most this many finished records per outcome for a lane
    pub fn configure_retention(&self, lane: &str, retain_completed: usize, retain_failed: usize) {
        let mut lanes = self.lanes.lock();
        let state = lanes.entry(lane.to_string()).or_default();
        state.retain_completed = retain_completed;
        state.retain_failed = retain_failed;
    }

    /// Error message recorded for a failed job, if it is still retained
    pub fn failure_reason(&self, id: &JobId) -> Option<String> {
        let lanes = self.lanes.lock();
        lanes.values().find_map(|state| {
            state
                .failed
                .iter()
                .find(|record| record.job.id == *id)
                .and_then(|record| record.error.clone())
        })
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn push(&self, job: QueuedJob) -> MessagingResult<()> {
        let mut lanes = self.lanes.lock();
        let state = lanes.entry(job.lane.clone()).or_default();
        state.ready[job.priority.index()].push_back(job);
        Ok(())
    }

    async fn claim_next(&self, lane: &str) -> MessagingResult<Option<QueuedJob>> {
        let mut lanes = self.lanes.lock();
        let Some(state) = lanes.get_mut(lane) else {
            return Ok(None);
        };

        state.promote_due(Instant::now());
        let ready = &state.ready;
        let Some(priority) = state
            .scheduler
            .next(|priority| !ready[priority.index()].is_empty())
        else {
            return Ok(None);
        };

        let job = state.ready[priority.index()].pop_front();
        if let Some(job) = &job {
            state.active.insert(job.id, job.clone());
        }
        Ok(job)
    }

    async fn retry_later(&self, job: QueuedJob, delay: Duration) -> MessagingResult<()> {
        let mut lanes = self.lanes.lock();
        let state = lanes.entry(job.lane.clone()).or_default();
        state.active.remove(&job.id);

        if delay.is_zero() {
            state.ready[job.priority.index()].push_front(job);
        } else {
            state.delayed.push((Instant::now() + delay, job));
        }
        Ok(())
    }

    async fn complete(&self, job: &QueuedJob) -> MessagingResult<()> {
        let mut lanes = self.lanes.lock();
        lanes.entry(job.lane.clone()).or_default().finish(job, None);
        Ok(())
    }

    async fn fail(&self, job: &QueuedJob, error: &str) -> MessagingResult<()> {
        let mut lanes = self.lanes.lock();
        lanes
            .entry(job.lane.clone())
            .or_default()
            .finish(job, Some(error));
        Ok(())
    }

    async fn counts(&self, lane: &str) -> MessagingResult<LaneCounts> {
        let lanes = self.lanes.lock();
        Ok(lanes
            .get(lane)
            .map(|state| LaneCounts {
                waiting: state.waiting(),
                active: state.active.len(),
                completed: state.completed.len(),
                failed: state.failed.len(),
                delayed: state.delayed.len(),
            })
            .unwrap_or_default())
    }

    async fn purge_finished(&self, lane: &str, older_than: Duration) -> MessagingResult<usize> {
        let mut lanes = self.lanes.lock();
        let Some(state) = lanes.get_mut(lane) else {
            return Ok(0);
        };

        let before = state.completed.len() + state.failed.len();
        state
            .completed
            .retain(|record| record.finished_at.elapsed() < older_than);
        state
            .failed
            .retain(|record| record.finished_at.elapsed() < older_than);
        Ok(before - state.completed.len() - state.failed.len())
    }

    async fn clear(&self, lane: &str) -> MessagingResult<usize> {
        let mut lanes = self.lanes.lock();
        let Some(state) = lanes.get_mut(lane) else {
            return Ok(0);
        };

        let removed = state.waiting() + state.delayed.len();
        for queue in &mut state.ready {
            queue.clear();
        }
        state.delayed.clear();
        Ok(removed)
    }

    async fn get(&self, id: &JobId) -> MessagingResult<Option<QueuedJob>> {
        let lanes = self.lanes.lock();
        for state in lanes.values() {
            let found = state
                .active
                .get(id)
                .or_else(|| state.ready.iter().flatten().find(|job| job.id == *id))
                .or_else(|| state.delayed.iter().map(|(_, job)| job).find(|job| job.id == *id))
                .or_else(|| {
                    state
                        .completed
                        .iter()
                        .chain(state.failed.iter())
                        .map(|record| &record.job)
                        .find(|job| job.id == *id)
                });
            if let Some(job) = found {
                return Ok(Some(job.clone()));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::JobEnvelope;
    use serde_json::json;

    fn job(lane: &str, priority: Priority, tag: u32) -> QueuedJob {
        let envelope = JobEnvelope::wrap("test", &json!({ "tag": tag })).unwrap();
        QueuedJob::new(lane, envelope, priority, 3)
    }

    fn tag(job: &QueuedJob) -> u64 {
        job.envelope.payload["tag"].as_u64().unwrap()
    }

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let store = InMemoryJobStore::new();
        for i in 0..3 {
            store.push(job("lane", Priority::Normal, i)).await.unwrap();
        }

        let mut order = Vec::new();
        while let Some(job) = store.claim_next("lane").await.unwrap() {
            order.push(tag(&job));
        }
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(store.counts("lane").await.unwrap().active, 3);
    }

    #[tokio::test]
    async fn test_high_priority_first_without_starving_low() {
        let store = InMemoryJobStore::new();
        store.push(job("lane", Priority::Low, 100)).await.unwrap();
        for i in 0..10 {
            store.push(job("lane", Priority::High, i)).await.unwrap();
        }

        let first = store.claim_next("lane").await.unwrap().unwrap();
        assert_eq!(first.priority, Priority::High);

        let mut claims = vec![first];
        for _ in 0..6 {
            claims.push(store.claim_next("lane").await.unwrap().unwrap());
        }
        assert!(claims.iter().any(|job| job.priority == Priority::Low));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_retry_returns_to_front() {
        let store = InMemoryJobStore::new();
        store.push(job("lane", Priority::Normal, 1)).await.unwrap();
        store.push(job("lane", Priority::Normal, 2)).await.unwrap();

        let first = store.claim_next("lane").await.unwrap().unwrap();
        store
            .retry_later(first, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(store.counts("lane").await.unwrap().delayed, 1);

        tokio::time::advance(Duration::from_secs(3)).await;
        let next = store.claim_next("lane").await.unwrap().unwrap();
        assert_eq!(tag(&next), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finish_retention_and_purge() {
        let store = InMemoryJobStore::new();
        store.configure_retention("lane", 2, 1);

        for i in 0..4 {
            store.push(job("lane", Priority::Normal, i)).await.unwrap();
            let claimed = store.claim_next("lane").await.unwrap().unwrap();
            if i % 2 == 0 {
                store.complete(&claimed).await.unwrap();
            } else {
                store.fail(&claimed, "boom").await.unwrap();
            }
        }

        let counts = store.counts("lane").await.unwrap();
        assert_eq!(counts.completed, 2);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.active, 0);

        tokio::time::advance(Duration::from_secs(3601)).await;
        let purged = store
            .purge_finished("lane", Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(purged, 3);
    }

    #[tokio::test]
    async fn test_clear_leaves_active_jobs() {
        let store = InMemoryJobStore::new();
        for i in 0..3 {
            store.push(job("lane", Priority::Low, i)).await.unwrap();
        }
        let active = store.claim_next("lane").await.unwrap().unwrap();

        assert_eq!(store.clear("lane").await.unwrap(), 2);
        let counts = store.counts("lane").await.unwrap();
        assert_eq!(counts.waiting, 0);
        assert_eq!(counts.active, 1);
        assert!(store.get(&active.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failure_reason_is_retained() {
        let store = InMemoryJobStore::new();
        store.push(job("lane", Priority::High, 1)).await.unwrap();
        let claimed = store.claim_next("lane").await.unwrap().unwrap();
        store.fail(&claimed, "invalid payload").await.unwrap();
        assert_eq!(
            store.failure_reason(&claimed.id),
            Some("invalid payload".to_string())
        );
    }
}
