//! # Messaging
//!
//! Queue-side building blocks: job and payload models, the deduplication
//! cache, the durable job store seam, per-lane workers and the in-process
//! fallback queue.

pub mod dedup;
pub mod errors;
pub mod fallback_queue;
pub mod job_store;
pub mod lane;
pub mod message;

pub use dedup::DeduplicationCache;
pub use errors::{MessagingError, MessagingResult};
pub use fallback_queue::{FallbackHandler, FallbackQueue, FallbackStats, QueueItem};
pub use job_store::{InMemoryJobStore, JobStore, LaneCounts};
pub use lane::{JobHandler, LaneStats, QueueEvent, QueueLane};
pub use message::{
    InboundEvent, JobEnvelope, JobId, OutboundMessage, Priority, QueuedJob, Submission,
};
