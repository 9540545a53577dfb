//! # Resilience
//!
//! Fault isolation for downstream dependencies: per-dependency circuit
//! breakers, the registry that owns them, and the backoff schedule used by
//! the retry queues.

pub mod backoff;
pub mod circuit_breaker;
pub mod config;
pub mod manager;
pub mod metrics;

pub use backoff::BackoffPolicy;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitState, InvalidTransition};
pub use config::CircuitBreakerConfig;
pub use manager::CircuitBreakerManager;
pub use metrics::{CircuitStats, CircuitStatsMap, HealthSummary, OverallHealth};
