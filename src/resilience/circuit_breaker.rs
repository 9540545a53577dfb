//! # Circuit Breaker Implementation
//!
//! Provides fault isolation for downstream dependencies. The breaker follows
//! the classic three-state pattern: Closed (normal operation), Open (failing
//! fast) and Half-Open (a single probe call tests recovery).
//!
//! All state lives behind one mutex so that check-and-transition is atomic;
//! the lock is never held across the protected operation's `.await`.

use crate::error::{DeliveryError, FailureDetails};
use crate::logging::log_circuit_transition;
use crate::resilience::{CircuitBreakerConfig, CircuitStats};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed,
    /// Failure mode - all calls fail fast without executing
    Open,
    /// Testing recovery - a single probe call is allowed through
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        };
        f.write_str(label)
    }
}

/// Errors that can occur during circuit breaker operation
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, the operation was not invoked
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    /// Operation ran and failed; the original error is preserved
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

impl<E> CircuitBreakerError<E> {
    /// Whether the call was rejected without invoking the operation
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

impl From<CircuitBreakerError<DeliveryError>> for DeliveryError {
    fn from(err: CircuitBreakerError<DeliveryError>) -> Self {
        match err {
            CircuitBreakerError::CircuitOpen { component } => DeliveryError::CircuitOpen { component },
            CircuitBreakerError::OperationFailed(inner) => inner,
        }
    }
}

/// Manual override target refused because it would skip a state
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Cannot force circuit {component} from {from} to {to}")]
pub struct InvalidTransition {
    pub component: String,
    pub from: CircuitState,
    pub to: CircuitState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u64,
    success_count: u64,
    total_calls: u64,
    rejected_calls: u64,
    ignored_failures: u64,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    last_reset: Instant,
    last_reset_at: DateTime<Utc>,
    probe_in_flight: bool,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            total_calls: 0,
            rejected_calls: 0,
            ignored_failures: 0,
            last_failure: None,
            last_failure_at: None,
            last_success_at: None,
            last_reset: Instant::now(),
            last_reset_at: Utc::now(),
            probe_in_flight: false,
        }
    }

    fn clear_counters(&mut self) {
        self.failure_count = 0;
        self.success_count = 0;
        self.total_calls = 0;
        self.rejected_calls = 0;
        self.ignored_failures = 0;
        self.last_reset = Instant::now();
        self.last_reset_at = Utc::now();
    }

    fn recovery_elapsed(&self, recovery_timeout: Duration) -> bool {
        self.last_failure
            .map_or(true, |failed_at| failed_at.elapsed() >= recovery_timeout)
    }
}

/// Three-state circuit breaker guarding one named dependency
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Component name for logging and metrics
    name: String,

    config: CircuitBreakerConfig,

    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and configuration
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            component = %name,
            failure_threshold = config.failure_threshold,
            recovery_timeout_ms = config.recovery_timeout.as_millis() as u64,
            monitoring_period_ms = config.monitoring_period.as_millis() as u64,
            "🛡️ Circuit breaker initialized"
        );

        Self {
            name,
            config,
            inner: Mutex::new(BreakerState::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get current circuit state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Whether a call made now would be let through
    pub fn is_available(&self) -> bool {
        let state = self.inner.lock();
        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => state.recovery_elapsed(self.config.recovery_timeout),
            CircuitState::HalfOpen => !state.probe_in_flight,
        }
    }

    /// Execute an operation with circuit breaker protection
    ///
    /// The operation's own error is always handed back inside
    /// [`CircuitBreakerError::OperationFailed`], whether or not it counted
    /// toward the failure threshold.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: FailureDetails,
    {
        let admission = self.admit().ok_or_else(|| CircuitBreakerError::CircuitOpen {
            component: self.name.clone(),
        })?;

        let mut guard = ProbeGuard {
            breaker: self,
            armed: admission == Admission::Probe,
        };
        let started = Instant::now();
        let result = operation().await;
        guard.armed = false;
        drop(guard);

        match &result {
            Ok(_) => self.record_success(admission, started.elapsed()),
            Err(err) => self.record_failure(admission, err, started.elapsed()),
        }

        result.map_err(CircuitBreakerError::OperationFailed)
    }

    fn admit(&self) -> Option<Admission> {
        let mut state = self.inner.lock();
        state.total_calls += 1;

        match state.state {
            CircuitState::Closed => Some(Admission::Normal),
            CircuitState::Open => {
                if state.recovery_elapsed(self.config.recovery_timeout) {
                    state.state = CircuitState::HalfOpen;
                    state.probe_in_flight = true;
                    info!(
                        component = %self.name,
                        "🟡 Circuit breaker half-open (sending probe)"
                    );
                    Some(Admission::Probe)
                } else {
                    state.rejected_calls += 1;
                    debug!(component = %self.name, "Call rejected by open circuit");
                    None
                }
            }
            CircuitState::HalfOpen => {
                if state.probe_in_flight {
                    state.rejected_calls += 1;
                    None
                } else {
                    state.probe_in_flight = true;
                    Some(Admission::Probe)
                }
            }
        }
    }

    fn record_success(&self, admission: Admission, duration: Duration) {
        let mut state = self.inner.lock();
        state.success_count += 1;
        state.last_success_at = Some(Utc::now());

        debug!(
            component = %self.name,
            duration_ms = duration.as_millis() as u64,
            "🟢 Operation succeeded"
        );

        if admission == Admission::Probe && state.state == CircuitState::HalfOpen {
            state.state = CircuitState::Closed;
            state.failure_count = 0;
            state.probe_in_flight = false;
            info!(
                component = %self.name,
                success_count = state.success_count,
                "🟢 Circuit breaker closed (recovered)"
            );
        }
    }

    fn record_failure<E: FailureDetails>(&self, admission: Admission, err: &E, duration: Duration) {
        let mut state = self.inner.lock();

        if self.is_excluded(err) {
            state.ignored_failures += 1;
            if admission == Admission::Probe {
                state.probe_in_flight = false;
            }
            debug!(
                component = %self.name,
                error = %err,
                "Failure not counted toward circuit threshold"
            );
            return;
        }

        state.failure_count += 1;
        state.last_failure = Some(Instant::now());
        state.last_failure_at = Some(Utc::now());

        warn!(
            component = %self.name,
            duration_ms = duration.as_millis() as u64,
            failure_count = state.failure_count,
            error = %err,
            "🔴 Operation failed"
        );

        let should_open = match state.state {
            CircuitState::HalfOpen => admission == Admission::Probe,
            CircuitState::Closed => state.failure_count >= u64::from(self.config.failure_threshold),
            CircuitState::Open => false,
        };

        if should_open {
            state.state = CircuitState::Open;
            state.probe_in_flight = false;
            error!(
                component = %self.name,
                failure_count = state.failure_count,
                recovery_timeout_ms = self.config.recovery_timeout.as_millis() as u64,
                "🔴 Circuit breaker opened (failing fast)"
            );
        }
    }

    /// Whether a failure matches an expected error or an excluded client status
    pub fn is_excluded<E: FailureDetails>(&self, err: &E) -> bool {
        if err.is_client_error() {
            return true;
        }

        if let Some(status) = err.status_code() {
            if self.config.excluded_status_codes.contains(&status) {
                return true;
            }
        }

        if self.config.expected_errors.is_empty() {
            return false;
        }

        let message = err.to_string();
        let code = err.error_code();
        self.config.expected_errors.iter().any(|expected| {
            message.contains(expected.as_str())
                || code.is_some_and(|code| code.contains(expected.as_str()))
        })
    }

    /// Operational override of the circuit state
    ///
    /// Closed circuits cannot be forced straight to half-open.
    pub fn force_state(&self, target: CircuitState) -> Result<(), InvalidTransition> {
        let mut state = self.inner.lock();
        let from = state.state;

        if from == CircuitState::Closed && target == CircuitState::HalfOpen {
            return Err(InvalidTransition {
                component: self.name.clone(),
                from,
                to: target,
            });
        }

        state.state = target;
        state.probe_in_flight = false;
        match target {
            CircuitState::Open => {
                state.last_failure = Some(Instant::now());
                state.last_failure_at = Some(Utc::now());
            }
            CircuitState::Closed => state.failure_count = 0,
            CircuitState::HalfOpen => {}
        }

        log_circuit_transition(&self.name, from, target, "forced");
        Ok(())
    }

    /// Close the circuit and clear every counter
    pub fn reset(&self) {
        let mut state = self.inner.lock();
        let from = state.state;
        state.state = CircuitState::Closed;
        state.probe_in_flight = false;
        state.last_failure = None;
        state.clear_counters();

        log_circuit_transition(&self.name, from, CircuitState::Closed, "reset");
    }

    /// Reset counters once a full monitoring period passed without failures
    ///
    /// Returns whether the counters were cleared. The circuit state is untouched.
    pub fn reset_stale_stats(&self) -> bool {
        let mut state = self.inner.lock();
        let period = self.config.monitoring_period;

        if state.last_reset.elapsed() < period {
            return false;
        }
        let quiet = state
            .last_failure
            .map_or(true, |failed_at| failed_at.elapsed() >= period);
        if !quiet {
            return false;
        }

        state.clear_counters();
        debug!(component = %self.name, "Circuit breaker stats reset after quiet monitoring period");
        true
    }

    /// Snapshot of the breaker's counters and state
    pub fn stats(&self) -> CircuitStats {
        let state = self.inner.lock();
        CircuitStats {
            name: self.name.clone(),
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            total_calls: state.total_calls,
            rejected_calls: state.rejected_calls,
            ignored_failures: state.ignored_failures,
            failure_rate: CircuitStats::compute_failure_rate(state.failure_count, state.success_count),
            last_failure_at: state.last_failure_at,
            last_success_at: state.last_success_at,
            last_reset_at: state.last_reset_at,
        }
    }

    /// Check if the circuit breaker is healthy (closed)
    pub fn is_healthy(&self) -> bool {
        self.state() == CircuitState::Closed
    }
}

/// Releases the half-open probe slot when the probing future is dropped mid-flight
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.inner.lock().probe_in_flight = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn breaker(threshold: u32, recovery: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: recovery,
                monitoring_period: Duration::from_secs(60),
                ..CircuitBreakerConfig::default()
            },
        )
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), CircuitBreakerError<DeliveryError>> {
        cb.call(|| async { Err::<(), _>(DeliveryError::transient("test", "connection reset")) })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_closed_state() {
        let cb = breaker(3, Duration::from_secs(1));

        let result = cb.call(|| async { Ok::<_, DeliveryError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().success_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_at_threshold_and_rejects() {
        let cb = breaker(3, Duration::from_secs(30));
        let invoked = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            assert!(matches!(
                fail(&cb).await,
                Err(CircuitBreakerError::OperationFailed(_))
            ));
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let counter = invoked.clone();
        let result = cb
            .call(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, DeliveryError>(())
            })
            .await;
        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(cb.stats().rejected_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_success_closes() {
        let cb = breaker(2, Duration::from_secs(10));
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.is_available());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cb.is_available());

        let result = cb.call(|| async { Ok::<_, DeliveryError>("ok") }).await;
        assert!(result.is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_failure_reopens() {
        let cb = breaker(1, Duration::from_secs(5));
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(6)).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        let result = cb.call(|| async { Ok::<_, DeliveryError>(()) }).await;
        assert!(result.unwrap_err().is_circuit_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_probe_in_half_open() {
        let cb = Arc::new(breaker(1, Duration::from_secs(5)));
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_secs(6)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe_cb = cb.clone();
        let probe = tokio::spawn(async move {
            probe_cb
                .call(|| async move {
                    let _ = release_rx.await;
                    Ok::<_, DeliveryError>(())
                })
                .await
        });
        tokio::task::yield_now().await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let concurrent = cb.call(|| async { Ok::<_, DeliveryError>(()) }).await;
        assert!(concurrent.unwrap_err().is_circuit_open());

        release_tx.send(()).unwrap();
        assert!(probe.await.unwrap().is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_errors_do_not_count() {
        let cb = breaker(2, Duration::from_secs(5));
        for _ in 0..5 {
            let result = cb
                .call(|| async { Err::<(), _>(DeliveryError::client_status(400, "bad request")) })
                .await;
            match result {
                Err(CircuitBreakerError::OperationFailed(err)) => {
                    assert_eq!(err.status_code(), Some(400))
                }
                other => panic!("unexpected result: {other:?}"),
            }
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().failure_count, 0);
        assert_eq!(cb.stats().ignored_failures, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expected_errors_and_excluded_statuses() {
        let cb = CircuitBreaker::new(
            "transport",
            CircuitBreakerConfig {
                failure_threshold: 1,
                expected_errors: vec!["RATE_LIMIT".to_string()],
                ..CircuitBreakerConfig::default()
            },
        );

        let rate_limited = DeliveryError::transient_with_code("transport", "RATE_LIMIT", "slow down");
        assert!(cb.is_excluded(&rate_limited));
        let not_found = DeliveryError::upstream_status("transport", 404, "no such user");
        assert!(cb.is_excluded(&not_found));
        let server_error = DeliveryError::upstream_status("transport", 503, "unavailable");
        assert!(!cb.is_excluded(&server_error));
        assert!(cb.is_excluded(&"request hit RATE_LIMIT"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_state_and_reset() {
        let cb = breaker(3, Duration::from_secs(60));

        let refused = cb.force_state(CircuitState::HalfOpen);
        assert!(refused.is_err());
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.force_state(CircuitState::Open).unwrap();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(fail(&cb).await.unwrap_err().is_circuit_open());

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().total_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_stale_stats_only_after_quiet_period() {
        let cb = breaker(10, Duration::from_secs(5));
        let _ = fail(&cb).await;
        let _ = cb.call(|| async { Ok::<_, DeliveryError>(()) }).await;

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!cb.reset_stale_stats());
        assert_eq!(cb.stats().failure_count, 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(cb.reset_stale_stats());
        let stats = cb.stats();
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.success_count, 0);
        assert_eq!(stats.state, CircuitState::Closed);
    }
}
