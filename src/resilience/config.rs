//! # Circuit Breaker Configuration
//!
//! Configuration structures and validation for circuit breaker behavior.
//! Values loaded from TOML live in [`crate::config::CircuitBreakerSettings`]
//! and are converted into this runtime form.

use crate::constants::DEFAULT_EXCLUDED_STATUS_CODES;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a single circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of counted failures before opening the circuit
    pub failure_threshold: u32,

    /// Time to wait after the last failure before letting a probe through
    pub recovery_timeout: Duration,

    /// Window after which failure/success counters are reset when quiet
    pub monitoring_period: Duration,

    /// Error codes or message substrings that never count as failures
    pub expected_errors: Vec<String>,

    /// Status codes that never count as failures
    pub excluded_status_codes: Vec<u16>,
}

impl CircuitBreakerConfig {
    /// Create configuration for the outbound messaging transport
    pub fn for_messaging_transport() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            monitoring_period: Duration::from_secs(180),
            ..Self::default()
        }
    }

    /// Create configuration for database operations
    pub fn for_database() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            monitoring_period: Duration::from_secs(300),
            ..Self::default()
        }
    }

    /// Create configuration for the hosted record store
    pub fn for_record_store() -> Self {
        Self {
            failure_threshold: 4,
            recovery_timeout: Duration::from_secs(45),
            monitoring_period: Duration::from_secs(240),
            ..Self::default()
        }
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be greater than 0".to_string());
        }

        if self.failure_threshold > 100 {
            return Err("failure_threshold should not exceed 100".to_string());
        }

        if self.recovery_timeout.is_zero() {
            return Err("recovery_timeout must be greater than 0".to_string());
        }

        if self.monitoring_period.is_zero() {
            return Err("monitoring_period must be greater than 0".to_string());
        }

        if self.expected_errors.iter().any(|e| e.trim().is_empty()) {
            return Err("expected_errors must not contain empty entries".to_string());
        }

        if let Some(code) = self
            .excluded_status_codes
            .iter()
            .find(|code| !(100..=599).contains(*code))
        {
            return Err(format!("excluded status code {code} is not a valid HTTP status"));
        }

        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            monitoring_period: Duration::from_secs(300),
            expected_errors: Vec::new(),
            excluded_status_codes: DEFAULT_EXCLUDED_STATUS_CODES.to_vec(),
        }
    }
}
