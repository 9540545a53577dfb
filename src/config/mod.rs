//! # Configuration
//!
//! Typed configuration for every pipeline component. Values are stored in
//! TOML-friendly units (milliseconds, counts) and converted into runtime
//! types (`Duration`, [`BackoffPolicy`], [`CircuitBreakerConfig`]) by helper
//! methods. Every section has defaults, so partial files are valid.

pub mod error;
pub mod loader;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

use crate::constants::{components, DEFAULT_EXCLUDED_STATUS_CODES};
use crate::resilience::{BackoffPolicy, CircuitBreakerConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Root configuration for the delivery pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub deduplication: DeduplicationConfig,
    pub circuit_breakers: CircuitBreakerSettings,
    pub lanes: LanesConfig,
    pub fallback_queue: FallbackQueueConfig,
    pub dead_letter: DeadLetterConfig,
    pub maintenance: MaintenanceConfig,
    /// Breaker name wrapping the outbound transport
    pub transport_component: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            deduplication: DeduplicationConfig::default(),
            circuit_breakers: CircuitBreakerSettings::default(),
            lanes: LanesConfig::default(),
            fallback_queue: FallbackQueueConfig::default(),
            dead_letter: DeadLetterConfig::default(),
            maintenance: MaintenanceConfig::default(),
            transport_component: components::MESSAGING_TRANSPORT.to_string(),
        }
    }
}

impl PipelineConfig {
    /// Validate every section, failing on the first problem found
    pub fn validate(&self) -> ConfigResult<()> {
        self.deduplication.validate()?;
        self.circuit_breakers.validate()?;
        self.lanes.webhook.validate("lanes.webhook")?;
        self.lanes.message.validate("lanes.message")?;
        self.fallback_queue.validate()?;
        self.dead_letter.validate()?;
        self.maintenance.validate()?;

        if self.transport_component.trim().is_empty() {
            return Err(ConfigurationError::invalid_value(
                "transport_component",
                "",
                "must name a circuit breaker component",
            ));
        }
        Ok(())
    }
}

fn require_positive(field: &str, value: u64) -> ConfigResult<()> {
    if value == 0 {
        return Err(ConfigurationError::invalid_value(field, value, "must be greater than 0"));
    }
    Ok(())
}

/// Deduplication cache settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeduplicationConfig {
    /// How long an identifier is remembered
    pub ttl_ms: u64,
    /// How often expired identifiers are swept from memory
    pub sweep_interval_ms: u64,
}

impl Default for DeduplicationConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 3_600_000,
            sweep_interval_ms: 300_000,
        }
    }
}

impl DeduplicationConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        require_positive("deduplication.ttl_ms", self.ttl_ms)?;
        require_positive("deduplication.sweep_interval_ms", self.sweep_interval_ms)
    }
}

/// Per-component circuit breaker settings as written in configuration files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerComponentConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub monitoring_period_ms: u64,
    pub expected_errors: Vec<String>,
    pub excluded_status_codes: Vec<u16>,
}

impl Default for CircuitBreakerComponentConfig {
    fn default() -> Self {
        Self::from_resilience_config(&CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerComponentConfig {
    fn from_resilience_config(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            recovery_timeout_ms: config.recovery_timeout.as_millis() as u64,
            monitoring_period_ms: config.monitoring_period.as_millis() as u64,
            expected_errors: config.expected_errors.clone(),
            excluded_status_codes: config.excluded_status_codes.clone(),
        }
    }

    /// Convert to the runtime breaker configuration
    pub fn to_resilience_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_millis(self.recovery_timeout_ms),
            monitoring_period: Duration::from_millis(self.monitoring_period_ms),
            expected_errors: self.expected_errors.clone(),
            excluded_status_codes: self.excluded_status_codes.clone(),
        }
    }
}

/// Circuit breaker registry settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// How often the monitor checks for quiet breakers to reset
    pub monitor_interval_ms: u64,
    /// Configuration for components without a dedicated entry
    pub default_config: CircuitBreakerComponentConfig,
    /// Per-component overrides keyed by dependency name
    pub component_configs: HashMap<String, CircuitBreakerComponentConfig>,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        let mut component_configs = HashMap::new();
        component_configs.insert(
            components::MESSAGING_TRANSPORT.to_string(),
            CircuitBreakerComponentConfig::from_resilience_config(
                &CircuitBreakerConfig::for_messaging_transport(),
            ),
        );
        component_configs.insert(
            components::DATABASE.to_string(),
            CircuitBreakerComponentConfig::from_resilience_config(&CircuitBreakerConfig::for_database()),
        );
        component_configs.insert(
            components::RECORD_STORE.to_string(),
            CircuitBreakerComponentConfig::from_resilience_config(
                &CircuitBreakerConfig::for_record_store(),
            ),
        );

        Self {
            monitor_interval_ms: 30_000,
            default_config: CircuitBreakerComponentConfig::default(),
            component_configs,
        }
    }
}

impl CircuitBreakerSettings {
    /// Configuration for a component, falling back to the default entry
    pub fn config_for_component(&self, component_name: &str) -> &CircuitBreakerComponentConfig {
        self.component_configs
            .get(component_name)
            .unwrap_or(&self.default_config)
    }

    fn validate(&self) -> ConfigResult<()> {
        require_positive("circuit_breakers.monitor_interval_ms", self.monitor_interval_ms)?;

        self.default_config
            .to_resilience_config()
            .validate()
            .map_err(|e| ConfigurationError::validation_error(format!("circuit_breakers.default_config: {e}")))?;

        for (name, component) in &self.component_configs {
            component.to_resilience_config().validate().map_err(|e| {
                ConfigurationError::validation_error(format!("circuit_breakers.component_configs.{name}: {e}"))
            })?;
        }
        Ok(())
    }
}

/// Settings for one durable queue lane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaneConfig {
    /// Jobs processed at once
    pub concurrency: usize,
    /// Attempts per job, the first one included
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Per-attempt handler timeout
    pub handler_timeout_ms: u64,
    /// Finished records kept for inspection
    pub retain_completed: usize,
    pub retain_failed: usize,
    /// Idle wake-up interval used to pick up delayed retries
    pub poll_interval_ms: u64,
    /// Forward terminal failures to the live-status notifier
    pub notify_on_terminal_failure: bool,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self::message_defaults()
    }
}

impl LaneConfig {
    /// Defaults for the inbound webhook lane
    pub fn webhook_defaults() -> Self {
        Self {
            concurrency: 10,
            max_attempts: 3,
            backoff_base_ms: 2_000,
            backoff_max_ms: 60_000,
            handler_timeout_ms: 30_000,
            retain_completed: 100,
            retain_failed: 500,
            poll_interval_ms: 250,
            notify_on_terminal_failure: false,
        }
    }

    /// Defaults for the outbound message lane
    pub fn message_defaults() -> Self {
        Self {
            concurrency: 5,
            max_attempts: 5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            handler_timeout_ms: 30_000,
            retain_completed: 50,
            retain_failed: 100,
            poll_interval_ms: 250,
            notify_on_terminal_failure: true,
        }
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::exponential(
            self.max_attempts,
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    fn validate(&self, section: &str) -> ConfigResult<()> {
        require_positive(&format!("{section}.concurrency"), self.concurrency as u64)?;
        require_positive(&format!("{section}.max_attempts"), u64::from(self.max_attempts))?;
        require_positive(&format!("{section}.backoff_base_ms"), self.backoff_base_ms)?;
        require_positive(&format!("{section}.handler_timeout_ms"), self.handler_timeout_ms)?;
        require_positive(&format!("{section}.poll_interval_ms"), self.poll_interval_ms)?;

        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(ConfigurationError::invalid_value(
                format!("{section}.backoff_max_ms"),
                self.backoff_max_ms,
                "must be at least backoff_base_ms",
            ));
        }
        Ok(())
    }
}

/// Both durable lanes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LanesConfig {
    pub webhook: LaneConfig,
    pub message: LaneConfig,
}

impl Default for LanesConfig {
    fn default() -> Self {
        Self {
            webhook: LaneConfig::webhook_defaults(),
            message: LaneConfig::message_defaults(),
        }
    }
}

/// In-process fallback queue settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackQueueConfig {
    /// Route inbound submissions here when the durable store rejects them
    pub enabled: bool,
    pub capacity: usize,
    pub max_retries: u32,
    /// Delay before retry N, indexed by retry count; the last entry repeats
    pub retry_delays_ms: Vec<u64>,
    /// Age after which waiting items are discarded by maintenance
    pub max_item_age_ms: u64,
}

impl Default for FallbackQueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 1000,
            max_retries: 3,
            retry_delays_ms: vec![1_000, 2_000, 4_000],
            max_item_age_ms: 1_800_000,
        }
    }
}

impl FallbackQueueConfig {
    /// Delay before the given retry (1-indexed)
    pub fn retry_delay(&self, retry: u32) -> Duration {
        let index = (retry.max(1) - 1) as usize;
        let delay_ms = self
            .retry_delays_ms
            .get(index)
            .or_else(|| self.retry_delays_ms.last())
            .copied()
            .unwrap_or(1_000);
        Duration::from_millis(delay_ms)
    }

    pub fn max_item_age(&self) -> Duration {
        Duration::from_millis(self.max_item_age_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        require_positive("fallback_queue.capacity", self.capacity as u64)?;
        require_positive("fallback_queue.max_item_age_ms", self.max_item_age_ms)?;
        if self.max_retries > 0 && self.retry_delays_ms.is_empty() {
            return Err(ConfigurationError::validation_error(
                "fallback_queue.retry_delays_ms must not be empty when retries are enabled",
            ));
        }
        Ok(())
    }
}

/// Dead-letter retry service settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    pub enabled: bool,
    pub retry_interval_ms: u64,
    /// Records fetched per cycle
    pub batch_size: usize,
    /// Automatic re-attempts before a record is left for operators
    pub max_retries: u32,
    /// Records re-attempted concurrently within a cycle
    pub concurrency: usize,
    /// Pause between sub-batches
    pub batch_pause_ms: u64,
    /// Age after which records are purged by maintenance
    pub retention_ms: u64,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retry_interval_ms: 120_000,
            batch_size: 10,
            max_retries: 3,
            concurrency: 5,
            batch_pause_ms: 1_000,
            retention_ms: 86_400_000,
        }
    }
}

impl DeadLetterConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        require_positive("dead_letter.retry_interval_ms", self.retry_interval_ms)?;
        require_positive("dead_letter.batch_size", self.batch_size as u64)?;
        require_positive("dead_letter.concurrency", self.concurrency as u64)?;
        require_positive("dead_letter.retention_ms", self.retention_ms)
    }
}

/// Periodic housekeeping settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// How often finished jobs are purged
    pub cleanup_interval_ms: u64,
    /// Age after which finished job records are purged
    pub finished_job_retention_ms: u64,
    /// How often queue and breaker stats are logged
    pub stats_log_interval_ms: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_ms: 3_600_000,
            finished_job_retention_ms: 3_600_000,
            stats_log_interval_ms: 60_000,
        }
    }
}

impl MaintenanceConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn finished_job_retention(&self) -> Duration {
        Duration::from_millis(self.finished_job_retention_ms)
    }

    pub fn stats_log_interval(&self) -> Duration {
        Duration::from_millis(self.stats_log_interval_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        require_positive("maintenance.cleanup_interval_ms", self.cleanup_interval_ms)?;
        require_positive("maintenance.finished_job_retention_ms", self.finished_job_retention_ms)?;
        require_positive("maintenance.stats_log_interval_ms", self.stats_log_interval_ms)
    }
}
