//! # Circuit Breaker Metrics
//!
//! Snapshots of individual breaker state and system-wide health summaries,
//! used by the pipeline stats API and periodic stats logging.

use crate::resilience::CircuitState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Point-in-time statistics for a single circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitStats {
    /// Component name the breaker protects
    pub name: String,

    /// Current circuit state
    pub state: CircuitState,

    /// Counted failures since the last reset
    pub failure_count: u64,

    /// Successes since the last reset
    pub success_count: u64,

    /// Calls attempted since the last reset, rejected calls included
    pub total_calls: u64,

    /// Calls rejected without invoking the operation since the last reset
    pub rejected_calls: u64,

    /// Failures ignored because they matched an expected error or client status
    pub ignored_failures: u64,

    /// failures / (failures + successes), 0.0 to 1.0
    pub failure_rate: f64,

    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_reset_at: DateTime<Utc>,
}

impl CircuitStats {
    /// Failure rate over counted outcomes, zero when nothing was recorded
    pub fn compute_failure_rate(failures: u64, successes: u64) -> f64 {
        let total = failures + successes;
        if total == 0 {
            return 0.0;
        }
        failures as f64 / total as f64
    }

    /// Get human-readable state description
    pub fn state_description(&self) -> &'static str {
        match self.state {
            CircuitState::Closed => "Healthy - Normal operation",
            CircuitState::Open => "Failing - Rejecting all calls",
            CircuitState::HalfOpen => "Recovering - Probing dependency",
        }
    }

    /// Format stats for logging
    pub fn format_summary(&self) -> String {
        format!(
            "{}: {} | Calls: {} | Failures: {} | Failure rate: {:.1}% | Rejected: {}",
            self.name,
            self.state_description(),
            self.total_calls,
            self.failure_count,
            self.failure_rate * 100.0,
            self.rejected_calls
        )
    }
}

/// Overall health derived from the set of breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    Healthy,
    Degraded,
    Critical,
}

/// Aggregated breaker health across all registered dependencies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub total: usize,
    /// Breakers in CLOSED state
    pub healthy: usize,
    /// Breakers in HALF_OPEN state
    pub degraded: usize,
    /// Breakers in OPEN state
    pub failed: usize,
    pub overall: OverallHealth,
    pub open_circuits: Vec<String>,
}

impl HealthSummary {
    /// Build a summary from individual breaker stats
    ///
    /// Any open circuit makes the system at least degraded; it becomes
    /// critical once open circuits outnumber closed ones.
    pub fn from_stats<'a>(stats: impl IntoIterator<Item = &'a CircuitStats>) -> Self {
        let mut summary = Self {
            total: 0,
            healthy: 0,
            degraded: 0,
            failed: 0,
            overall: OverallHealth::Healthy,
            open_circuits: Vec::new(),
        };

        for stat in stats {
            summary.total += 1;
            match stat.state {
                CircuitState::Closed => summary.healthy += 1,
                CircuitState::HalfOpen => summary.degraded += 1,
                CircuitState::Open => {
                    summary.failed += 1;
                    summary.open_circuits.push(stat.name.clone());
                }
            }
        }

        summary.overall = if summary.failed > 0 {
            if summary.failed > summary.healthy {
                OverallHealth::Critical
            } else {
                OverallHealth::Degraded
            }
        } else if summary.degraded > 0 {
            OverallHealth::Degraded
        } else {
            OverallHealth::Healthy
        };
        summary.open_circuits.sort();
        summary
    }

    /// Fraction of breakers currently closed (1.0 with no breakers)
    pub fn health_score(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.healthy as f64 / self.total as f64
    }
}

/// Stats for every registered breaker keyed by component name
pub type CircuitStatsMap = BTreeMap<String, CircuitStats>;

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(name: &str, state: CircuitState) -> CircuitStats {
        CircuitStats {
            name: name.to_string(),
            state,
            failure_count: 0,
            success_count: 0,
            total_calls: 0,
            rejected_calls: 0,
            ignored_failures: 0,
            failure_rate: 0.0,
            last_failure_at: None,
            last_success_at: None,
            last_reset_at: Utc::now(),
        }
    }

    #[test]
    fn test_failure_rate() {
        assert_eq!(CircuitStats::compute_failure_rate(0, 0), 0.0);
        assert_eq!(CircuitStats::compute_failure_rate(1, 3), 0.25);
        assert_eq!(CircuitStats::compute_failure_rate(2, 0), 1.0);
    }

    #[test]
    fn test_health_summary() {
        let all_closed = [stats("a", CircuitState::Closed), stats("b", CircuitState::Closed)];
        let summary = HealthSummary::from_stats(&all_closed);
        assert_eq!(summary.overall, OverallHealth::Healthy);
        assert_eq!(summary.health_score(), 1.0);

        let half_open = [stats("a", CircuitState::Closed), stats("b", CircuitState::HalfOpen)];
        assert_eq!(HealthSummary::from_stats(&half_open).overall, OverallHealth::Degraded);

        let one_open = [
            stats("a", CircuitState::Closed),
            stats("b", CircuitState::Closed),
            stats("c", CircuitState::Open),
        ];
        let summary = HealthSummary::from_stats(&one_open);
        assert_eq!(summary.overall, OverallHealth::Degraded);
        assert_eq!(summary.open_circuits, vec!["c".to_string()]);

        let mostly_open = [
            stats("a", CircuitState::Closed),
            stats("b", CircuitState::Open),
            stats("c", CircuitState::Open),
        ];
        let summary = HealthSummary::from_stats(&mostly_open);
        assert_eq!(summary.overall, OverallHealth::Critical);
        assert_eq!(summary.failed, 2);
    }

    #[test]
    fn test_empty_summary_is_healthy() {
        let summary = HealthSummary::from_stats(Vec::<CircuitStats>::new().iter());
        assert_eq!(summary.total, 0);
        assert_eq!(summary.overall, OverallHealth::Healthy);
    }
}
