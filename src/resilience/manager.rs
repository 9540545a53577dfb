//! # Circuit Breaker Manager
//!
//! Registry of circuit breakers keyed by dependency name. Breakers are
//! created lazily on first reference with the per-component configuration
//! (or the default one) and live for the life of the manager.

use crate::config::CircuitBreakerSettings;
use crate::resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStats, CircuitStatsMap,
    HealthSummary,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Manager for circuit breakers across the pipeline's dependencies
#[derive(Debug)]
pub struct CircuitBreakerManager {
    /// Collection of circuit breakers by component name
    circuit_breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,

    /// Configuration
    settings: CircuitBreakerSettings,
}

impl CircuitBreakerManager {
    /// Create new circuit breaker manager from configuration
    pub fn from_config(settings: &CircuitBreakerSettings) -> Self {
        info!(
            components = settings.component_configs.len(),
            "Initializing circuit breaker manager"
        );

        Self {
            circuit_breakers: RwLock::new(HashMap::new()),
            settings: settings.clone(),
        }
    }

    /// Get or create circuit breaker for a component
    pub fn get_circuit_breaker(&self, component_name: &str) -> Arc<CircuitBreaker> {
        let config = self
            .settings
            .config_for_component(component_name)
            .to_resilience_config();
        self.get_circuit_breaker_with(component_name, config)
    }

    /// Get or create circuit breaker for a component with explicit configuration
    ///
    /// The configuration only applies when the breaker does not exist yet.
    pub fn get_circuit_breaker_with(
        &self,
        component_name: &str,
        config: CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        {
            let breakers = self.circuit_breakers.read();
            if let Some(breaker) = breakers.get(component_name) {
                return Arc::clone(breaker);
            }
        }

        let mut breakers = self.circuit_breakers.write();

        // Double-check pattern (another caller might have created it)
        if let Some(breaker) = breakers.get(component_name) {
            return Arc::clone(breaker);
        }

        let breaker = Arc::new(CircuitBreaker::new(component_name, config));
        breakers.insert(component_name.to_string(), Arc::clone(&breaker));

        info!(
            component = component_name,
            total_circuit_breakers = breakers.len(),
            "Created new circuit breaker"
        );

        breaker
    }

    /// Get all circuit breaker names
    pub fn list_components(&self) -> Vec<String> {
        let mut names: Vec<String> = self.circuit_breakers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Get stats for a specific circuit breaker
    pub fn stats(&self, component_name: &str) -> Option<CircuitStats> {
        self.circuit_breakers
            .read()
            .get(component_name)
            .map(|breaker| breaker.stats())
    }

    /// Get stats for every registered circuit breaker
    pub fn all_stats(&self) -> CircuitStatsMap {
        self.circuit_breakers
            .read()
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.stats()))
            .collect()
    }

    /// Names of breakers currently in OPEN state
    pub fn open_circuits(&self) -> Vec<String> {
        let mut open: Vec<String> = self
            .circuit_breakers
            .read()
            .iter()
            .filter(|(_, breaker)| breaker.state() == CircuitState::Open)
            .map(|(name, _)| name.clone())
            .collect();
        open.sort();
        open
    }

    /// Aggregated health across all breakers
    pub fn health_summary(&self) -> HealthSummary {
        let stats = self.all_stats();
        HealthSummary::from_stats(stats.values())
    }

    /// Reset every breaker to CLOSED with cleared counters
    pub fn reset_all(&self) {
        info!("🔄 Resetting all circuit breakers");
        for breaker in self.circuit_breakers.read().values() {
            breaker.reset();
        }
    }

    /// Clear counters on breakers that have been quiet for their monitoring period
    pub fn reset_stale_stats(&self) -> usize {
        self.circuit_breakers
            .read()
            .values()
            .filter(|breaker| breaker.reset_stale_stats())
            .count()
    }

    /// Spawn the monitoring task that periodically resets quiet breakers
    pub fn spawn_monitor(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let period = Duration::from_millis(self.settings.monitor_interval_ms.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reset = self.reset_stale_stats();
                        if reset > 0 {
                            debug!(reset_count = reset, "Circuit breaker monitoring window rolled over");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Circuit breaker monitor stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}
