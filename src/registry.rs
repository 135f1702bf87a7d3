//! Registry of named resilience managers
//!
//! Call sites that share a logical downstream service ("llm",
//! "vector-search") must share breaker and bulkhead state, so managers are
//! looked up by name here instead of being created per call. The registry
//! is an explicit value owned by the application's composition root and
//! handed to whoever needs it; tests construct isolated registries and
//! nothing in this crate is process-global.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::circuit_breaker::CircuitState;
use crate::config::ResilienceConfig;
use crate::events::ResilienceListener;
use crate::manager::{ResilienceManager, ResilienceStats};

/// Process-wide liveness view over all registered circuits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// True when no circuit is open
    pub healthy: bool,
    /// Names of services whose circuit is currently open, sorted
    pub open_circuits: Vec<String>,
}

/// Lookup of [`ResilienceManager`] instances by service name.
pub struct ResilienceRegistry {
    managers: RwLock<HashMap<String, Arc<ResilienceManager>>>,
    listeners: Vec<Arc<dyn ResilienceListener>>,
}

impl ResilienceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            managers: RwLock::new(HashMap::new()),
            listeners: Vec::new(),
        }
    }

    /// Create a registry whose managers report events to `listener`.
    pub fn with_listener(listener: Arc<dyn ResilienceListener>) -> Self {
        Self {
            managers: RwLock::new(HashMap::new()),
            listeners: vec![listener],
        }
    }

    /// Return the manager for `name`, constructing it from `config` on
    /// first reference. Construction is atomic with respect to concurrent
    /// callers: exactly one manager per name ever exists, so breaker
    /// history is never silently discarded. `config` is ignored when the
    /// manager already exists.
    pub async fn get_or_create(
        &self,
        name: &str,
        config: ResilienceConfig,
    ) -> Arc<ResilienceManager> {
        {
            let managers = self.managers.read().await;
            if let Some(manager) = managers.get(name) {
                return manager.clone();
            }
        }

        let mut managers = self.managers.write().await;
        managers
            .entry(name.to_string())
            .or_insert_with(|| {
                info!(service = name, tier = ?config.tier, "creating resilience manager");
                Arc::new(ResilienceManager::with_listeners(
                    name,
                    config,
                    self.listeners.clone(),
                ))
            })
            .clone()
    }

    /// The manager for `name`, if one has been created.
    pub async fn get(&self, name: &str) -> Option<Arc<ResilienceManager>> {
        self.managers.read().await.get(name).cloned()
    }

    /// Combined statistics for every registered service.
    pub async fn all_stats(&self) -> HashMap<String, ResilienceStats> {
        let managers: Vec<_> = {
            let guard = self.managers.read().await;
            guard
                .iter()
                .map(|(name, manager)| (name.clone(), manager.clone()))
                .collect()
        };
        let mut stats = HashMap::with_capacity(managers.len());
        for (name, manager) in managers {
            stats.insert(name, manager.stats().await);
        }
        stats
    }

    /// Reset every registered manager. Administrative operation.
    pub async fn reset_all(&self) {
        let managers: Vec<_> = self.managers.read().await.values().cloned().collect();
        for manager in managers {
            manager.reset().await;
        }
        info!("reset all resilience managers");
    }

    /// Read-only aggregation for liveness/readiness endpoints: the process
    /// is healthy while no circuit is open.
    pub async fn health(&self) -> HealthReport {
        let managers: Vec<_> = {
            let guard = self.managers.read().await;
            guard
                .iter()
                .map(|(name, manager)| (name.clone(), manager.clone()))
                .collect()
        };
        let mut open_circuits = Vec::new();
        for (name, manager) in managers {
            if let Some(breaker) = manager.circuit_breaker() {
                if breaker.state().await == CircuitState::Open {
                    open_circuits.push(name);
                }
            }
        }
        open_circuits.sort();
        HealthReport {
            healthy: open_circuits.is_empty(),
            open_circuits,
        }
    }
}

impl Default for ResilienceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResilienceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceRegistry").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;

    #[tokio::test]
    async fn same_name_shares_one_manager() {
        let registry = ResilienceRegistry::new();

        let a = registry
            .get_or_create("llm", ResilienceConfig::critical())
            .await;
        let b = registry
            .get_or_create("llm", ResilienceConfig::optional())
            .await;
        let c = registry
            .get_or_create("vector-search", ResilienceConfig::standard())
            .await;

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        // The second config was ignored; the first one won.
        assert_eq!(b.config().failure_threshold, 3);
    }

    #[tokio::test]
    async fn concurrent_first_references_construct_once() {
        let registry = Arc::new(ResilienceRegistry::new());

        let managers = join_all((0..16).map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .get_or_create("llm", ResilienceConfig::standard())
                    .await
            })
        }))
        .await;

        let first = managers[0].as_ref().unwrap().clone();
        for manager in managers {
            assert!(Arc::ptr_eq(&first, &manager.unwrap()));
        }
    }

    #[tokio::test]
    async fn health_lists_open_circuits() {
        let registry = ResilienceRegistry::new();
        let healthy_cfg = ResilienceConfig::standard();
        let failing_cfg = ResilienceConfig {
            failure_threshold: 1,
            ..ResilienceConfig::standard()
        };

        let _ = registry.get_or_create("vector-search", healthy_cfg).await;
        let llm = registry.get_or_create("llm", failing_cfg).await;

        assert!(registry.health().await.healthy);

        let _ = llm
            .execute("call", || async { Err::<(), _>("downstream down") })
            .await;

        let health = registry.health().await;
        assert!(!health.healthy);
        assert_eq!(health.open_circuits, vec!["llm".to_string()]);

        registry.reset_all().await;
        assert!(registry.health().await.healthy);
    }

    #[tokio::test]
    async fn all_stats_covers_every_service() {
        let registry = ResilienceRegistry::new();
        let llm = registry
            .get_or_create("llm", ResilienceConfig::standard())
            .await;
        let _ = registry
            .get_or_create("webhook", ResilienceConfig::optional())
            .await;

        let _ = llm.execute("call", || async { Ok::<_, &str>(()) }).await;

        let stats = registry.all_stats().await;
        assert_eq!(stats.len(), 2);
        assert_eq!(stats["llm"].successes, 1);
        assert_eq!(stats["webhook"].successes, 0);
    }
}
