//! Per-service resilience configuration
//!
//! A [`ResilienceConfig`] fully describes the protection applied to one
//! logical downstream service. The crate never loads configuration itself;
//! the host resolves it (file, env, defaults) and hands over the finished
//! struct.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Importance tier for a protected downstream service.
///
/// Tiers only select default capacity values per call-site importance.
/// Each named bulkhead is independent; no cross-tier prioritization is
/// applied at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceTier {
    /// Must-work operations (primary LLM calls, session store)
    Critical,
    /// Normal operations (vector search, database queries)
    Standard,
    /// Best-effort operations (webhooks, background enrichment)
    Optional,
}

/// Configuration for one named resilience manager.
///
/// Immutable after the manager is constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Failures within `failure_window` before the circuit opens
    pub failure_threshold: u32,
    /// Rolling window for failure counting; failures spaced further apart
    /// than this never accumulate
    #[serde(with = "humantime_serde")]
    pub failure_window: Duration,
    /// Cooldown before an open circuit admits a trial call
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
    /// Deadline applied to each protected call
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
    /// Maximum concurrently executing calls
    pub max_concurrent: usize,
    /// Maximum callers waiting for a slot before rejection
    pub max_queue_size: usize,
    /// Importance tier of this service
    pub tier: ServiceTier,
    /// Disable to skip the circuit breaker layer entirely
    pub circuit_breaker_enabled: bool,
    /// Disable to skip the bulkhead layer entirely
    pub bulkhead_enabled: bool,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self::standard()
    }
}

impl ResilienceConfig {
    /// Configuration for critical services: trips early, recovers
    /// cautiously, generous concurrency.
    pub fn critical() -> Self {
        Self {
            failure_threshold: 3,
            failure_window: Duration::from_secs(30),
            reset_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(10),
            max_concurrent: 16,
            max_queue_size: 32,
            tier: ServiceTier::Critical,
            circuit_breaker_enabled: true,
            bulkhead_enabled: true,
        }
    }

    /// Default configuration for standard services.
    pub fn standard() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
            max_concurrent: 8,
            max_queue_size: 16,
            tier: ServiceTier::Standard,
            circuit_breaker_enabled: true,
            bulkhead_enabled: true,
        }
    }

    /// Configuration for best-effort services: tolerant thresholds, tight
    /// concurrency so they never crowd out more important work.
    pub fn optional() -> Self {
        Self {
            failure_threshold: 10,
            failure_window: Duration::from_secs(120),
            reset_timeout: Duration::from_secs(60),
            call_timeout: Duration::from_secs(60),
            max_concurrent: 4,
            max_queue_size: 8,
            tier: ServiceTier::Optional,
            circuit_breaker_enabled: true,
            bulkhead_enabled: true,
        }
    }

    /// Preset for the given tier.
    pub fn for_tier(tier: ServiceTier) -> Self {
        match tier {
            ServiceTier::Critical => Self::critical(),
            ServiceTier::Standard => Self::standard(),
            ServiceTier::Optional => Self::optional(),
        }
    }
}
