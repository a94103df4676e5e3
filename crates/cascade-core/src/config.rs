//! Engine configuration types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub rate_limits: RateLimitConfig,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub limits: ExecutionLimits,
    pub response: ResponseConfig,
    /// Reserved. Parsed and surfaced, but the executor always stops on the
    /// first terminal failure.
    pub continue_on_error: bool,
}

/// Sliding-window rate limits, per agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    pub requests_per_day: u32,
    /// Sub-limits applied only to `ApiCall` slots.
    pub api_calls_per_minute: u32,
    pub api_calls_per_hour: u32,
    /// Fixed delay inserted between granted slots. Zero disables the hook.
    pub throttle_delay_ms: u64,
    /// Per-agent overrides; an entry replaces the defaults wholesale.
    pub per_agent: HashMap<String, AgentRateLimits>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            requests_per_hour: 1000,
            requests_per_day: 10_000,
            api_calls_per_minute: 30,
            api_calls_per_hour: 500,
            throttle_delay_ms: 0,
            per_agent: HashMap::new(),
        }
    }
}

/// The per-agent override shape: the same knobs minus the override table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentRateLimits {
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    pub requests_per_day: u32,
    pub api_calls_per_minute: u32,
    pub api_calls_per_hour: u32,
    pub throttle_delay_ms: u64,
}

impl Default for AgentRateLimits {
    fn default() -> Self {
        let base = RateLimitConfig::default();
        Self {
            requests_per_minute: base.requests_per_minute,
            requests_per_hour: base.requests_per_hour,
            requests_per_day: base.requests_per_day,
            api_calls_per_minute: base.api_calls_per_minute,
            api_calls_per_hour: base.api_calls_per_hour,
            throttle_delay_ms: base.throttle_delay_ms,
        }
    }
}

impl From<&RateLimitConfig> for AgentRateLimits {
    fn from(cfg: &RateLimitConfig) -> Self {
        Self {
            requests_per_minute: cfg.requests_per_minute,
            requests_per_hour: cfg.requests_per_hour,
            requests_per_day: cfg.requests_per_day,
            api_calls_per_minute: cfg.api_calls_per_minute,
            api_calls_per_hour: cfg.api_calls_per_hour,
            throttle_delay_ms: cfg.throttle_delay_ms,
        }
    }
}

/// Retry policy knobs for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_base: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            backoff_base: 2.0,
            jitter: true,
        }
    }
}

/// Result cache knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub default_ttl_sec: u64,
    pub max_size: usize,
    /// Per-kind TTL overrides, keyed by kind name. Zero disables caching for
    /// that kind.
    pub per_kind_ttl_sec: HashMap<String, u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_sec: 300,
            max_size: 1000,
            per_kind_ttl_sec: HashMap::new(),
        }
    }
}

/// Hard caps on a single execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionLimits {
    pub max_operations_per_workflow: usize,
    pub max_workflow_duration_ms: u64,
    pub max_data_model_bytes: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_operations_per_workflow: 100,
            max_workflow_duration_ms: 30_000,
            max_data_model_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Size bounds applied to the `data` projection in execution responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResponseConfig {
    pub max_string_bytes: usize,
    pub max_array_items: usize,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            max_string_bytes: 1024,
            max_array_items: 50,
        }
    }
}
