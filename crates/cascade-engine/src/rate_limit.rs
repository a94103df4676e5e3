//! Per-agent sliding-window rate limiting.
//!
//! Timestamp buckets per agent at minute/hour/day granularity, plus
//! `ApiCall` sub-counters. Stale timestamps are evicted on every check; a
//! denial reports how long until the earliest relevant window frees a slot.
//! A denied acquisition leaves no trace: the request is recorded only when
//! granted.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use cascade_core::{AgentId, AgentRateLimits, EngineError, RateLimitConfig};
use cascade_catalog::OperationKind;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(86_400);

#[derive(Debug, Default)]
struct AgentWindow {
    /// Grant timestamps, oldest first, retained for at most a day.
    requests: VecDeque<Instant>,
    /// Subset of grants that were `ApiCall` slots.
    api_calls: VecDeque<Instant>,
    last_granted: Option<Instant>,
}

impl AgentWindow {
    fn evict(&mut self, now: Instant) {
        // checked_sub: the monotonic clock may be younger than a day.
        let Some(cutoff) = now.checked_sub(DAY) else {
            return;
        };
        while self.requests.front().is_some_and(|t| *t < cutoff) {
            self.requests.pop_front();
        }
        while self.api_calls.front().is_some_and(|t| *t < cutoff) {
            self.api_calls.pop_front();
        }
    }

    fn idle_since(&self) -> Option<Instant> {
        self.last_granted
    }
}

/// Usage snapshot for one agent.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    pub requests_last_minute: usize,
    pub requests_last_hour: usize,
    pub requests_last_day: usize,
    pub api_calls_last_minute: usize,
    pub api_calls_last_hour: usize,
}

/// Process-wide limiter shared by concurrent executions.
#[derive(Debug)]
pub struct RateLimiter {
    defaults: AgentRateLimits,
    overrides: RwLock<HashMap<AgentId, AgentRateLimits>>,
    windows: RwLock<HashMap<AgentId, AgentWindow>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let mut overrides = HashMap::new();
        for (agent, limits) in &config.per_agent {
            overrides.insert(AgentId::new(agent.clone()), limits.clone());
        }
        Self {
            defaults: AgentRateLimits::from(config),
            overrides: RwLock::new(overrides),
            windows: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the limits for one agent.
    pub async fn set_agent_limits(&self, agent: impl Into<AgentId>, limits: AgentRateLimits) {
        self.overrides.write().await.insert(agent.into(), limits);
    }

    async fn limits_for(&self, agent: &AgentId) -> AgentRateLimits {
        self.overrides
            .read()
            .await
            .get(agent)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }

    /// Ask for an execution slot. On success the grant is recorded and, when
    /// the throttle hook is configured, a fixed inter-request delay has been
    /// honoured. On denial nothing is recorded and the error carries
    /// `retryAfterMs`.
    pub async fn acquire(
        &self,
        agent: &AgentId,
        kind: OperationKind,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let limits = self.limits_for(agent).await;
        let throttle_wait = {
            let mut windows = self.windows.write().await;
            let window = windows.entry(agent.clone()).or_default();
            let now = Instant::now();
            window.evict(now);

            let api_call = kind == OperationKind::ApiCall;
            let checks: [(bool, Duration, u32, &str); 5] = [
                (false, MINUTE, limits.requests_per_minute, "requests per minute"),
                (false, HOUR, limits.requests_per_hour, "requests per hour"),
                (false, DAY, limits.requests_per_day, "requests per day"),
                (true, MINUTE, limits.api_calls_per_minute, "API calls per minute"),
                (true, HOUR, limits.api_calls_per_hour, "API calls per hour"),
            ];
            for (api_only, span, limit, label) in checks {
                if api_only && !api_call {
                    continue;
                }
                let bucket = if api_only {
                    &window.api_calls
                } else {
                    &window.requests
                };
                if let Some(retry_after) = window_denial(bucket, span, limit, now) {
                    debug!(agent = %agent, label, "rate limit denied");
                    return Err(EngineError::RateLimit {
                        message: format!("{limit} {label}"),
                        retry_after_ms: retry_after.as_millis() as u64,
                    });
                }
            }

            let throttle_wait = match (limits.throttle_delay_ms, window.last_granted) {
                (0, _) | (_, None) => Duration::ZERO,
                (delay_ms, Some(last)) => {
                    Duration::from_millis(delay_ms).saturating_sub(now.duration_since(last))
                }
            };

            window.requests.push_back(now);
            if api_call {
                window.api_calls.push_back(now);
            }
            window.last_granted = Some(now);
            throttle_wait
        };

        if !throttle_wait.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep(throttle_wait) => {}
            }
        }
        Ok(())
    }

    /// Current usage for an agent.
    pub async fn status(&self, agent: &AgentId) -> RateLimitStatus {
        let mut windows = self.windows.write().await;
        let window = windows.entry(agent.clone()).or_default();
        let now = Instant::now();
        window.evict(now);
        RateLimitStatus {
            requests_last_minute: count_within(&window.requests, MINUTE, now),
            requests_last_hour: count_within(&window.requests, HOUR, now),
            requests_last_day: count_within(&window.requests, DAY, now),
            api_calls_last_minute: count_within(&window.api_calls, MINUTE, now),
            api_calls_last_hour: count_within(&window.api_calls, HOUR, now),
        }
    }

    /// Reclaim windows for agents with no activity in the last day.
    pub async fn cleanup(&self) {
        let mut windows = self.windows.write().await;
        let now = Instant::now();
        windows.retain(|_, window| {
            window.evict(now);
            window
                .idle_since()
                .is_some_and(|last| now.duration_since(last) < DAY)
        });
    }
}

/// If granting one more slot would break `limit` within `span`, the wait
/// until the earliest of the newest `limit` timestamps leaves the window.
fn window_denial(
    bucket: &VecDeque<Instant>,
    span: Duration,
    limit: u32,
    now: Instant,
) -> Option<Duration> {
    let limit = limit as usize;
    let in_window = count_within(bucket, span, now);
    if in_window < limit {
        return None;
    }
    // The (in_window - limit + 1)-th oldest in-window timestamp must expire
    // before a slot frees up.
    let start = bucket.len() - in_window;
    let blocking = bucket[start + (in_window - limit)];
    Some((blocking + span).saturating_duration_since(now).max(Duration::from_millis(1)))
}

fn count_within(bucket: &VecDeque<Instant>, span: Duration, now: Instant) -> usize {
    bucket
        .iter()
        .rev()
        .take_while(|t| now.duration_since(**t) < span)
        .count()
}
