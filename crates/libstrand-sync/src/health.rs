//! Per-direction channel health

use std::time::Duration;

use libstrand_core::config::SyncConfig;
use libstrand_core::types::remote::{ChannelHealth, HealthState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    pub max_failures: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for HealthPolicy {
    fn from(config: &SyncConfig) -> Self {
        Self {
            max_failures: config.max_failures.max(1),
            retry_base: Duration::from_millis(config.retry_base_ms),
            retry_max: Duration::from_millis(config.retry_max_ms),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthMonitor {
    policy: HealthPolicy,
    health: ChannelHealth,
}

impl HealthMonitor {
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            policy,
            health: ChannelHealth::idle(),
        }
    }

    pub fn health(&self) -> &ChannelHealth {
        &self.health
    }

    pub fn record_success(&mut self, at_utc_ms: u64) {
        self.health.failure_count = 0;
        self.health.last_success_utc_ms = Some(at_utc_ms);
        self.health.state = HealthState::Idle;
    }

    pub fn record_failure(&mut self, at_utc_ms: u64) {
        self.health.failure_count = self.health.failure_count.saturating_add(1);
        self.health.last_failure_utc_ms = Some(at_utc_ms);
        self.health.state = if self.health.failure_count >= self.policy.max_failures {
            HealthState::Error
        } else {
            HealthState::Running
        };
    }

    /// Backoff before the next attempt; zero while healthy
    pub fn retry_delay(&self) -> Duration {
        backoff(&self.policy, self.health.failure_count)
    }
}

/// `min(base * 2^(failures - 1), max)`
pub fn backoff(policy: &HealthPolicy, failures: u32) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let factor = 2u32.saturating_pow(failures - 1);
    policy
        .retry_base
        .checked_mul(factor)
        .unwrap_or(policy.retry_max)
        .min(policy.retry_max)
}
