//! Retry and backoff policy.
//!
//! Three distinct regimes, per the orchestration design:
//! - external submit/poll calls are retried only by re-polling on the next
//!   agent cycle (no in-cycle retry loop);
//! - message delivery uses bounded replay tiers with a quadratic, randomized
//!   delay;
//! - lock staleness uses a fixed ttl, never exponential.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Delivery/backoff knobs, loaded from config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay in seconds for message redelivery.
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    /// Hard cap on any single computed delay.
    #[serde(default = "default_max_retry_delay_secs")]
    pub max_retry_delay_secs: u64,
    /// Number of replay tiers before a message is left visible as
    /// delivered-but-unconfirmed.
    #[serde(default = "default_max_replay_times")]
    pub max_replay_times: u32,
    /// Fixed staleness ttl for row leases.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: i64,
}

fn default_base_delay_secs() -> u64 {
    60
}

fn default_max_retry_delay_secs() -> u64 {
    3600
}

fn default_max_replay_times() -> u32 {
    3
}

fn default_lock_ttl_secs() -> i64 {
    3600
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_secs: default_base_delay_secs(),
            max_retry_delay_secs: default_max_retry_delay_secs(),
            max_replay_times: default_max_replay_times(),
            lock_ttl_secs: default_lock_ttl_secs(),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next delivery attempt for a message on its
    /// `retries`-th retry: `base_delay * retries^2`, randomized within
    /// `[1, delay]`, capped at `max_retry_delay`.
    pub fn message_delay(&self, retries: u32) -> Duration {
        let tier = retries.max(1) as u64;
        let upper = (self.base_delay_secs * tier * tier).clamp(1, self.max_retry_delay_secs);
        let secs = rand::thread_rng().gen_range(1..=upper);
        Duration::from_secs(secs)
    }

    /// Whether the replay budget for a message is exhausted.
    pub fn replay_exhausted(&self, retries: u32) -> bool {
        retries >= self.max_replay_times
    }
}

/// Jitter an idle-sleep interval by up to `jitter_secs` extra seconds, so
/// replica agents polling the same tables do not wake in lock-step.
pub fn jittered(interval: Duration, jitter_secs: u64) -> Duration {
    if jitter_secs == 0 {
        return interval;
    }
    let extra = rand::thread_rng().gen_range(0..=jitter_secs);
    interval + Duration::from_secs(extra)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_delay_is_bounded_by_quadratic_tier() {
        let policy = RetryPolicy {
            base_delay_secs: 10,
            max_retry_delay_secs: 3600,
            max_replay_times: 3,
            lock_ttl_secs: 3600,
        };
        for _ in 0..100 {
            let d1 = policy.message_delay(1).as_secs();
            assert!((1..=10).contains(&d1));
            let d3 = policy.message_delay(3).as_secs();
            assert!((1..=90).contains(&d3));
        }
    }

    #[test]
    fn message_delay_respects_cap() {
        let policy = RetryPolicy {
            base_delay_secs: 1000,
            max_retry_delay_secs: 120,
            max_replay_times: 3,
            lock_ttl_secs: 3600,
        };
        for _ in 0..50 {
            assert!(policy.message_delay(5).as_secs() <= 120);
        }
    }

    #[test]
    fn zero_retries_treated_as_first_tier() {
        let policy = RetryPolicy::default();
        let d = policy.message_delay(0).as_secs();
        assert!((1..=policy.base_delay_secs).contains(&d));
    }

    #[test]
    fn replay_budget() {
        let policy = RetryPolicy::default();
        assert!(!policy.replay_exhausted(2));
        assert!(policy.replay_exhausted(3));
        assert!(policy.replay_exhausted(10));
    }

    #[test]
    fn jitter_adds_at_most_the_configured_slack() {
        let base = Duration::from_secs(30);
        for _ in 0..50 {
            let j = jittered(base, 5);
            assert!(j >= base && j <= base + Duration::from_secs(5));
        }
        assert_eq!(jittered(base, 0), base);
    }
}
