//! Retry decisions for failed sends and connection attempts
//!
//! A policy is a pure function of the retry count and the last status. The default policy is
//! exponential backoff with jitter; policies can be swapped on a live client and only affect
//! decisions taken after the swap.

use crate::status::IotHubStatusCode;
use rand::Rng;
use std::fmt;
use std::time::Duration;

/// Outcome of a single retry decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub wait: Duration,
}

impl RetryDecision {
    pub fn retry_after(wait: Duration) -> Self {
        Self {
            should_retry: true,
            wait,
        }
    }

    pub fn give_up() -> Self {
        Self {
            should_retry: false,
            wait: Duration::ZERO,
        }
    }
}

/// Decide whether an operation that failed with `last_status` should be attempted again
pub trait RetryPolicy: Send + Sync + fmt::Debug {
    /// `retry_count` is the number of retries already performed (0 on the first failure)
    fn decide(&self, retry_count: u32, last_status: IotHubStatusCode) -> RetryDecision;
}

/// `min(max_delay, base_delay * 2^n) + uniform(0, jitter)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExponentialBackoffWithJitter {
    /// Maximum number of retries (None = unlimited)
    pub max_retries: Option<u32>,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for ExponentialBackoffWithJitter {
    fn default() -> Self {
        Self {
            max_retries: None,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: Duration::from_millis(100),
        }
    }
}

impl ExponentialBackoffWithJitter {
    pub fn new(
        max_retries: Option<u32>,
        base_delay: Duration,
        max_delay: Duration,
        jitter: Duration,
    ) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            jitter,
        }
    }

    /// Deterministic part of the wait for the given retry count
    pub fn backoff_without_jitter(&self, retry_count: u32) -> Duration {
        let base_ms = self.base_delay.as_millis().min(u64::MAX as u128) as u64;
        let max_ms = self.max_delay.as_millis().min(u64::MAX as u128) as u64;
        let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
    }

    fn jitter_sample(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis().min(u64::MAX as u128) as u64;
        if jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

impl RetryPolicy for ExponentialBackoffWithJitter {
    fn decide(&self, retry_count: u32, last_status: IotHubStatusCode) -> RetryDecision {
        if !last_status.is_retryable() {
            return RetryDecision::give_up();
        }

        if let Some(max_retries) = self.max_retries {
            if retry_count >= max_retries {
                return RetryDecision::give_up();
            }
        }

        RetryDecision::retry_after(self.backoff_without_jitter(retry_count) + self.jitter_sample())
    }
}

/// Never retries; every failure is final
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn decide(&self, _retry_count: u32, _last_status: IotHubStatusCode) -> RetryDecision {
        RetryDecision::give_up()
    }
}
