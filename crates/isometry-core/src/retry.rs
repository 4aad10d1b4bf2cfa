//! # Retry State
//!
//! Pure retry bookkeeping for host calls. The caller owns a [`RetryState`]
//! value and asks it what to do after each failure; nothing here sleeps.
//!
//! ## Backoff Formula
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  delay(attempt) = min(base × 2^attempt, max)                            │
//! │                 + jitter × ratio × min(base × 2^attempt, max)           │
//! │                                                                         │
//! │  jitter ∈ [0, 1) is supplied by the caller, ratio defaults to 0.1      │
//! │                                                                         │
//! │  base 200ms:  attempt 0 → 200–220ms                                    │
//! │               attempt 1 → 400–440ms                                    │
//! │               attempt 2 → budget exhausted (max_attempts = 3)          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use crate::error::BridgeError;

/// Retry budget and backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on the exponential part of the delay.
    pub max_delay: Duration,
    /// Jitter as a fraction of the delay.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            jitter_ratio: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn no_retry() -> Self {
        RetryPolicy {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Backoff delay after failed attempt number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32, jitter: f64) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        let exponential = self.base_delay.saturating_mul(factor).min(self.max_delay);
        let jitter = jitter.clamp(0.0, 1.0) * self.jitter_ratio.max(0.0);
        exponential + exponential.mul_f64(jitter)
    }
}

/// What the caller should do after a failure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    /// Wait `delay`, then try again carrying `next`.
    Retry { delay: Duration, next: RetryState },
    /// Surface the error.
    GiveUp,
}

/// Attempts made so far for one logical call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    attempt: u32,
}

impl RetryState {
    pub fn new() -> Self {
        RetryState::default()
    }

    /// Number of attempts that already failed.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Attempts left after the current one.
    pub fn remaining(&self, policy: &RetryPolicy) -> u32 {
        policy.max_attempts.saturating_sub(self.attempt + 1)
    }

    /// Decides whether to retry after `error`.
    ///
    /// Non-retriable errors and an exhausted budget both give up.
    pub fn next(&self, policy: &RetryPolicy, error: &BridgeError, jitter: f64) -> RetryDecision {
        if !error.is_retryable() || self.remaining(policy) == 0 {
            return RetryDecision::GiveUp;
        }

        RetryDecision::Retry {
            delay: policy.delay_for(self.attempt, jitter),
            next: RetryState {
                attempt: self.attempt + 1,
            },
        }
    }
}
