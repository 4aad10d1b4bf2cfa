//! # Bridge Configuration
//!
//! Tunables for the transport bridge. Loaded as the `[bridge]` table of the
//! client config file (see `isometry-sync`); every field has a default so a
//! partial table is valid.
//!
//! ```toml
//! [bridge]
//! default_timeout_ms = 10000
//! max_attempts = 3
//! breaker_threshold = 5
//! breaker_reset_ms = 60000
//! offline_queue_capacity = 100
//! probe_interval_secs = 30
//! ```

use std::time::Duration;

use isometry_core::{CircuitBreaker, RetryPolicy, ValidationError};
use serde::{Deserialize, Serialize};

/// Transport bridge settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Deadline for a single attempt (milliseconds).
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Total attempts per call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay (milliseconds).
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    /// Cap on the exponential retry delay (milliseconds).
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,

    /// Jitter as a fraction of the retry delay.
    #[serde(default = "default_retry_jitter")]
    pub retry_jitter: f64,

    /// Consecutive failures that open the breaker.
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,

    /// How long the breaker stays open (milliseconds).
    #[serde(default = "default_breaker_reset_ms")]
    pub breaker_reset_ms: u64,

    /// Envelopes held while disconnected; the oldest is shed when full.
    #[serde(default = "default_offline_queue_capacity")]
    pub offline_queue_capacity: usize,

    /// Health probe period (seconds).
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,

    /// Health probe deadline (milliseconds).
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Operation name the host answers for health probes.
    #[serde(default = "default_probe_operation")]
    pub probe_operation: String,

    /// Stale pending-request sweep period (seconds).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_timeout_ms() -> u64 {
    10_000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    200
}
fn default_retry_max_ms() -> u64 {
    10_000
}
fn default_retry_jitter() -> f64 {
    0.1
}
fn default_breaker_threshold() -> u32 {
    5
}
fn default_breaker_reset_ms() -> u64 {
    60_000
}
fn default_offline_queue_capacity() -> usize {
    100
}
fn default_probe_interval_secs() -> u64 {
    30
}
fn default_probe_timeout_ms() -> u64 {
    5_000
}
fn default_probe_operation() -> String {
    "ping".to_string()
}
fn default_sweep_interval_secs() -> u64 {
    30
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            default_timeout_ms: default_timeout_ms(),
            max_attempts: default_max_attempts(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            retry_jitter: default_retry_jitter(),
            breaker_threshold: default_breaker_threshold(),
            breaker_reset_ms: default_breaker_reset_ms(),
            offline_queue_capacity: default_offline_queue_capacity(),
            probe_interval_secs: default_probe_interval_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
            probe_operation: default_probe_operation(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl BridgeConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Retry policy for `call`.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.retry_base_ms),
            max_delay: Duration::from_millis(self.retry_max_ms),
            jitter_ratio: self.retry_jitter,
        }
    }

    /// Fresh breaker with the configured threshold and window.
    pub fn breaker(&self) -> CircuitBreaker {
        CircuitBreaker::new(
            self.breaker_threshold,
            Duration::from_millis(self.breaker_reset_ms),
        )
    }

    /// Rejects settings that would make the bridge unusable.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let positive = [
            ("default_timeout_ms", self.default_timeout_ms),
            ("max_attempts", u64::from(self.max_attempts)),
            ("breaker_threshold", u64::from(self.breaker_threshold)),
            ("offline_queue_capacity", self.offline_queue_capacity as u64),
            ("probe_interval_secs", self.probe_interval_secs),
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("sweep_interval_secs", self.sweep_interval_secs),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ValidationError::InvalidFormat {
                    field: field.to_string(),
                    reason: "must be greater than 0".to_string(),
                });
            }
        }

        if self.retry_base_ms > self.retry_max_ms {
            return Err(ValidationError::InvalidFormat {
                field: "retry_base_ms".to_string(),
                reason: "must not exceed retry_max_ms".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return Err(ValidationError::InvalidFormat {
                field: "retry_jitter".to_string(),
                reason: "must be between 0 and 1".to_string(),
            });
        }

        isometry_core::validation::validate_operation_name(&self.probe_operation)
    }
}
