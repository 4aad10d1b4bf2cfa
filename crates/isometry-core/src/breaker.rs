//! # Circuit Breaker
//!
//! Tracks consecutive transport failures and refuses new sends while the
//! host looks unhealthy.
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Circuit Breaker States                              │
//! │                                                                         │
//! │  ┌────────┐  failures ≥ threshold  ┌────────┐                          │
//! │  │ Closed │ ─────────────────────► │  Open  │ ◄────────────┐           │
//! │  └────────┘                        └───┬────┘              │           │
//! │      ▲                                 │ reset window      │ failure   │
//! │      │ success                         │ elapsed, next     │           │
//! │      │                                 ▼ should_allow()    │           │
//! │      │                           ┌───────────┐             │           │
//! │      └────────────────────────── │ Half-open │ ────────────┘           │
//! │                                  │ (1 probe) │                         │
//! │                                  └───────────┘                         │
//! │                                                                         │
//! │  Defaults: threshold 5, reset window 60s                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every method takes `now` explicitly so the state machine can be driven
//! by a fake clock. Methods return the transition they caused (if any) so
//! the caller can log it.

use std::time::{Duration, Instant};

/// Default consecutive failures before opening.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default time the breaker stays open.
pub const DEFAULT_RESET_WINDOW: Duration = Duration::from_secs(60);

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected until the reset window elapses.
    Open,
    /// One probe call is in flight; others are rejected.
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// State change caused by a breaker call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerTransition {
    Opened,
    HalfOpened,
    Closed,
    Reopened,
}

/// Snapshot of the breaker for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
}

/// Consecutive-failure circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    failure_threshold: u32,
    opened_at: Option<Instant>,
    reset_window: Duration,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        CircuitBreaker::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_RESET_WINDOW)
    }
}

impl CircuitBreaker {
    /// Creates a closed breaker. A threshold of 0 is treated as 1.
    pub fn new(failure_threshold: u32, reset_window: Duration) -> Self {
        CircuitBreaker {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            failure_threshold: failure_threshold.max(1),
            opened_at: None,
            reset_window,
        }
    }

    /// Decides whether a call may proceed at `now`.
    ///
    /// Once the reset window has elapsed, exactly one call is let through as
    /// a half-open probe; further calls are refused until that probe's
    /// outcome is recorded.
    pub fn should_allow(&mut self, now: Instant) -> (bool, Option<BreakerTransition>) {
        match self.state {
            BreakerState::Closed => (true, None),
            BreakerState::HalfOpen => (false, None),
            BreakerState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|opened| now.saturating_duration_since(opened))
                    .unwrap_or(self.reset_window);

                if elapsed >= self.reset_window {
                    self.state = BreakerState::HalfOpen;
                    (true, Some(BreakerTransition::HalfOpened))
                } else {
                    (false, None)
                }
            }
        }
    }

    /// Records a successful call. Always clears the failure count.
    pub fn record_success(&mut self) -> Option<BreakerTransition> {
        self.consecutive_failures = 0;

        match self.state {
            BreakerState::Closed => None,
            BreakerState::Open | BreakerState::HalfOpen => {
                self.state = BreakerState::Closed;
                self.opened_at = None;
                Some(BreakerTransition::Closed)
            }
        }
    }

    /// Records a failed call at `now`.
    pub fn record_failure(&mut self, now: Instant) -> Option<BreakerTransition> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        match self.state {
            BreakerState::Closed => {
                if self.consecutive_failures >= self.failure_threshold {
                    self.state = BreakerState::Open;
                    self.opened_at = Some(now);
                    Some(BreakerTransition::Opened)
                } else {
                    None
                }
            }
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open;
                self.opened_at = Some(now);
                Some(BreakerTransition::Reopened)
            }
            BreakerState::Open => None,
        }
    }

    /// Returns true while the breaker refuses calls at `now`.
    pub fn is_open(&self, now: Instant) -> bool {
        match self.state {
            BreakerState::Closed => false,
            BreakerState::HalfOpen => true,
            BreakerState::Open => self
                .opened_at
                .map(|opened| now.saturating_duration_since(opened) < self.reset_window)
                .unwrap_or(false),
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Returns the consecutive failure count.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Returns a snapshot for status reporting.
    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            opened_at: self.opened_at,
        }
    }
}
