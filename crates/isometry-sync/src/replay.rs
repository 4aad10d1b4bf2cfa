//! # Offline Replay
//!
//! Sends queued changes back to the host after reconnecting.
//!
//! ## Replay Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Sync Offline Queue Replay                          │
//! │                                                                         │
//! │   queue: [c1 c2 ... c10 | c11 ... c20 | c21 ...]                        │
//! │            └─ batch 1 ──┘  └─ batch 2 ─┘                                │
//! │                                                                         │
//! │   batch N: all items sent together, awaited as a whole                 │
//! │            ends before the first repeat of a record already in it      │
//! │            each item: up to max_attempts, exponential backoff          │
//! │                                                                         │
//! │   per item outcome:                                                     │
//! │     Sent     ──► acknowledged                                           │
//! │     Requeue  ──► host unreachable; back to the head of the queue        │
//! │     Rejected ──► host refused it; reported as a failed change           │
//! │                                                                         │
//! │   batch N+1 starts only after batch N finished                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures_util::future::join_all;
use isometry_core::{BridgeError, BridgeResult, DataChange};
use tracing::debug;

use crate::config::SyncSettings;

/// Per-item retry parameters for replay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplayPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl ReplayPolicy {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        ReplayPolicy {
            max_attempts: settings.replay_max_attempts.max(1),
            initial_backoff: settings.replay_initial_backoff(),
            max_backoff: settings.replay_max_backoff(),
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.initial_backoff,
            max_interval: self.max_backoff,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff.reset();
        backoff
    }
}

/// Result of replaying one change.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayOutcome {
    /// The host acknowledged the change.
    Sent(DataChange),
    /// The host could not be reached; keep the change queued.
    Requeue(DataChange, BridgeError),
    /// The host refused the change.
    Rejected(DataChange, BridgeError),
}

/// Sends one change, retrying retriable failures with backoff.
pub async fn replay_one<F, Fut>(change: &DataChange, policy: &ReplayPolicy, send: &F) -> BridgeResult<()>
where
    F: Fn(DataChange) -> Fut,
    Fut: Future<Output = BridgeResult<()>>,
{
    let mut backoff = policy.backoff();
    let mut attempt = 1;

    loop {
        let err = match send(change.clone()).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        if !err.is_retryable() || attempt >= policy.max_attempts {
            return Err(err);
        }

        let delay = backoff.next_backoff().unwrap_or(policy.max_backoff);
        debug!(
            id = %change.id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Replay attempt failed, backing off"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Cuts `batch` before the first change to a record it already holds and
/// returns the tail. Two changes to one record never travel together.
pub fn split_at_repeated_key(batch: &mut Vec<DataChange>) -> Vec<DataChange> {
    let cut = {
        let mut seen = HashSet::new();
        batch
            .iter()
            .position(|change| !seen.insert((change.entity.as_str(), change.id.as_str())))
    };
    match cut {
        Some(at) => batch.split_off(at),
        None => Vec::new(),
    }
}

/// Replays one batch concurrently. Outcomes are returned in batch order.
pub async fn replay_batch<F, Fut>(batch: Vec<DataChange>, policy: &ReplayPolicy, send: &F) -> Vec<ReplayOutcome>
where
    F: Fn(DataChange) -> Fut,
    Fut: Future<Output = BridgeResult<()>>,
{
    let results = join_all(batch.iter().map(|change| replay_one(change, policy, send))).await;

    batch
        .into_iter()
        .zip(results)
        .map(|(change, result)| match result {
            Ok(()) => ReplayOutcome::Sent(change),
            Err(err) if err.is_connectivity() => ReplayOutcome::Requeue(change, err),
            Err(err) => ReplayOutcome::Rejected(change, err),
        })
        .collect()
}
