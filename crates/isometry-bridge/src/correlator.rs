//! # Request Correlator
//!
//! Matches host responses to the callers waiting on them.
//!
//! ## Request Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Pending Request Lifecycle                          │
//! │                                                                         │
//! │   register(id, timeout)                                                 │
//! │        │                                                                │
//! │        ├──► pending map: id → { oneshot tx, timer, armed_at }           │
//! │        └──► timer task: sleep(timeout)                                  │
//! │                                                                         │
//! │   park(id, timeout) ── no timer until arm(id) at post time              │
//! │                                                                         │
//! │   exactly ONE of these wins (whoever removes the map entry first):      │
//! │                                                                         │
//! │   deliver(response) ──► abort timer ──► tx.send(result)                 │
//! │   timer fires       ──► tx.send(Err(Timeout))                           │
//! │   reject(id, err)   ──► abort timer ──► tx.send(Err(err))               │
//! │   sweep(now)        ──► entries older than 2 × timeout                  │
//! │   cancel_all()      ──► every entry gets CancelledByCleanup             │
//! │                                                                         │
//! │   A response for an id that is no longer in the map is dropped.         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Removal from the map is the single point of truth: every settle path
//! removes first and only the remover may use the sender.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use isometry_core::{BridgeError, BridgeResult, ResponseEnvelope};
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::events::{EventRegistry, RequestOutcome, RequestSettled};

/// Receiver side handed back to the caller of [`RequestCorrelator::register`].
pub type ResponseReceiver = oneshot::Receiver<BridgeResult<Value>>;

struct PendingRequest {
    response_tx: oneshot::Sender<BridgeResult<Value>>,
    /// None while parked.
    timeout_handle: Option<AbortHandle>,
    armed_at: Option<Instant>,
    timeout: Duration,
    retry_count: u32,
}

impl PendingRequest {
    fn settle(self, id: String, result: BridgeResult<Value>, events: &EventRegistry<RequestSettled>) {
        if let Some(timer) = self.timeout_handle {
            timer.abort();
        }

        let outcome = match &result {
            Ok(_) => RequestOutcome::Resolved,
            Err(e) => RequestOutcome::Rejected(e.clone()),
        };
        events.emit(&RequestSettled { id, outcome });

        // The caller may have given up waiting; nothing to do then.
        let _ = self.response_tx.send(result);
    }
}

/// Table of in-flight requests keyed by correlation id.
#[derive(Clone)]
pub struct RequestCorrelator {
    pending: Arc<Mutex<HashMap<String, PendingRequest>>>,
    events: EventRegistry<RequestSettled>,
}

impl RequestCorrelator {
    pub fn new(events: EventRegistry<RequestSettled>) -> Self {
        RequestCorrelator {
            pending: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Starts tracking `id` and arms its deadline.
    ///
    /// The returned receiver yields exactly one result.
    pub async fn register(&self, id: &str, timeout: Duration, retry_count: u32) -> ResponseReceiver {
        self.track(id, timeout, retry_count, true).await
    }

    /// Starts tracking `id` without a deadline.
    ///
    /// Used for requests held in the offline queue: the deadline starts
    /// when the envelope is finally posted, see [`arm`](Self::arm). Until
    /// then the entry is exempt from the sweep.
    pub async fn park(&self, id: &str, timeout: Duration, retry_count: u32) -> ResponseReceiver {
        self.track(id, timeout, retry_count, false).await
    }

    /// Arms the deadline of a parked request. Returns false if the request
    /// is unknown or already armed.
    pub async fn arm(&self, id: &str) -> bool {
        let mut pending = self.pending.lock().await;
        match pending.get_mut(id) {
            Some(request) if request.timeout_handle.is_none() => {
                request.timeout_handle = Some(self.spawn_deadline(id, request.timeout));
                request.armed_at = Some(Instant::now());
                true
            }
            _ => false,
        }
    }

    async fn track(&self, id: &str, timeout: Duration, retry_count: u32, armed: bool) -> ResponseReceiver {
        let (response_tx, response_rx) = oneshot::channel();

        // Hold the lock while arming so the timer cannot run before the
        // entry exists.
        let mut pending = self.pending.lock().await;
        let timeout_handle = armed.then(|| self.spawn_deadline(id, timeout));

        let previous = pending.insert(
            id.to_string(),
            PendingRequest {
                response_tx,
                timeout_handle,
                armed_at: armed.then(Instant::now),
                timeout,
                retry_count,
            },
        );
        drop(pending);

        if let Some(previous) = previous {
            warn!(id, "Correlation id reused, cancelling previous request");
            previous.settle(id.to_string(), Err(BridgeError::CancelledByCleanup), &self.events);
        }

        response_rx
    }

    fn spawn_deadline(&self, id: &str, timeout: Duration) -> AbortHandle {
        let timer_pending = self.pending.clone();
        let timer_events = self.events.clone();
        let timer_id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = timer_pending.lock().await.remove(&timer_id);
            if let Some(request) = expired {
                debug!(id = %timer_id, timeout_ms = timeout.as_millis() as u64, "Request timed out");
                let err = BridgeError::Timeout {
                    id: timer_id.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                };
                request.settle(timer_id, Err(err), &timer_events);
            }
        })
        .abort_handle()
    }

    /// Settles the request a response belongs to.
    ///
    /// Returns false when the id is unknown (late, duplicate or foreign),
    /// in which case the response is dropped.
    pub async fn deliver(&self, response: ResponseEnvelope) -> bool {
        let request = self.pending.lock().await.remove(&response.id);
        match request {
            Some(request) => {
                debug!(
                    id = %response.id,
                    success = response.success,
                    retry_count = request.retry_count,
                    "Response matched"
                );
                let id = response.id.clone();
                request.settle(id, response.into_result(), &self.events);
                true
            }
            None => {
                debug!(id = %response.id, "Dropping response for unknown request");
                false
            }
        }
    }

    /// Rejects one pending request. Returns false if it was already settled.
    pub async fn reject(&self, id: &str, error: BridgeError) -> bool {
        let request = self.pending.lock().await.remove(id);
        match request {
            Some(request) => {
                request.settle(id.to_string(), Err(error), &self.events);
                true
            }
            None => false,
        }
    }

    /// Whether `id` is still waiting for a response.
    pub async fn contains(&self, id: &str) -> bool {
        self.pending.lock().await.contains_key(id)
    }

    /// Times out every armed request older than twice its own timeout.
    ///
    /// Backstop for timers that never fired. Returns the number swept.
    pub async fn sweep(&self, now: Instant) -> usize {
        let stale: Vec<(String, PendingRequest)> = {
            let mut pending = self.pending.lock().await;
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, req)| {
                    req.armed_at
                        .is_some_and(|at| now.saturating_duration_since(at) > req.timeout * 2)
                })
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|req| (id, req)))
                .collect()
        };

        let count = stale.len();
        for (id, request) in stale {
            let err = BridgeError::Timeout {
                id: id.clone(),
                timeout_ms: request.timeout.as_millis() as u64,
            };
            request.settle(id, Err(err), &self.events);
        }

        if count > 0 {
            warn!(count, "Swept stale pending requests");
        }
        count
    }

    /// Spawns the periodic stale-request sweep.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let correlator = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately; nothing can be stale yet.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                correlator.sweep(Instant::now()).await;
            }
        })
    }

    /// Rejects every pending request with `CancelledByCleanup`.
    pub async fn cancel_all(&self) -> usize {
        let drained: Vec<(String, PendingRequest)> =
            self.pending.lock().await.drain().collect();

        let count = drained.len();
        for (id, request) in drained {
            request.settle(id, Err(BridgeError::CancelledByCleanup), &self.events);
        }
        count
    }

    /// Number of in-flight requests.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}
