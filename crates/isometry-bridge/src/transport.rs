//! # Transport Bridge
//!
//! Request/response façade over the host's fire-and-forget channel.
//!
//! ## Call Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         call(target, op, payload)                       │
//! │                                                                         │
//! │   host present? ──no──► Err(TransportUnavailable)                       │
//! │        │                                                                │
//! │        ▼                                                                │
//! │   ┌──────────────── attempt loop (max_attempts) ─────────────────┐      │
//! │   │                                                              │      │
//! │   │  breaker.should_allow? ──no──► Err(CircuitOpen), not queued  │      │
//! │   │        │                                                     │      │
//! │   │        ▼                                                     │      │
//! │   │  fresh envelope, correlator.register(id, timeout)            │      │
//! │   │        │                                                     │      │
//! │   │   connected? ──yes──► host.post(envelope)                    │      │
//! │   │        │                                                     │      │
//! │   │        no ──► offline queue (oldest shed → QueueOverflow)    │      │
//! │   │        │                                                     │      │
//! │   │        ▼                                                     │      │
//! │   │  await response / timeout                                    │      │
//! │   │        │                                                     │      │
//! │   │  Timeout / TransientChannel ──► backoff + jitter, retry      │      │
//! │   └──────────────────────────────────────────────────────────────┘      │
//! │                                                                         │
//! │   deliver(response): correlator match ──► breaker success / failure     │
//! │   reconnect (false → true): flush offline queue in FIFO order           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Breaker Accounting
//! Failures are recorded for timeouts, channel post errors and host responses
//! with `success = false`. Successes are recorded for matched responses with
//! `success = true`. Responses the correlator does not recognise (late or
//! duplicate) leave the breaker untouched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use isometry_core::validation::validate_operation_name;
use isometry_core::{
    BoundedQueue, BreakerSnapshot, BreakerTransition, BridgeError, BridgeResult, CircuitBreaker,
    DataChange, HostOperation, InboundMessage, MessageEnvelope, Payload, PushOutcome,
    ResponseEnvelope, RetryDecision, RetryState, Target, ValidationError,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::correlator::RequestCorrelator;
use crate::events::{BridgeEvents, ConnectivityChanged, RequestSettled, Subscription};
use crate::host::HostChannel;
use crate::monitor::{ConnectionMonitor, MonitorHandle};

/// Background tasks owned by an initialised bridge.
#[derive(Default)]
struct BackgroundTasks {
    sweeper: Option<JoinHandle<()>>,
    monitor: Option<MonitorHandle>,
}

struct BridgeInner {
    config: BridgeConfig,
    host: Arc<dyn HostChannel>,
    correlator: RequestCorrelator,
    breaker: Mutex<CircuitBreaker>,
    offline: Mutex<BoundedQueue<MessageEnvelope>>,
    connected: AtomicBool,
    events: BridgeEvents,
    tasks: Mutex<BackgroundTasks>,
}

/// Cloneable handle to the transport bridge.
#[derive(Clone)]
pub struct TransportBridge {
    inner: Arc<BridgeInner>,
}

/// Non-owning handle used by background tasks.
#[derive(Clone)]
pub struct WeakTransportBridge {
    inner: Weak<BridgeInner>,
}

impl WeakTransportBridge {
    pub fn upgrade(&self) -> Option<TransportBridge> {
        self.inner.upgrade().map(|inner| TransportBridge { inner })
    }
}

/// Clock reading for the breaker. Goes through tokio so paused-time tests
/// move the breaker's clock too.
fn breaker_now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

impl TransportBridge {
    /// Builds a bridge over `host`. Connectivity starts out as the host's
    /// presence; call [`init`](Self::init) to start probing.
    pub fn new(config: BridgeConfig, host: Arc<dyn HostChannel>) -> Self {
        let events = BridgeEvents::default();
        let connected = host.is_present();

        TransportBridge {
            inner: Arc::new(BridgeInner {
                correlator: RequestCorrelator::new(events.requests.clone()),
                breaker: Mutex::new(config.breaker()),
                offline: Mutex::new(BoundedQueue::new(config.offline_queue_capacity)),
                connected: AtomicBool::new(connected),
                host,
                events,
                config,
                tasks: Mutex::new(BackgroundTasks::default()),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakTransportBridge {
        WeakTransportBridge {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Starts the stale-request sweeper and the connection monitor.
    ///
    /// Calling it again while running is a no-op. Invalid settings are
    /// rejected before any task starts.
    pub async fn init(&self) -> Result<(), ValidationError> {
        self.inner.config.validate()?;

        let mut tasks = self.inner.tasks.lock().await;
        if tasks.monitor.is_some() {
            debug!("Transport bridge already initialised");
            return Ok(());
        }

        tasks.sweeper = Some(
            self.inner
                .correlator
                .spawn_sweeper(self.inner.config.sweep_interval()),
        );
        tasks.monitor = Some(ConnectionMonitor::spawn(
            self.downgrade(),
            self.inner.config.probe_interval(),
        ));

        info!(
            host_present = self.is_host_present(),
            probe_interval_secs = self.inner.config.probe_interval_secs,
            "Transport bridge started"
        );
        Ok(())
    }

    /// Stops background tasks and rejects every pending request with
    /// `CancelledByCleanup`. Safe to call more than once.
    pub async fn shutdown(&self) -> usize {
        {
            let mut tasks = self.inner.tasks.lock().await;
            if let Some(sweeper) = tasks.sweeper.take() {
                sweeper.abort();
            }
            if let Some(monitor) = tasks.monitor.take() {
                monitor.shutdown().await;
            }
        }

        let dropped = self.inner.offline.lock().await.drain().len();
        let cancelled = self.inner.correlator.cancel_all().await;

        if cancelled > 0 || dropped > 0 {
            info!(cancelled, dropped, "Transport bridge shut down");
        }
        cancelled
    }

    // =========================================================================
    // Environment
    // =========================================================================

    /// Whether a host messaging channel exists.
    pub fn is_host_present(&self) -> bool {
        self.inner.host.is_present()
    }

    /// Last known connectivity.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Records a connectivity change. A false → true edge flushes the
    /// offline queue.
    pub async fn set_connected(&self, connected: bool) {
        let was = self.inner.connected.swap(connected, Ordering::SeqCst);
        if was == connected {
            return;
        }

        info!(connected, "Host connectivity changed");
        self.inner.events.connectivity.emit(&ConnectivityChanged {
            connected,
            at: Utc::now(),
        });

        if connected {
            let flushed = self.flush_offline().await;
            if flushed > 0 {
                info!(flushed, "Flushed offline queue after reconnect");
            }
        }
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Sends an operation and waits for its correlated response.
    ///
    /// `timeout` applies per attempt and defaults to the configured one.
    pub async fn call(
        &self,
        target: Target,
        operation: &str,
        payload: Payload,
        timeout: Option<Duration>,
    ) -> BridgeResult<Value> {
        if !self.is_host_present() {
            return Err(BridgeError::TransportUnavailable);
        }
        validate_operation_name(operation)
            .map_err(|e| BridgeError::Serialization(e.to_string()))?;

        let timeout = timeout.unwrap_or_else(|| self.inner.config.default_timeout());
        let policy = self.inner.config.retry_policy();
        let mut retry = RetryState::new();

        loop {
            let err = match self.attempt(target, operation, &payload, timeout, retry).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            match retry.next(&policy, &err, rand::random::<f64>()) {
                RetryDecision::Retry { delay, next } => {
                    debug!(
                        operation,
                        attempt = next.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying host call"
                    );
                    tokio::time::sleep(delay).await;
                    retry = next;
                }
                RetryDecision::GiveUp => {
                    debug!(operation, attempts = retry.attempt() + 1, error = %err, "Host call failed");
                    return Err(err);
                }
            }
        }
    }

    /// Sends a typed host operation.
    pub async fn request(&self, operation: HostOperation) -> BridgeResult<Value> {
        let (target, name, payload) = operation.into_parts()?;
        self.call(target, &name, payload, None).await
    }

    /// Sends a typed host operation and decodes the result.
    pub async fn request_as<T: DeserializeOwned>(&self, operation: HostOperation) -> BridgeResult<T> {
        let value = self.request(operation).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn attempt(
        &self,
        target: Target,
        operation: &str,
        payload: &Payload,
        timeout: Duration,
        retry: RetryState,
    ) -> BridgeResult<Value> {
        let (allowed, transition) = self.inner.breaker.lock().await.should_allow(breaker_now());
        log_transition(transition);
        if !allowed {
            return Err(BridgeError::CircuitOpen);
        }

        let envelope = MessageEnvelope::new(target, operation, payload.clone());
        let id = envelope.id.clone();
        let correlator = &self.inner.correlator;

        let response = if self.is_connected() {
            let response = correlator.register(&id, timeout, retry.attempt()).await;
            if let Err(err) = self.inner.host.post(&envelope) {
                warn!(id = %id, operation, error = %err, "Host channel rejected message");
                correlator.reject(&id, err.clone()).await;
                self.record_failure().await;
                return Err(err);
            }
            response
        } else {
            // The deadline starts once the envelope is flushed to the host.
            let response = correlator.park(&id, timeout, retry.attempt()).await;
            self.enqueue_offline(envelope).await;
            response
        };

        // Only posted envelopes can time out, so this never counts queued time.
        let result = response.await.unwrap_or(Err(BridgeError::CancelledByCleanup));
        if matches!(result, Err(BridgeError::Timeout { .. })) {
            self.record_failure().await;
        }
        result
    }

    async fn enqueue_offline(&self, envelope: MessageEnvelope) {
        let id = envelope.id.clone();
        let outcome = self.inner.offline.lock().await.push(envelope);
        match outcome {
            PushOutcome::Accepted => debug!(id = %id, "Queued request while disconnected"),
            PushOutcome::Evicted(old) | PushOutcome::Rejected(old) => {
                warn!(id = %old.id, "Offline queue full, shedding request");
                let err = BridgeError::QueueOverflow { id: old.id.clone() };
                self.inner.correlator.reject(&old.id, err).await;
            }
        }
    }

    /// Posts queued envelopes in FIFO order.
    ///
    /// Entries whose request already settled (timed out, cancelled) are
    /// skipped. Returns the number posted.
    pub async fn flush_offline(&self) -> usize {
        let queued = self.inner.offline.lock().await.drain();
        let mut posted = 0;

        for envelope in queued {
            if !self.inner.correlator.contains(&envelope.id).await {
                debug!(id = %envelope.id, "Skipping settled request from offline queue");
                continue;
            }

            let (allowed, transition) = self.inner.breaker.lock().await.should_allow(breaker_now());
            log_transition(transition);
            if !allowed {
                self.inner
                    .correlator
                    .reject(&envelope.id, BridgeError::CircuitOpen)
                    .await;
                continue;
            }

            self.inner.correlator.arm(&envelope.id).await;
            match self.inner.host.post(&envelope) {
                Ok(()) => posted += 1,
                Err(err) => {
                    warn!(id = %envelope.id, error = %err, "Failed to flush queued request");
                    self.inner.correlator.reject(&envelope.id, err).await;
                    self.record_failure().await;
                }
            }
        }

        posted
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    /// Settles the pending request a response belongs to.
    ///
    /// Returns false for unknown ids; those are dropped without touching the
    /// breaker.
    pub async fn deliver(&self, response: ResponseEnvelope) -> bool {
        let success = response.success;
        if !self.inner.correlator.deliver(response).await {
            return false;
        }

        if success {
            let transition = self.inner.breaker.lock().await.record_success();
            log_transition(transition);
        } else {
            self.record_failure().await;
        }
        true
    }

    /// Decodes and routes one raw inbound message from the host.
    pub async fn receive_json(&self, json: &str) -> BridgeResult<()> {
        let message = InboundMessage::from_json(json).map_err(|e| {
            warn!(error = %e, "Malformed message from host");
            e
        })?;

        match message {
            InboundMessage::Response(response) => {
                self.deliver(response).await;
            }
            InboundMessage::Change(change) => {
                debug!(entity = %change.entity, id = %change.id, "Remote change received");
                self.inner.events.remote_changes.emit(&change);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Health
    // =========================================================================

    /// Sends the configured probe operation directly, bypassing the queue.
    ///
    /// An application-level failure still proves the host is reachable.
    pub async fn probe(&self) -> BridgeResult<Value> {
        if !self.is_host_present() {
            return Err(BridgeError::TransportUnavailable);
        }

        let config = &self.inner.config;
        let envelope =
            MessageEnvelope::new(Target::Database, config.probe_operation.as_str(), Payload::new());
        let id = envelope.id.clone();
        let response = self
            .inner
            .correlator
            .register(&id, config.probe_timeout(), 0)
            .await;

        if let Err(err) = self.inner.host.post(&envelope) {
            self.inner.correlator.reject(&id, err.clone()).await;
            self.record_failure().await;
            return Err(err);
        }

        let result = response.await.unwrap_or(Err(BridgeError::CancelledByCleanup));
        if matches!(result, Err(BridgeError::Timeout { .. })) {
            self.record_failure().await;
        }
        result
    }

    /// Probes the host and updates connectivity. Returns the new state.
    pub async fn check_health(&self) -> bool {
        let healthy = match self.probe().await {
            Ok(_) | Err(BridgeError::Application(_)) => true,
            Err(err) => {
                debug!(error = %err, "Health probe failed");
                false
            }
        };
        self.set_connected(healthy).await;
        healthy
    }

    async fn record_failure(&self) {
        let transition = self.inner.breaker.lock().await.record_failure(breaker_now());
        log_transition(transition);
    }

    // =========================================================================
    // Observability
    // =========================================================================

    pub async fn pending_count(&self) -> usize {
        self.inner.correlator.pending_count().await
    }

    pub async fn offline_len(&self) -> usize {
        self.inner.offline.lock().await.len()
    }

    pub async fn breaker_snapshot(&self) -> BreakerSnapshot {
        self.inner.breaker.lock().await.snapshot()
    }

    pub fn events(&self) -> &BridgeEvents {
        &self.inner.events
    }

    pub fn on_connectivity<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectivityChanged) + Send + Sync + 'static,
    {
        self.inner.events.connectivity.subscribe(listener)
    }

    pub fn on_request_settled<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&RequestSettled) + Send + Sync + 'static,
    {
        self.inner.events.requests.subscribe(listener)
    }

    pub fn on_remote_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&DataChange) + Send + Sync + 'static,
    {
        self.inner.events.remote_changes.subscribe(listener)
    }
}

fn log_transition(transition: Option<BreakerTransition>) {
    match transition {
        Some(BreakerTransition::Opened) => warn!("Circuit breaker opened"),
        Some(BreakerTransition::Reopened) => warn!("Circuit breaker re-opened after failed probe"),
        Some(BreakerTransition::HalfOpened) => info!("Circuit breaker half-open, allowing probe"),
        Some(BreakerTransition::Closed) => info!("Circuit breaker closed"),
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RequestOutcome;
    use crate::host::{DetachedHost, LoopbackHost};
    use isometry_core::BreakerState;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;

    fn config() -> BridgeConfig {
        BridgeConfig {
            max_attempts: 1,
            ..Default::default()
        }
    }

    fn bridge(config: BridgeConfig) -> (TransportBridge, Arc<LoopbackHost>, mpsc::UnboundedReceiver<MessageEnvelope>) {
        let (host, rx) = LoopbackHost::new();
        (TransportBridge::new(config, host.clone()), host, rx)
    }

    /// Answers every envelope with `{"echo": operation}`.
    fn spawn_echo(bridge: &TransportBridge, mut rx: mpsc::UnboundedReceiver<MessageEnvelope>) -> JoinHandle<()> {
        let bridge = bridge.clone();
        tokio::spawn(async move {
            while let Some(env) = rx.recv().await {
                let value = json!({ "echo": env.operation });
                bridge.deliver(ResponseEnvelope::ok(env.id, value)).await;
            }
        })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test]
    async fn test_call_resolves_with_host_result() {
        let (bridge, _host, rx) = bridge(config());
        spawn_echo(&bridge, rx);

        let value = bridge
            .call(Target::Database, "execute", Payload::new(), None)
            .await
            .unwrap();

        assert_eq!(value, json!({ "echo": "execute" }));
        assert_eq!(bridge.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_call_without_host() {
        let bridge = TransportBridge::new(config(), Arc::new(DetachedHost));
        assert!(!bridge.is_connected());
        assert_eq!(
            bridge.call(Target::Filesystem, "readFile", Payload::new(), None).await,
            Err(BridgeError::TransportUnavailable)
        );
    }

    #[tokio::test]
    async fn test_application_error_is_not_retried() {
        let (bridge, host, mut rx) = bridge(BridgeConfig::default());
        let responder = bridge.clone();
        tokio::spawn(async move {
            while let Some(env) = rx.recv().await {
                responder.deliver(ResponseEnvelope::failed(env.id, "no such table")).await;
            }
        });

        let result = bridge.call(Target::Database, "execute", Payload::new(), None).await;

        assert_eq!(result, Err(BridgeError::Application("no such table".into())));
        assert_eq!(host.posted_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_late_duplicate_is_dropped() {
        let (bridge, _host, mut rx) = bridge(config());

        let result = bridge
            .call(Target::Database, "execute", Payload::new(), Some(Duration::from_secs(10)))
            .await;

        assert!(matches!(result, Err(BridgeError::Timeout { timeout_ms: 10_000, .. })));
        assert_eq!(bridge.pending_count().await, 0);

        let posted = rx.try_recv().unwrap();
        assert!(!bridge.deliver(ResponseEnvelope::ok(posted.id, json!(1))).await);
        assert_eq!(bridge.breaker_snapshot().await.consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retried_with_fresh_id() {
        let (bridge, host, mut rx) = bridge(BridgeConfig::default());
        let responder = bridge.clone();
        let ids = Arc::new(StdMutex::new(Vec::new()));
        let seen = ids.clone();
        tokio::spawn(async move {
            // Ignore the first attempt, answer the second.
            let mut n = 0;
            while let Some(env) = rx.recv().await {
                seen.lock().unwrap().push(env.id.clone());
                n += 1;
                if n >= 2 {
                    responder.deliver(ResponseEnvelope::ok(env.id, json!("late but fine"))).await;
                }
            }
        });

        let value = bridge
            .call(Target::Database, "execute", Payload::new(), Some(Duration::from_secs(1)))
            .await
            .unwrap();

        assert_eq!(value, json!("late but fine"));
        assert_eq!(host.posted_count(), 2);
        let ids = ids.lock().unwrap();
        assert_ne!(ids[0], ids[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_after_five_failures() {
        let (bridge, host, _rx) = bridge(config());
        host.set_failing(true);

        for _ in 0..5 {
            let result = bridge.call(Target::Database, "execute", Payload::new(), None).await;
            assert!(matches!(result, Err(BridgeError::TransientChannel(_))));
        }
        assert_eq!(bridge.breaker_snapshot().await.state, BreakerState::Open);

        host.set_failing(false);
        let before = host.posted_count();
        assert_eq!(
            bridge.call(Target::Database, "execute", Payload::new(), None).await,
            Err(BridgeError::CircuitOpen)
        );
        assert_eq!(host.posted_count(), before);
        assert_eq!(bridge.offline_len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_half_open_probe_closes_on_success() {
        let (bridge, host, rx) = bridge(config());
        host.set_failing(true);
        for _ in 0..5 {
            let _ = bridge.call(Target::Database, "execute", Payload::new(), None).await;
        }
        host.set_failing(false);
        spawn_echo(&bridge, rx);

        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(bridge.call(Target::Database, "execute", Payload::new(), None).await.is_ok());
        assert_eq!(bridge.breaker_snapshot().await.state, BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_calls_queue_and_flush_in_order() {
        let (bridge, host, rx) = bridge(config());
        bridge.set_connected(false).await;

        let first = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.call(Target::Database, "first", Payload::new(), None).await }
        });
        settle().await;
        let second = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.call(Target::Database, "second", Payload::new(), None).await }
        });
        settle().await;

        assert_eq!(bridge.offline_len().await, 2);
        assert_eq!(host.posted_count(), 0);

        let order = Arc::new(StdMutex::new(Vec::new()));
        let _sub = {
            let order = order.clone();
            bridge.on_request_settled(move |e| order.lock().unwrap().push(e.id.clone()))
        };
        spawn_echo(&bridge, rx);
        bridge.set_connected(true).await;

        assert_eq!(first.await.unwrap(), Ok(json!({ "echo": "first" })));
        assert_eq!(second.await.unwrap(), Ok(json!({ "echo": "second" })));
        assert_eq!(bridge.offline_len().await, 0);
        assert_eq!(order.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_calls_do_not_trip_breaker_while_disconnected() {
        let (bridge, host, rx) = bridge(BridgeConfig::default());
        bridge.set_connected(false).await;

        let calls: Vec<_> = ["first", "second"]
            .into_iter()
            .map(|op| {
                let bridge = bridge.clone();
                tokio::spawn(async move { bridge.call(Target::Database, op, Payload::new(), None).await })
            })
            .collect();

        // Well past every per-attempt timeout and the sweep horizon.
        tokio::time::sleep(Duration::from_secs(120)).await;
        bridge.inner.correlator.sweep(tokio::time::Instant::now()).await;

        let snapshot = bridge.breaker_snapshot().await;
        assert_eq!(snapshot.state, BreakerState::Closed);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(host.posted_count(), 0);
        assert_eq!(bridge.offline_len().await, 2);
        assert_eq!(bridge.pending_count().await, 2);

        spawn_echo(&bridge, rx);
        bridge.set_connected(true).await;

        for call in calls {
            assert!(call.await.unwrap().is_ok());
        }
        assert!(bridge.call(Target::Database, "after", Payload::new(), None).await.is_ok());
        assert_eq!(host.posted_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushed_call_times_out_from_post_time() {
        let (bridge, _host, _rx) = bridge(config());
        bridge.set_connected(false).await;

        let call = tokio::spawn({
            let bridge = bridge.clone();
            async move {
                bridge
                    .call(Target::Database, "execute", Payload::new(), Some(Duration::from_secs(10)))
                    .await
            }
        });
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!call.is_finished());

        // Host never answers after the flush.
        bridge.set_connected(true).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!call.is_finished());

        assert!(matches!(
            call.await.unwrap(),
            Err(BridgeError::Timeout { timeout_ms: 10_000, .. })
        ));
        assert_eq!(bridge.breaker_snapshot().await.consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_overflow_rejects_oldest() {
        let (bridge, _host, _rx) = bridge(BridgeConfig {
            offline_queue_capacity: 2,
            ..config()
        });
        bridge.set_connected(false).await;

        let mut calls = Vec::new();
        for op in ["a", "b", "c"] {
            let bridge = bridge.clone();
            calls.push(tokio::spawn(async move {
                bridge.call(Target::Database, op, Payload::new(), None).await
            }));
            settle().await;
        }

        let oldest = calls.remove(0).await.unwrap();
        assert!(matches!(oldest, Err(BridgeError::QueueOverflow { .. })));
        assert_eq!(bridge.offline_len().await, 2);
        assert_eq!(bridge.pending_count().await, 2);
    }

    #[tokio::test]
    async fn test_init_rejects_zero_health_check_interval() {
        let (bridge, _host, _rx) = bridge(BridgeConfig {
            probe_interval_secs: 0,
            ..config()
        });

        assert!(matches!(bridge.init().await, Err(ValidationError::InvalidFormat { ref field, .. }) if field == "probe_interval_secs"));
        assert!(bridge.inner.tasks.lock().await.monitor.is_none());
        assert!(bridge.inner.tasks.lock().await.sweeper.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_and_is_idempotent() {
        let (bridge, _host, mut rx) = bridge(config());
        let call = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.call(Target::Database, "execute", Payload::new(), None).await }
        });
        settle().await;
        let posted = rx.try_recv().unwrap();

        assert_eq!(bridge.shutdown().await, 1);
        assert_eq!(bridge.shutdown().await, 0);
        assert_eq!(call.await.unwrap(), Err(BridgeError::CancelledByCleanup));

        // A response racing the cleanup is dropped.
        assert!(!bridge.deliver(ResponseEnvelope::ok(posted.id, json!(1))).await);
    }

    #[tokio::test]
    async fn test_receive_json_routes_messages() {
        let (bridge, _host, mut rx) = bridge(config());
        let changes = Arc::new(StdMutex::new(Vec::new()));
        let _sub = {
            let changes = changes.clone();
            bridge.on_remote_change(move |c| changes.lock().unwrap().push(c.id.clone()))
        };

        let call = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.call(Target::Database, "execute", Payload::new(), None).await }
        });
        let env = rx.recv().await.unwrap();

        let response = format!(r#"{{"kind":"response","id":"{}","result":[1,2],"success":true}}"#, env.id);
        bridge.receive_json(&response).await.unwrap();
        assert_eq!(call.await.unwrap(), Ok(json!([1, 2])));

        let change = r#"{"kind":"change","id":"n1","entity":"nodes","operation":"update","data":{},"timestamp":1,"version":2}"#;
        bridge.receive_json(change).await.unwrap();
        assert_eq!(*changes.lock().unwrap(), vec!["n1".to_string()]);

        assert!(matches!(
            bridge.receive_json("{not json").await,
            Err(BridgeError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_request_as_decodes_typed_result() {
        let (bridge, _host, mut rx) = bridge(config());
        let responder = bridge.clone();
        tokio::spawn(async move {
            while let Some(env) = rx.recv().await {
                responder.deliver(ResponseEnvelope::ok(env.id, json!(["a.md", "b.md"]))).await;
            }
        });

        let files: Vec<String> = bridge
            .request_as(HostOperation::ListFiles { path: "/notes".into() })
            .await
            .unwrap();
        assert_eq!(files, vec!["a.md", "b.md"]);

        let mismatch: BridgeResult<u64> = bridge
            .request_as(HostOperation::ListFiles { path: "/notes".into() })
            .await;
        assert!(matches!(mismatch, Err(BridgeError::Serialization(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_health_flips_connectivity() {
        let (bridge, host, rx) = bridge(config());
        let flips = Arc::new(StdMutex::new(Vec::new()));
        let _sub = {
            let flips = flips.clone();
            bridge.on_connectivity(move |e| flips.lock().unwrap().push(e.connected))
        };
        spawn_echo(&bridge, rx);

        assert!(bridge.check_health().await);
        assert!(flips.lock().unwrap().is_empty());

        host.set_present(false);
        assert!(!bridge.check_health().await);
        host.set_present(true);
        assert!(bridge.check_health().await);

        assert_eq!(*flips.lock().unwrap(), vec![false, true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_events_report_timeouts() {
        let (bridge, _host, _rx) = bridge(config());
        let outcomes = Arc::new(StdMutex::new(Vec::new()));
        let _sub = {
            let outcomes = outcomes.clone();
            bridge.on_request_settled(move |e| outcomes.lock().unwrap().push(e.outcome.clone()))
        };

        let _ = bridge
            .call(Target::Database, "execute", Payload::new(), Some(Duration::from_millis(50)))
            .await;

        let outcomes = outcomes.lock().unwrap();
        assert!(matches!(
            outcomes.as_slice(),
            [RequestOutcome::Rejected(BridgeError::Timeout { .. })]
        ));
    }

    #[tokio::test]
    async fn test_invalid_operation_name() {
        let (bridge, _host, _rx) = bridge(config());
        assert!(matches!(
            bridge.call(Target::Database, "drop table", Payload::new(), None).await,
            Err(BridgeError::Serialization(_))
        ));
    }
}
