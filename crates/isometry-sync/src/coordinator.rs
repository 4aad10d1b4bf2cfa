//! # Sync Coordinator
//!
//! Publishes local changes through the transport bridge, ingests changes
//! pushed by the host, and settles conflicts between the two.
//!
//! ## Change Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Local Change States                              │
//! │                                                                         │
//! │   publish() ──► pending-local ──┬──► debounce (300ms) ──┐               │
//! │                                 │                       │               │
//! │                   delete /      └──► send now ◄─────────┘               │
//! │                   immediate               │                             │
//! │                                           ├──► acknowledged             │
//! │                                           ├──► queued-offline ──┐       │
//! │                                           └──► failed (event)   │       │
//! │                                                                 │       │
//! │   reconnect ──► replay in batches of 10 ◄───────────────────────┘       │
//! │                                                                         │
//! │   ingest(remote) ── same entity pending within window? ──► conflicted   │
//! │                              │                                │         │
//! │                              no                         resolvers       │
//! │                              ▼                                ▼         │
//! │                        consumers ◄─────────────────────── resolved      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Background Loop
//! `init` spawns one loop that multiplexes remote changes, connectivity
//! events from the bridge, debounced changes, the heartbeat and shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use isometry_bridge::{Subscription, TransportBridge};
use isometry_core::validation::validate_change;
use isometry_core::{
    detect_conflict, BoundedQueue, BridgeResult, ConflictStrategy, DataChange, PushOutcome,
    SyncConflict, SyncMode, SyncState,
};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::SyncSettings;
use crate::debounce::Debouncer;
use crate::error::{SyncError, SyncResult};
use crate::events::{ChangeFailed, ConflictResolved, ConsumerRegistry, SyncEvents};
use crate::replay::{replay_batch, split_at_repeated_key, ReplayOutcome, ReplayPolicy};
use crate::resolver::{ConflictResolver, ResolverRegistry};

/// Pending-local changes are tracked per (entity, id).
type PendingKey = (String, String);

fn key_of(change: &DataChange) -> PendingKey {
    (change.entity.clone(), change.id.clone())
}

/// Orders held-back changes by creation time before queueing them.
fn by_timestamp(mut changes: Vec<DataChange>) -> Vec<DataChange> {
    changes.sort_by_key(|c| c.timestamp);
    changes
}

struct LoopChannels {
    inbound: mpsc::UnboundedReceiver<DataChange>,
    connectivity: mpsc::UnboundedReceiver<bool>,
    debounced: mpsc::UnboundedReceiver<DataChange>,
    shutdown: mpsc::Receiver<()>,
}

/// Handles owned while the coordinator runs.
struct Runtime {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<mpsc::UnboundedReceiver<DataChange>>,
    subscriptions: Vec<Subscription>,
}

struct CoordinatorInner {
    settings: SyncSettings,
    bridge: TransportBridge,
    state: RwLock<SyncState>,
    pending: Mutex<HashMap<PendingKey, DataChange>>,
    offline: Mutex<BoundedQueue<DataChange>>,
    debouncer: Debouncer<DataChange>,
    debounced_rx: Mutex<Option<mpsc::UnboundedReceiver<DataChange>>>,
    resolvers: ResolverRegistry,
    consumers: ConsumerRegistry,
    events: SyncEvents,
    replay: ReplayPolicy,
    draining: AtomicBool,
    running: AtomicBool,
    runtime: Mutex<Option<Runtime>>,
}

/// Clears the draining flag when a drain pass ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Cloneable handle to the sync coordinator.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl SyncCoordinator {
    /// Creates a stopped coordinator on top of `bridge`.
    pub fn new(settings: SyncSettings, bridge: TransportBridge) -> Self {
        let (debounced_tx, debounced_rx) = mpsc::unbounded_channel();
        let state = SyncState {
            connected: bridge.is_connected(),
            mode: settings.mode,
            ..Default::default()
        };

        SyncCoordinator {
            inner: Arc::new(CoordinatorInner {
                state: RwLock::new(state),
                pending: Mutex::new(HashMap::new()),
                offline: Mutex::new(BoundedQueue::new(settings.offline_queue_capacity)),
                debouncer: Debouncer::new(settings.debounce(), debounced_tx),
                debounced_rx: Mutex::new(Some(debounced_rx)),
                resolvers: ResolverRegistry::new(settings.default_strategy),
                consumers: ConsumerRegistry::new(),
                events: SyncEvents::default(),
                replay: ReplayPolicy::from_settings(&settings),
                draining: AtomicBool::new(false),
                running: AtomicBool::new(false),
                runtime: Mutex::new(None),
                settings,
                bridge,
            }),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Subscribes to the bridge and starts the background loop.
    ///
    /// Fails with `InvalidConfig` before starting anything if the sync or
    /// bridge settings are unusable.
    pub async fn init(&self) -> SyncResult<()> {
        self.inner.settings.validate()?;
        self.inner
            .bridge
            .config()
            .validate()
            .map_err(|e| SyncError::InvalidConfig(format!("bridge: {e}")))?;

        let mut runtime = self.inner.runtime.lock().await;
        if runtime.is_some() {
            return Err(SyncError::AlreadyRunning);
        }

        let debounced = self
            .inner
            .debounced_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| SyncError::ChannelError("debounce receiver unavailable".into()))?;

        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (connectivity_tx, connectivity) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown) = mpsc::channel(1);

        let bridge = &self.inner.bridge;
        let subscriptions = vec![
            bridge.on_remote_change(move |change| {
                let _ = inbound_tx.send(change.clone());
            }),
            bridge.on_connectivity(move |event| {
                let _ = connectivity_tx.send(event.connected);
            }),
        ];

        self.inner.state.write().await.connected = bridge.is_connected();

        let task = tokio::spawn(self.clone().run(LoopChannels {
            inbound,
            connectivity,
            debounced,
            shutdown,
        }));

        *runtime = Some(Runtime {
            shutdown_tx,
            task,
            subscriptions,
        });
        self.inner.running.store(true, Ordering::SeqCst);

        info!(
            mode = %self.inner.settings.mode,
            heartbeat_secs = self.inner.settings.heartbeat_interval_secs,
            conflict_window_ms = self.inner.settings.conflict_window_ms,
            "Sync coordinator started"
        );
        Ok(())
    }

    /// Stops the loop. Changes still inside the debounce window move to the
    /// offline queue. Safe to call more than once.
    pub async fn shutdown(&self) -> SyncResult<()> {
        let Some(runtime) = self.inner.runtime.lock().await.take() else {
            return Ok(());
        };

        info!("Shutting down sync coordinator");
        self.inner.running.store(false, Ordering::SeqCst);
        drop(runtime.subscriptions);

        let _ = runtime.shutdown_tx.send(()).await;
        let mut held = self.inner.debouncer.flush();

        match runtime.task.await {
            Ok(mut debounced) => {
                while let Ok(change) = debounced.try_recv() {
                    held.push(change);
                }
                *self.inner.debounced_rx.lock().await = Some(debounced);
            }
            Err(e) => error!(?e, "Sync coordinator loop ended abnormally"),
        }

        for change in by_timestamp(held) {
            self.enqueue(change).await;
        }

        info!(
            queued = self.offline_len().await,
            pending = self.inner.pending.lock().await.len(),
            "Sync coordinator stopped"
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    async fn run(self, mut channels: LoopChannels) -> mpsc::UnboundedReceiver<DataChange> {
        let mut heartbeat = tokio::time::interval(self.inner.settings.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the immediate first tick; the bridge already knows its state.
        heartbeat.tick().await;

        loop {
            tokio::select! {
                Some(change) = channels.inbound.recv() => {
                    if let Err(e) = self.ingest(change).await {
                        warn!(error = %e, "Rejected remote change");
                    }
                }

                Some(connected) = channels.connectivity.recv() => {
                    self.set_connected(connected).await;
                }

                Some(change) = channels.debounced.recv() => {
                    let this = self.clone();
                    tokio::spawn(async move { this.dispatch(change).await });
                }

                _ = heartbeat.tick() => self.heartbeat().await,

                _ = channels.shutdown.recv() => {
                    info!("Sync coordinator received shutdown");
                    break;
                }
            }
        }

        channels.debounced
    }

    /// Probes the host and retries anything left in the offline queue.
    async fn heartbeat(&self) {
        let healthy = self.inner.bridge.check_health().await;
        debug!(healthy, "Heartbeat");
        self.set_connected(healthy).await;

        let realtime = self.inner.state.read().await.mode == SyncMode::Realtime;
        if healthy && realtime && !self.inner.offline.lock().await.is_empty() {
            self.spawn_drain();
        }
    }

    // =========================================================================
    // Publish
    // =========================================================================

    /// Tracks a local change and sends it according to the current mode.
    ///
    /// Returns once the change is accepted; the outcome is reported through
    /// sync state and `change_failed` events.
    pub async fn publish(&self, change: DataChange) -> SyncResult<()> {
        if !self.is_running() {
            return Err(SyncError::NotRunning);
        }
        validate_change(&change)?;

        self.inner
            .pending
            .lock()
            .await
            .insert(key_of(&change), change.clone());
        self.refresh_state().await;

        let (mode, connected) = {
            let state = self.inner.state.read().await;
            (state.mode, state.connected)
        };
        let backlog = self.has_backlog().await;

        if mode != SyncMode::Realtime || !connected || backlog {
            debug!(entity = %change.entity, id = %change.id, %mode, connected, "Queueing change");
            self.enqueue(change).await;
            if backlog && connected && mode == SyncMode::Realtime {
                self.spawn_drain();
            }
            return Ok(());
        }

        if change.is_delete() || self.inner.settings.is_immediate(&change.entity) {
            let key = key_of(&change);
            let superseded = self.inner.debouncer.remove_where(|c| key_of(c) == key);
            if !superseded.is_empty() {
                debug!(id = %change.id, count = superseded.len(), "Dropped debounced changes superseded by immediate change");
            }
            self.dispatch(change).await;
        } else {
            let id = change.id.clone();
            if self.inner.debouncer.schedule(change.coalesce_key(), change) {
                debug!(id = %id, "Coalesced with debounced change");
            }
        }
        Ok(())
    }

    /// Sends one change now, or queues it if that is not possible.
    ///
    /// Anything already waiting for replay goes first, so a change that
    /// finds a backlog joins the end of it.
    async fn dispatch(&self, change: DataChange) {
        let (mode, connected) = {
            let state = self.inner.state.read().await;
            (state.mode, state.connected)
        };
        if mode != SyncMode::Realtime || !connected {
            self.enqueue(change).await;
            return;
        }
        if self.has_backlog().await {
            debug!(id = %change.id, "Replay in progress, queueing behind it");
            self.enqueue(change).await;
            self.spawn_drain();
            return;
        }

        match self.send_change(&change).await {
            Ok(()) => self.acknowledge(&change).await,
            Err(err) if err.is_connectivity() => {
                warn!(id = %change.id, error = %err, "Publish failed, queueing for replay");
                self.enqueue(change).await;
            }
            Err(err) => self.fail(change, err.to_string()).await,
        }
    }

    /// True while queued changes are waiting or being replayed.
    async fn has_backlog(&self) -> bool {
        self.inner.draining.load(Ordering::SeqCst) || !self.inner.offline.lock().await.is_empty()
    }

    async fn send_change(&self, change: &DataChange) -> BridgeResult<()> {
        self.inner
            .bridge
            .request(change.to_host_operation())
            .await
            .map(|_| ())
    }

    /// Clears pending tracking unless a newer local change replaced it.
    async fn acknowledge(&self, change: &DataChange) {
        let key = key_of(change);
        let cleared = {
            let mut pending = self.inner.pending.lock().await;
            if pending.get(&key) == Some(change) {
                pending.remove(&key);
                true
            } else {
                false
            }
        };

        self.inner.state.write().await.last_sync_at = Some(Utc::now());
        debug!(entity = %change.entity, id = %change.id, cleared, "Change acknowledged");
        self.refresh_state().await;
    }

    async fn fail(&self, change: DataChange, reason: String) {
        let key = key_of(&change);
        {
            let mut pending = self.inner.pending.lock().await;
            if pending.get(&key) == Some(&change) {
                pending.remove(&key);
            }
        }

        error!(entity = %change.entity, id = %change.id, reason = %reason, "Change failed");
        self.inner
            .events
            .change_failed
            .emit(&ChangeFailed { change, reason });
        self.refresh_state().await;
    }

    async fn enqueue(&self, change: DataChange) {
        let outcome = self.inner.offline.lock().await.push(change);
        match outcome {
            PushOutcome::Accepted => {}
            PushOutcome::Evicted(dropped) | PushOutcome::Rejected(dropped) => {
                warn!(id = %dropped.id, "Sync offline queue full, shedding change");
                self.fail(dropped, "evicted from full offline queue".into()).await;
            }
        }
    }

    // =========================================================================
    // Offline Replay
    // =========================================================================

    fn spawn_drain(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            this.drain_offline().await;
        });
    }

    /// Replays the offline queue in batches. Returns the number of changes
    /// the host acknowledged.
    ///
    /// Stops early when the host becomes unreachable; unsent changes stay
    /// at the head of the queue in their original order.
    pub async fn drain_offline(&self) -> usize {
        let (mode, connected) = {
            let state = self.inner.state.read().await;
            (state.mode, state.connected)
        };
        if mode == SyncMode::Offline || !connected {
            return 0;
        }

        let mut sent = 0;
        loop {
            if self.inner.draining.swap(true, Ordering::SeqCst) {
                debug!("Offline replay already in progress");
                break;
            }
            let (replayed, interrupted) = {
                let _guard = DrainGuard(&self.inner.draining);
                self.replay_queue().await
            };
            sent += replayed;

            // Changes queued behind the last batch while the flag was still
            // set are picked up by another pass.
            if interrupted || self.inner.offline.lock().await.is_empty() {
                break;
            }
        }

        if sent > 0 {
            info!(sent, "Offline queue replayed");
        }
        sent
    }

    /// One replay pass over the queue. Returns the acknowledged count and
    /// whether the host became unreachable.
    async fn replay_queue(&self) -> (usize, bool) {
        let send = |change: DataChange| {
            let this = self.clone();
            async move { this.send_change(&change).await }
        };
        let batch_size = self.inner.settings.drain_batch_size;
        let mut sent = 0;

        loop {
            let batch = {
                let mut offline = self.inner.offline.lock().await;
                let mut batch = offline.take_front(batch_size);
                let rest = split_at_repeated_key(&mut batch);
                if !rest.is_empty() {
                    offline.requeue_front(rest);
                }
                batch
            };
            if batch.is_empty() {
                break;
            }
            debug!(size = batch.len(), "Replaying offline batch");

            let mut requeue = Vec::new();
            for outcome in replay_batch(batch, &self.inner.replay, &send).await {
                match outcome {
                    ReplayOutcome::Sent(change) => {
                        self.acknowledge(&change).await;
                        sent += 1;
                    }
                    ReplayOutcome::Requeue(change, err) => {
                        debug!(id = %change.id, error = %err, "Keeping change for next replay");
                        requeue.push(change);
                    }
                    ReplayOutcome::Rejected(change, err) => {
                        self.fail(change, err.to_string()).await;
                    }
                }
            }

            if !requeue.is_empty() {
                let count = requeue.len();
                let overflow = self.inner.offline.lock().await.requeue_front(requeue);
                for change in overflow {
                    self.fail(change, "evicted from full offline queue".into()).await;
                }
                warn!(count, "Host unreachable during replay, changes requeued");
                return (sent, true);
            }
        }
        (sent, false)
    }

    /// Sends everything held back right now: debounced changes and the
    /// offline queue. Does nothing in offline mode or while disconnected.
    pub async fn sync_now(&self) -> SyncResult<usize> {
        if !self.is_running() {
            return Err(SyncError::NotRunning);
        }

        for change in by_timestamp(self.inner.debouncer.flush()) {
            self.enqueue(change).await;
        }
        Ok(self.drain_offline().await)
    }

    // =========================================================================
    // Ingest
    // =========================================================================

    /// Applies a change pushed by the host, resolving a conflict first if a
    /// local change to the same entity is pending. Returns the change that
    /// was handed to consumers.
    pub async fn ingest(&self, remote: DataChange) -> SyncResult<DataChange> {
        validate_change(&remote)?;

        let local = self.inner.pending.lock().await.get(&key_of(&remote)).cloned();
        let window = self.inner.settings.conflict_window_ms;

        let applied = match local {
            Some(local) if detect_conflict(&local, &remote, window) => {
                self.resolve_conflict(local, remote).await
            }
            _ => {
                debug!(entity = %remote.entity, id = %remote.id, "Applying remote change");
                self.inner.consumers.dispatch(&remote);
                remote
            }
        };

        self.inner.state.write().await.last_sync_at = Some(Utc::now());
        self.refresh_state().await;
        Ok(applied)
    }

    async fn resolve_conflict(&self, local: DataChange, remote: DataChange) -> DataChange {
        let mut conflict = SyncConflict::new(local, remote);
        self.inner.state.write().await.conflict_count += 1;

        info!(
            conflict = %conflict.id,
            entity = %conflict.remote_change.entity,
            id = %conflict.remote_change.id,
            local_ts = conflict.local_change.timestamp,
            remote_ts = conflict.remote_change.timestamp,
            "Conflict detected"
        );
        self.inner.events.conflict_detected.emit(&conflict);

        let resolution = self.inner.resolvers.resolve(&conflict).await;
        let applied = conflict.resolve(resolution);

        self.forget_local(&applied).await;
        self.inner.consumers.dispatch(&applied);
        self.inner.events.conflict_resolved.emit(&ConflictResolved {
            conflict: conflict.clone(),
            applied: applied.clone(),
        });

        info!(conflict = %conflict.id, strategy = %conflict.strategy, "Conflict resolved");

        if conflict.strategy != ConflictStrategy::RemoteWins {
            let this = self.clone();
            let resolved = applied.clone();
            let conflict_id = conflict.id.clone();
            tokio::spawn(async move {
                if let Err(e) = this.publish(resolved).await {
                    warn!(conflict = %conflict_id, error = %e, "Failed to publish conflict resolution");
                }
            });
        }
        applied
    }

    /// Drops every local trace of the entity `change` refers to.
    async fn forget_local(&self, change: &DataChange) {
        let key = key_of(change);
        self.inner.pending.lock().await.remove(&key);
        let debounced = self.inner.debouncer.remove_where(|c| key_of(c) == key);
        let queued = self
            .inner
            .offline
            .lock()
            .await
            .remove_where(|c| key_of(c) == key);

        if !debounced.is_empty() || !queued.is_empty() {
            debug!(
                id = %change.id,
                debounced = debounced.len(),
                queued = queued.len(),
                "Discarded local changes superseded by conflict resolution"
            );
        }
    }

    // =========================================================================
    // Connectivity & Mode
    // =========================================================================

    async fn set_connected(&self, connected: bool) {
        let (changed, mode) = {
            let mut state = self.inner.state.write().await;
            let changed = state.connected != connected;
            state.connected = connected;
            (changed, state.mode)
        };
        if !changed {
            return;
        }

        info!(connected, "Sync connectivity changed");
        self.emit_state().await;

        if connected && mode == SyncMode::Realtime {
            self.spawn_drain();
        }
    }

    /// Switches the publication mode.
    pub async fn set_mode(&self, mode: SyncMode) {
        let (previous, connected) = {
            let mut state = self.inner.state.write().await;
            (std::mem::replace(&mut state.mode, mode), state.connected)
        };
        if previous == mode {
            return;
        }

        info!(from = %previous, to = %mode, "Sync mode changed");
        if mode != SyncMode::Realtime {
            for change in by_timestamp(self.inner.debouncer.flush()) {
                self.enqueue(change).await;
            }
        }
        self.emit_state().await;

        if mode == SyncMode::Realtime && connected {
            self.spawn_drain();
        }
    }

    // =========================================================================
    // State & Registration
    // =========================================================================

    async fn refresh_state(&self) {
        let pending = self.inner.pending.lock().await.len();
        self.inner.state.write().await.pending_count = pending;
        self.emit_state().await;
    }

    async fn emit_state(&self) {
        let snapshot = self.inner.state.read().await.clone();
        self.inner.events.state.emit(&snapshot);
    }

    /// Current sync state snapshot.
    pub async fn state(&self) -> SyncState {
        self.inner.state.read().await.clone()
    }

    pub async fn offline_len(&self) -> usize {
        self.inner.offline.lock().await.len()
    }

    pub fn events(&self) -> &SyncEvents {
        &self.inner.events
    }

    /// Registers a consumer for applied changes to `entity`.
    pub fn register_consumer<F>(&self, entity: &str, consumer: F) -> Subscription
    where
        F: Fn(&DataChange) + Send + Sync + 'static,
    {
        self.inner.consumers.register(entity, consumer)
    }

    /// Adds a resolver consulted for every conflict.
    pub fn register_resolver(&self, resolver: Arc<dyn ConflictResolver>) {
        self.inner.resolvers.register(resolver);
    }

    /// Adds a resolver consulted for conflicts on `entity` only.
    pub fn register_resolver_for(&self, entity: &str, resolver: Arc<dyn ConflictResolver>) {
        self.inner.resolvers.register_for(entity, resolver);
    }

    pub fn on_state_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncState) + Send + Sync + 'static,
    {
        self.inner.events.state.subscribe(listener)
    }

    pub fn on_conflict_detected<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncConflict) + Send + Sync + 'static,
    {
        self.inner.events.conflict_detected.subscribe(listener)
    }

    pub fn on_conflict_resolved<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConflictResolved) + Send + Sync + 'static,
    {
        self.inner.events.conflict_resolved.subscribe(listener)
    }

    pub fn on_change_failed<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ChangeFailed) + Send + Sync + 'static,
    {
        self.inner.events.change_failed.subscribe(listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::StrategyResolver;
    use isometry_bridge::{BridgeConfig, LoopbackHost};
    use isometry_core::{ChangeOperation, MessageEnvelope, Payload, ResponseEnvelope};
    use serde_json::{json, Value};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    type HostLog = Arc<StdMutex<Vec<MessageEnvelope>>>;

    struct Harness {
        coordinator: SyncCoordinator,
        bridge: TransportBridge,
        host: Arc<LoopbackHost>,
        log: HostLog,
        applied: HostLog,
    }

    impl Harness {
        /// Host operations received so far, health probes excluded.
        fn operations(&self) -> Vec<(String, Value)> {
            self.log
                .lock()
                .unwrap()
                .iter()
                .filter(|env| env.operation != "ping")
                .map(|env| (env.operation.clone(), Value::Object(env.payload.clone())))
                .collect()
        }

        /// Names written by the host, in the order it acknowledged them.
        fn applied_names(&self) -> Vec<Value> {
            self.applied
                .lock()
                .unwrap()
                .iter()
                .map(|env| env.payload["data"]["name"].clone())
                .collect()
        }
    }

    /// How the in-process host treats everything except pings.
    #[derive(Clone, Copy, Default)]
    struct HostScript {
        /// Operations answered with a failure.
        refuse: &'static [&'static str],
        /// Leading requests that never get an answer.
        drop_first: usize,
        /// Wait before answering.
        delay: Duration,
    }

    /// Host that acknowledges everything except operations in `refuse`.
    async fn harness(settings: SyncSettings, connected: bool, refuse: &'static [&'static str]) -> Harness {
        scripted(settings, connected, HostScript { refuse, ..Default::default() }).await
    }

    async fn scripted(settings: SyncSettings, connected: bool, script: HostScript) -> Harness {
        let (host, mut rx) = LoopbackHost::new();
        let bridge = TransportBridge::new(
            BridgeConfig {
                max_attempts: 1,
                ..Default::default()
            },
            host.clone(),
        );
        bridge.set_connected(connected).await;

        let log: HostLog = Arc::new(StdMutex::new(Vec::new()));
        let applied: HostLog = Arc::new(StdMutex::new(Vec::new()));
        let responder = bridge.clone();
        let seen = log.clone();
        let written = applied.clone();
        tokio::spawn(async move {
            let mut dropped = 0;
            while let Some(env) = rx.recv().await {
                seen.lock().unwrap().push(env.clone());
                let is_ping = env.operation == "ping";
                if !is_ping && dropped < script.drop_first {
                    dropped += 1;
                    continue;
                }

                let refused = script.refuse.iter().any(|op| *op == env.operation);
                let bridge = responder.clone();
                let written = written.clone();
                let answer = async move {
                    let response = if refused {
                        ResponseEnvelope::failed(env.id, "constraint violated")
                    } else {
                        if !is_ping {
                            written.lock().unwrap().push(env.clone());
                        }
                        ResponseEnvelope::ok(env.id, Value::Null)
                    };
                    bridge.deliver(response).await;
                };
                if script.delay.is_zero() {
                    answer.await;
                } else {
                    tokio::spawn(async move {
                        tokio::time::sleep(script.delay).await;
                        answer.await;
                    });
                }
            }
        });

        let coordinator = SyncCoordinator::new(settings, bridge.clone());
        coordinator.init().await.unwrap();

        Harness {
            coordinator,
            bridge,
            host,
            log,
            applied,
        }
    }

    fn named(entity: &str, id: &str, name: &str, ts: i64) -> DataChange {
        let mut data = Payload::new();
        data.insert("name".into(), json!(name));
        DataChange::new(entity, id, ChangeOperation::Update, data).at(ts)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_updates_coalesce_to_last_value() {
        let h = harness(SyncSettings::default(), true, &[]).await;

        h.coordinator.publish(named("nodes", "n1", "A", 1_000)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.coordinator.publish(named("nodes", "n1", "B", 1_100)).await.unwrap();
        assert!(h.operations().is_empty());

        tokio::time::sleep(Duration::from_millis(400)).await;

        let ops = h.operations();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].0, "updateNode");
        assert_eq!(ops[0].1["data"]["name"], json!("B"));
        assert_eq!(h.coordinator.state().await.pending_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_bypasses_debounce() {
        let h = harness(SyncSettings::default(), true, &[]).await;

        h.coordinator.publish(named("nodes", "n1", "A", 1_000)).await.unwrap();
        let delete = DataChange::new("nodes", "n1", ChangeOperation::Delete, Payload::new()).at(1_050);
        h.coordinator.publish(delete).await.unwrap();

        let ops = h.operations();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].0, "deleteNode");

        // The pending update was superseded and never reaches the host.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.operations().len(), 1);
        assert_eq!(h.coordinator.state().await.pending_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_publish_drains_on_reconnect() {
        let h = harness(SyncSettings::default(), false, &[]).await;

        h.coordinator.publish(named("nodes", "n1", "A", 1_000)).await.unwrap();
        assert_eq!(h.coordinator.offline_len().await, 1);
        assert_eq!(h.coordinator.state().await.pending_count, 1);
        assert!(h.operations().is_empty());

        h.bridge.set_connected(true).await;
        settle().await;

        let state = h.coordinator.state().await;
        assert!(state.connected);
        assert_eq!(state.pending_count, 0);
        assert!(state.last_sync_at.is_some());
        assert_eq!(h.coordinator.offline_len().await, 0);

        let ops = h.operations();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].1["id"], json!("n1"));
        assert_eq!(ops[0].1["data"]["name"], json!("A"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_preserves_insertion_order_across_batches() {
        let h = harness(SyncSettings::default(), false, &[]).await;

        for i in 0..25 {
            h.coordinator
                .publish(named("nodes", &format!("n{i}"), "x", 1_000 + i))
                .await
                .unwrap();
        }
        assert_eq!(h.coordinator.offline_len().await, 25);

        h.bridge.set_connected(true).await;
        settle().await;

        let ids: Vec<Value> = h.operations().into_iter().map(|(_, p)| p["id"].clone()).collect();
        let expected: Vec<Value> = (0..25).map(|i| json!(format!("n{i}"))).collect();
        assert_eq!(ids, expected);
        assert_eq!(h.coordinator.state().await.pending_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflict_defaults_to_remote_wins() {
        let h = harness(SyncSettings::default(), true, &[]).await;
        let applied = Arc::new(StdMutex::new(Vec::new()));
        let _consumer = {
            let applied = applied.clone();
            h.coordinator
                .register_consumer("nodes", move |c| applied.lock().unwrap().push(c.data["name"].clone()))
        };
        let detected = Arc::new(StdMutex::new(0));
        let _detected = {
            let detected = detected.clone();
            h.coordinator.on_conflict_detected(move |_| *detected.lock().unwrap() += 1)
        };

        h.coordinator.publish(named("nodes", "n1", "Local", 1_000)).await.unwrap();
        let result = h
            .coordinator
            .ingest(named("nodes", "n1", "Remote", 1_500))
            .await
            .unwrap();

        assert_eq!(result.data["name"], json!("Remote"));
        assert_eq!(*applied.lock().unwrap(), vec![json!("Remote")]);
        assert_eq!(*detected.lock().unwrap(), 1);

        let state = h.coordinator.state().await;
        assert_eq!(state.conflict_count, 1);
        assert_eq!(state.pending_count, 0);

        // The debounced local change was discarded, nothing is republished.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(h.operations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_change_during_inflight_publish_wins() {
        let h = scripted(
            SyncSettings::default(),
            true,
            HostScript {
                delay: Duration::from_secs(1),
                ..Default::default()
            },
        )
        .await;
        let consumed = Arc::new(StdMutex::new(Vec::new()));
        let _consumer = {
            let consumed = consumed.clone();
            h.coordinator
                .register_consumer("nodes", move |c| consumed.lock().unwrap().push(c.data["name"].clone()))
        };
        let failed = Arc::new(StdMutex::new(0));
        let _failed = {
            let failed = failed.clone();
            h.coordinator.on_change_failed(move |_| *failed.lock().unwrap() += 1)
        };

        // The debounced update is on the wire, its answer is still a second away.
        h.coordinator.publish(named("nodes", "n1", "Local", 1_000)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(h.operations().len(), 1);
        assert!(h.applied_names().is_empty());
        assert_eq!(h.coordinator.state().await.pending_count, 1);

        let result = h
            .coordinator
            .ingest(named("nodes", "n1", "Remote", 1_500))
            .await
            .unwrap();
        assert_eq!(result.data["name"], json!("Remote"));
        assert_eq!(*consumed.lock().unwrap(), vec![json!("Remote")]);
        assert_eq!(h.coordinator.state().await.pending_count, 0);

        // The late acknowledgement neither restores the local change nor
        // triggers a second send.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.applied_names(), vec![json!("Local")]);
        let state = h.coordinator.state().await;
        assert_eq!(state.pending_count, 0);
        assert_eq!(state.conflict_count, 1);
        assert_eq!(h.operations().len(), 1);
        assert_eq!(h.coordinator.offline_len().await, 0);
        assert_eq!(*failed.lock().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_changes_outside_window_apply_without_conflict() {
        let h = harness(SyncSettings::default(), true, &[]).await;

        h.coordinator.publish(named("nodes", "n1", "Local", 1_000)).await.unwrap();
        let result = h
            .coordinator
            .ingest(named("nodes", "n1", "Remote", 7_000))
            .await
            .unwrap();

        assert_eq!(result.data["name"], json!("Remote"));
        let state = h.coordinator.state().await;
        assert_eq!(state.conflict_count, 0);
        assert_eq!(state.pending_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_wins_resolution_is_republished() {
        let h = harness(SyncSettings::default(), true, &[]).await;
        h.coordinator
            .register_resolver(Arc::new(StrategyResolver(ConflictStrategy::LocalWins)));

        h.coordinator
            .publish(named("nodes", "n1", "Local", 1_000).with_version(3))
            .await
            .unwrap();
        let applied = h
            .coordinator
            .ingest(named("nodes", "n1", "Remote", 2_000).with_version(4))
            .await
            .unwrap();
        assert_eq!(applied.data["name"], json!("Local"));
        assert_eq!(applied.version, 5);

        tokio::time::sleep(Duration::from_secs(1)).await;

        let ops = h.operations();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].1["data"]["name"], json!("Local"));
        assert_eq!(ops[0].1["version"], json!(5));
        assert_eq!(h.coordinator.state().await.pending_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_change_from_host_reaches_consumer() {
        let h = harness(SyncSettings::default(), true, &[]).await;
        let applied = Arc::new(StdMutex::new(Vec::new()));
        let _consumer = {
            let applied = applied.clone();
            h.coordinator
                .register_consumer("nodes", move |c| applied.lock().unwrap().push(c.id.clone()))
        };

        h.bridge
            .receive_json(
                r#"{"kind":"change","id":"n9","entity":"nodes","operation":"create","data":{"name":"x"},"timestamp":5,"version":1}"#,
            )
            .await
            .unwrap();
        settle().await;

        assert_eq!(*applied.lock().unwrap(), vec!["n9".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_mode_waits_for_sync_now() {
        let settings = SyncSettings {
            mode: SyncMode::Manual,
            ..Default::default()
        };
        let h = harness(settings, true, &[]).await;

        h.coordinator.publish(named("nodes", "n1", "A", 1_000)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(h.operations().is_empty());
        assert_eq!(h.coordinator.offline_len().await, 1);

        assert_eq!(h.coordinator.sync_now().await.unwrap(), 1);
        assert_eq!(h.operations().len(), 1);
        assert_eq!(h.coordinator.state().await.pending_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mode_switch_back_to_realtime_drains() {
        let h = harness(SyncSettings::default(), true, &[]).await;
        let modes = Arc::new(StdMutex::new(Vec::new()));
        let _sub = {
            let modes = modes.clone();
            h.coordinator.on_state_change(move |s| modes.lock().unwrap().push(s.mode))
        };

        h.coordinator.set_mode(SyncMode::Offline).await;
        h.coordinator.publish(named("nodes", "n1", "A", 1_000)).await.unwrap();
        assert_eq!(h.coordinator.sync_now().await.unwrap(), 0);
        assert_eq!(h.coordinator.offline_len().await, 1);

        h.coordinator.set_mode(SyncMode::Realtime).await;
        settle().await;

        assert_eq!(h.operations().len(), 1);
        assert_eq!(h.coordinator.offline_len().await, 0);
        assert!(modes.lock().unwrap().contains(&SyncMode::Offline));
        assert_eq!(modes.lock().unwrap().last(), Some(&SyncMode::Realtime));
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_queue_overflow_reports_failed_change() {
        let settings = SyncSettings {
            offline_queue_capacity: 2,
            ..Default::default()
        };
        let h = harness(settings, false, &[]).await;
        let failed = Arc::new(StdMutex::new(Vec::new()));
        let _sub = {
            let failed = failed.clone();
            h.coordinator
                .on_change_failed(move |f| failed.lock().unwrap().push(f.change.id.clone()))
        };

        for id in ["n1", "n2", "n3"] {
            h.coordinator.publish(named("nodes", id, "x", 1_000)).await.unwrap();
        }

        assert_eq!(*failed.lock().unwrap(), vec!["n1".to_string()]);
        assert_eq!(h.coordinator.offline_len().await, 2);
        assert_eq!(h.coordinator.state().await.pending_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_rejection_is_reported_not_queued() {
        let settings = SyncSettings {
            immediate_entities: vec!["nodes".into()],
            ..Default::default()
        };
        let h = harness(settings, true, &["updateNode"]).await;
        let failed = Arc::new(StdMutex::new(Vec::new()));
        let _sub = {
            let failed = failed.clone();
            h.coordinator
                .on_change_failed(move |f| failed.lock().unwrap().push(f.reason.clone()))
        };

        h.coordinator.publish(named("nodes", "n1", "A", 1_000)).await.unwrap();

        assert_eq!(failed.lock().unwrap().len(), 1);
        assert!(failed.lock().unwrap()[0].contains("constraint violated"));
        assert_eq!(h.coordinator.offline_len().await, 0);
        assert_eq!(h.coordinator.state().await.pending_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_failure_queues_for_replay() {
        let settings = SyncSettings {
            immediate_entities: vec!["nodes".into()],
            ..Default::default()
        };
        let h = harness(settings, true, &[]).await;
        h.host.set_failing(true);

        h.coordinator.publish(named("nodes", "n1", "A", 1_000)).await.unwrap();

        assert_eq!(h.coordinator.offline_len().await, 1);
        assert_eq!(h.coordinator.state().await.pending_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_keeps_newer_pending_change() {
        let h = harness(SyncSettings::default(), true, &[]).await;
        let older = named("nodes", "n1", "A", 1_000);
        let newer = named("nodes", "n1", "B", 2_000);

        h.coordinator
            .inner
            .pending
            .lock()
            .await
            .insert(key_of(&newer), newer.clone());
        h.coordinator.acknowledge(&older).await;
        assert_eq!(h.coordinator.state().await.pending_count, 1);

        h.coordinator.acknowledge(&newer).await;
        assert_eq!(h.coordinator.state().await.pending_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_during_replay_waits_for_queued_change() {
        let h = scripted(
            SyncSettings::default(),
            false,
            HostScript {
                drop_first: 1,
                ..Default::default()
            },
        )
        .await;

        h.coordinator.publish(named("nodes", "n1", "A", 1_000)).await.unwrap();
        h.bridge.set_connected(true).await;

        // The replayed "A" is lost once and retried after its timeout.
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.coordinator.publish(named("nodes", "n1", "B", 2_000)).await.unwrap();
        assert_eq!(h.coordinator.offline_len().await, 1);

        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(h.applied_names(), vec![json!("A"), json!("B")]);
        assert_eq!(h.coordinator.offline_len().await, 0);
        assert_eq!(h.coordinator.state().await.pending_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_publish_is_retried_by_heartbeat() {
        let settings = SyncSettings {
            immediate_entities: vec!["nodes".into()],
            ..Default::default()
        };
        let h = scripted(
            settings,
            true,
            HostScript {
                drop_first: 1,
                ..Default::default()
            },
        )
        .await;

        h.coordinator.publish(named("nodes", "n1", "A", 1_000)).await.unwrap();
        assert!(h.applied_names().is_empty());

        // No reconnect happens; the next healthy heartbeat replays the queue.
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(h.coordinator.state().await.connected);
        assert_eq!(h.applied_names(), vec![json!("A")]);
        assert_eq!(h.coordinator.offline_len().await, 0);
        assert_eq!(h.coordinator.state().await.pending_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_tracks_host_presence() {
        let h = harness(SyncSettings::default(), true, &[]).await;

        h.host.set_present(false);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(!h.coordinator.state().await.connected);

        h.host.set_present(true);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(h.coordinator.state().await.connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_moves_debounced_changes_to_queue() {
        let h = harness(SyncSettings::default(), true, &[]).await;

        h.coordinator.publish(named("nodes", "n1", "A", 1_000)).await.unwrap();
        h.coordinator.shutdown().await.unwrap();
        h.coordinator.shutdown().await.unwrap();

        assert_eq!(h.coordinator.offline_len().await, 1);
        assert!(matches!(
            h.coordinator.publish(named("nodes", "n2", "B", 1_000)).await,
            Err(SyncError::NotRunning)
        ));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(h.operations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_twice_is_rejected_and_restart_works() {
        let h = harness(SyncSettings::default(), true, &[]).await;
        assert!(matches!(h.coordinator.init().await, Err(SyncError::AlreadyRunning)));

        h.coordinator.shutdown().await.unwrap();
        h.coordinator.init().await.unwrap();
        assert!(h.coordinator.is_running());
    }

    #[tokio::test]
    async fn test_invalid_change_is_rejected() {
        let h = harness(SyncSettings::default(), true, &[]).await;
        let bad = DataChange::new("nodes", "", ChangeOperation::Update, Payload::new());
        assert!(matches!(
            h.coordinator.publish(bad).await,
            Err(SyncError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_init_rejects_zero_heartbeat() {
        let (host, _rx) = LoopbackHost::new();
        let bridge = TransportBridge::new(BridgeConfig::default(), host);
        let coordinator = SyncCoordinator::new(
            SyncSettings {
                heartbeat_interval_secs: 0,
                ..Default::default()
            },
            bridge,
        );

        assert!(matches!(coordinator.init().await, Err(SyncError::InvalidConfig(_))));
        assert!(!coordinator.is_running());
        assert!(matches!(
            coordinator.publish(named("nodes", "n1", "A", 1_000)).await,
            Err(SyncError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_init_rejects_invalid_bridge_settings() {
        let (host, _rx) = LoopbackHost::new();
        let bridge = TransportBridge::new(
            BridgeConfig {
                probe_interval_secs: 0,
                ..Default::default()
            },
            host,
        );
        let coordinator = SyncCoordinator::new(SyncSettings::default(), bridge);

        assert!(matches!(
            coordinator.init().await,
            Err(SyncError::InvalidConfig(msg)) if msg.starts_with("bridge:")
        ));
        assert!(!coordinator.is_running());
    }
}
