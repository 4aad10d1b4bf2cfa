//! # Event Registries
//!
//! Typed observer lists, one per event category. Subscribing returns a
//! [`Subscription`]; dropping it (or calling [`Subscription::unsubscribe`])
//! removes the listener, so a torn-down UI component cannot leak callbacks.
//!
//! ## Delivery Guarantees
//! - Listeners run synchronously inside `emit`, in subscription order.
//! - The listener list is snapshotted before dispatch, so a listener may
//!   subscribe or unsubscribe without deadlocking.
//! - Listeners must not block; hand work to a channel or a task instead.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use chrono::{DateTime, Utc};
use isometry_core::{BridgeError, DataChange};

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct RegistryInner<E> {
    next_id: u64,
    listeners: Vec<(u64, Listener<E>)>,
}

/// Observer list for one event type.
pub struct EventRegistry<E> {
    inner: Arc<Mutex<RegistryInner<E>>>,
}

impl<E> Clone for EventRegistry<E> {
    fn clone(&self) -> Self {
        EventRegistry {
            inner: self.inner.clone(),
        }
    }
}

impl<E: 'static> Default for EventRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: 'static> EventRegistry<E> {
    pub fn new() -> Self {
        EventRegistry {
            inner: Arc::new(Mutex::new(RegistryInner {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }

    /// Registers a listener. It stays registered while the returned
    /// subscription is alive.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let id = inner.next_id;
            inner.next_id += 1;
            inner.listeners.push((id, Arc::new(listener)));
            id
        };

        let weak: Weak<Mutex<RegistryInner<E>>> = Arc::downgrade(&self.inner);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
                    inner.listeners.retain(|(listener_id, _)| *listener_id != id);
                }
            })),
        }
    }

    /// Dispatches `event` to every current listener.
    pub fn emit(&self, event: &E) {
        let listeners: Vec<Listener<E>> = {
            let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner.listeners.iter().map(|(_, l)| l.clone()).collect()
        };

        for listener in listeners {
            listener(event);
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .len()
    }
}

/// Handle that keeps a listener registered.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Removes the listener now.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keeps the listener registered for the registry's whole lifetime.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

// =============================================================================
// Bridge Events
// =============================================================================

/// Host connectivity flipped.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectivityChanged {
    pub connected: bool,
    pub at: DateTime<Utc>,
}

/// Terminal outcome of a pending request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    Resolved,
    Rejected(BridgeError),
}

/// A pending request reached a terminal state.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSettled {
    pub id: String,
    pub outcome: RequestOutcome,
}

/// Event categories exposed by the transport bridge.
#[derive(Clone, Default)]
pub struct BridgeEvents {
    /// connectivity-state-changed
    pub connectivity: EventRegistry<ConnectivityChanged>,

    /// Every resolve / reject / timeout of a pending request.
    pub requests: EventRegistry<RequestSettled>,

    /// Change notifications pushed by the host.
    pub remote_changes: EventRegistry<DataChange>,
}
