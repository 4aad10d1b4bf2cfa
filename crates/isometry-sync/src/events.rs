//! # Sync Events
//!
//! Observer registries for the sync layer and per-entity change consumers.
//! Built on [`isometry_bridge::EventRegistry`], so every subscription is a
//! [`Subscription`] handle.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use isometry_bridge::{EventRegistry, Subscription};
use isometry_core::{DataChange, SyncConflict, SyncState};

/// A conflict reached its final resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictResolved {
    pub conflict: SyncConflict,
    /// The change that was applied.
    pub applied: DataChange,
}

/// A local change will never reach the host.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeFailed {
    pub change: DataChange,
    pub reason: String,
}

/// Event categories exposed by the sync coordinator.
#[derive(Clone, Default)]
pub struct SyncEvents {
    /// sync-state-changed
    pub state: EventRegistry<SyncState>,

    /// conflict-detected
    pub conflict_detected: EventRegistry<SyncConflict>,

    /// conflict-resolved
    pub conflict_resolved: EventRegistry<ConflictResolved>,

    /// Changes rejected by the host or shed from the offline queue.
    pub change_failed: EventRegistry<ChangeFailed>,
}

/// Consumers of applied changes, keyed by entity type.
#[derive(Default)]
pub struct ConsumerRegistry {
    by_entity: Mutex<HashMap<String, EventRegistry<DataChange>>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `consumer` for changes to `entity`.
    pub fn register<F>(&self, entity: &str, consumer: F) -> Subscription
    where
        F: Fn(&DataChange) + Send + Sync + 'static,
    {
        let registry = self
            .by_entity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(entity.to_string())
            .or_default()
            .clone();
        registry.subscribe(consumer)
    }

    /// Hands `change` to every consumer of its entity type. Returns the
    /// number of consumers reached.
    pub fn dispatch(&self, change: &DataChange) -> usize {
        let registry = self
            .by_entity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&change.entity)
            .cloned();

        match registry {
            Some(registry) => {
                let count = registry.listener_count();
                registry.emit(change);
                count
            }
            None => 0,
        }
    }
}
