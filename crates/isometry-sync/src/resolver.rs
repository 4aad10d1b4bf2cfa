//! # Conflict Resolvers
//!
//! Pluggable strategies consulted when a local pending change and a remote
//! change collide.
//!
//! ## Resolution Order
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   SyncConflict ──► resolver #1 ──► Ok(Some(resolution)) ──► applied     │
//! │                        │                                                │
//! │                  Ok(None) / Err                                         │
//! │                        ▼                                                │
//! │                    resolver #2 ──► ...                                  │
//! │                        │                                                │
//! │                  nobody accepted                                        │
//! │                        ▼                                                │
//! │                 default strategy (remote-wins unless configured)        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A resolver failure is logged and treated as "not accepted"; the conflict
//! is always settled.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use isometry_core::{ConflictResolution, ConflictStrategy, SyncConflict};
use tracing::{debug, warn};

/// Error a resolver may return.
pub type ResolverError = Box<dyn std::error::Error + Send + Sync>;

/// Decides how a conflict is settled.
///
/// Return `Ok(None)` to pass the conflict on to the next resolver.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn resolve(&self, conflict: &SyncConflict) -> Result<Option<ConflictResolution>, ResolverError>;
}

/// Adapts a synchronous closure into a resolver.
pub struct FnResolver<F> {
    f: F,
}

impl<F> FnResolver<F>
where
    F: Fn(&SyncConflict) -> Result<Option<ConflictResolution>, ResolverError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        FnResolver { f }
    }
}

#[async_trait]
impl<F> ConflictResolver for FnResolver<F>
where
    F: Fn(&SyncConflict) -> Result<Option<ConflictResolution>, ResolverError> + Send + Sync,
{
    async fn resolve(&self, conflict: &SyncConflict) -> Result<Option<ConflictResolution>, ResolverError> {
        (self.f)(conflict)
    }
}

/// Always answers with one fixed strategy.
#[derive(Debug, Clone, Copy)]
pub struct StrategyResolver(pub ConflictStrategy);

#[async_trait]
impl ConflictResolver for StrategyResolver {
    async fn resolve(&self, _conflict: &SyncConflict) -> Result<Option<ConflictResolution>, ResolverError> {
        Ok(Some(ConflictResolution::from_strategy(self.0)))
    }
}

struct Registered {
    /// Only consulted for this entity type when set.
    entity: Option<String>,
    resolver: Arc<dyn ConflictResolver>,
}

/// Ordered resolver list with a default fallback.
pub struct ResolverRegistry {
    resolvers: Mutex<Vec<Registered>>,
    default_strategy: ConflictStrategy,
}

impl ResolverRegistry {
    pub fn new(default_strategy: ConflictStrategy) -> Self {
        ResolverRegistry {
            resolvers: Mutex::new(Vec::new()),
            default_strategy,
        }
    }

    /// Adds a resolver consulted for every entity type.
    pub fn register(&self, resolver: Arc<dyn ConflictResolver>) {
        self.push(None, resolver);
    }

    /// Adds a resolver consulted only for conflicts on `entity`.
    pub fn register_for(&self, entity: impl Into<String>, resolver: Arc<dyn ConflictResolver>) {
        self.push(Some(entity.into()), resolver);
    }

    fn push(&self, entity: Option<String>, resolver: Arc<dyn ConflictResolver>) {
        self.resolvers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Registered { entity, resolver });
    }

    pub fn len(&self) -> usize {
        self.resolvers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Picks a resolution. Never fails: falls back to the default strategy.
    pub async fn resolve(&self, conflict: &SyncConflict) -> ConflictResolution {
        let entity = conflict.remote_change.entity.as_str();
        let candidates: Vec<Arc<dyn ConflictResolver>> = self
            .resolvers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.entity.as_deref().map_or(true, |e| e == entity))
            .map(|r| r.resolver.clone())
            .collect();

        for (index, resolver) in candidates.iter().enumerate() {
            match resolver.resolve(conflict).await {
                Ok(Some(resolution)) => {
                    debug!(
                        conflict = %conflict.id,
                        resolver = index,
                        strategy = %resolution.strategy,
                        "Conflict resolved by resolver"
                    );
                    return resolution;
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!(conflict = %conflict.id, resolver = index, error = %e, "Conflict resolver failed");
                }
            }
        }

        debug!(
            conflict = %conflict.id,
            strategy = %self.default_strategy,
            "No resolver accepted, using default strategy"
        );
        ConflictResolution::from_strategy(self.default_strategy)
    }
}
