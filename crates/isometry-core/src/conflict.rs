//! # Conflict Detection & Resolution Rules
//!
//! Pure rules for deciding whether a local and a remote change collide and
//! what data a chosen resolution produces. Choosing the strategy (resolver
//! functions, fallbacks) is the sync coordinator's job.
//!
//! ## Detection Rule
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Conflict Detection                                  │
//! │                                                                         │
//! │  conflict  ⇔  local.id == remote.id                                    │
//! │            ∧  local.timestamp ≠ remote.timestamp                       │
//! │            ∧  |local.timestamp − remote.timestamp| ≤ window            │
//! │                                                                         │
//! │  local ts=1000, remote ts=1500, window 5000  → conflict                │
//! │  local ts=1000, remote ts=7000, window 5000  → sequential, remote wins │
//! │  local ts=1000, remote ts=1000               → echo, not a conflict    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::change::{ChangeOperation, DataChange};
use crate::envelope::Payload;
use crate::error::ValidationError;

// =============================================================================
// Strategy
// =============================================================================

/// How a conflict was (or should be) settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "kebab-case")]
#[ts(export)]
pub enum ConflictStrategy {
    /// Keep the local change.
    LocalWins,

    /// Take the remote change.
    #[default]
    RemoteWins,

    /// Combine both sides field by field.
    Merge,

    /// A user picked the data explicitly.
    UserChoice,
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictStrategy::LocalWins => write!(f, "local-wins"),
            ConflictStrategy::RemoteWins => write!(f, "remote-wins"),
            ConflictStrategy::Merge => write!(f, "merge"),
            ConflictStrategy::UserChoice => write!(f, "user-choice"),
        }
    }
}

impl std::str::FromStr for ConflictStrategy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "local-wins" | "local" => Ok(ConflictStrategy::LocalWins),
            "remote-wins" | "remote" => Ok(ConflictStrategy::RemoteWins),
            "merge" => Ok(ConflictStrategy::Merge),
            "user-choice" => Ok(ConflictStrategy::UserChoice),
            other => Err(ValidationError::InvalidFormat {
                field: "conflict strategy".to_string(),
                reason: format!("unknown strategy '{other}'"),
            }),
        }
    }
}

// =============================================================================
// Resolution
// =============================================================================

/// Outcome chosen for a conflict, optionally carrying explicit data.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictResolution {
    pub strategy: ConflictStrategy,
    pub data: Option<Payload>,
}

impl ConflictResolution {
    pub fn local_wins() -> Self {
        ConflictResolution {
            strategy: ConflictStrategy::LocalWins,
            data: None,
        }
    }

    pub fn remote_wins() -> Self {
        ConflictResolution {
            strategy: ConflictStrategy::RemoteWins,
            data: None,
        }
    }

    /// Merge; `None` uses [`merge_data`].
    pub fn merge(data: Option<Payload>) -> Self {
        ConflictResolution {
            strategy: ConflictStrategy::Merge,
            data,
        }
    }

    pub fn user_choice(data: Payload) -> Self {
        ConflictResolution {
            strategy: ConflictStrategy::UserChoice,
            data: Some(data),
        }
    }

    /// Resolution for a bare strategy with no explicit data.
    pub fn from_strategy(strategy: ConflictStrategy) -> Self {
        ConflictResolution {
            strategy,
            data: None,
        }
    }
}

// =============================================================================
// Sync Conflict
// =============================================================================

/// A local pending change and a remote change that collided.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct SyncConflict {
    /// Conflict id (UUID v4).
    pub id: String,

    pub local_change: DataChange,

    pub remote_change: DataChange,

    /// Strategy applied; `RemoteWins` until resolved otherwise.
    pub strategy: ConflictStrategy,

    /// Final data once resolved.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    #[ts(type = "Record<string, unknown> | null")]
    pub resolved_data: Option<Payload>,
}

impl SyncConflict {
    /// Creates an unresolved conflict.
    pub fn new(local_change: DataChange, remote_change: DataChange) -> Self {
        SyncConflict {
            id: uuid::Uuid::new_v4().to_string(),
            local_change,
            remote_change,
            strategy: ConflictStrategy::default(),
            resolved_data: None,
        }
    }

    /// Returns true once a resolution has been recorded.
    pub fn is_resolved(&self) -> bool {
        self.resolved_data.is_some()
    }

    /// Records a resolution and returns the change that should be applied.
    ///
    /// `UserChoice` without data falls back to the remote side.
    pub fn resolve(&mut self, resolution: ConflictResolution) -> DataChange {
        let local = &self.local_change;
        let remote = &self.remote_change;

        let (strategy, data) = match (resolution.strategy, resolution.data) {
            (ConflictStrategy::RemoteWins, _) => (ConflictStrategy::RemoteWins, remote.data.clone()),
            (ConflictStrategy::LocalWins, _) => (ConflictStrategy::LocalWins, local.data.clone()),
            (ConflictStrategy::Merge, Some(data)) => (ConflictStrategy::Merge, data),
            (ConflictStrategy::Merge, None) => {
                (ConflictStrategy::Merge, merge_data(&local.data, &remote.data))
            }
            (ConflictStrategy::UserChoice, Some(data)) => (ConflictStrategy::UserChoice, data),
            (ConflictStrategy::UserChoice, None) => {
                (ConflictStrategy::RemoteWins, remote.data.clone())
            }
        };

        let operation = match strategy {
            ConflictStrategy::RemoteWins => remote.operation,
            ConflictStrategy::LocalWins => local.operation,
            ConflictStrategy::Merge | ConflictStrategy::UserChoice => {
                if local.is_delete() && remote.is_delete() {
                    ChangeOperation::Delete
                } else {
                    ChangeOperation::Update
                }
            }
        };

        let version = if strategy == ConflictStrategy::RemoteWins {
            remote.version
        } else {
            local.version.max(remote.version) + 1
        };

        let resolved = DataChange {
            id: remote.id.clone(),
            entity: remote.entity.clone(),
            operation,
            data: data.clone(),
            timestamp: local.timestamp.max(remote.timestamp),
            version,
        };

        self.strategy = strategy;
        self.resolved_data = Some(data);
        resolved
    }
}

// =============================================================================
// Rules
// =============================================================================

/// Returns true if `local` and `remote` are concurrent edits of one entity.
pub fn detect_conflict(local: &DataChange, remote: &DataChange, window_ms: u64) -> bool {
    if local.id != remote.id || local.timestamp == remote.timestamp {
        return false;
    }

    local.timestamp.abs_diff(remote.timestamp) <= window_ms
}

/// Shallow field merge: every local field, overlaid by remote fields.
pub fn merge_data(local: &Payload, remote: &Payload) -> Payload {
    let mut merged = local.clone();
    for (key, value) in remote {
        merged.insert(key.clone(), value.clone());
    }
    merged
}
