//! # Domain Change Types
//!
//! The unit of domain mutation exchanged between the UI and the host, and
//! the process-wide sync status record.
//!
//! ## Change Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      DataChange Lifecycle                               │
//! │                                                                         │
//! │                     publish()                                           │
//! │                        │                                                │
//! │                        ▼                                                │
//! │                 ┌──────────────┐  host ack   ┌──────────────┐          │
//! │                 │ pending-local│ ──────────► │ acknowledged │          │
//! │                 └──┬────────┬──┘             └──────────────┘          │
//! │        disconnected│        │ remote change in window                  │
//! │                    ▼        ▼                                          │
//! │         ┌───────────────┐ ┌────────────┐ resolution ┌──────────┐       │
//! │         │ queued-offline│ │ conflicted │ ─────────► │ resolved │       │
//! │         └───────┬───────┘ └────────────┘            └──────────┘       │
//! │                 │ reconnect                                             │
//! │                 └──────────► pending-local                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::envelope::{HostOperation, Payload};

// =============================================================================
// Change Operation
// =============================================================================

/// Kind of mutation a [`DataChange`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum ChangeOperation {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeOperation::Create => write!(f, "create"),
            ChangeOperation::Update => write!(f, "update"),
            ChangeOperation::Delete => write!(f, "delete"),
        }
    }
}

// =============================================================================
// Data Change
// =============================================================================

/// One unit of domain mutation, either locally originated (pending
/// publication) or pushed by the host (pending application).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct DataChange {
    /// Identifier of the entity being changed.
    pub id: String,

    /// Table / entity type name (e.g. "nodes").
    pub entity: String,

    /// Mutation kind.
    pub operation: ChangeOperation,

    /// Entity fields after the change.
    #[serde(default)]
    #[ts(type = "Record<string, unknown>")]
    pub data: Payload,

    /// When the change was made (epoch milliseconds).
    #[ts(type = "number")]
    pub timestamp: i64,

    /// Entity version after the change.
    #[serde(default)]
    pub version: u64,
}

impl DataChange {
    /// Creates a change stamped with the current time and version 0.
    pub fn new(
        entity: impl Into<String>,
        id: impl Into<String>,
        operation: ChangeOperation,
        data: Payload,
    ) -> Self {
        DataChange {
            id: id.into(),
            entity: entity.into(),
            operation,
            data,
            timestamp: Utc::now().timestamp_millis(),
            version: 0,
        }
    }

    /// Sets an explicit timestamp (epoch milliseconds).
    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Sets an explicit version.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Returns true for deletions.
    pub fn is_delete(&self) -> bool {
        self.operation == ChangeOperation::Delete
    }

    /// Key under which rapid repeats of the same logical change coalesce.
    ///
    /// Changes with different entity, id or operation never share a key.
    pub fn coalesce_key(&self) -> String {
        format!("{}:{}:{}", self.entity, self.id, self.operation)
    }

    /// Builds the host operation that publishes this change.
    pub fn to_host_operation(&self) -> HostOperation {
        let table = self.entity.clone();
        let id = self.id.clone();
        let version = self.version;
        let timestamp = self.timestamp;

        match self.operation {
            ChangeOperation::Create => HostOperation::CreateNode {
                table,
                id,
                data: self.data.clone(),
                version,
                timestamp,
            },
            ChangeOperation::Update => HostOperation::UpdateNode {
                table,
                id,
                data: self.data.clone(),
                version,
                timestamp,
            },
            ChangeOperation::Delete => HostOperation::DeleteNode {
                table,
                id,
                version,
                timestamp,
            },
        }
    }
}

// =============================================================================
// Sync Mode & State
// =============================================================================

/// How the sync coordinator publishes local changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum SyncMode {
    /// Publish as changes happen (debounced).
    #[default]
    Realtime,

    /// Queue changes until an explicit sync is requested.
    Manual,

    /// Queue everything; never publish.
    Offline,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Realtime => write!(f, "realtime"),
            SyncMode::Manual => write!(f, "manual"),
            SyncMode::Offline => write!(f, "offline"),
        }
    }
}

impl std::str::FromStr for SyncMode {
    type Err = crate::error::ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "realtime" | "auto" => Ok(SyncMode::Realtime),
            "manual" => Ok(SyncMode::Manual),
            "offline" | "disabled" => Ok(SyncMode::Offline),
            other => Err(crate::error::ValidationError::InvalidFormat {
                field: "sync mode".to_string(),
                reason: format!("'{other}' is not one of realtime, manual, offline"),
            }),
        }
    }
}

/// Process-wide sync status, read by observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct SyncState {
    /// Whether the host answered the last liveness check.
    pub connected: bool,

    /// Last time a change was acknowledged or applied.
    #[ts(as = "Option<String>")]
    pub last_sync_at: Option<DateTime<Utc>>,

    /// Local changes not yet acknowledged by the host.
    pub pending_count: usize,

    /// Conflicts detected since initialization.
    pub conflict_count: usize,

    /// Current publication mode.
    pub mode: SyncMode,
}

impl Default for SyncState {
    fn default() -> Self {
        SyncState {
            connected: false,
            last_sync_at: None,
            pending_count: 0,
            conflict_count: 0,
            mode: SyncMode::Realtime,
        }
    }
}
