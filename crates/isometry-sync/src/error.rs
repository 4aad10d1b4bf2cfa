//! # Sync Error Types
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Lifecycle           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Bridge(..)     │  │  NotRunning             │ │
//! │  │  ConfigLoad     │  │  (BridgeError)  │  │  AlreadyRunning         │ │
//! │  │  ConfigSave     │  │                 │  │  ChannelError           │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐                                                   │
//! │  │   Validation    │                                                   │
//! │  │  (bad changes)  │                                                   │
//! │  └─────────────────┘                                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use isometry_core::{BridgeError, ValidationError};
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// A host round trip failed.
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    // =========================================================================
    // Input Errors
    // =========================================================================
    /// A change failed validation.
    #[error("Invalid change: {0}")]
    Validation(#[from] ValidationError),

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// Coordinator not started, or already shut down.
    #[error("Sync coordinator is not running")]
    NotRunning,

    /// `init` called twice.
    #[error("Sync coordinator is already running")]
    AlreadyRunning,

    /// Internal channel closed unexpectedly.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Bridge(BridgeError::from(err))
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Returns true if the operation may succeed when retried later.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Bridge(err) => err.is_retryable() || err.is_connectivity(),
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}
