//! # Error Types
//!
//! Error taxonomy shared by the bridge and the sync layers.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  isometry-core errors (this file)                                      │
//! │  ├── BridgeError      - Outcome of a failed host call                  │
//! │  └── ValidationError  - Malformed envelope / change input              │
//! │                                                                         │
//! │  isometry-sync errors (separate crate)                                 │
//! │  └── SyncError        - Wraps BridgeError + config failures            │
//! │                                                                         │
//! │  Retry classification:                                                 │
//! │  ┌────────────────────────┬──────────────┐                            │
//! │  │ Timeout                │  retriable   │                            │
//! │  │ TransientChannel       │  retriable   │                            │
//! │  │ TransportUnavailable   │  fatal       │                            │
//! │  │ CircuitOpen            │  fatal       │                            │
//! │  │ Application            │  fatal       │                            │
//! │  │ QueueOverflow          │  fatal       │                            │
//! │  │ CancelledByCleanup     │  fatal       │                            │
//! │  │ Serialization          │  fatal       │                            │
//! │  └────────────────────────┴──────────────┘                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Bridge Error
// =============================================================================

/// Terminal failure of a host call.
///
/// Errors are `Clone` because a single failure may be reported both to the
/// waiting caller and to the request event registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// No host messaging channel exists (e.g. running outside the host).
    #[error("Host transport is not available")]
    TransportUnavailable,

    /// The circuit breaker is open and refused the call.
    #[error("Circuit breaker is open, call rejected")]
    CircuitOpen,

    /// No response arrived before the deadline.
    #[error("Request {id} timed out after {timeout_ms}ms")]
    Timeout { id: String, timeout_ms: u64 },

    /// The host channel failed to accept the message.
    #[error("Transient channel error: {0}")]
    TransientChannel(String),

    /// The host processed the request and reported a domain failure.
    #[error("Host reported error: {0}")]
    Application(String),

    /// The request was shed from a full offline queue.
    #[error("Request {id} evicted from full offline queue")]
    QueueOverflow { id: String },

    /// The bridge was torn down while the request was pending.
    #[error("Request cancelled by bridge cleanup")]
    CancelledByCleanup,

    /// A payload or inbound message did not match its schema.
    #[error("Serialization failed: {0}")]
    Serialization(String),
}

impl BridgeError {
    /// Returns true if the bridge may transparently retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::Timeout { .. } | BridgeError::TransientChannel(_)
        )
    }

    /// Returns true if the error says the host could not be reached, as
    /// opposed to the host answering with a failure.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            BridgeError::TransportUnavailable
                | BridgeError::CircuitOpen
                | BridgeError::Timeout { .. }
                | BridgeError::TransientChannel(_)
                | BridgeError::QueueOverflow { .. }
        )
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Serialization(err.to_string())
    }
}

/// Convenience type alias for bridge results.
pub type BridgeResult<T> = Result<T, BridgeError>;

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors for changes and envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Invalid format.
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

// =============================================================================
// Unit Tests
// =============================================================================
