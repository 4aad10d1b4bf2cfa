//! # isometry-core: Pure Bridge & Sync Types
//!
//! Everything the transport bridge and the sync coordinator agree on, as
//! plain data and deterministic state machines with zero I/O.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Isometry Client Architecture                       │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    UI layer (out of scope)                      │   │
//! │  │      reads SyncState, listens for conflicts/connectivity        │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │          isometry-sync  ──►  isometry-bridge  ──► host          │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │             ★ isometry-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌──────────────────┐  │   │
//! │  │   │ envelope │ │  change  │ │ conflict │ │ breaker / queue  │  │   │
//! │  │   │ Message  │ │DataChange│ │ detect   │ │ / retry          │  │   │
//! │  │   │ Response │ │SyncState │ │ merge    │ │ state machines   │  │   │
//! │  │   └──────────┘ └──────────┘ └──────────┘ └──────────────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO TIMERS • CLOCKS PASSED IN                         │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`envelope`] - Wire envelopes and typed host operations
//! - [`change`] - `DataChange`, `SyncState`, `SyncMode`
//! - [`conflict`] - Conflict detection and resolution rules
//! - [`breaker`] - Circuit breaker state machine
//! - [`queue`] - Generic bounded FIFO with eviction policy
//! - [`retry`] - Retry budget and backoff arithmetic
//! - [`error`] - `BridgeError` taxonomy and validation errors
//! - [`validation`] - Input checks
//!
//! ## Example Usage
//!
//! ```rust
//! use isometry_core::breaker::CircuitBreaker;
//! use std::time::{Duration, Instant};
//!
//! let start = Instant::now();
//! let mut breaker = CircuitBreaker::new(5, Duration::from_secs(60));
//! for _ in 0..5 {
//!     breaker.record_failure(start);
//! }
//!
//! assert!(!breaker.should_allow(start + Duration::from_secs(59)).0);
//! assert!(breaker.should_allow(start + Duration::from_secs(60)).0);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod breaker;
pub mod change;
pub mod conflict;
pub mod envelope;
pub mod error;
pub mod queue;
pub mod retry;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use breaker::{BreakerSnapshot, BreakerState, BreakerTransition, CircuitBreaker};
pub use change::{ChangeOperation, DataChange, SyncMode, SyncState};
pub use conflict::{
    detect_conflict, merge_data, ConflictResolution, ConflictStrategy, SyncConflict,
};
pub use envelope::{
    HostOperation, InboundMessage, MessageEnvelope, Payload, ResponseEnvelope, Target,
};
pub use error::{BridgeError, BridgeResult, ValidationError};
pub use queue::{BoundedQueue, EvictionPolicy, PushOutcome};
pub use retry::{RetryDecision, RetryPolicy, RetryState};

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Maximum length of entity and correlation ids.
pub const MAX_ID_LEN: usize = 256;

/// Maximum length of a table / entity type name.
pub const MAX_ENTITY_NAME_LEN: usize = 64;
