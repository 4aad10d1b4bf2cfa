//! # isometry-sync: Sync Coordinator for Isometry
//!
//! Keeps the client's optimistic local state and the host's authoritative
//! state converging, on top of [`isometry_bridge::TransportBridge`].
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Coordinator                                 │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                 SyncCoordinator (coordinator.rs)                 │  │
//! │  │                                                                  │  │
//! │  │  publish ─► debounce ─► bridge.request ─► ack / queue / fail     │  │
//! │  │  ingest  ─► conflict? ─► resolvers ─► consumers                  │  │
//! │  │  heartbeat every 10s ─► bridge.check_health                      │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │   Debouncer    │  │ Offline replay │  │  ResolverRegistry      │    │
//! │  │                │  │                │  │                        │    │
//! │  │ Per-key 300ms  │  │ Batches of 10  │  │ Ordered resolvers,     │    │
//! │  │ trailing edge  │  │ with backoff   │  │ default fallback       │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  EVENTS:                                                               │
//! │  • state              - connectivity, pending, conflicts, mode        │
//! │  • conflict_detected  - a local and remote change collided            │
//! │  • conflict_resolved  - resolution applied                            │
//! │  • change_failed      - a local change will not reach the host        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`config`] - `ClientConfig` (bridge + sync settings), TOML and env
//! - [`coordinator`] - `SyncCoordinator` orchestrator
//! - [`debounce`] - Keyed trailing-edge debouncer
//! - [`error`] - Sync error types
//! - [`events`] - Sync event registries and entity consumers
//! - [`replay`] - Offline queue replay
//! - [`resolver`] - Conflict resolver trait and registry
//!
//! ## Usage
//!
//! ```rust,no_run
//! use isometry_bridge::{LoopbackHost, TransportBridge};
//! use isometry_core::{ChangeOperation, DataChange, Payload};
//! use isometry_sync::{ClientConfig, SyncCoordinator};
//!
//! # async fn demo() -> isometry_sync::SyncResult<()> {
//! let config = ClientConfig::load_or_default(None);
//! let (host, _host_rx) = LoopbackHost::new();
//! let bridge = TransportBridge::new(config.bridge.clone(), host);
//! bridge.init().await?;
//!
//! let sync = SyncCoordinator::new(config.sync.clone(), bridge.clone());
//! sync.init().await?;
//!
//! let _nodes = sync.register_consumer("nodes", |change| {
//!     println!("applied {} {}", change.operation, change.id);
//! });
//!
//! sync.publish(DataChange::new("nodes", "n1", ChangeOperation::Update, Payload::new()))
//!     .await?;
//!
//! sync.shutdown().await?;
//! bridge.shutdown().await;
//! # Ok(())
//! # }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod coordinator;
pub mod debounce;
pub mod error;
pub mod events;
pub mod replay;
pub mod resolver;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{ClientConfig, SyncSettings};
pub use coordinator::SyncCoordinator;
pub use debounce::Debouncer;
pub use error::{SyncError, SyncResult};
pub use events::{ChangeFailed, ConflictResolved, ConsumerRegistry, SyncEvents};
pub use replay::{ReplayOutcome, ReplayPolicy};
pub use resolver::{ConflictResolver, FnResolver, ResolverError, ResolverRegistry, StrategyResolver};
