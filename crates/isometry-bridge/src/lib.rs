//! # isometry-bridge: Host Transport Bridge
//!
//! Request/response messaging over the host application's one-way channel.
//!
//! ## Components
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         isometry-bridge                                 │
//! │                                                                         │
//! │   caller ──► TransportBridge::call ──► HostChannel::post ──► host      │
//! │                     │                                          │        │
//! │                     ▼                                          │        │
//! │              RequestCorrelator ◄── deliver / receive_json ◄────┘        │
//! │                     │                                                   │
//! │                     ▼                                                   │
//! │              EventRegistry (requests, connectivity, remote changes)     │
//! │                                                                         │
//! │   ConnectionMonitor ── every 30s ──► check_health ──► flush offline     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//! ```rust,no_run
//! use isometry_bridge::{BridgeConfig, LoopbackHost, TransportBridge};
//! use isometry_core::HostOperation;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let (host, _host_rx) = LoopbackHost::new();
//! let bridge = TransportBridge::new(BridgeConfig::default(), host);
//! bridge.init().await?;
//!
//! let files: Vec<String> = bridge
//!     .request_as(HostOperation::ListFiles { path: "/notes".into() })
//!     .await?;
//! # let _ = files;
//! bridge.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod correlator;
pub mod events;
pub mod host;
pub mod monitor;
pub mod transport;

pub use config::BridgeConfig;
pub use correlator::RequestCorrelator;
pub use events::{
    BridgeEvents, ConnectivityChanged, EventRegistry, RequestOutcome, RequestSettled, Subscription,
};
pub use host::{DetachedHost, HostChannel, LoopbackHost};
pub use monitor::{ConnectionMonitor, MonitorHandle};
pub use transport::{TransportBridge, WeakTransportBridge};
