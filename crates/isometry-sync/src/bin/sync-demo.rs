//! # Sync Demo
//!
//! Runs the bridge and the sync coordinator against an in-process host.
//!
//! ```text
//!   SyncCoordinator ──► TransportBridge ──► LoopbackHost ──► responder task
//!          ▲                   ▲                                   │
//!          └── remote change ──┴────────── deliver / receive_json ◄┘
//! ```
//!
//! ## Log Levels
//! - `RUST_LOG=debug` - Show debug messages
//! - `RUST_LOG=isometry_sync=trace` - Trace the sync crate only
//! - Default: `info,isometry_bridge=debug,isometry_sync=debug`

use std::time::Duration;

use isometry_bridge::{LoopbackHost, TransportBridge};
use isometry_core::{ChangeOperation, DataChange, InboundMessage, Payload, ResponseEnvelope};
use isometry_sync::{ClientConfig, SyncCoordinator};
use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = ClientConfig::load_or_default(None);
    info!(
        mode = %config.sync.mode,
        strategy = %config.sync.default_strategy,
        timeout_ms = config.bridge.default_timeout_ms,
        "Configuration loaded"
    );

    let (host, mut host_rx) = LoopbackHost::new();
    let bridge = TransportBridge::new(config.bridge.clone(), host);

    // Stand-in for the native host: acknowledge every request.
    let responder = bridge.downgrade();
    tokio::spawn(async move {
        while let Some(envelope) = host_rx.recv().await {
            let Some(bridge) = responder.upgrade() else {
                break;
            };
            info!(id = %envelope.id, operation = %envelope.operation, "Host received request");
            bridge.deliver(ResponseEnvelope::ok(envelope.id, Value::Null)).await;
        }
    });

    bridge.init().await?;

    let sync = SyncCoordinator::new(config.sync.clone(), bridge.clone());
    sync.init().await?;

    let _nodes = sync.register_consumer("nodes", |change| {
        let data = Value::Object(change.data.clone());
        info!(id = %change.id, data = %data, "Applied change");
    });
    let _conflicts = sync.on_conflict_resolved(|resolved| {
        info!(
            conflict = %resolved.conflict.id,
            strategy = %resolved.conflict.strategy,
            "Conflict settled"
        );
    });
    let _failures = sync.on_change_failed(|failed| {
        warn!(id = %failed.change.id, reason = %failed.reason, "Change failed");
    });

    let now = chrono::Utc::now().timestamp_millis();

    let mut local = Payload::new();
    local.insert("name".into(), json!("Local"));
    sync.publish(DataChange::new("nodes", "n1", ChangeOperation::Update, local).at(now))
        .await?;

    let mut remote = Payload::new();
    remote.insert("name".into(), json!("Remote"));
    let pushed = InboundMessage::Change(
        DataChange::new("nodes", "n1", ChangeOperation::Update, remote).at(now + 500),
    );
    bridge.receive_json(&serde_json::to_string(&pushed)?).await?;

    let mut other = Payload::new();
    other.insert("name".into(), json!("Second"));
    sync.publish(DataChange::new("nodes", "n2", ChangeOperation::Create, other))
        .await?;

    tokio::time::sleep(Duration::from_secs(1)).await;

    let state = sync.state().await;
    info!(
        connected = state.connected,
        pending = state.pending_count,
        conflicts = state.conflict_count,
        mode = %state.mode,
        "Sync state"
    );
    println!("{}", serde_json::to_string_pretty(&state)?);

    sync.shutdown().await?;
    let cancelled = bridge.shutdown().await;
    info!(cancelled, "Demo complete");
    Ok(())
}

/// Initializes the tracing subscriber for structured logging.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,isometry_bridge=debug,isometry_sync=debug"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
