//! # Connection Monitor
//!
//! Periodic health probe. Each tick calls
//! [`TransportBridge::check_health`], which flips connectivity and drains
//! the offline queue on reconnect.
//!
//! The monitor holds a weak handle; it exits on its own once the last
//! bridge handle is dropped.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::transport::WeakTransportBridge;

/// Background health prober.
pub struct ConnectionMonitor {
    bridge: WeakTransportBridge,
    interval: Duration,
    shutdown_rx: mpsc::Receiver<()>,
}

/// Handle for stopping a running monitor.
pub struct MonitorHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Stops the monitor and waits for it to exit.
    pub async fn shutdown(self) {
        if self.shutdown_tx.send(()).await.is_err() {
            // Loop already gone.
            return;
        }
        let _ = self.task.await;
    }
}

impl ConnectionMonitor {
    /// Spawns the probe loop. The first probe runs immediately.
    pub fn spawn(bridge: WeakTransportBridge, interval: Duration) -> MonitorHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let monitor = ConnectionMonitor {
            bridge,
            interval,
            shutdown_rx,
        };
        let task = tokio::spawn(monitor.run());
        MonitorHandle { shutdown_tx, task }
    }

    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(interval_secs = self.interval.as_secs(), "Connection monitor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(bridge) = self.bridge.upgrade() else {
                        debug!("Bridge dropped, stopping connection monitor");
                        break;
                    };
                    let connected = bridge.check_health().await;
                    debug!(connected, "Health probe completed");
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Connection monitor received shutdown");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::host::LoopbackHost;
    use crate::transport::TransportBridge;
    use isometry_core::ResponseEnvelope;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_monitor_detects_disconnect_and_recovery() {
        let (host, mut rx) = LoopbackHost::new();
        let bridge = TransportBridge::new(BridgeConfig::default(), host.clone());

        let responder = bridge.clone();
        tokio::spawn(async move {
            while let Some(env) = rx.recv().await {
                responder.deliver(ResponseEnvelope::ok(env.id, json!("pong"))).await;
            }
        });

        let handle = ConnectionMonitor::spawn(bridge.downgrade(), Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(bridge.is_connected());

        host.set_present(false);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!bridge.is_connected());

        host.set_present(true);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(bridge.is_connected());

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_exits_when_bridge_dropped() {
        let (host, _rx) = LoopbackHost::new();
        host.set_present(false);
        let bridge = TransportBridge::new(BridgeConfig::default(), host);
        let weak = bridge.downgrade();
        drop(bridge);

        let handle = ConnectionMonitor::spawn(weak, Duration::from_secs(30));
        tokio::time::timeout(Duration::from_secs(1), handle.task)
            .await
            .expect("monitor should stop")
            .unwrap();
    }
}
