//! # Host Channel
//!
//! The raw, fire-and-forget messaging channel the host application exposes.
//! Posting never waits for an answer; responses come back separately through
//! [`TransportBridge::deliver`](crate::TransportBridge::deliver) or
//! [`TransportBridge::receive_json`](crate::TransportBridge::receive_json).
//!
//! Two implementations ship with the crate:
//! - [`DetachedHost`]: running outside the host (every call fails with
//!   `TransportUnavailable`)
//! - [`LoopbackHost`]: in-process channel used by tests and the demo binary

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use isometry_core::{BridgeError, BridgeResult, MessageEnvelope};
use tokio::sync::mpsc;
use tracing::trace;

/// Outbound side of the host messaging channel.
///
/// `post` must not block; implementations hand the message to the host and
/// return.
pub trait HostChannel: Send + Sync {
    /// Whether a host messaging channel exists at all.
    fn is_present(&self) -> bool;

    /// Hands an envelope to the host.
    fn post(&self, envelope: &MessageEnvelope) -> BridgeResult<()>;
}

/// Environment without a host application.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedHost;

impl HostChannel for DetachedHost {
    fn is_present(&self) -> bool {
        false
    }

    fn post(&self, _envelope: &MessageEnvelope) -> BridgeResult<()> {
        Err(BridgeError::TransportUnavailable)
    }
}

/// In-process host: posted envelopes appear on an unbounded receiver.
#[derive(Debug)]
pub struct LoopbackHost {
    tx: mpsc::UnboundedSender<MessageEnvelope>,
    present: AtomicBool,
    failing: AtomicBool,
    posted: AtomicU64,
}

impl LoopbackHost {
    /// Creates the host and the receiver standing in for the host side.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MessageEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let host = Arc::new(LoopbackHost {
            tx,
            present: AtomicBool::new(true),
            failing: AtomicBool::new(false),
            posted: AtomicU64::new(0),
        });
        (host, rx)
    }

    /// Simulates the host channel appearing or disappearing.
    pub fn set_present(&self, present: bool) {
        self.present.store(present, Ordering::SeqCst);
    }

    /// Makes every `post` fail with a transient channel error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Envelopes accepted so far.
    pub fn posted_count(&self) -> u64 {
        self.posted.load(Ordering::SeqCst)
    }
}

impl HostChannel for LoopbackHost {
    fn is_present(&self) -> bool {
        self.present.load(Ordering::SeqCst)
    }

    fn post(&self, envelope: &MessageEnvelope) -> BridgeResult<()> {
        if !self.is_present() {
            return Err(BridgeError::TransportUnavailable);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(BridgeError::TransientChannel(
                "loopback channel failing".to_string(),
            ));
        }

        self.tx
            .send(envelope.clone())
            .map_err(|_| BridgeError::TransientChannel("host receiver dropped".to_string()))?;
        self.posted.fetch_add(1, Ordering::SeqCst);

        trace!(id = %envelope.id, operation = %envelope.operation, "Posted to loopback host");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isometry_core::{Payload, Target};

    fn envelope() -> MessageEnvelope {
        MessageEnvelope::new(Target::Database, "execute", Payload::new())
    }

    #[test]
    fn test_detached_host() {
        let host = DetachedHost;
        assert!(!host.is_present());
        assert_eq!(host.post(&envelope()), Err(BridgeError::TransportUnavailable));
    }

    #[test]
    fn test_loopback_delivers_envelopes() {
        let (host, mut rx) = LoopbackHost::new();
        let env = envelope();

        host.post(&env).unwrap();

        assert_eq!(rx.try_recv().unwrap().id, env.id);
        assert_eq!(host.posted_count(), 1);
    }

    #[test]
    fn test_loopback_switches() {
        let (host, _rx) = LoopbackHost::new();

        host.set_failing(true);
        assert!(matches!(
            host.post(&envelope()),
            Err(BridgeError::TransientChannel(_))
        ));

        host.set_present(false);
        assert_eq!(host.post(&envelope()), Err(BridgeError::TransportUnavailable));
        assert_eq!(host.posted_count(), 0);
    }

    #[test]
    fn test_loopback_receiver_dropped() {
        let (host, rx) = LoopbackHost::new();
        drop(rx);
        assert!(matches!(
            host.post(&envelope()),
            Err(BridgeError::TransientChannel(_))
        ));
    }
}
