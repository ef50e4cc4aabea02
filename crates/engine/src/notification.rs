//! Notification publishing (spec §6). The manager core only knows how to
//! build and publish payloads; transport is an external collaborator
//! (spec §1) — we ship one process-local implementation so the engine is
//! runnable and testable standalone.

use async_trait::async_trait;
use leasemgr_common::notification::NotificationPayload;
use tokio::sync::broadcast;

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, payload: NotificationPayload);
}

/// Fans published notifications out to every live `subscribe()`r over a
/// `tokio::sync::broadcast` channel, mirroring the teacher's use of
/// `broadcast` for process-local signaling in `runtime.rs`. Lagging
/// subscribers silently miss old notifications rather than blocking
/// publishers — there is no durability guarantee here, by design (spec
/// §1 excludes a concrete transport).
pub struct BroadcastNotificationSink {
    tx: broadcast::Sender<NotificationPayload>,
}

impl BroadcastNotificationSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotificationPayload> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastNotificationSink {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl NotificationSink for BroadcastNotificationSink {
    async fn publish(&self, payload: NotificationPayload) {
        // No receivers is the common case in tests; that's not an error.
        let _ = self.tx.send(payload);
    }
}
