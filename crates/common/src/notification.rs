//! Notification payloads (spec §6). The manager core only knows how to
//! build and publish these; transport is an external collaborator.

use serde::{Deserialize, Serialize};

use crate::model::Lease;

/// A published notification: the full lease document under a topic name
/// such as `lease.create` or `event.start_lease`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub topic: String,
    pub lease: Lease,
}

impl NotificationPayload {
    pub fn new(topic: impl Into<String>, lease: Lease) -> Self {
        Self { topic: topic.into(), lease }
    }
}

pub mod topics {
    pub const LEASE_CREATE: &str = "lease.create";
    pub const LEASE_UPDATE: &str = "lease.update";
    pub const LEASE_DELETE: &str = "lease.delete";

    pub fn event(event_type: &str) -> String {
        format!("event.{event_type}")
    }

    pub fn before_end_lease_stop() -> &'static str {
        "event.before_end_lease.stop"
    }

    pub const RESERVATION_DEGRADED: &str = "reservation.degraded";
    pub const RESERVATION_DEGRADED_RECOVERED: &str = "reservation.degraded.recovered";
}
