//! Core domain types shared by every crate in the workspace.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lease status. See spec §3: {PENDING, ACTIVE, TERMINATED, ERROR} are
/// stable; everything else is transitional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaseStatus {
    Creating,
    Pending,
    Starting,
    Active,
    Updating,
    Terminating,
    Terminated,
    Deleting,
    Error,
}

impl LeaseStatus {
    pub fn is_stable(self) -> bool {
        matches!(self, Self::Pending | Self::Active | Self::Terminated | Self::Error)
    }

    pub fn is_transitional(self) -> bool {
        !self.is_stable()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Pending,
    Active,
    Deleted,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Undone,
    InProgress,
    Done,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    StartLease,
    EndLease,
    BeforeEndLease,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StartLease => "start_lease",
            Self::EndLease => "end_lease",
            Self::BeforeEndLease => "before_end_lease",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub id: Uuid,
    pub name: String,
    pub project_id: String,
    pub user_id: String,
    pub trust_id: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub status: LeaseStatus,
    pub degraded: bool,
    pub reservations: Vec<Reservation>,
    pub events: Vec<Event>,
}

impl Lease {
    pub fn start_event(&self) -> Option<&Event> {
        self.events.iter().find(|e| e.event_type == EventType::StartLease)
    }

    pub fn end_event(&self) -> Option<&Event> {
        self.events.iter().find(|e| e.event_type == EventType::EndLease)
    }

    pub fn before_end_event(&self) -> Option<&Event> {
        self.events.iter().find(|e| e.event_type == EventType::BeforeEndLease)
    }
}

/// A type-specific resource claim. `values` is opaque to the manager core —
/// only the resolved plugin for `resource_type` interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub lease_id: Uuid,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub status: ReservationStatus,
    pub missing_resources: bool,
    pub resources_changed: bool,
    #[serde(default)]
    pub values: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub lease_id: Uuid,
    pub event_type: EventType,
    pub time: DateTime<Utc>,
    pub status: EventStatus,
}

/// The concrete resource units a plugin assigned to a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub reservation_id: Uuid,
    pub resource_id: String,
}

/// Reservation weight for ordering within a lease (spec §4.2). Default
/// weight is 0; `network` resources run last on teardown because they
/// depend on compute resources still being live.
pub fn reservation_order_weight(resource_type: &str) -> u8 {
    if resource_type == "network" {
        1
    } else {
        0
    }
}

/// Input values for creating a reservation, before a resource_id has been
/// assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationValues {
    /// Present only on update, to reference an existing reservation.
    #[serde(default)]
    pub id: Option<Uuid>,
    pub resource_type: String,
    #[serde(default)]
    pub values: HashMap<String, serde_json::Value>,
}

/// `"YYYY-MM-DD HH:MM"` or the literal `"now"`, per spec §4.1 / §6.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LeaseDate {
    Now,
    At(String),
}

impl LeaseDate {
    pub const FORMAT: &'static str = "%Y-%m-%d %H:%M";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseCreateValues {
    pub name: String,
    pub project_id: String,
    pub user_id: String,
    pub trust_id: String,
    pub start_date: LeaseDate,
    pub end_date: LeaseDate,
    #[serde(default)]
    pub before_end_date: Option<String>,
    pub reservations: Vec<ReservationValues>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeaseUpdateValues {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub start_date: Option<LeaseDate>,
    #[serde(default)]
    pub end_date: Option<LeaseDate>,
    #[serde(default)]
    pub before_end_date: Option<String>,
    #[serde(default)]
    pub reservations: Vec<ReservationValues>,
}

impl LeaseUpdateValues {
    /// True when the caller submitted nothing but (possibly) a name —
    /// update(id, {}) must be a no-op per spec §8.
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.start_date.is_none()
            && self.end_date.is_none()
            && self.before_end_date.is_none()
            && self.reservations.is_empty()
    }

    pub fn is_name_only(&self) -> bool {
        self.start_date.is_none() && self.end_date.is_none() && self.reservations.is_empty()
    }
}
