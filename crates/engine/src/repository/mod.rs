//! The abstract Repository (spec §2, §6): CRUD + filtered queries over
//! leases, reservations, events, and allocations. Every call is
//! independent — implementations must not assume the caller will see a
//! write reflected anywhere except through a fresh read (spec §9 Open
//! Question).

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use leasemgr_common::filter::{Filters, SortDirection};
use leasemgr_common::model::{Allocation, Event, EventStatus, Lease, Reservation};
use uuid::Uuid;

use crate::error::EngineResult;

/// Patch applied to a lease row. `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct LeasePatch {
    pub name: Option<String>,
    pub start_date: Option<chrono::DateTime<chrono::Utc>>,
    pub end_date: Option<chrono::DateTime<chrono::Utc>>,
    pub status: Option<leasemgr_common::model::LeaseStatus>,
    pub degraded: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct ReservationPatch {
    pub resource_id: Option<Option<String>>,
    pub status: Option<leasemgr_common::model::ReservationStatus>,
    pub missing_resources: Option<bool>,
    pub resources_changed: Option<bool>,
    pub values: Option<std::collections::HashMap<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Default)]
pub struct EventPatch {
    pub time: Option<chrono::DateTime<chrono::Utc>>,
    pub status: Option<EventStatus>,
}

#[async_trait]
pub trait Repository: Send + Sync {
    async fn lease_create(&self, lease: Lease) -> EngineResult<Lease>;
    async fn lease_get(&self, id: Uuid) -> EngineResult<Lease>;
    async fn lease_get_by_name(&self, project_id: &str, name: &str) -> EngineResult<Option<Lease>>;
    async fn lease_list(&self, project_id: &str) -> EngineResult<Vec<Lease>>;
    async fn lease_update(&self, id: Uuid, patch: LeasePatch) -> EngineResult<Lease>;
    async fn lease_destroy(&self, id: Uuid) -> EngineResult<()>;

    /// Atomic compare-and-swap: succeeds only if the lease's current
    /// status is one of `expected`, in which case it's set to `to` and
    /// the updated lease is returned. Returns `InvalidStatus` otherwise.
    /// This is how the StatusMachine guard (spec §4.6) admits only one
    /// transitional operation at a time on a given lease.
    async fn lease_cas_status(
        &self,
        id: Uuid,
        expected: &[leasemgr_common::model::LeaseStatus],
        to: leasemgr_common::model::LeaseStatus,
    ) -> EngineResult<Lease>;

    async fn reservation_create(&self, reservation: Reservation) -> EngineResult<Reservation>;
    async fn reservation_get(&self, id: Uuid) -> EngineResult<Reservation>;
    async fn reservation_update(
        &self,
        id: Uuid,
        patch: ReservationPatch,
    ) -> EngineResult<Reservation>;
    async fn reservation_destroy(&self, id: Uuid) -> EngineResult<()>;

    async fn event_create(&self, event: Event) -> EngineResult<Event>;
    async fn event_get_all_sorted_by_filters(
        &self,
        sort_key: &str,
        sort_dir: SortDirection,
        filters: Filters,
    ) -> EngineResult<Vec<Event>>;
    async fn event_get_first_sorted_by_filters(
        &self,
        sort_key: &str,
        sort_dir: SortDirection,
        filters: Filters,
    ) -> EngineResult<Option<Event>>;
    async fn event_update(&self, id: Uuid, patch: EventPatch) -> EngineResult<Event>;

    async fn allocation_create(&self, allocation: Allocation) -> EngineResult<Allocation>;
    async fn allocation_list(&self, reservation_id: Uuid) -> EngineResult<Vec<Allocation>>;
    async fn allocation_clear(&self, reservation_id: Uuid) -> EngineResult<()>;
}
