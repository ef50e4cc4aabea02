//! In-memory Repository implementation. Used by tests and the CLI's
//! `serve --ephemeral` mode; mirrors the shape of `PostgresRepository`
//! exactly so tests exercise real orchestration logic against a fake
//! backend, the way the teacher's daemon tests exercise `MetaDb` against
//! a throwaway sqlite file.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use leasemgr_common::error::{ManagerError, RepositoryError};
use leasemgr_common::filter::{FieldFilter, Filters, SortDirection};
use leasemgr_common::model::{Allocation, Event, Lease, Reservation};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{EventPatch, LeasePatch, Repository, ReservationPatch};
use crate::error::EngineResult;

#[derive(Debug, Default)]
struct Inner {
    leases: HashMap<Uuid, Lease>,
    reservations: HashMap<Uuid, Reservation>,
    events: HashMap<Uuid, Event>,
    allocations: Vec<Allocation>,
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryRepository {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(kind: &str, id: Uuid) -> ManagerError {
    ManagerError::Repository(RepositoryError::NotFound(format!("{kind} {id} not found")))
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn lease_create(&self, lease: Lease) -> EngineResult<Lease> {
        let mut inner = self.inner.write().await;
        if inner.leases.values().any(|l| l.project_id == lease.project_id && l.name == lease.name)
        {
            return Err(ManagerError::LeaseNameAlreadyExists(lease.name));
        }
        inner.leases.insert(lease.id, lease.clone());
        Ok(lease)
    }

    async fn lease_get(&self, id: Uuid) -> EngineResult<Lease> {
        let inner = self.inner.read().await;
        let mut lease = inner.leases.get(&id).cloned().ok_or_else(|| not_found("lease", id))?;
        lease.reservations =
            inner.reservations.values().filter(|r| r.lease_id == id).cloned().collect();
        lease.events = inner.events.values().filter(|e| e.lease_id == id).cloned().collect();
        Ok(lease)
    }

    async fn lease_get_by_name(&self, project_id: &str, name: &str) -> EngineResult<Option<Lease>> {
        let inner = self.inner.read().await;
        Ok(inner
            .leases
            .values()
            .find(|l| l.project_id == project_id && l.name == name)
            .cloned())
    }

    async fn lease_list(&self, project_id: &str) -> EngineResult<Vec<Lease>> {
        let inner = self.inner.read().await;
        let mut leases: Vec<Lease> =
            inner.leases.values().filter(|l| l.project_id == project_id).cloned().collect();
        for lease in &mut leases {
            lease.reservations =
                inner.reservations.values().filter(|r| r.lease_id == lease.id).cloned().collect();
            lease.events =
                inner.events.values().filter(|e| e.lease_id == lease.id).cloned().collect();
        }
        Ok(leases)
    }

    async fn lease_update(&self, id: Uuid, patch: LeasePatch) -> EngineResult<Lease> {
        let mut inner = self.inner.write().await;
        let lease = inner.leases.get_mut(&id).ok_or_else(|| not_found("lease", id))?;
        if let Some(name) = patch.name {
            lease.name = name;
        }
        if let Some(start_date) = patch.start_date {
            lease.start_date = start_date;
        }
        if let Some(end_date) = patch.end_date {
            lease.end_date = end_date;
        }
        if let Some(status) = patch.status {
            lease.status = status;
        }
        if let Some(degraded) = patch.degraded {
            lease.degraded = degraded;
        }
        let updated = lease.clone();
        drop(inner);
        self.lease_get(updated.id).await
    }

    async fn lease_cas_status(
        &self,
        id: Uuid,
        expected: &[leasemgr_common::model::LeaseStatus],
        to: leasemgr_common::model::LeaseStatus,
    ) -> EngineResult<Lease> {
        {
            let mut inner = self.inner.write().await;
            let lease = inner.leases.get_mut(&id).ok_or_else(|| not_found("lease", id))?;
            if !expected.contains(&lease.status) {
                return Err(ManagerError::InvalidStatus(format!(
                    "lease {id} is {:?}, expected one of {:?}",
                    lease.status, expected
                )));
            }
            lease.status = to;
        }
        self.lease_get(id).await
    }

    async fn lease_destroy(&self, id: Uuid) -> EngineResult<()> {
        let mut inner = self.inner.write().await;
        inner.leases.remove(&id).ok_or_else(|| not_found("lease", id))?;
        let reservation_ids: Vec<Uuid> = inner
            .reservations
            .values()
            .filter(|r| r.lease_id == id)
            .map(|r| r.id)
            .collect();
        inner.reservations.retain(|_, r| r.lease_id != id);
        inner.events.retain(|_, e| e.lease_id != id);
        inner.allocations.retain(|a| !reservation_ids.contains(&a.reservation_id));
        Ok(())
    }

    async fn reservation_create(&self, reservation: Reservation) -> EngineResult<Reservation> {
        let mut inner = self.inner.write().await;
        inner.reservations.insert(reservation.id, reservation.clone());
        Ok(reservation)
    }

    async fn reservation_get(&self, id: Uuid) -> EngineResult<Reservation> {
        let inner = self.inner.read().await;
        inner.reservations.get(&id).cloned().ok_or_else(|| not_found("reservation", id))
    }

    async fn reservation_update(
        &self,
        id: Uuid,
        patch: ReservationPatch,
    ) -> EngineResult<Reservation> {
        let mut inner = self.inner.write().await;
        let reservation =
            inner.reservations.get_mut(&id).ok_or_else(|| not_found("reservation", id))?;
        if let Some(resource_id) = patch.resource_id {
            reservation.resource_id = resource_id;
        }
        if let Some(status) = patch.status {
            reservation.status = status;
        }
        if let Some(missing) = patch.missing_resources {
            reservation.missing_resources = missing;
        }
        if let Some(changed) = patch.resources_changed {
            reservation.resources_changed = changed;
        }
        if let Some(values) = patch.values {
            reservation.values = values;
        }
        Ok(reservation.clone())
    }

    async fn reservation_destroy(&self, id: Uuid) -> EngineResult<()> {
        let mut inner = self.inner.write().await;
        inner.reservations.remove(&id).ok_or_else(|| not_found("reservation", id))?;
        inner.allocations.retain(|a| a.reservation_id != id);
        Ok(())
    }

    async fn event_create(&self, event: Event) -> EngineResult<Event> {
        let mut inner = self.inner.write().await;
        inner.events.insert(event.id, event.clone());
        Ok(event)
    }

    async fn event_get_all_sorted_by_filters(
        &self,
        sort_key: &str,
        sort_dir: SortDirection,
        filters: Filters,
    ) -> EngineResult<Vec<Event>> {
        let inner = self.inner.read().await;
        let mut events: Vec<Event> =
            inner.events.values().filter(|e| matches_event(e, &filters)).cloned().collect();
        sort_events(&mut events, sort_key, sort_dir);
        Ok(events)
    }

    async fn event_get_first_sorted_by_filters(
        &self,
        sort_key: &str,
        sort_dir: SortDirection,
        filters: Filters,
    ) -> EngineResult<Option<Event>> {
        Ok(self.event_get_all_sorted_by_filters(sort_key, sort_dir, filters).await?.into_iter().next())
    }

    async fn event_update(&self, id: Uuid, patch: EventPatch) -> EngineResult<Event> {
        let mut inner = self.inner.write().await;
        let event = inner.events.get_mut(&id).ok_or_else(|| not_found("event", id))?;
        if let Some(time) = patch.time {
            event.time = time;
        }
        if let Some(status) = patch.status {
            event.status = status;
        }
        Ok(event.clone())
    }

    async fn allocation_create(&self, allocation: Allocation) -> EngineResult<Allocation> {
        let mut inner = self.inner.write().await;
        inner.allocations.push(allocation.clone());
        Ok(allocation)
    }

    async fn allocation_list(&self, reservation_id: Uuid) -> EngineResult<Vec<Allocation>> {
        let inner = self.inner.read().await;
        Ok(inner.allocations.iter().filter(|a| a.reservation_id == reservation_id).cloned().collect())
    }

    async fn allocation_clear(&self, reservation_id: Uuid) -> EngineResult<()> {
        let mut inner = self.inner.write().await;
        inner.allocations.retain(|a| a.reservation_id != reservation_id);
        Ok(())
    }
}

fn matches_event(event: &Event, filters: &Filters) -> bool {
    for (field, filter) in filters {
        let ok = match field.as_str() {
            "status" => matches!(filter, FieldFilter::Equals(s) if *s == status_str(event.status)),
            "lease_id" => {
                matches!(filter, FieldFilter::Equals(s) if *s == event.lease_id.to_string())
            }
            "time" => match filter {
                FieldFilter::Compare { .. } => filter.matches_time(event.time),
                FieldFilter::Equals(s) => s == &event.time.to_rfc3339(),
            },
            _ => true,
        };
        if !ok {
            return false;
        }
    }
    true
}

fn status_str(status: leasemgr_common::model::EventStatus) -> String {
    use leasemgr_common::model::EventStatus::*;
    match status {
        Undone => "UNDONE",
        InProgress => "IN_PROGRESS",
        Done => "DONE",
        Error => "ERROR",
    }
    .to_string()
}

fn sort_events(events: &mut [Event], sort_key: &str, sort_dir: SortDirection) {
    if sort_key == "time" {
        events.sort_by_key(|e| e.time);
    }
    if sort_dir == SortDirection::Desc {
        events.reverse();
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use leasemgr_common::model::{EventStatus, EventType};

    use super::*;

    fn sample_event(lease_id: Uuid, event_type: EventType, time: chrono::DateTime<Utc>) -> Event {
        Event { id: Uuid::new_v4(), lease_id, event_type, time, status: EventStatus::Undone }
    }

    #[tokio::test]
    async fn event_filters_select_undone_events_due_by_time() {
        let repo = InMemoryRepository::new();
        let lease_id = Uuid::new_v4();
        let now = Utc::now();

        let due = sample_event(lease_id, EventType::StartLease, now - Duration::minutes(1));
        let future = sample_event(lease_id, EventType::EndLease, now + Duration::minutes(60));
        repo.event_create(due.clone()).await.unwrap();
        repo.event_create(future).await.unwrap();

        let mut filters = Filters::new();
        filters.insert("status".into(), FieldFilter::eq("UNDONE"));
        filters.insert(
            "time".into(),
            FieldFilter::time(leasemgr_common::filter::ComparisonOp::Le, now),
        );

        let results = repo
            .event_get_all_sorted_by_filters("time", SortDirection::Asc, filters)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, due.id);
    }

    #[tokio::test]
    async fn duplicate_lease_name_in_project_is_rejected() {
        let repo = InMemoryRepository::new();
        let lease = Lease {
            id: Uuid::new_v4(),
            name: "my-lease".into(),
            project_id: "proj-1".into(),
            user_id: "user-1".into(),
            trust_id: "trust-1".into(),
            start_date: Utc::now(),
            end_date: Utc::now() + Duration::hours(1),
            status: leasemgr_common::model::LeaseStatus::Creating,
            degraded: false,
            reservations: vec![],
            events: vec![],
        };
        repo.lease_create(lease.clone()).await.unwrap();

        let mut dup = lease;
        dup.id = Uuid::new_v4();
        let err = repo.lease_create(dup).await.unwrap_err();
        assert!(matches!(err, ManagerError::LeaseNameAlreadyExists(_)));
    }

    #[tokio::test]
    async fn lease_destroy_cascades_reservations_and_events() {
        let repo = InMemoryRepository::new();
        let lease_id = Uuid::new_v4();
        let lease = Lease {
            id: lease_id,
            name: "cascade".into(),
            project_id: "proj-1".into(),
            user_id: "user-1".into(),
            trust_id: "trust-1".into(),
            start_date: Utc::now(),
            end_date: Utc::now() + Duration::hours(1),
            status: leasemgr_common::model::LeaseStatus::Terminated,
            degraded: false,
            reservations: vec![],
            events: vec![],
        };
        repo.lease_create(lease).await.unwrap();
        let reservation = Reservation {
            id: Uuid::new_v4(),
            lease_id,
            resource_type: "compute_host".into(),
            resource_id: Some("host-1".into()),
            status: leasemgr_common::model::ReservationStatus::Active,
            missing_resources: false,
            resources_changed: false,
            values: Default::default(),
        };
        let reservation_id = reservation.id;
        repo.reservation_create(reservation).await.unwrap();
        repo.event_create(sample_event(lease_id, EventType::StartLease, Utc::now())).await.unwrap();
        repo.allocation_create(Allocation { reservation_id, resource_id: "host-1".into() })
            .await
            .unwrap();

        repo.lease_destroy(lease_id).await.unwrap();
        let err = repo.lease_get(lease_id).await.unwrap_err();
        assert!(matches!(err, ManagerError::Repository(RepositoryError::NotFound(_))));
        assert!(repo.allocation_list(reservation_id).await.unwrap().is_empty());
    }
}
