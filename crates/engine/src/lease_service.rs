//! `LeaseService` (spec §4.1): construct, update, and tear down leases.
//! Mutating operations run under the [`crate::status_machine`] guard;
//! `create` additionally tracks its own rollback bookkeeping since it
//! writes several rows before the lease has a stable status to guard.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Timelike, Utc};
use leasemgr_common::error::ManagerError;
use leasemgr_common::model::{
    Event, EventStatus, EventType, Lease, LeaseCreateValues, LeaseDate, LeaseStatus,
    LeaseUpdateValues, Reservation, ReservationStatus, ReservationValues,
};
use leasemgr_common::notification::{topics, NotificationPayload};
use serde_json::Value;
use uuid::Uuid;

use crate::enforcement::Enforcement;
use crate::error::EngineResult;
use crate::notification::NotificationSink;
use crate::ordering;
use crate::plugins::registry::PluginRegistry;
use crate::plugins::ResourcePlugin;
use crate::repository::{EventPatch, LeasePatch, Repository};
use crate::status_machine;

pub struct LeaseService {
    repo: Arc<dyn Repository>,
    plugins: Arc<PluginRegistry>,
    enforcement: Enforcement,
    notifications: Arc<dyn NotificationSink>,
    minutes_before_end_lease: u32,
}

impl LeaseService {
    pub fn new(
        repo: Arc<dyn Repository>,
        plugins: Arc<PluginRegistry>,
        enforcement: Enforcement,
        notifications: Arc<dyn NotificationSink>,
        minutes_before_end_lease: u32,
    ) -> Self {
        Self { repo, plugins, enforcement, notifications, minutes_before_end_lease }
    }

    pub async fn get(&self, lease_id: Uuid) -> EngineResult<Lease> {
        self.repo.lease_get(lease_id).await
    }

    pub async fn list(&self, project_id: &str) -> EngineResult<Vec<Lease>> {
        self.repo.lease_list(project_id).await
    }

    /// spec §4.1 `create`.
    pub async fn create(&self, values: LeaseCreateValues, now: DateTime<Utc>) -> EngineResult<Lease> {
        if values.reservations.is_empty() {
            return Err(ManagerError::InvalidInput(
                "a lease must include at least one reservation".to_string(),
            ));
        }
        if values.trust_id.is_empty() {
            return Err(ManagerError::MissingTrustId);
        }

        let start_date = resolve_date(&values.start_date, now)?;
        let end_date = resolve_date(&values.end_date, now)?;
        if start_date < truncate_to_minute(now) {
            return Err(ManagerError::InvalidInput("start_date is in the past".to_string()));
        }
        if end_date <= start_date {
            return Err(ManagerError::InvalidPeriod("end_date must be after start_date".to_string()));
        }
        if self.repo.lease_get_by_name(&values.project_id, &values.name).await?.is_some() {
            return Err(ManagerError::LeaseNameAlreadyExists(values.name.clone()));
        }

        // Step 1: resolve allocation candidates per reservation. This only
        // validates — no resources are claimed yet.
        let mut plugins = Vec::with_capacity(values.reservations.len());
        for reservation_values in &values.reservations {
            let plugin = self.plugins.resolve(&reservation_values.resource_type)?;
            self.check_allocation_candidates(&plugin, &reservation_values.values).await?;
            plugins.push(plugin);
        }

        // Step 2: enforcement.
        self.enforcement.check_create(&values.project_id, &values.reservations).await?;

        // Step 3: before_end_date.
        let before_end_date = self.compute_before_end_date(
            values.before_end_date.as_deref(),
            start_date,
            end_date,
            now,
        )?;

        // Step 4: persist, rolling back on any failure.
        let lease_id = Uuid::new_v4();
        let mut lease = Lease {
            id: lease_id,
            name: values.name.clone(),
            project_id: values.project_id.clone(),
            user_id: values.user_id.clone(),
            trust_id: values.trust_id.clone(),
            start_date,
            end_date,
            status: LeaseStatus::Creating,
            degraded: false,
            reservations: vec![],
            events: vec![],
        };

        let mut rollback = CreateRollback::default();
        match self
            .persist_new_lease(&mut lease, &values.reservations, &plugins, before_end_date, &mut rollback)
            .await
        {
            Ok(()) => {
                let lease = self
                    .repo
                    .lease_update(
                        lease_id,
                        LeasePatch { status: Some(LeaseStatus::Pending), ..Default::default() },
                    )
                    .await?;
                self.notifications
                    .publish(NotificationPayload::new(topics::LEASE_CREATE, lease.clone()))
                    .await;
                Ok(lease)
            }
            Err(err) => {
                self.unwind_create(&lease, &rollback).await;
                Err(err)
            }
        }
    }

    async fn check_allocation_candidates(
        &self,
        plugin: &Arc<dyn ResourcePlugin>,
        values: &HashMap<String, Value>,
    ) -> EngineResult<()> {
        match plugin.allocation_candidates(values).await {
            Ok(_) => Ok(()),
            Err(ManagerError::NotEnoughResourcesAvailable { reason, retried_without_defaults })
                if !retried_without_defaults && plugin.retry_allocation_without_defaults() =>
            {
                let mut stripped = values.clone();
                stripped.remove("default_resource_properties");
                plugin.allocation_candidates(&stripped).await.map_err(|_| {
                    ManagerError::NotEnoughResourcesAvailable {
                        reason,
                        retried_without_defaults: true,
                    }
                })?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn compute_before_end_date(
        &self,
        supplied: Option<&str>,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<DateTime<Utc>>> {
        if let Some(raw) = supplied {
            let parsed = resolve_date(&LeaseDate::At(raw.to_string()), now)?;
            if !(start_date < parsed && parsed < end_date) {
                return Err(ManagerError::InvalidRange(
                    "before_end_date must fall strictly between start_date and end_date".to_string(),
                ));
            }
            return Ok(Some(parsed));
        }
        if self.minutes_before_end_lease == 0 {
            return Ok(None);
        }
        let candidate = end_date - chrono::Duration::minutes(i64::from(self.minutes_before_end_lease));
        if candidate < start_date {
            tracing::warn!(
                minutes_before_end_lease = self.minutes_before_end_lease,
                "before_end_lease time computed before start_date; clamping"
            );
            return Ok(Some(start_date));
        }
        Ok(Some(candidate))
    }

    async fn persist_new_lease(
        &self,
        lease: &mut Lease,
        reservation_values: &[ReservationValues],
        plugins: &[Arc<dyn ResourcePlugin>],
        before_end_date: Option<DateTime<Utc>>,
        rollback: &mut CreateRollback,
    ) -> EngineResult<()> {
        self.repo.lease_create(lease.clone()).await?;
        rollback.lease_created = true;

        for (values, plugin) in reservation_values.iter().zip(plugins.iter()) {
            let reservation_id = Uuid::new_v4();
            let resource_id = plugin.reserve_resource(reservation_id, &values.values).await?;
            rollback.reserved.push((plugin.clone(), resource_id.clone()));

            let reservation = Reservation {
                id: reservation_id,
                lease_id: lease.id,
                resource_type: values.resource_type.clone(),
                resource_id: Some(resource_id),
                status: ReservationStatus::Pending,
                missing_resources: false,
                resources_changed: false,
                values: values.values.clone(),
            };
            self.repo.reservation_create(reservation.clone()).await?;
            lease.reservations.push(reservation);
        }

        let start_event = Event {
            id: Uuid::new_v4(),
            lease_id: lease.id,
            event_type: EventType::StartLease,
            time: lease.start_date,
            status: EventStatus::Undone,
        };
        self.repo.event_create(start_event.clone()).await?;
        lease.events.push(start_event);

        let end_event = Event {
            id: Uuid::new_v4(),
            lease_id: lease.id,
            event_type: EventType::EndLease,
            time: lease.end_date,
            status: EventStatus::Undone,
        };
        self.repo.event_create(end_event.clone()).await?;
        lease.events.push(end_event);

        if let Some(before_end) = before_end_date {
            let event = Event {
                id: Uuid::new_v4(),
                lease_id: lease.id,
                event_type: EventType::BeforeEndLease,
                time: before_end,
                status: EventStatus::Undone,
            };
            self.repo.event_create(event.clone()).await?;
            lease.events.push(event);
        }

        Ok(())
    }

    /// Best-effort undo of whatever `persist_new_lease` managed to write.
    /// Destroying the lease row cascades its reservations and events, so
    /// all that's left to unwind by hand is any plugin-side allocation.
    async fn unwind_create(&self, lease: &Lease, rollback: &CreateRollback) {
        for (plugin, resource_id) in &rollback.reserved {
            if let Err(err) = plugin.on_end(resource_id, lease).await {
                tracing::warn!(
                    lease_id = %lease.id,
                    resource_id,
                    error = %err,
                    "failed to release plugin resource during create rollback"
                );
            }
        }
        if rollback.lease_created {
            if let Err(err) = self.repo.lease_destroy(lease.id).await {
                tracing::error!(lease_id = %lease.id, error = %err, "failed to roll back partially-created lease");
            }
        }
    }

    /// spec §4.1 `update`.
    pub async fn update(
        &self,
        lease_id: Uuid,
        values: LeaseUpdateValues,
        now: DateTime<Utc>,
    ) -> EngineResult<Lease> {
        if values.is_empty() {
            return self.repo.lease_get(lease_id).await;
        }
        let current = self.repo.lease_get(lease_id).await?;
        if !current.status.is_stable() {
            return Err(ManagerError::InvalidStatus(format!(
                "lease {lease_id} is {:?}, not in a stable status",
                current.status
            )));
        }
        let pre_status = current.status;

        status_machine::guard(&self.repo, lease_id, &[pre_status], LeaseStatus::Updating, || async move {
            let updated = self.apply_update(&current, values, now).await?;
            self.notifications
                .publish(NotificationPayload::new(topics::LEASE_UPDATE, updated.clone()))
                .await;
            Ok((updated, pre_status))
        })
        .await
    }

    async fn apply_update(
        &self,
        current: &Lease,
        values: LeaseUpdateValues,
        now: DateTime<Utc>,
    ) -> EngineResult<Lease> {
        if values.is_name_only() {
            if let Some(name) = values.name {
                return self
                    .repo
                    .lease_update(current.id, LeasePatch { name: Some(name), ..Default::default() })
                    .await;
            }
            return self.repo.lease_get(current.id).await;
        }

        if current.status == LeaseStatus::Terminated {
            return Err(ManagerError::CantUpdateParameter(
                "only name may change on a terminated lease".to_string(),
            ));
        }

        let new_start_date = match &values.start_date {
            Some(raw) => {
                let parsed = resolve_date(raw, now)?;
                if current.start_date < now && parsed != current.start_date {
                    return Err(ManagerError::CantUpdateParameter(
                        "start_date cannot change once the lease has started".to_string(),
                    ));
                }
                parsed
            }
            None => current.start_date,
        };

        let new_end_date = match &values.end_date {
            Some(raw) => resolve_date(raw, now)?,
            None => current.end_date,
        };
        if new_end_date <= now {
            return Err(ManagerError::InvalidInput("end_date must be in the future".to_string()));
        }
        if new_end_date <= new_start_date {
            return Err(ManagerError::InvalidPeriod(
                "end_date must be after start_date".to_string(),
            ));
        }

        let mut patched_reservations = current.reservations.clone();
        for submitted in &values.reservations {
            let id = submitted.id.ok_or_else(|| {
                ManagerError::InvalidInput(
                    "reservation updates must reference an existing reservation id".to_string(),
                )
            })?;
            let existing = patched_reservations
                .iter()
                .find(|r| r.id == id)
                .ok_or_else(|| ManagerError::InvalidInput(format!("no such reservation {id}")))?;
            if existing.resource_type != submitted.resource_type {
                return Err(ManagerError::CantUpdateParameter("resource_type".to_string()));
            }
        }

        let mut proposed_reservations = patched_reservations.clone();
        for submitted in &values.reservations {
            let id = submitted.id.expect("validated above");
            if let Some(r) = proposed_reservations.iter_mut().find(|r| r.id == id) {
                r.values.extend(submitted.values.clone());
            }
        }

        let mut old_allocs = Vec::new();
        for reservation in &patched_reservations {
            old_allocs.extend(self.repo.allocation_list(reservation.id).await?);
        }
        // This update flow only revises reservation parameters, not
        // resource assignment, so the allocation set is unchanged by it.
        let new_allocs = old_allocs.clone();

        self.enforcement
            .check_update(current, &values, &old_allocs, &new_allocs, &patched_reservations, &proposed_reservations)
            .await?;

        for submitted in &values.reservations {
            let id = submitted.id.expect("validated above");
            let plugin = self.plugins.resolve(&submitted.resource_type)?;
            let merged = {
                let existing = patched_reservations.iter().find(|r| r.id == id).unwrap();
                let mut merged = existing.values.clone();
                merged.extend(submitted.values.clone());
                merged
            };
            plugin.update_reservation(id, &merged).await?;
            self.repo
                .reservation_update(
                    id,
                    crate::repository::ReservationPatch {
                        values: Some(merged.clone()),
                        ..Default::default()
                    },
                )
                .await?;
            if let Some(r) = patched_reservations.iter_mut().find(|r| r.id == id) {
                r.values = merged;
            }
        }

        if let Some(start_event) = current.start_event() {
            self.repo
                .event_update(start_event.id, EventPatch { time: Some(new_start_date), ..Default::default() })
                .await?;
        }
        if let Some(end_event) = current.end_event() {
            self.repo
                .event_update(end_event.id, EventPatch { time: Some(new_end_date), ..Default::default() })
                .await?;
        }

        if let Some(before_end_event) = current.before_end_event() {
            let new_before_end = match &values.before_end_date {
                Some(raw) => Some(resolve_date(&LeaseDate::At(raw.clone()), now)?),
                None => {
                    let delta = current.end_date - before_end_event.time;
                    Some(new_end_date - delta)
                }
            };
            if let Some(new_time) = new_before_end {
                let shifted_into_future =
                    before_end_event.status == EventStatus::Done && new_time > now;
                let mut patch = EventPatch { time: Some(new_time), ..Default::default() };
                if shifted_into_future {
                    patch.status = Some(EventStatus::Undone);
                }
                self.repo.event_update(before_end_event.id, patch).await?;
                if shifted_into_future {
                    self.notifications
                        .publish(NotificationPayload::new(
                            topics::before_end_lease_stop(),
                            current.clone(),
                        ))
                        .await;
                }
            }
        } else if let Some(raw) = &values.before_end_date {
            let new_time = resolve_date(&LeaseDate::At(raw.clone()), now)?;
            if start_ok(new_start_date, new_time, new_end_date) {
                self.repo
                    .event_create(Event {
                        id: Uuid::new_v4(),
                        lease_id: current.id,
                        event_type: EventType::BeforeEndLease,
                        time: new_time,
                        status: EventStatus::Undone,
                    })
                    .await?;
            }
        }

        self.repo
            .lease_update(
                current.id,
                LeasePatch {
                    start_date: Some(new_start_date),
                    end_date: Some(new_end_date),
                    ..Default::default()
                },
            )
            .await
    }

    /// spec §4.1 `delete`. `now` is accepted for symmetry with
    /// `create`/`update` and to leave room for a future timeout-aware
    /// teardown path; the current algorithm doesn't need it.
    pub async fn delete(&self, lease_id: Uuid, _now: DateTime<Utc>) -> EngineResult<()> {
        let current = self.repo.lease_get(lease_id).await?;
        if !current.status.is_stable() {
            return Err(ManagerError::InvalidStatus(format!(
                "lease {lease_id} is {:?}, not in a stable status",
                current.status
            )));
        }
        let pre_status = current.status;

        status_machine::guard_terminal(
            &self.repo,
            lease_id,
            &[pre_status],
            LeaseStatus::Deleting,
            || async move { self.teardown(&current).await },
        )
        .await
    }

    async fn teardown(&self, lease: &Lease) -> EngineResult<()> {
        let started = lease.start_event().map(|e| e.status != EventStatus::Undone).unwrap_or(false);
        let ended = lease.end_event().map(|e| e.status != EventStatus::Undone).unwrap_or(false);

        if started && !ended {
            if let Some(end_event) = lease.end_event() {
                self.repo
                    .event_update(end_event.id, EventPatch { status: Some(EventStatus::InProgress), ..Default::default() })
                    .await?;
            }
        }

        if !ended {
            for (name, err) in self.enforcement.on_end(lease).await {
                tracing::warn!(lease_id = %lease.id, filter = name, error = %err, "enforcement on_end failed during delete");
            }
        }

        let mut ordered = lease.reservations.clone();
        ordering::sort_for_teardown(&mut ordered);

        let mut unclean = false;
        for reservation in &ordered {
            if let Some(resource_id) = &reservation.resource_id {
                let plugin = match self.plugins.resolve(&reservation.resource_type) {
                    Ok(p) => p,
                    Err(_) => {
                        unclean = true;
                        continue;
                    }
                };
                if let Err(err) = plugin.on_end(resource_id, lease).await {
                    tracing::error!(
                        lease_id = %lease.id,
                        reservation_id = %reservation.id,
                        error = %err,
                        "plugin on_end failed during delete"
                    );
                    unclean = true;
                }
            }
        }

        self.notifications
            .publish(NotificationPayload::new(topics::LEASE_DELETE, lease.clone()))
            .await;

        if unclean {
            return Err(ManagerError::EventError(format!(
                "one or more reservations failed to release cleanly for lease {}",
                lease.id
            )));
        }

        if started && !ended {
            if let Some(end_event) = lease.end_event() {
                self.repo
                    .event_update(end_event.id, EventPatch { status: Some(EventStatus::Done), ..Default::default() })
                    .await?;
            }
        }

        self.repo.lease_destroy(lease.id).await
    }
}

#[derive(Default)]
struct CreateRollback {
    lease_created: bool,
    reserved: Vec<(Arc<dyn ResourcePlugin>, String)>,
}

fn start_ok(start: DateTime<Utc>, candidate: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    start < candidate && candidate < end
}

fn truncate_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_second(0).and_then(|t| t.with_nanosecond(0)).unwrap_or(t)
}

/// Parses `"YYYY-MM-DD HH:MM"` as UTC, or resolves the `now` literal.
fn resolve_date(date: &LeaseDate, now: DateTime<Utc>) -> EngineResult<DateTime<Utc>> {
    match date {
        LeaseDate::Now => Ok(now),
        LeaseDate::At(raw) => {
            let naive = chrono::NaiveDateTime::parse_from_str(raw, LeaseDate::FORMAT).map_err(|_| {
                ManagerError::InvalidDate { date: raw.clone(), expected_format: LeaseDate::FORMAT.to_string() }
            })?;
            Ok(Utc.from_utc_datetime(&naive))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::dummy::DummyResourcePlugin;
    use crate::plugins::registry::PluginRegistry;
    use crate::repository::memory::InMemoryRepository;
    use crate::notification::BroadcastNotificationSink;
    use serde_json::json;

    fn service(repo: Arc<dyn Repository>) -> LeaseService {
        let plugin: Arc<dyn ResourcePlugin> =
            Arc::new(DummyResourcePlugin::with_pool(vec!["host-1".to_string()]));
        let registry = Arc::new(PluginRegistry::from_plugins(vec![plugin]).unwrap());
        LeaseService::new(
            repo,
            registry,
            Enforcement::default(),
            Arc::new(BroadcastNotificationSink::default()),
            60,
        )
    }

    fn sample_values(name: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> LeaseCreateValues {
        LeaseCreateValues {
            name: name.to_string(),
            project_id: "proj".to_string(),
            user_id: "user".to_string(),
            trust_id: "trust".to_string(),
            start_date: LeaseDate::At(start.format(LeaseDate::FORMAT).to_string()),
            end_date: LeaseDate::At(end.format(LeaseDate::FORMAT).to_string()),
            before_end_date: None,
            reservations: vec![ReservationValues {
                id: None,
                resource_type: "dummy.vm.plugin".to_string(),
                values: HashMap::from([("min".to_string(), json!(1)), ("max".to_string(), json!(1))]),
            }],
        }
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let service = service(repo);
        let now = Utc::now();
        let values = sample_values("lease-a", now + chrono::Duration::minutes(5), now + chrono::Duration::minutes(65));

        let created = service.create(values, now).await.unwrap();
        assert_eq!(created.status, LeaseStatus::Pending);
        assert_eq!(created.reservations.len(), 1);
        assert!(created.events.iter().any(|e| e.event_type == EventType::StartLease));
        assert!(created.events.iter().any(|e| e.event_type == EventType::BeforeEndLease));

        let fetched = service.get(created.id).await.unwrap();
        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.reservations.len(), created.reservations.len());
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let service = service(repo);
        let now = Utc::now();
        let values = sample_values("dup", now + chrono::Duration::minutes(5), now + chrono::Duration::minutes(65));
        service.create(values.clone(), now).await.unwrap();

        let err = service.create(values, now).await.unwrap_err();
        assert!(matches!(err, ManagerError::LeaseNameAlreadyExists(_)));
    }

    #[tokio::test]
    async fn create_past_start_date_is_rejected() {
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let service = service(repo);
        let now = Utc::now();
        let values = sample_values("past", now - chrono::Duration::minutes(5), now + chrono::Duration::minutes(65));
        let err = service.create(values, now).await.unwrap_err();
        assert!(matches!(err, ManagerError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn empty_update_is_a_no_op() {
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let service = service(repo);
        let now = Utc::now();
        let values = sample_values("noop", now + chrono::Duration::minutes(5), now + chrono::Duration::minutes(65));
        let created = service.create(values, now).await.unwrap();

        let unchanged = service.update(created.id, LeaseUpdateValues::default(), now).await.unwrap();
        assert_eq!(unchanged, created);
    }

    #[tokio::test]
    async fn name_only_update_is_a_fast_path() {
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let service = service(repo);
        let now = Utc::now();
        let values = sample_values("old-name", now + chrono::Duration::minutes(5), now + chrono::Duration::minutes(65));
        let created = service.create(values, now).await.unwrap();

        let renamed = service
            .update(
                created.id,
                LeaseUpdateValues { name: Some("new-name".to_string()), ..Default::default() },
                now,
            )
            .await
            .unwrap();
        assert_eq!(renamed.name, "new-name");
        assert_eq!(renamed.status, LeaseStatus::Pending);
    }

    #[tokio::test]
    async fn delete_rolls_back_nothing_left_over() {
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let service = service(repo);
        let now = Utc::now();
        let values = sample_values("to-delete", now + chrono::Duration::minutes(5), now + chrono::Duration::minutes(65));
        let created = service.create(values, now).await.unwrap();

        service.delete(created.id, now).await.unwrap();
        let err = service.get(created.id).await.unwrap_err();
        assert!(matches!(err, ManagerError::Repository(_)));
    }
}
