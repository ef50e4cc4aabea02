//! Basic lifecycle handlers (spec §4.4): `start_lease`, `end_lease`,
//! `before_end_lease`. These are what `EventEngine::dispatch` calls once
//! it has decided an event is due and the owning lease is stable.

use std::sync::Arc;

use leasemgr_common::error::ManagerError;
use leasemgr_common::model::{Lease, LeaseStatus, ReservationStatus};

use crate::enforcement::Enforcement;
use crate::error::EngineResult;
use crate::ordering;
use crate::plugins::registry::PluginRegistry;
use crate::repository::{LeasePatch, ReservationPatch, Repository};
use crate::status_machine;

pub struct LifecycleHandlers {
    repo: Arc<dyn Repository>,
    plugins: Arc<PluginRegistry>,
    enforcement: Enforcement,
}

impl LifecycleHandlers {
    pub fn new(repo: Arc<dyn Repository>, plugins: Arc<PluginRegistry>, enforcement: Enforcement) -> Self {
        Self { repo, plugins, enforcement }
    }

    /// `PENDING -> STARTING -> {ACTIVE, ERROR}`. A single reservation
    /// failing does not abort the others — it lands that reservation (and
    /// the event) in ERROR while its siblings still get a chance to
    /// start.
    pub async fn start_lease(&self, lease_id: uuid::Uuid) -> EngineResult<()> {
        status_machine::guard(
            &self.repo,
            lease_id,
            &[LeaseStatus::Pending],
            LeaseStatus::Starting,
            || async move {
                let lease = self.repo.lease_get(lease_id).await?;
                let mut ordered = lease.reservations.clone();
                ordering::sort_for_bring_up(&mut ordered);

                let mut any_failed = false;
                for reservation in &ordered {
                    let outcome = self.start_reservation(&lease, reservation).await;
                    if outcome.is_err() {
                        any_failed = true;
                    }
                }

                if any_failed {
                    return Err(ManagerError::EventError(format!(
                        "one or more reservations failed to start for lease {lease_id}"
                    )));
                }
                Ok(((), LeaseStatus::Active))
            },
        )
        .await
    }

    async fn start_reservation(
        &self,
        lease: &Lease,
        reservation: &leasemgr_common::model::Reservation,
    ) -> EngineResult<()> {
        let plugin = self.plugins.resolve(&reservation.resource_type)?;
        let result = match &reservation.resource_id {
            Some(resource_id) => plugin.on_start(resource_id, lease).await,
            None => Err(ManagerError::EventError(format!(
                "reservation {} has no resource_id to start",
                reservation.id
            ))),
        };

        match result {
            Ok(()) => {
                self.repo
                    .reservation_update(
                        reservation.id,
                        ReservationPatch { status: Some(ReservationStatus::Active), ..Default::default() },
                    )
                    .await?;
                Ok(())
            }
            Err(err) => {
                let _ = self
                    .repo
                    .reservation_update(
                        reservation.id,
                        ReservationPatch { status: Some(ReservationStatus::Error), ..Default::default() },
                    )
                    .await;
                Err(err)
            }
        }
    }

    /// `ACTIVE -> TERMINATING -> {TERMINATED, ERROR}`.
    pub async fn end_lease(&self, lease_id: uuid::Uuid) -> EngineResult<()> {
        status_machine::guard(
            &self.repo,
            lease_id,
            &[LeaseStatus::Active],
            LeaseStatus::Terminating,
            || async move {
                let lease = self.repo.lease_get(lease_id).await?;

                for (name, err) in self.enforcement.on_end(&lease).await {
                    tracing::warn!(lease_id = %lease_id, filter = name, error = %err, "enforcement on_end failed");
                }

                let mut ordered = lease.reservations.clone();
                ordering::sort_for_teardown(&mut ordered);

                let mut any_failed = false;
                for reservation in &ordered {
                    if self.end_reservation(&lease, reservation).await.is_err() {
                        any_failed = true;
                    }
                }

                if any_failed {
                    return Err(ManagerError::EventError(format!(
                        "one or more reservations failed to end for lease {lease_id}"
                    )));
                }
                Ok(((), LeaseStatus::Terminated))
            },
        )
        .await
    }

    async fn end_reservation(
        &self,
        lease: &Lease,
        reservation: &leasemgr_common::model::Reservation,
    ) -> EngineResult<()> {
        let plugin = self.plugins.resolve(&reservation.resource_type)?;
        let result = match &reservation.resource_id {
            Some(resource_id) => plugin.on_end(resource_id, lease).await,
            None => Ok(()),
        };

        match result {
            Ok(()) => {
                self.repo
                    .reservation_update(
                        reservation.id,
                        ReservationPatch { status: Some(ReservationStatus::Deleted), ..Default::default() },
                    )
                    .await?;
                Ok(())
            }
            Err(err) => {
                let _ = self
                    .repo
                    .reservation_update(
                        reservation.id,
                        ReservationPatch { status: Some(ReservationStatus::Error), ..Default::default() },
                    )
                    .await;
                Err(err)
            }
        }
    }

    /// No lease status transition — the plugin decides what "before the
    /// lease ends" means (snapshot, notification, etc).
    pub async fn before_end_lease(&self, lease_id: uuid::Uuid) -> EngineResult<()> {
        let lease = self.repo.lease_get(lease_id).await?;
        let mut ordered = lease.reservations.clone();
        ordering::sort_for_teardown(&mut ordered);

        for reservation in &ordered {
            let Some(resource_id) = &reservation.resource_id else { continue };
            let plugin = self.plugins.resolve(&reservation.resource_type)?;
            plugin.before_end(resource_id, &lease).await?;
        }
        Ok(())
    }
}

/// Patches a lease's `degraded` flag — used by the Monitor (spec §4.8),
/// kept here since it's a lease-level mutation alongside the other
/// lifecycle writes.
pub async fn set_degraded(repo: &Arc<dyn Repository>, lease_id: uuid::Uuid, degraded: bool) -> EngineResult<()> {
    repo.lease_update(lease_id, LeasePatch { degraded: Some(degraded), ..Default::default() }).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::dummy::DummyResourcePlugin;
    use crate::plugins::ResourcePlugin;
    use crate::repository::memory::InMemoryRepository;
    use chrono::{Duration, Utc};
    use leasemgr_common::model::{Event, EventStatus, EventType, Reservation};
    use uuid::Uuid;

    async fn pending_lease_with_reservation(
        repo: &Arc<dyn Repository>,
    ) -> (Lease, Reservation) {
        let lease_id = Uuid::new_v4();
        let now = Utc::now();
        let lease = Lease {
            id: lease_id,
            name: "x".into(),
            project_id: "p".into(),
            user_id: "u".into(),
            trust_id: "t".into(),
            start_date: now,
            end_date: now + Duration::hours(1),
            status: LeaseStatus::Pending,
            degraded: false,
            reservations: vec![],
            events: vec![],
        };
        repo.lease_create(lease.clone()).await.unwrap();

        let reservation = Reservation {
            id: Uuid::new_v4(),
            lease_id,
            resource_type: "dummy.vm.plugin".to_string(),
            resource_id: Some("host-1".to_string()),
            status: ReservationStatus::Pending,
            missing_resources: false,
            resources_changed: false,
            values: Default::default(),
        };
        repo.reservation_create(reservation.clone()).await.unwrap();
        repo.event_create(Event {
            id: Uuid::new_v4(),
            lease_id,
            event_type: EventType::StartLease,
            time: now,
            status: EventStatus::Undone,
        })
        .await
        .unwrap();

        (lease, reservation)
    }

    #[tokio::test]
    async fn start_lease_activates_lease_and_reservation() {
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let (lease, reservation) = pending_lease_with_reservation(&repo).await;
        let plugin: Arc<dyn ResourcePlugin> = Arc::new(DummyResourcePlugin::new());
        let registry = Arc::new(PluginRegistry::from_plugins(vec![plugin]).unwrap());
        let handlers = LifecycleHandlers::new(repo.clone(), registry, Enforcement::default());

        handlers.start_lease(lease.id).await.unwrap();

        let updated_lease = repo.lease_get(lease.id).await.unwrap();
        assert_eq!(updated_lease.status, LeaseStatus::Active);
        let updated_reservation = repo.reservation_get(reservation.id).await.unwrap();
        assert_eq!(updated_reservation.status, ReservationStatus::Active);
    }

    #[tokio::test]
    async fn end_lease_deletes_reservations_and_terminates_lease() {
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let (lease, reservation) = pending_lease_with_reservation(&repo).await;
        repo.lease_update(lease.id, LeasePatch { status: Some(LeaseStatus::Active), ..Default::default() })
            .await
            .unwrap();

        let plugin: Arc<dyn ResourcePlugin> = Arc::new(DummyResourcePlugin::new());
        let registry = Arc::new(PluginRegistry::from_plugins(vec![plugin]).unwrap());
        let handlers = LifecycleHandlers::new(repo.clone(), registry, Enforcement::default());

        handlers.end_lease(lease.id).await.unwrap();

        let updated_lease = repo.lease_get(lease.id).await.unwrap();
        assert_eq!(updated_lease.status, LeaseStatus::Terminated);
        let updated_reservation = repo.reservation_get(reservation.id).await.unwrap();
        assert_eq!(updated_reservation.status, ReservationStatus::Deleted);
    }
}
