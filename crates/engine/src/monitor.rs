//! `Monitor` (spec/SPEC_FULL §4.8): health polling and
//! notification-driven reallocation, on its own timer independent of the
//! event tick (spec §5). Intentionally the thinnest component — a
//! polling-and-callback shell, not a scheduler.

use std::sync::Arc;

use leasemgr_common::model::ReservationStatus;
use leasemgr_common::notification::{topics, NotificationPayload};
use uuid::Uuid;

use crate::error::EngineResult;
use crate::lifecycle::set_degraded;
use crate::notification::NotificationSink;
use crate::plugins::registry::PluginRegistry;
use crate::plugins::ResourcePlugin;
use crate::repository::{ReservationPatch, Repository};

pub struct Monitor {
    repo: Arc<dyn Repository>,
    plugins: Arc<PluginRegistry>,
    notifications: Arc<dyn NotificationSink>,
}

impl Monitor {
    pub fn new(
        repo: Arc<dyn Repository>,
        plugins: Arc<PluginRegistry>,
        notifications: Arc<dyn NotificationSink>,
    ) -> Self {
        Self { repo, plugins, notifications }
    }

    /// One poll cycle across every registered plugin.
    pub async fn poll(&self) -> EngineResult<()> {
        for plugin in self.plugins.all() {
            let health_events = plugin.health_check().await;
            if health_events.is_empty() {
                continue;
            }
            tracing::warn!(
                resource_type = plugin.resource_type(),
                count = health_events.len(),
                "health poll reported unavailable resources"
            );
            let reservation_ids: Vec<Uuid> =
                health_events.iter().map(|e| e.reservation_id).collect();
            self.heal(plugin, &reservation_ids).await?;
        }
        Ok(())
    }

    async fn heal(&self, plugin: &Arc<dyn ResourcePlugin>, reservation_ids: &[Uuid]) -> EngineResult<()> {
        for &reservation_id in reservation_ids {
            self.repo
                .reservation_update(
                    reservation_id,
                    ReservationPatch { missing_resources: Some(true), ..Default::default() },
                )
                .await?;
        }

        let report = plugin.heal_reservations(reservation_ids).await;
        for reservation_id in report.healed {
            self.mark_recovered(reservation_id).await?;
        }
        for reservation_id in report.still_missing {
            self.mark_degraded(reservation_id).await?;
        }
        Ok(())
    }

    async fn mark_recovered(&self, reservation_id: Uuid) -> EngineResult<()> {
        let reservation = self
            .repo
            .reservation_update(
                reservation_id,
                ReservationPatch {
                    missing_resources: Some(false),
                    resources_changed: Some(true),
                    status: Some(ReservationStatus::Active),
                    ..Default::default()
                },
            )
            .await?;
        let lease = self.repo.lease_get(reservation.lease_id).await?;
        set_degraded(&self.repo, lease.id, false).await?;
        self.notifications
            .publish(NotificationPayload::new(topics::RESERVATION_DEGRADED_RECOVERED, lease))
            .await;
        Ok(())
    }

    async fn mark_degraded(&self, reservation_id: Uuid) -> EngineResult<()> {
        let reservation = self.repo.reservation_get(reservation_id).await?;
        let lease = self.repo.lease_get(reservation.lease_id).await?;
        set_degraded(&self.repo, lease.id, true).await?;
        self.notifications
            .publish(NotificationPayload::new(topics::RESERVATION_DEGRADED, lease))
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::BroadcastNotificationSink;
    use crate::plugins::dummy::DummyResourcePlugin;
    use crate::plugins::ResourcePlugin;
    use crate::repository::memory::InMemoryRepository;
    use chrono::{Duration, Utc};
    use leasemgr_common::model::{Lease, LeaseStatus, Reservation};
    use std::collections::HashMap;

    struct FlakyPlugin {
        reservation_id: Uuid,
        heals: bool,
    }

    #[async_trait::async_trait]
    impl ResourcePlugin for FlakyPlugin {
        fn resource_type(&self) -> &str {
            "flaky.plugin"
        }

        async fn setup(&self, _conf: &HashMap<String, serde_json::Value>) -> EngineResult<()> {
            Ok(())
        }

        async fn get(&self, resource_id: &str) -> EngineResult<serde_json::Value> {
            Ok(serde_json::json!({ "id": resource_id }))
        }

        async fn reserve_resource(
            &self,
            _reservation_id: Uuid,
            _values: &HashMap<String, serde_json::Value>,
        ) -> EngineResult<String> {
            Ok("host-x".to_string())
        }

        async fn update_reservation(
            &self,
            _reservation_id: Uuid,
            _values: &HashMap<String, serde_json::Value>,
        ) -> EngineResult<()> {
            Ok(())
        }

        async fn allocation_candidates(
            &self,
            _values: &HashMap<String, serde_json::Value>,
        ) -> EngineResult<Vec<String>> {
            Ok(vec!["host-x".to_string()])
        }

        async fn update_default_parameters(
            &self,
            _values: &HashMap<String, serde_json::Value>,
        ) -> EngineResult<()> {
            Ok(())
        }

        async fn on_start(&self, _resource_id: &str, _lease: &Lease) -> EngineResult<()> {
            Ok(())
        }

        async fn on_end(&self, _resource_id: &str, _lease: &Lease) -> EngineResult<()> {
            Ok(())
        }

        async fn before_end(&self, _resource_id: &str, _lease: &Lease) -> EngineResult<()> {
            Ok(())
        }

        async fn list_allocations(
            &self,
            _query: &HashMap<String, serde_json::Value>,
        ) -> EngineResult<Vec<String>> {
            Ok(vec![])
        }

        async fn query_allocations(
            &self,
            resource_ids: &[String],
            _lease_id: Option<Uuid>,
            _reservation_id: Option<Uuid>,
        ) -> EngineResult<Vec<String>> {
            Ok(resource_ids.to_vec())
        }

        async fn health_check(&self) -> Vec<crate::plugins::HealthEvent> {
            vec![crate::plugins::HealthEvent {
                reservation_id: self.reservation_id,
                resource_id: "host-x".to_string(),
                reason: "host unreachable".to_string(),
            }]
        }

        async fn heal_reservations(&self, reservation_ids: &[Uuid]) -> crate::plugins::HealReport {
            if self.heals {
                crate::plugins::HealReport { healed: reservation_ids.to_vec(), still_missing: vec![] }
            } else {
                crate::plugins::HealReport { healed: vec![], still_missing: reservation_ids.to_vec() }
            }
        }
    }

    async fn lease_with_reservation(repo: &Arc<dyn Repository>, resource_id: &str) -> (Lease, Reservation) {
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
            status: LeaseStatus::Active,
            degraded: false,
            reservations: vec![],
            events: vec![],
        };
        repo.lease_create(lease.clone()).await.unwrap();
        let reservation = Reservation {
            id: Uuid::new_v4(),
            lease_id,
            resource_type: "dummy.vm.plugin".to_string(),
            resource_id: Some(resource_id.to_string()),
            status: ReservationStatus::Active,
            missing_resources: false,
            resources_changed: false,
            values: Default::default(),
        };
        repo.reservation_create(reservation.clone()).await.unwrap();
        (lease, reservation)
    }

    #[tokio::test]
    async fn poll_with_no_health_events_is_a_no_op() {
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let plugin: Arc<dyn ResourcePlugin> = Arc::new(DummyResourcePlugin::new());
        let registry = Arc::new(PluginRegistry::from_plugins(vec![plugin]).unwrap());
        let monitor =
            Monitor::new(repo, registry, Arc::new(BroadcastNotificationSink::default()));
        monitor.poll().await.unwrap();
    }

    #[tokio::test]
    async fn successful_heal_clears_missing_resources_and_recovers() {
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let (lease, reservation) = lease_with_reservation(&repo, "host-x").await;
        let plugin: Arc<dyn ResourcePlugin> =
            Arc::new(FlakyPlugin { reservation_id: reservation.id, heals: true });
        let registry = Arc::new(PluginRegistry::from_plugins(vec![plugin]).unwrap());
        let sink = Arc::new(BroadcastNotificationSink::default());
        let mut rx = sink.subscribe();
        let monitor = Monitor::new(repo.clone(), registry, sink);

        monitor.poll().await.unwrap();

        let updated = repo.reservation_get(reservation.id).await.unwrap();
        assert!(!updated.missing_resources);
        assert!(updated.resources_changed);
        let updated_lease = repo.lease_get(lease.id).await.unwrap();
        assert!(!updated_lease.degraded);
        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.topic, topics::RESERVATION_DEGRADED_RECOVERED);
    }

    #[tokio::test]
    async fn failed_heal_leaves_lease_degraded() {
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let (lease, reservation) = lease_with_reservation(&repo, "host-x").await;
        let plugin: Arc<dyn ResourcePlugin> =
            Arc::new(FlakyPlugin { reservation_id: reservation.id, heals: false });
        let registry = Arc::new(PluginRegistry::from_plugins(vec![plugin]).unwrap());
        let sink = Arc::new(BroadcastNotificationSink::default());
        let mut rx = sink.subscribe();
        let monitor = Monitor::new(repo.clone(), registry, sink);

        monitor.poll().await.unwrap();

        let updated_lease = repo.lease_get(lease.id).await.unwrap();
        assert!(updated_lease.degraded);
        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.topic, topics::RESERVATION_DEGRADED);
    }
}
