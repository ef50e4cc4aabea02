//! End-to-end lifecycle scenarios driving `LeaseService` and `EventEngine`
//! together against the in-memory repository, the way a single engine
//! tick would see them (spec §8 scenarios 1, 3, 4).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use leasemgr_common::model::{
    EventStatus, LeaseCreateValues, LeaseDate, LeaseStatus, LeaseUpdateValues, ReservationStatus,
    ReservationValues,
};
use leasemgr_engine::enforcement::Enforcement;
use leasemgr_engine::event_engine::EventEngine;
use leasemgr_engine::lease_service::LeaseService;
use leasemgr_engine::lifecycle::LifecycleHandlers;
use leasemgr_engine::notification::BroadcastNotificationSink;
use leasemgr_engine::plugins::dummy::DummyResourcePlugin;
use leasemgr_engine::plugins::registry::PluginRegistry;
use leasemgr_engine::plugins::ResourcePlugin;
use leasemgr_engine::repository::memory::InMemoryRepository;
use leasemgr_engine::repository::Repository;
use serde_json::json;

struct Harness {
    repo: Arc<dyn Repository>,
    lease_service: LeaseService,
    event_engine: EventEngine,
}

fn harness(pool: Vec<&str>) -> Harness {
    let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
    let plugin: Arc<dyn ResourcePlugin> =
        Arc::new(DummyResourcePlugin::with_pool(pool.into_iter().map(str::to_string).collect()));
    let registry = Arc::new(PluginRegistry::from_plugins(vec![plugin]).unwrap());
    let notifications = Arc::new(BroadcastNotificationSink::default());

    let lease_service = LeaseService::new(
        repo.clone(),
        registry.clone(),
        Enforcement::default(),
        notifications.clone(),
        60,
    );
    let handlers = Arc::new(LifecycleHandlers::new(repo.clone(), registry, Enforcement::default()));
    let event_engine = EventEngine::new(
        repo.clone(),
        handlers,
        notifications,
        Duration::seconds(10),
        std::time::Duration::from_secs(10),
        3,
    );
    Harness { repo, lease_service, event_engine }
}

fn reservation(min: u64, max: u64) -> ReservationValues {
    ReservationValues {
        id: None,
        resource_type: "dummy.vm.plugin".to_string(),
        values: HashMap::from([("min".to_string(), json!(min)), ("max".to_string(), json!(max))]),
    }
}

fn create_values(name: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> LeaseCreateValues {
    LeaseCreateValues {
        name: name.to_string(),
        project_id: "proj".to_string(),
        user_id: "user".to_string(),
        trust_id: "trust".to_string(),
        start_date: LeaseDate::At(start.format(LeaseDate::FORMAT).to_string()),
        end_date: LeaseDate::At(end.format(LeaseDate::FORMAT).to_string()),
        before_end_date: None,
        reservations: vec![reservation(1, 1)],
    }
}

#[tokio::test]
async fn create_then_start_tick_activates_the_lease() {
    let h = harness(vec!["host-1"]);
    let now = Utc::now();
    let start = now + Duration::minutes(1);
    let end = start + Duration::hours(1);

    let lease = h.lease_service.create(create_values("a", start, end), now).await.unwrap();
    assert_eq!(lease.status, LeaseStatus::Pending);

    h.event_engine.process_due_events(start + Duration::seconds(1)).await.unwrap();

    let active = h.repo.lease_get(lease.id).await.unwrap();
    assert_eq!(active.status, LeaseStatus::Active);
    assert_eq!(active.reservations[0].status, ReservationStatus::Active);
    let start_event = active.start_event().unwrap();
    assert_eq!(start_event.status, EventStatus::Done);
}

#[tokio::test]
async fn before_end_then_end_tick_terminates_and_frees_the_resource() {
    let h = harness(vec!["host-1"]);
    let now = Utc::now();
    let start = now + Duration::minutes(1);
    let end = start + Duration::hours(2);

    let lease = h.lease_service.create(create_values("b", start, end), now).await.unwrap();
    let before_end = lease.before_end_event().unwrap().time;
    assert_eq!(before_end, end - Duration::minutes(60));

    h.event_engine.process_due_events(start + Duration::seconds(1)).await.unwrap();
    h.event_engine.process_due_events(before_end + Duration::seconds(1)).await.unwrap();

    let ticking = h.repo.lease_get(lease.id).await.unwrap();
    assert_eq!(ticking.status, LeaseStatus::Active, "before_end_lease must not change lease status");
    assert_eq!(ticking.before_end_event().unwrap().status, EventStatus::Done);

    h.event_engine.process_due_events(end + Duration::seconds(1)).await.unwrap();

    let err = h.repo.lease_get(lease.id).await.unwrap_err();
    assert!(matches!(err, leasemgr_common::error::ManagerError::Repository(_)), "lease_destroy should remove the row");

    // The single host is back in the pool: a fresh lease claiming it succeeds.
    let reuse_start = end + Duration::minutes(2);
    let reuse_end = reuse_start + Duration::hours(1);
    h.lease_service
        .create(create_values("b-again", reuse_start, reuse_end), end + Duration::seconds(2))
        .await
        .expect("the host freed by teardown should be available for reuse");
}

#[tokio::test]
async fn extending_an_active_lease_shifts_its_end_and_before_end_events() {
    let h = harness(vec!["host-1"]);
    let now = Utc::now();
    let start = now + Duration::minutes(1);
    let end = start + Duration::hours(1);

    let lease = h.lease_service.create(create_values("c", start, end), now).await.unwrap();
    h.event_engine.process_due_events(start + Duration::seconds(1)).await.unwrap();
    assert_eq!(h.repo.lease_get(lease.id).await.unwrap().status, LeaseStatus::Active);

    let new_end = end + Duration::hours(3);
    let update = LeaseUpdateValues {
        end_date: Some(LeaseDate::At(new_end.format(LeaseDate::FORMAT).to_string())),
        ..Default::default()
    };
    let updated =
        h.lease_service.update(lease.id, update, start + Duration::minutes(2)).await.unwrap();

    assert_eq!(updated.status, LeaseStatus::Active);
    assert_eq!(updated.end_event().unwrap().time, new_end);
    assert_eq!(updated.before_end_event().unwrap().time, new_end - Duration::minutes(60));
}
