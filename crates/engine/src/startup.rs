//! Startup wiring (spec §6): turns a [`ManagerConfig`] into the
//! constructed components a runtime drives. Mirrors the teacher's
//! `startup.rs` pattern of collecting "resolve config, build resources"
//! into one place so callers (the CLI, the test harness) don't repeat it.

use std::sync::Arc;

use crate::config::ManagerConfig;
use crate::enforcement::Enforcement;
use crate::error::EngineResult;
use crate::event_engine::EventEngine;
use crate::lease_service::LeaseService;
use crate::lifecycle::LifecycleHandlers;
use crate::monitor::Monitor;
use crate::notification::{BroadcastNotificationSink, NotificationSink};
use crate::plugins::registry::PluginRegistry;
use crate::repository::memory::InMemoryRepository;
use crate::repository::postgres::PostgresRepository;
use crate::repository::Repository;

/// Every long-lived component the runtime drives, constructed once at
/// startup and shared across the event tick and the monitor poll.
pub struct Engine {
    pub repo: Arc<dyn Repository>,
    pub plugins: Arc<PluginRegistry>,
    pub notifications: Arc<dyn NotificationSink>,
    pub lease_service: Arc<LeaseService>,
    pub event_engine: Arc<EventEngine>,
    pub monitor: Arc<Monitor>,
    pub config: ManagerConfig,
}

impl Engine {
    /// Build every component from `config`. `database_url` selects the
    /// repository backend: `Some` connects to Postgres, `None` falls back
    /// to the in-memory repository (development, tests, and any embedder
    /// that doesn't need durability).
    pub async fn build(config: ManagerConfig, database_url: Option<&str>) -> EngineResult<Self> {
        let repo: Arc<dyn Repository> = match database_url {
            Some(url) => Arc::new(PostgresRepository::connect(url).await?),
            None => Arc::new(InMemoryRepository::new()),
        };

        let plugins = Arc::new(PluginRegistry::load(&config.plugins).await?);
        let enforcement = Enforcement::default();
        let notifications: Arc<dyn NotificationSink> =
            Arc::new(BroadcastNotificationSink::default());

        let lease_service = Arc::new(LeaseService::new(
            repo.clone(),
            plugins.clone(),
            enforcement.clone(),
            notifications.clone(),
            config.minutes_before_end_lease,
        ));

        let handlers =
            Arc::new(LifecycleHandlers::new(repo.clone(), plugins.clone(), enforcement));
        let event_engine = Arc::new(EventEngine::new(
            repo.clone(),
            handlers,
            notifications.clone(),
            config.retry_window(),
            config.event_interval(),
            config.recovery_stale_ticks,
        ));
        let monitor = Arc::new(Monitor::new(repo.clone(), plugins.clone(), notifications.clone()));

        Ok(Self { repo, plugins, notifications, lease_service, event_engine, monitor, config })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builds_with_default_config_and_in_memory_repository() {
        let engine = Engine::build(ManagerConfig::default(), None).await.unwrap();
        assert!(engine.plugins.resolve("dummy.vm.plugin").is_ok());
    }

    #[tokio::test]
    async fn unknown_plugin_name_fails_build() {
        let mut config = ManagerConfig::default();
        config.plugins = vec!["no.such.plugin".to_string()];
        let err = Engine::build(config, None).await.unwrap_err();
        assert!(matches!(err, leasemgr_common::error::ManagerError::PluginConfigurationError(_)));
    }
}
