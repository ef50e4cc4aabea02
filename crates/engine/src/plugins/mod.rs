//! The plugin contract (spec §4.5): one implementation per resource type,
//! coordinated through a uniform async interface.

pub mod dummy;
pub mod registry;

use std::collections::HashMap;

use async_trait::async_trait;
use leasemgr_common::model::Lease;
use serde_json::Value;
use uuid::Uuid;

use crate::error::EngineResult;

/// A single configuration option a plugin wants registered under its
/// resource-type config group (spec §4.5, §6).
#[derive(Debug, Clone, PartialEq)]
pub struct PluginOption {
    pub name: &'static str,
    pub default: Value,
}

/// Outcome of a healing attempt (spec §4.8 Monitor).
#[derive(Debug, Clone, Default)]
pub struct HealReport {
    pub healed: Vec<Uuid>,
    pub still_missing: Vec<Uuid>,
}

/// A resource a health poll found unexpectedly unavailable. The plugin
/// owns the resource_id -> reservation_id mapping (it assigned the
/// resource in the first place), so it reports the affected reservation
/// directly rather than making the Monitor parse an opaque resource_id.
#[derive(Debug, Clone)]
pub struct HealthEvent {
    pub reservation_id: Uuid,
    pub resource_id: String,
    pub reason: String,
}

#[async_trait]
pub trait ResourcePlugin: Send + Sync {
    fn resource_type(&self) -> &str;

    /// Config options registered under a group named by `resource_type`.
    fn get_plugin_opts(&self) -> Vec<PluginOption> {
        Vec::new()
    }

    /// If true, `allocation_candidates` is retried once with
    /// `default_resource_properties` stripped when the first attempt
    /// fails with NotEnoughResources (spec §4.1 step 1).
    fn retry_allocation_without_defaults(&self) -> bool {
        false
    }

    async fn setup(&self, conf: &HashMap<String, Value>) -> EngineResult<()>;

    async fn get(&self, resource_id: &str) -> EngineResult<Value>;

    async fn reserve_resource(
        &self,
        reservation_id: Uuid,
        values: &HashMap<String, Value>,
    ) -> EngineResult<String>;

    async fn update_reservation(
        &self,
        reservation_id: Uuid,
        values: &HashMap<String, Value>,
    ) -> EngineResult<()>;

    async fn allocation_candidates(
        &self,
        values: &HashMap<String, Value>,
    ) -> EngineResult<Vec<String>>;

    async fn update_default_parameters(&self, values: &HashMap<String, Value>) -> EngineResult<()>;

    async fn on_start(&self, resource_id: &str, lease: &Lease) -> EngineResult<()>;
    async fn on_end(&self, resource_id: &str, lease: &Lease) -> EngineResult<()>;
    async fn before_end(&self, resource_id: &str, lease: &Lease) -> EngineResult<()>;

    async fn list_allocations(&self, query: &HashMap<String, Value>) -> EngineResult<Vec<String>>;
    async fn query_allocations(
        &self,
        resource_ids: &[String],
        lease_id: Option<Uuid>,
        reservation_id: Option<Uuid>,
    ) -> EngineResult<Vec<String>>;

    /// Optional health poll, consumed by the Monitor (spec §4.8). Default
    /// is "nothing to report".
    async fn health_check(&self) -> Vec<HealthEvent> {
        Vec::new()
    }

    /// Optional reallocation hook, consumed by the Monitor.
    async fn heal_reservations(&self, reservation_ids: &[Uuid]) -> HealReport {
        HealReport { healed: Vec::new(), still_missing: reservation_ids.to_vec() }
    }
}
