//! Reference plugin for `resource_type = "dummy.vm.plugin"` (spec §6's
//! documented default). Grounded in the min/max pool-allocation shape of
//! `original_source/blazar/plugins/oshosts/host_plugin.py`'s
//! `allocation_candidates`/`reserve_resource`, simplified to an in-memory
//! pool since the concrete driver is out of scope (spec §1).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use leasemgr_common::model::Lease;
use serde_json::Value;
use uuid::Uuid;

use crate::error::EngineResult;
use leasemgr_common::error::ManagerError;

use super::ResourcePlugin;

#[derive(Debug)]
struct Pool {
    available: Vec<String>,
    allocated: HashMap<Uuid, Vec<String>>,
}

/// A fixed pool of interchangeable resource ids (e.g. compute hosts).
/// `reserve_resource` hands out `min..=max` of them per reservation;
/// `allocation_candidates` fails with `NotEnoughResourcesAvailable` when
/// the pool can't satisfy the minimum.
pub struct DummyResourcePlugin {
    pool: Mutex<Pool>,
}

impl DummyResourcePlugin {
    pub fn new() -> Self {
        Self::with_pool((1..=3).map(|n| format!("host-{n}")).collect())
    }

    pub fn with_pool(ids: Vec<String>) -> Self {
        Self { pool: Mutex::new(Pool { available: ids, allocated: HashMap::new() }) }
    }

    fn min_max(values: &HashMap<String, Value>) -> EngineResult<(usize, usize)> {
        let min = values
            .get("min")
            .and_then(Value::as_u64)
            .ok_or_else(|| ManagerError::MissingParameter("min".to_string()))? as usize;
        let max = values.get("max").and_then(Value::as_u64).unwrap_or(min as u64) as usize;
        if min == 0 || max < min {
            return Err(ManagerError::MalformedParameter(
                "min and max must satisfy 1 <= min <= max".to_string(),
            ));
        }
        Ok((min, max))
    }
}

impl Default for DummyResourcePlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourcePlugin for DummyResourcePlugin {
    fn resource_type(&self) -> &str {
        "dummy.vm.plugin"
    }

    async fn setup(&self, _conf: &HashMap<String, Value>) -> EngineResult<()> {
        Ok(())
    }

    async fn get(&self, resource_id: &str) -> EngineResult<Value> {
        Ok(serde_json::json!({ "id": resource_id }))
    }

    async fn reserve_resource(
        &self,
        reservation_id: Uuid,
        values: &HashMap<String, Value>,
    ) -> EngineResult<String> {
        let (min, max) = Self::min_max(values)?;
        let mut pool = self.pool.lock().expect("dummy plugin pool mutex poisoned");
        if pool.available.len() < min {
            return Err(ManagerError::NotEnoughResourcesAvailable {
                reason: format!(
                    "requested min={min} but only {} host(s) available",
                    pool.available.len()
                ),
                retried_without_defaults: false,
            });
        }
        let take = max.min(pool.available.len());
        let granted: Vec<String> = pool.available.drain(..take).collect();
        pool.allocated.insert(reservation_id, granted.clone());
        // The manager core only stores a single opaque `resource_id`; we
        // encode the granted set as a comma-joined token and decode it
        // back out in `on_start`/`on_end`/`allocation_candidates`.
        Ok(granted.join(","))
    }

    async fn update_reservation(
        &self,
        _reservation_id: Uuid,
        _values: &HashMap<String, Value>,
    ) -> EngineResult<()> {
        Ok(())
    }

    async fn allocation_candidates(
        &self,
        values: &HashMap<String, Value>,
    ) -> EngineResult<Vec<String>> {
        let (min, _max) = Self::min_max(values)?;
        let pool = self.pool.lock().expect("dummy plugin pool mutex poisoned");
        if pool.available.len() < min {
            return Err(ManagerError::NotEnoughResourcesAvailable {
                reason: format!(
                    "requested min={min} but only {} host(s) available",
                    pool.available.len()
                ),
                retried_without_defaults: false,
            });
        }
        Ok(pool.available.clone())
    }

    async fn update_default_parameters(&self, _values: &HashMap<String, Value>) -> EngineResult<()> {
        Ok(())
    }

    async fn on_start(&self, _resource_id: &str, _lease: &Lease) -> EngineResult<()> {
        Ok(())
    }

    async fn on_end(&self, resource_id: &str, _lease: &Lease) -> EngineResult<()> {
        let mut pool = self.pool.lock().expect("dummy plugin pool mutex poisoned");
        let ids: Vec<String> = resource_id.split(',').map(str::to_string).collect();
        pool.allocated.retain(|_, v| v != &ids);
        for id in ids {
            if !pool.available.contains(&id) {
                pool.available.push(id);
            }
        }
        Ok(())
    }

    async fn before_end(&self, _resource_id: &str, _lease: &Lease) -> EngineResult<()> {
        Ok(())
    }

    async fn list_allocations(&self, _query: &HashMap<String, Value>) -> EngineResult<Vec<String>> {
        let pool = self.pool.lock().expect("dummy plugin pool mutex poisoned");
        Ok(pool.allocated.values().flatten().cloned().collect())
    }

    async fn query_allocations(
        &self,
        resource_ids: &[String],
        _lease_id: Option<Uuid>,
        _reservation_id: Option<Uuid>,
    ) -> EngineResult<Vec<String>> {
        Ok(resource_ids.to_vec())
    }
}
