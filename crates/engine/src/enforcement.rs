//! Pluggable policy-filter pipeline (spec §4.7). Filters run before a
//! lease is created or updated, and again when it ends, and can veto the
//! operation outright or usage (no database mutation happens until every
//! filter has agreed).

use std::sync::Arc;

use async_trait::async_trait;
use leasemgr_common::model::{Allocation, Lease, LeaseUpdateValues, Reservation, ReservationValues};

use crate::error::EngineResult;

/// A single policy check. Implementations should be cheap and
/// side-effect-free on the reject path — `Enforcement` runs every
/// registered filter even after an earlier one has already failed is not
/// guaranteed, so filters must not assume they always get to observe a
/// rejection made by a filter ordered after them.
#[async_trait]
pub trait EnforcementFilter: Send + Sync {
    fn name(&self) -> &str;

    /// Called before a new lease (and its reservations) is persisted.
    async fn check_create(
        &self,
        project_id: &str,
        reservations: &[ReservationValues],
    ) -> EngineResult<()>;

    /// Called before an existing lease's reservations are changed. Carries
    /// both the submitted patch and the before/after allocation and
    /// reservation state so filters can compare what's actually moving
    /// (e.g. a quota filter diffing `old_allocs` against `new_allocs`).
    #[allow(clippy::too_many_arguments)]
    async fn check_update(
        &self,
        old_lease: &Lease,
        new_values: &LeaseUpdateValues,
        old_allocs: &[Allocation],
        new_allocs: &[Allocation],
        old_res: &[Reservation],
        new_res: &[Reservation],
    ) -> EngineResult<()>;

    /// Called when a lease ends, so filters can release any policy state
    /// (e.g. quota) they were holding for it. Best-effort: failures here
    /// are logged by the caller, not propagated as a lease-ending error.
    async fn on_end(&self, _lease: &Lease) -> EngineResult<()> {
        Ok(())
    }
}

/// Runs every registered filter in order, short-circuiting on the first
/// rejection for `check_create`/`check_update` (spec §4.7: "the first
/// filter to reject wins; later filters do not run").
#[derive(Clone, Default)]
pub struct Enforcement {
    filters: Vec<Arc<dyn EnforcementFilter>>,
}

impl Enforcement {
    pub fn new(filters: Vec<Arc<dyn EnforcementFilter>>) -> Self {
        Self { filters }
    }

    pub async fn check_create(
        &self,
        project_id: &str,
        reservations: &[ReservationValues],
    ) -> EngineResult<()> {
        for filter in &self.filters {
            filter.check_create(project_id, reservations).await?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn check_update(
        &self,
        old_lease: &Lease,
        new_values: &LeaseUpdateValues,
        old_allocs: &[Allocation],
        new_allocs: &[Allocation],
        old_res: &[Reservation],
        new_res: &[Reservation],
    ) -> EngineResult<()> {
        for filter in &self.filters {
            filter
                .check_update(old_lease, new_values, old_allocs, new_allocs, old_res, new_res)
                .await?;
        }
        Ok(())
    }

    /// Runs every filter's `on_end` hook, collecting failures rather than
    /// stopping at the first one — lease teardown must not get stuck
    /// because one filter's bookkeeping failed.
    pub async fn on_end(&self, lease: &Lease) -> Vec<(String, leasemgr_common::error::ManagerError)> {
        let mut failures = Vec::new();
        for filter in &self.filters {
            if let Err(err) = filter.on_end(lease).await {
                failures.push((filter.name().to_string(), err));
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use leasemgr_common::error::ManagerError;
    use leasemgr_common::model::LeaseStatus;
    use uuid::Uuid;

    struct RejectAll;

    #[async_trait]
    impl EnforcementFilter for RejectAll {
        fn name(&self) -> &str {
            "reject-all"
        }

        async fn check_create(
            &self,
            _project_id: &str,
            _reservations: &[ReservationValues],
        ) -> EngineResult<()> {
            Err(ManagerError::NotAuthorized("no quota left".into()))
        }

        async fn check_update(
            &self,
            _old_lease: &Lease,
            _new_values: &LeaseUpdateValues,
            _old_allocs: &[Allocation],
            _new_allocs: &[Allocation],
            _old_res: &[Reservation],
            _new_res: &[Reservation],
        ) -> EngineResult<()> {
            Ok(())
        }
    }

    struct CountingFilter(std::sync::atomic::AtomicUsize);

    #[async_trait]
    impl EnforcementFilter for CountingFilter {
        fn name(&self) -> &str {
            "counting"
        }

        async fn check_create(
            &self,
            _project_id: &str,
            _reservations: &[ReservationValues],
        ) -> EngineResult<()> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        async fn check_update(
            &self,
            _old_lease: &Lease,
            _new_values: &LeaseUpdateValues,
            _old_allocs: &[Allocation],
            _new_allocs: &[Allocation],
            _old_res: &[Reservation],
            _new_res: &[Reservation],
        ) -> EngineResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn first_rejection_short_circuits_later_filters() {
        let counter = Arc::new(CountingFilter(std::sync::atomic::AtomicUsize::new(0)));
        let enforcement = Enforcement::new(vec![Arc::new(RejectAll), counter.clone()]);

        let err = enforcement.check_create("proj", &[]).await.unwrap_err();
        assert!(matches!(err, ManagerError::NotAuthorized(_)));
        assert_eq!(counter.0.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_filters_always_passes() {
        let enforcement = Enforcement::default();
        assert!(enforcement.check_create("proj", &[]).await.is_ok());

        let lease = Lease {
            id: Uuid::new_v4(),
            name: "x".into(),
            project_id: "proj".into(),
            user_id: "u".into(),
            trust_id: "t".into(),
            start_date: Utc::now(),
            end_date: Utc::now(),
            status: LeaseStatus::Active,
            degraded: false,
            reservations: vec![],
            events: vec![],
        };
        assert!(enforcement.on_end(&lease).await.is_empty());
    }
}
