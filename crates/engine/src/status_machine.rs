//! Declarative status-transition guard for lease-mutating operations
//! (spec §4.6). The guard CASes the lease into a transitional status,
//! runs the operation, and resolves the final status based on how the
//! operation finished — success, a declared non-fatal exception, or
//! anything else (which lands the lease in ERROR).

use std::future::Future;
use std::sync::Arc;

use leasemgr_common::error::ManagerError;
use leasemgr_common::model::LeaseStatus;
use uuid::Uuid;

use crate::error::EngineResult;
use crate::repository::{LeasePatch, Repository};

/// Runs `op` under the status-machine protocol:
///
/// 1. CAS the lease from one of `from` into `transition`.
/// 2. Run `op`.
/// 3. On success, set the lease to whatever `op` returned alongside its
///    value (the "pre-existing stable state" for update, a fixed state
///    for others).
/// 4. On a non-fatal error (per `ManagerError::is_non_fatal`), revert to
///    the lease's status as it was before step 1 and re-raise.
/// 5. On any other error, set ERROR and re-raise.
pub async fn guard<T, F, Fut>(
    repo: &Arc<dyn Repository>,
    lease_id: Uuid,
    from: &[LeaseStatus],
    transition: LeaseStatus,
    op: F,
) -> EngineResult<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = EngineResult<(T, LeaseStatus)>>,
{
    let pre_call = repo.lease_get(lease_id).await?.status;
    repo.lease_cas_status(lease_id, from, transition).await?;

    match op().await {
        Ok((value, result_status)) => {
            repo.lease_update(
                lease_id,
                LeasePatch { status: Some(result_status), ..Default::default() },
            )
            .await?;
            Ok(value)
        }
        Err(err) if err.is_non_fatal() => {
            repo.lease_update(
                lease_id,
                LeasePatch { status: Some(pre_call), ..Default::default() },
            )
            .await?;
            Err(err)
        }
        Err(err) => {
            // Swallow a failure to even write ERROR — the original error
            // is what the caller needs to see.
            let _ = repo
                .lease_update(
                    lease_id,
                    LeasePatch { status: Some(LeaseStatus::Error), ..Default::default() },
                )
                .await;
            Err(err)
        }
    }
}

/// Like [`guard`], but for operations (e.g. delete) with no single
/// success status to write back — `op` itself is responsible for leaving
/// the lease in its final state (or destroying the row) on success.
pub async fn guard_terminal<T, F, Fut>(
    repo: &Arc<dyn Repository>,
    lease_id: Uuid,
    from: &[LeaseStatus],
    transition: LeaseStatus,
    op: F,
) -> EngineResult<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    repo.lease_cas_status(lease_id, from, transition).await?;

    match op().await {
        Ok(value) => Ok(value),
        Err(err) if err.is_non_fatal() => Err(err),
        Err(err) => {
            let _ = repo
                .lease_update(
                    lease_id,
                    LeasePatch { status: Some(LeaseStatus::Error), ..Default::default() },
                )
                .await;
            Err(err)
        }
    }
}

/// Convenience: guard an operation whose only pre-state and whose only
/// non-fatal behavior is "revert to whatever it was", used by `update`.
pub fn is_concurrent_modification(err: &ManagerError) -> bool {
    err.is_invalid_status()
}
