//! Postgres-backed Repository, using `sqlx`. Migration style mirrors the
//! teacher's `MetaDb` (a small in-process migration table + ordered SQL
//! blocks) rather than pulling in `sqlx::migrate!`'s file-based macro,
//! since the whole schema fits in one module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leasemgr_common::error::{ManagerError, RepositoryError};
use leasemgr_common::filter::{FieldFilter, Filters, SortDirection};
use leasemgr_common::model::{
    Allocation, Event, EventStatus, EventType, Lease, LeaseStatus, Reservation, ReservationStatus,
};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{EventPatch, LeasePatch, Repository, ReservationPatch};
use crate::error::EngineResult;

const MIGRATION_V1_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS leases (
    id              UUID PRIMARY KEY,
    name            TEXT NOT NULL,
    project_id      TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    trust_id        TEXT NOT NULL,
    start_date      TIMESTAMPTZ NOT NULL,
    end_date        TIMESTAMPTZ NOT NULL,
    status          TEXT NOT NULL,
    degraded        BOOLEAN NOT NULL DEFAULT FALSE,
    UNIQUE (project_id, name)
);

CREATE TABLE IF NOT EXISTS reservations (
    id                  UUID PRIMARY KEY,
    lease_id            UUID NOT NULL REFERENCES leases(id) ON DELETE CASCADE,
    resource_type       TEXT NOT NULL,
    resource_id         TEXT NULL,
    status              TEXT NOT NULL,
    missing_resources   BOOLEAN NOT NULL DEFAULT FALSE,
    resources_changed   BOOLEAN NOT NULL DEFAULT FALSE,
    values              JSONB NOT NULL DEFAULT '{}'::jsonb
);

CREATE TABLE IF NOT EXISTS events (
    id          UUID PRIMARY KEY,
    lease_id    UUID NOT NULL REFERENCES leases(id) ON DELETE CASCADE,
    event_type  TEXT NOT NULL,
    time        TIMESTAMPTZ NOT NULL,
    status      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS events_due_idx ON events (status, time);

CREATE TABLE IF NOT EXISTS allocations (
    reservation_id  UUID NOT NULL REFERENCES reservations(id) ON DELETE CASCADE,
    resource_id     TEXT NOT NULL,
    PRIMARY KEY (reservation_id, resource_id)
);
"#;

const MIGRATIONS: &[(i64, &str)] = &[(1, MIGRATION_V1_SQL)];

pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub async fn connect(url: &str) -> EngineResult<Self> {
        let pool = PgPool::connect(url).await.map_err(backend_err)?;
        let repo = Self { pool };
        repo.migrate().await?;
        Ok(repo)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn migrate(&self) -> EngineResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (\
                version BIGINT PRIMARY KEY, applied_at TIMESTAMPTZ NOT NULL DEFAULT now())",
        )
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;

        let current: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")
                .fetch_one(&self.pool)
                .await
                .map_err(backend_err)?;

        for (version, sql) in MIGRATIONS {
            if *version <= current {
                continue;
            }
            let mut tx = self.pool.begin().await.map_err(backend_err)?;
            sqlx::query(sql).execute(&mut *tx).await.map_err(backend_err)?;
            sqlx::query("INSERT INTO schema_migrations (version) VALUES ($1)")
                .bind(version)
                .execute(&mut *tx)
                .await
                .map_err(backend_err)?;
            tx.commit().await.map_err(backend_err)?;
        }
        Ok(())
    }

    async fn load_reservations(&self, lease_id: Uuid) -> EngineResult<Vec<Reservation>> {
        let rows = sqlx::query(
            "SELECT id, lease_id, resource_type, resource_id, status, missing_resources, \
             resources_changed, values FROM reservations WHERE lease_id = $1",
        )
        .bind(lease_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;
        rows.iter().map(row_to_reservation).collect()
    }

    async fn load_events(&self, lease_id: Uuid) -> EngineResult<Vec<Event>> {
        let rows = sqlx::query("SELECT id, lease_id, event_type, time, status FROM events WHERE lease_id = $1")
            .bind(lease_id)
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;
        rows.iter().map(row_to_event).collect()
    }
}

fn backend_err(err: sqlx::Error) -> ManagerError {
    if matches!(err, sqlx::Error::RowNotFound) {
        ManagerError::Repository(RepositoryError::NotFound(err.to_string()))
    } else {
        ManagerError::Repository(RepositoryError::Backend(err.to_string()))
    }
}

fn lease_status_str(status: LeaseStatus) -> &'static str {
    use LeaseStatus::*;
    match status {
        Creating => "CREATING",
        Pending => "PENDING",
        Starting => "STARTING",
        Active => "ACTIVE",
        Updating => "UPDATING",
        Terminating => "TERMINATING",
        Terminated => "TERMINATED",
        Deleting => "DELETING",
        Error => "ERROR",
    }
}

fn parse_lease_status(s: &str) -> EngineResult<LeaseStatus> {
    use LeaseStatus::*;
    Ok(match s {
        "CREATING" => Creating,
        "PENDING" => Pending,
        "STARTING" => Starting,
        "ACTIVE" => Active,
        "UPDATING" => Updating,
        "TERMINATING" => Terminating,
        "TERMINATED" => Terminated,
        "DELETING" => Deleting,
        "ERROR" => Error,
        other => {
            return Err(ManagerError::Repository(RepositoryError::Backend(format!(
                "unknown lease status `{other}` in storage"
            ))))
        }
    })
}

fn reservation_status_str(status: ReservationStatus) -> &'static str {
    use ReservationStatus::*;
    match status {
        Pending => "PENDING",
        Active => "ACTIVE",
        Deleted => "DELETED",
        Error => "ERROR",
    }
}

fn parse_reservation_status(s: &str) -> EngineResult<ReservationStatus> {
    use ReservationStatus::*;
    Ok(match s {
        "PENDING" => Pending,
        "ACTIVE" => Active,
        "DELETED" => Deleted,
        "ERROR" => Error,
        other => {
            return Err(ManagerError::Repository(RepositoryError::Backend(format!(
                "unknown reservation status `{other}` in storage"
            ))))
        }
    })
}

fn event_status_str(status: EventStatus) -> &'static str {
    use EventStatus::*;
    match status {
        Undone => "UNDONE",
        InProgress => "IN_PROGRESS",
        Done => "DONE",
        Error => "ERROR",
    }
}

fn parse_event_status(s: &str) -> EngineResult<EventStatus> {
    use EventStatus::*;
    Ok(match s {
        "UNDONE" => Undone,
        "IN_PROGRESS" => InProgress,
        "DONE" => Done,
        "ERROR" => Error,
        other => {
            return Err(ManagerError::Repository(RepositoryError::Backend(format!(
                "unknown event status `{other}` in storage"
            ))))
        }
    })
}

fn event_type_str(event_type: EventType) -> &'static str {
    event_type.as_str()
}

fn parse_event_type(s: &str) -> EngineResult<EventType> {
    Ok(match s {
        "start_lease" => EventType::StartLease,
        "end_lease" => EventType::EndLease,
        "before_end_lease" => EventType::BeforeEndLease,
        other => {
            return Err(ManagerError::Repository(RepositoryError::Backend(format!(
                "unknown event type `{other}` in storage"
            ))))
        }
    })
}

fn row_to_reservation(row: &sqlx::postgres::PgRow) -> EngineResult<Reservation> {
    let status: String = row.try_get("status").map_err(backend_err)?;
    let values: serde_json::Value = row.try_get("values").map_err(backend_err)?;
    Ok(Reservation {
        id: row.try_get("id").map_err(backend_err)?,
        lease_id: row.try_get("lease_id").map_err(backend_err)?,
        resource_type: row.try_get("resource_type").map_err(backend_err)?,
        resource_id: row.try_get("resource_id").map_err(backend_err)?,
        status: parse_reservation_status(&status)?,
        missing_resources: row.try_get("missing_resources").map_err(backend_err)?,
        resources_changed: row.try_get("resources_changed").map_err(backend_err)?,
        values: serde_json::from_value(values).unwrap_or_default(),
    })
}

fn row_to_event(row: &sqlx::postgres::PgRow) -> EngineResult<Event> {
    let event_type: String = row.try_get("event_type").map_err(backend_err)?;
    let status: String = row.try_get("status").map_err(backend_err)?;
    Ok(Event {
        id: row.try_get("id").map_err(backend_err)?,
        lease_id: row.try_get("lease_id").map_err(backend_err)?,
        event_type: parse_event_type(&event_type)?,
        time: row.try_get("time").map_err(backend_err)?,
        status: parse_event_status(&status)?,
    })
}

#[async_trait]
impl Repository for PostgresRepository {
    async fn lease_create(&self, lease: Lease) -> EngineResult<Lease> {
        let result = sqlx::query(
            "INSERT INTO leases (id, name, project_id, user_id, trust_id, start_date, end_date, \
             status, degraded) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(lease.id)
        .bind(&lease.name)
        .bind(&lease.project_id)
        .bind(&lease.user_id)
        .bind(&lease.trust_id)
        .bind(lease.start_date)
        .bind(lease.end_date)
        .bind(lease_status_str(lease.status))
        .bind(lease.degraded)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(lease),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(ManagerError::LeaseNameAlreadyExists(lease.name))
            }
            Err(err) => Err(backend_err(err)),
        }
    }

    async fn lease_get(&self, id: Uuid) -> EngineResult<Lease> {
        let row = sqlx::query(
            "SELECT id, name, project_id, user_id, trust_id, start_date, end_date, status, \
             degraded FROM leases WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?
        .ok_or_else(|| ManagerError::Repository(RepositoryError::NotFound(format!("lease {id}"))))?;

        let status: String = row.try_get("status").map_err(backend_err)?;
        Ok(Lease {
            id: row.try_get("id").map_err(backend_err)?,
            name: row.try_get("name").map_err(backend_err)?,
            project_id: row.try_get("project_id").map_err(backend_err)?,
            user_id: row.try_get("user_id").map_err(backend_err)?,
            trust_id: row.try_get("trust_id").map_err(backend_err)?,
            start_date: row.try_get("start_date").map_err(backend_err)?,
            end_date: row.try_get("end_date").map_err(backend_err)?,
            status: parse_lease_status(&status)?,
            degraded: row.try_get("degraded").map_err(backend_err)?,
            reservations: self.load_reservations(id).await?,
            events: self.load_events(id).await?,
        })
    }

    async fn lease_get_by_name(&self, project_id: &str, name: &str) -> EngineResult<Option<Lease>> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM leases WHERE project_id = $1 AND name = $2")
                .bind(project_id)
                .bind(name)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend_err)?;
        match row {
            Some((id,)) => Ok(Some(self.lease_get(id).await?)),
            None => Ok(None),
        }
    }

    async fn lease_list(&self, project_id: &str) -> EngineResult<Vec<Lease>> {
        let ids: Vec<(Uuid,)> = sqlx::query_as("SELECT id FROM leases WHERE project_id = $1")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;
        let mut leases = Vec::with_capacity(ids.len());
        for (id,) in ids {
            leases.push(self.lease_get(id).await?);
        }
        Ok(leases)
    }

    async fn lease_update(&self, id: Uuid, patch: LeasePatch) -> EngineResult<Lease> {
        if let Some(name) = &patch.name {
            sqlx::query("UPDATE leases SET name = $1 WHERE id = $2")
                .bind(name)
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(backend_err)?;
        }
        if let Some(start_date) = patch.start_date {
            sqlx::query("UPDATE leases SET start_date = $1 WHERE id = $2")
                .bind(start_date)
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(backend_err)?;
        }
        if let Some(end_date) = patch.end_date {
            sqlx::query("UPDATE leases SET end_date = $1 WHERE id = $2")
                .bind(end_date)
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(backend_err)?;
        }
        if let Some(status) = patch.status {
            sqlx::query("UPDATE leases SET status = $1 WHERE id = $2")
                .bind(lease_status_str(status))
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(backend_err)?;
        }
        if let Some(degraded) = patch.degraded {
            sqlx::query("UPDATE leases SET degraded = $1 WHERE id = $2")
                .bind(degraded)
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(backend_err)?;
        }
        self.lease_get(id).await
    }

    async fn lease_cas_status(
        &self,
        id: Uuid,
        expected: &[LeaseStatus],
        to: LeaseStatus,
    ) -> EngineResult<Lease> {
        let expected_strs: Vec<&'static str> = expected.iter().copied().map(lease_status_str).collect();
        let rows = sqlx::query(
            "UPDATE leases SET status = $1 WHERE id = $2 AND status = ANY($3)",
        )
        .bind(lease_status_str(to))
        .bind(id)
        .bind(&expected_strs)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;

        if rows.rows_affected() == 0 {
            // Either the lease doesn't exist, or it's not in an expected
            // state — distinguish the two for a clearer error.
            let current = self.lease_get(id).await?;
            return Err(ManagerError::InvalidStatus(format!(
                "lease {id} is {:?}, expected one of {:?}",
                current.status, expected
            )));
        }
        self.lease_get(id).await
    }

    async fn lease_destroy(&self, id: Uuid) -> EngineResult<()> {
        let rows = sqlx::query("DELETE FROM leases WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        if rows.rows_affected() == 0 {
            return Err(ManagerError::Repository(RepositoryError::NotFound(format!("lease {id}"))));
        }
        Ok(())
    }

    async fn reservation_create(&self, reservation: Reservation) -> EngineResult<Reservation> {
        let values = serde_json::to_value(&reservation.values).unwrap_or_default();
        sqlx::query(
            "INSERT INTO reservations (id, lease_id, resource_type, resource_id, status, \
             missing_resources, resources_changed, values) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(reservation.id)
        .bind(reservation.lease_id)
        .bind(&reservation.resource_type)
        .bind(&reservation.resource_id)
        .bind(reservation_status_str(reservation.status))
        .bind(reservation.missing_resources)
        .bind(reservation.resources_changed)
        .bind(values)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(reservation)
    }

    async fn reservation_get(&self, id: Uuid) -> EngineResult<Reservation> {
        let row = sqlx::query(
            "SELECT id, lease_id, resource_type, resource_id, status, missing_resources, \
             resources_changed, values FROM reservations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?
        .ok_or_else(|| {
            ManagerError::Repository(RepositoryError::NotFound(format!("reservation {id}")))
        })?;
        row_to_reservation(&row)
    }

    async fn reservation_update(
        &self,
        id: Uuid,
        patch: ReservationPatch,
    ) -> EngineResult<Reservation> {
        if let Some(resource_id) = patch.resource_id {
            sqlx::query("UPDATE reservations SET resource_id = $1 WHERE id = $2")
                .bind(resource_id)
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(backend_err)?;
        }
        if let Some(status) = patch.status {
            sqlx::query("UPDATE reservations SET status = $1 WHERE id = $2")
                .bind(reservation_status_str(status))
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(backend_err)?;
        }
        if let Some(missing) = patch.missing_resources {
            sqlx::query("UPDATE reservations SET missing_resources = $1 WHERE id = $2")
                .bind(missing)
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(backend_err)?;
        }
        if let Some(changed) = patch.resources_changed {
            sqlx::query("UPDATE reservations SET resources_changed = $1 WHERE id = $2")
                .bind(changed)
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(backend_err)?;
        }
        if let Some(values) = patch.values {
            let values = serde_json::to_value(values).unwrap_or_default();
            sqlx::query("UPDATE reservations SET values = $1 WHERE id = $2")
                .bind(values)
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(backend_err)?;
        }
        self.reservation_get(id).await
    }

    async fn reservation_destroy(&self, id: Uuid) -> EngineResult<()> {
        let rows = sqlx::query("DELETE FROM reservations WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        if rows.rows_affected() == 0 {
            return Err(ManagerError::Repository(RepositoryError::NotFound(format!(
                "reservation {id}"
            ))));
        }
        Ok(())
    }

    async fn event_create(&self, event: Event) -> EngineResult<Event> {
        sqlx::query(
            "INSERT INTO events (id, lease_id, event_type, time, status) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(event.id)
        .bind(event.lease_id)
        .bind(event_type_str(event.event_type))
        .bind(event.time)
        .bind(event_status_str(event.status))
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(event)
    }

    async fn event_get_all_sorted_by_filters(
        &self,
        sort_key: &str,
        sort_dir: SortDirection,
        filters: Filters,
    ) -> EngineResult<Vec<Event>> {
        // The filter language is tiny (equality + one timestamp
        // comparison); build the WHERE clause by hand rather than
        // pulling in a query builder crate.
        let mut clauses = Vec::new();
        let mut status_filter: Option<String> = None;
        let mut lease_filter: Option<Uuid> = None;
        let mut time_border: Option<(String, DateTime<Utc>)> = None;

        for (field, filter) in filters {
            match (field.as_str(), filter) {
                ("status", FieldFilter::Equals(s)) => status_filter = Some(s),
                ("lease_id", FieldFilter::Equals(s)) => {
                    lease_filter = Uuid::parse_str(&s).ok();
                }
                ("time", FieldFilter::Compare { op, border }) => {
                    let sql_op = match op {
                        leasemgr_common::filter::ComparisonOp::Lt => "<",
                        leasemgr_common::filter::ComparisonOp::Le => "<=",
                        leasemgr_common::filter::ComparisonOp::Gt => ">",
                        leasemgr_common::filter::ComparisonOp::Ge => ">=",
                    };
                    time_border = Some((sql_op.to_string(), border));
                }
                _ => {}
            }
        }

        if status_filter.is_some() {
            clauses.push("status = ".to_string() + &format!("${}", clauses.len() + 1));
        }
        // With only two optional predicates and a tiny, well-known filter
        // vocabulary, dispatch on which combination is present rather than
        // building a generic dynamic-parameter binder.
        let order = if sort_key == "time" {
            match sort_dir {
                SortDirection::Asc => "ORDER BY time ASC",
                SortDirection::Desc => "ORDER BY time DESC",
            }
        } else {
            ""
        };

        let rows = match (status_filter, lease_filter, time_border) {
            (Some(status), Some(lease_id), Some((op, border))) => {
                let sql = format!(
                    "SELECT id, lease_id, event_type, time, status FROM events \
                     WHERE status = $1 AND lease_id = $2 AND time {op} $3 {order}"
                );
                sqlx::query(&sql).bind(status).bind(lease_id).bind(border)
            }
            (Some(status), None, Some((op, border))) => {
                let sql = format!(
                    "SELECT id, lease_id, event_type, time, status FROM events \
                     WHERE status = $1 AND time {op} $2 {order}"
                );
                sqlx::query(&sql).bind(status).bind(border)
            }
            (Some(status), Some(lease_id), None) => {
                let sql = format!(
                    "SELECT id, lease_id, event_type, time, status FROM events \
                     WHERE status = $1 AND lease_id = $2 {order}"
                );
                sqlx::query(&sql).bind(status).bind(lease_id)
            }
            (Some(status), None, None) => {
                let sql = format!(
                    "SELECT id, lease_id, event_type, time, status FROM events WHERE status = $1 {order}"
                );
                sqlx::query(&sql).bind(status)
            }
            (None, _, _) => {
                let sql = format!("SELECT id, lease_id, event_type, time, status FROM events {order}");
                sqlx::query(&sql)
            }
        }
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;

        rows.iter().map(row_to_event).collect()
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
        if let Some(time) = patch.time {
            sqlx::query("UPDATE events SET time = $1 WHERE id = $2")
                .bind(time)
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(backend_err)?;
        }
        if let Some(status) = patch.status {
            sqlx::query("UPDATE events SET status = $1 WHERE id = $2")
                .bind(event_status_str(status))
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(backend_err)?;
        }
        let row = sqlx::query("SELECT id, lease_id, event_type, time, status FROM events WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?
            .ok_or_else(|| ManagerError::Repository(RepositoryError::NotFound(format!("event {id}"))))?;
        row_to_event(&row)
    }

    async fn allocation_create(&self, allocation: Allocation) -> EngineResult<Allocation> {
        sqlx::query("INSERT INTO allocations (reservation_id, resource_id) VALUES ($1, $2)")
            .bind(allocation.reservation_id)
            .bind(&allocation.resource_id)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(allocation)
    }

    async fn allocation_list(&self, reservation_id: Uuid) -> EngineResult<Vec<Allocation>> {
        let rows =
            sqlx::query("SELECT reservation_id, resource_id FROM allocations WHERE reservation_id = $1")
                .bind(reservation_id)
                .fetch_all(&self.pool)
                .await
                .map_err(backend_err)?;
        rows.iter()
            .map(|row| {
                Ok(Allocation {
                    reservation_id: row.try_get("reservation_id").map_err(backend_err)?,
                    resource_id: row.try_get("resource_id").map_err(backend_err)?,
                })
            })
            .collect()
    }

    async fn allocation_clear(&self, reservation_id: Uuid) -> EngineResult<()> {
        sqlx::query("DELETE FROM allocations WHERE reservation_id = $1")
            .bind(reservation_id)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }
}
