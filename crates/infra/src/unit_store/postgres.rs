//! Postgres-backed unit store implementation.
//!
//! Uniqueness and lock immutability are enforced by the schema in
//! `migrations/0001_units.sql`, not by application checks.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `Conflict` | Another allocator committed the same code first |
//! | Database (serialization failure) | `40001` | `Conflict` | Concurrent lock transaction updated the same rows |
//! | Database (deadlock detected) | `40P01` | `Conflict` | Competing transactions aborted by the server |
//! | Database (foreign key violation) | `23503` | `NotFound` | Project or item vanished before insert |
//! | Database (check violation) | `23514` | `Corrupt` | Attempt to alter a locked unit or invalid suffix |
//! | Database (other) | Any other | `Unavailable` | Other server-side failures |
//! | PoolClosed / PoolTimedOut / Io / Tls | N/A | `Unavailable` | Transport failures |
//! | Decode / ColumnNotFound | N/A | `Corrupt` | Row does not match the schema |
//!
//! ## Thread Safety
//!
//! `PostgresUnitStore` is `Send + Sync` and can be shared across tasks; every
//! transaction checks out its own pooled connection.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

use unitledger_core::{Entity, ItemId, ProjectId, UnitId};
use unitledger_units::{Item, LegacyCode, Unit, UnitState};

use super::r#trait::{Isolation, StoreError, UnitStore, UnitTransaction};
use crate::config::StoreConfig;

/// Schema applied by [`PostgresUnitStore::migrate`].
pub const SCHEMA: &str = include_str!("../../migrations/0001_units.sql");

/// Postgres-backed unit store.
///
/// ## Allocation
///
/// Allocation transactions run at `READ COMMITTED`: `MAX(code_seq)` is read and the
/// new rows inserted in the same transaction. If a concurrent allocator commits the
/// same code first, the `units_project_code_key` constraint fails the insert with
/// `23505` and the caller retries with a fresh maximum.
///
/// ## Locking
///
/// Lock transactions run at `REPEATABLE READ`, so the set of open units is fixed
/// when the transaction's snapshot is taken. Units committed later stay open.
#[derive(Debug, Clone)]
pub struct PostgresUnitStore {
    pool: Arc<PgPool>,
}

impl PostgresUnitStore {
    /// Create a new PostgresUnitStore with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect using `DATABASE_URL` and pool settings from the config.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let url = config
            .require_database_url()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.operation_timeout)
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Apply the schema. Idempotent.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl UnitStore for PostgresUnitStore {
    type Tx = PostgresUnitTransaction;

    #[instrument(skip(self), fields(project_id = %project_id), err)]
    async fn begin(
        &self,
        project_id: ProjectId,
        isolation: Isolation,
    ) -> Result<Self::Tx, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let level = match isolation {
            Isolation::ReadCommitted => "SET TRANSACTION ISOLATION LEVEL READ COMMITTED",
            Isolation::Snapshot => "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ",
        };
        sqlx::query(level)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_isolation", e))?;

        Ok(PostgresUnitTransaction { tx, project_id })
    }

    #[instrument(skip(self), fields(project_id = %project_id), err)]
    async fn register_project(&self, project_id: ProjectId) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO projects (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
            .bind(project_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("register_project", e))?;
        Ok(())
    }

    #[instrument(skip(self, item), fields(item_id = %item.id(), project_id = %item.project_id), err)]
    async fn register_item(&self, item: &Item) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO items (
                id, project_id, box_id, name, description, quantity, condition, photo_ref
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                box_id = EXCLUDED.box_id,
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                quantity = EXCLUDED.quantity,
                condition = EXCLUDED.condition,
                photo_ref = EXCLUDED.photo_ref
            WHERE items.project_id = EXCLUDED.project_id
            "#,
        )
        .bind(item.id().as_uuid())
        .bind(item.project_id.as_uuid())
        .bind(item.box_id.as_uuid())
        .bind(&item.name)
        .bind(&item.description)
        .bind(i64::from(item.quantity))
        .bind(&item.condition)
        .bind(item.photo_ref.as_deref())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("register_item", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "item {} already belongs to another project",
                item.id()
            )));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(project_id = %project_id), err)]
    async fn list_units(&self, project_id: ProjectId) -> Result<Vec<Unit>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, project_id, item_id, legacy_code, code_seq, locked_at, created_at
            FROM units
            WHERE project_id = $1
            ORDER BY code_seq ASC
            "#,
        )
        .bind(project_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_units", e))?;

        decode_units(&rows)
    }

    #[instrument(skip(self), fields(project_id = %project_id, item_id = %item_id), err)]
    async fn units_for_item(
        &self,
        project_id: ProjectId,
        item_id: ItemId,
    ) -> Result<Vec<Unit>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, project_id, item_id, legacy_code, code_seq, locked_at, created_at
            FROM units
            WHERE project_id = $1 AND item_id = $2
            ORDER BY code_seq ASC
            "#,
        )
        .bind(project_id.as_uuid())
        .bind(item_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("units_for_item", e))?;

        decode_units(&rows)
    }
}

/// A Postgres transaction scoped to one project. Rolled back on drop unless committed.
pub struct PostgresUnitTransaction {
    tx: Transaction<'static, Postgres>,
    project_id: ProjectId,
}

#[async_trait]
impl UnitTransaction for PostgresUnitTransaction {
    fn project_id(&self) -> ProjectId {
        self.project_id
    }

    async fn project_exists(&mut self) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 AS present FROM projects WHERE id = $1")
            .bind(self.project_id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("project_exists", e))?;
        Ok(row.is_some())
    }

    async fn item_project(&mut self, item_id: ItemId) -> Result<Option<ProjectId>, StoreError> {
        let row = sqlx::query("SELECT project_id FROM items WHERE id = $1")
            .bind(item_id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("item_project", e))?;

        row.map(|r| {
            r.try_get::<Uuid, _>("project_id")
                .map(ProjectId::from_uuid)
                .map_err(|e| StoreError::Corrupt(format!("failed to read project_id: {e}")))
        })
        .transpose()
    }

    async fn max_suffix(&mut self) -> Result<u64, StoreError> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(code_seq), 0) AS max_seq FROM units WHERE project_id = $1",
        )
        .bind(self.project_id.as_uuid())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("max_suffix", e))?;

        let max: i64 = row
            .try_get("max_seq")
            .map_err(|e| StoreError::Corrupt(format!("failed to read max_seq: {e}")))?;
        u64::try_from(max).map_err(|_| StoreError::Corrupt(format!("negative code_seq {max}")))
    }

    #[instrument(skip(self, units), fields(count = units.len()), err)]
    async fn insert_units(&mut self, units: &[Unit]) -> Result<(), StoreError> {
        for unit in units {
            if unit.project_id() != self.project_id {
                return Err(StoreError::Conflict(format!(
                    "unit {} targets project {}, transaction is scoped to {}",
                    unit.legacy_code(),
                    unit.project_id(),
                    self.project_id
                )));
            }

            let code_seq = i64::try_from(unit.suffix()).map_err(|_| {
                StoreError::Corrupt(format!("suffix {} does not fit code_seq", unit.suffix()))
            })?;

            sqlx::query(
                r#"
                INSERT INTO units (
                    id, project_id, item_id, legacy_code, code_seq, locked_at, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(unit.id().as_uuid())
            .bind(unit.project_id().as_uuid())
            .bind(unit.item_id().as_uuid())
            .bind(unit.legacy_code().to_string())
            .bind(code_seq)
            .bind(unit.state().locked_at())
            .bind(unit.created_at())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::Conflict(format!(
                        "concurrent allocation detected: {} already exists",
                        unit.legacy_code()
                    ))
                } else {
                    map_sqlx_error("insert_unit", e)
                }
            })?;
        }
        Ok(())
    }

    async fn select_open_units(&mut self) -> Result<Vec<Unit>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, project_id, item_id, legacy_code, code_seq, locked_at, created_at
            FROM units
            WHERE project_id = $1 AND locked_at IS NULL
            ORDER BY code_seq ASC
            "#,
        )
        .bind(self.project_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("select_open_units", e))?;

        decode_units(&rows)
    }

    #[instrument(skip(self, unit_ids), fields(requested = unit_ids.len()), err)]
    async fn mark_locked(
        &mut self,
        unit_ids: &[UnitId],
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        if unit_ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<Uuid> = unit_ids.iter().map(|id| *id.as_uuid()).collect();

        let result = sqlx::query(
            r#"
            UPDATE units
            SET locked_at = $3
            WHERE project_id = $1 AND id = ANY($2) AND locked_at IS NULL
            "#,
        )
        .bind(self.project_id.as_uuid())
        .bind(&ids)
        .bind(at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("mark_locked", e))?;

        Ok(result.rows_affected())
    }

    async fn commit(self) -> Result<(), StoreError> {
        let project_id = self.project_id;
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        debug!(%project_id, "unit transaction committed");
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

fn decode_units(rows: &[PgRow]) -> Result<Vec<Unit>, StoreError> {
    rows.iter()
        .map(|row| {
            UnitRecord::from_row(row)
                .map_err(|e| StoreError::Corrupt(format!("failed to deserialize unit row: {e}")))
                .and_then(Unit::try_from)
        })
        .collect()
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("40001") | Some("40P01") => StoreError::Conflict(msg),
                Some("23503") => StoreError::NotFound(msg),
                Some("23514") => StoreError::Corrupt(msg),
                _ => StoreError::Unavailable(msg),
            }
        }
        sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::TypeNotFound { .. } => {
            StoreError::Corrupt(format!("decode error in {operation}: {err}"))
        }
        _ => StoreError::Unavailable(format!("sqlx error in {operation}: {err}")),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct UnitRecord {
    id: Uuid,
    project_id: Uuid,
    item_id: Uuid,
    legacy_code: String,
    code_seq: i64,
    locked_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for UnitRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(UnitRecord {
            id: row.try_get("id")?,
            project_id: row.try_get("project_id")?,
            item_id: row.try_get("item_id")?,
            legacy_code: row.try_get("legacy_code")?,
            code_seq: row.try_get("code_seq")?,
            locked_at: row.try_get("locked_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<UnitRecord> for Unit {
    type Error = StoreError;

    fn try_from(row: UnitRecord) -> Result<Self, Self::Error> {
        let suffix = u64::try_from(row.code_seq)
            .map_err(|_| StoreError::Corrupt(format!("negative code_seq {}", row.code_seq)))?;
        let code = LegacyCode::new(suffix).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        if code.to_string() != row.legacy_code {
            return Err(StoreError::Corrupt(format!(
                "legacy_code {} disagrees with code_seq {}",
                row.legacy_code, row.code_seq
            )));
        }

        Ok(Unit::restore(
            UnitId::from_uuid(row.id),
            ProjectId::from_uuid(row.project_id),
            ItemId::from_uuid(row.item_id),
            code,
            UnitState::from_locked_at(row.locked_at),
            row.created_at,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(code_seq: i64, legacy_code: &str) -> UnitRecord {
        UnitRecord {
            id: Uuid::now_v7(),
            project_id: Uuid::now_v7(),
            item_id: Uuid::now_v7(),
            legacy_code: legacy_code.to_string(),
            code_seq,
            locked_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn rows_decode_into_units() {
        let mut row = record(10_000, "LEG10000");
        let at = Utc::now();
        row.locked_at = Some(at);

        let unit = Unit::try_from(row).unwrap();
        assert_eq!(unit.suffix(), 10_000);
        assert_eq!(unit.state(), UnitState::Locked { locked_at: at });
    }

    #[test]
    fn inconsistent_rows_are_corrupt() {
        assert!(matches!(
            Unit::try_from(record(7, "LEG0008")),
            Err(StoreError::Corrupt(_))
        ));
        assert!(matches!(
            Unit::try_from(record(-1, "LEG-001")),
            Err(StoreError::Corrupt(_))
        ));
        assert!(matches!(
            Unit::try_from(record(0, "LEG0000")),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn transport_errors_are_unavailable() {
        assert!(matches!(
            map_sqlx_error("commit", sqlx::Error::PoolClosed),
            StoreError::Unavailable(_)
        ));
        assert!(matches!(
            map_sqlx_error("commit", sqlx::Error::PoolTimedOut),
            StoreError::Unavailable(_)
        ));
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn schema_declares_the_uniqueness_constraint() {
        assert!(SCHEMA.contains("UNIQUE (project_id, legacy_code)"));
        assert!(SCHEMA.contains("units_guard_locked"));
    }
}
