use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use unitledger_core::{ItemId, ProjectId, UnitId};
use unitledger_units::{Item, Unit};

/// Unit store operation error.
///
/// These are **infrastructure errors** (storage, concurrency) as opposed to
/// domain errors (validation, invariants).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// A uniqueness constraint or a concurrent row update rejected the transaction.
    #[error("write conflict: {0}")]
    Conflict(String),

    /// A referenced project or item does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Connection, pool, IO or timeout failure.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Stored data could not be decoded into domain values.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Isolation requested for a store transaction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Isolation {
    /// Each read sees the latest committed data. Used for allocation, where the
    /// uniqueness constraint catches races.
    ReadCommitted,
    /// All reads see one snapshot taken when the transaction begins. Used for
    /// locking: units committed after that point stay open.
    Snapshot,
}

/// One open store transaction, scoped to a single project.
///
/// Writes become visible to other transactions only on [`UnitTransaction::commit`].
/// Dropping the transaction without committing discards every write.
#[async_trait]
pub trait UnitTransaction: Send {
    fn project_id(&self) -> ProjectId;

    async fn project_exists(&mut self) -> Result<bool, StoreError>;

    /// Project owning `item_id`, or `None` if the item does not exist.
    async fn item_project(&mut self, item_id: ItemId) -> Result<Option<ProjectId>, StoreError>;

    /// Highest numeric suffix issued in the project, `0` when there are no units.
    async fn max_suffix(&mut self) -> Result<u64, StoreError>;

    /// Stage new units. Every unit must belong to this transaction's project.
    async fn insert_units(&mut self, units: &[Unit]) -> Result<(), StoreError>;

    /// Units of the project that are open as seen by this transaction, ordered by suffix.
    async fn select_open_units(&mut self) -> Result<Vec<Unit>, StoreError>;

    /// Lock the given units at `at`. Units that are already locked are left
    /// untouched and not counted. Returns the number of units transitioned.
    async fn mark_locked(&mut self, unit_ids: &[UnitId], at: DateTime<Utc>)
        -> Result<u64, StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

/// Persistent, project-scoped unit store.
///
/// Implementations must:
/// - enforce uniqueness of `(project_id, legacy_code)` at the storage layer
/// - apply a transaction's writes atomically (all or nothing)
/// - honour [`Isolation::Snapshot`] for reads
/// - never clear `locked_at` or rewrite `legacy_code` once a unit is locked
#[async_trait]
pub trait UnitStore: Send + Sync {
    type Tx: UnitTransaction;

    async fn begin(&self, project_id: ProjectId, isolation: Isolation)
        -> Result<Self::Tx, StoreError>;

    /// Make a project known to the store. Registering twice is a no-op.
    async fn register_project(&self, project_id: ProjectId) -> Result<(), StoreError>;

    /// Record an item so units can be allocated for it. The project must exist.
    async fn register_item(&self, item: &Item) -> Result<(), StoreError>;

    /// All units of a project (open and locked), ordered by suffix.
    async fn list_units(&self, project_id: ProjectId) -> Result<Vec<Unit>, StoreError>;

    /// Units belonging to one item, ordered by suffix.
    async fn units_for_item(
        &self,
        project_id: ProjectId,
        item_id: ItemId,
    ) -> Result<Vec<Unit>, StoreError>;
}

#[async_trait]
impl<S> UnitStore for Arc<S>
where
    S: UnitStore,
{
    type Tx = S::Tx;

    async fn begin(&self, project_id: ProjectId, isolation: Isolation)
        -> Result<Self::Tx, StoreError> {
        (**self).begin(project_id, isolation).await
    }

    async fn register_project(&self, project_id: ProjectId) -> Result<(), StoreError> {
        (**self).register_project(project_id).await
    }

    async fn register_item(&self, item: &Item) -> Result<(), StoreError> {
        (**self).register_item(item).await
    }

    async fn list_units(&self, project_id: ProjectId) -> Result<Vec<Unit>, StoreError> {
        (**self).list_units(project_id).await
    }

    async fn units_for_item(
        &self,
        project_id: ProjectId,
        item_id: ItemId,
    ) -> Result<Vec<Unit>, StoreError> {
        (**self).units_for_item(project_id, item_id).await
    }
}
