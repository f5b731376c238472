//! Export snapshots: lock, then read back the frozen set.
//!
//! Joining units with item and box display fields, and rendering them, is the
//! export orchestrator's job. This reader only guarantees which units are in.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::instrument;

use unitledger_core::ProjectId;
use unitledger_units::Unit;

use crate::clock::Clock;
use crate::error::UnitError;
use crate::lock_manager::{LockManager, LockOutcome};
use crate::unit_store::UnitStore;

/// Units of a project as seen right after a lock run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportSnapshot {
    pub project_id: ProjectId,
    pub lock: LockOutcome,
    /// Every locked unit, including ones frozen by earlier runs.
    pub locked: Vec<Unit>,
    /// Units allocated after the lock snapshot point.
    pub open: Vec<Unit>,
    pub taken_at: DateTime<Utc>,
}

impl ExportSnapshot {
    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

pub struct ExportReader<S, C> {
    locks: LockManager<S, C>,
}

impl<S, C> ExportReader<S, C>
where
    S: UnitStore,
    C: Clock,
{
    pub fn new(locks: LockManager<S, C>) -> Self {
        Self { locks }
    }

    #[instrument(skip_all, fields(project_id = %project_id), err)]
    pub async fn snapshot(&self, project_id: ProjectId) -> Result<ExportSnapshot, UnitError> {
        let lock = self.locks.lock_open_units(project_id).await?;
        let (locked, open) = self
            .locks
            .store()
            .list_units(project_id)
            .await?
            .into_iter()
            .partition(Unit::is_locked);

        Ok(ExportSnapshot {
            project_id,
            taken_at: lock.locked_at,
            lock,
            locked,
            open,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;
    use unitledger_core::BoxId;
    use unitledger_units::{Item, Quantity};

    use super::*;
    use crate::allocator::CodeAllocator;
    use crate::clock::FixedClock;
    use crate::config::AllocatorConfig;
    use crate::retry::RetryPolicy;
    use crate::unit_store::InMemoryUnitStore;

    #[tokio::test]
    async fn snapshot_partitions_and_serializes() {
        let config = AllocatorConfig {
            retry: RetryPolicy::fixed(3, Duration::ZERO),
            operation_timeout: Duration::from_secs(5),
        };
        let store = InMemoryUnitStore::new();
        let project_id = ProjectId::new();
        store.register_project(project_id).await.unwrap();
        let item = Item::new(project_id, BoxId::new(), "Rug", Quantity::new(2).unwrap()).unwrap();
        store.register_item(&item).await.unwrap();
        CodeAllocator::new(store.clone(), config.clone())
            .allocate_item(&item)
            .await
            .unwrap();

        let now = Utc.with_ymd_and_hms(2024, 8, 2, 10, 30, 0).unwrap();
        let reader = ExportReader::new(LockManager::with_clock(store, config, FixedClock(now)));
        let snapshot = reader.snapshot(project_id).await.unwrap();

        assert_eq!(snapshot.lock.locked, 2);
        assert_eq!(snapshot.locked.len(), 2);
        assert!(snapshot.open.is_empty());
        assert_eq!(snapshot.taken_at, now);

        let json = snapshot.to_json().unwrap();
        assert_eq!(json["locked"][0]["legacy_code"], "LEG0001");
        assert_eq!(json["locked"][0]["state"], "locked");
        assert_eq!(json["lock"]["locked"], 2);
    }
}
