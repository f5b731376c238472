//! End-to-end tests for the allocation and export pipeline.
//!
//! Tests: Item → CodeAllocator → UnitStore → LockManager → ExportReader
//!
//! Verifies:
//! - Codes stay unique and ordered across items, batches and lock runs
//! - Locked codes survive later allocations untouched
//! - Export snapshots only ever grow the frozen set

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};

    use unitledger_core::{BoxId, ProjectId};
    use unitledger_units::{Item, Quantity, Unit};

    use crate::allocator::CodeAllocator;
    use crate::clock::FixedClock;
    use crate::config::AllocatorConfig;
    use crate::error::UnitError;
    use crate::export::ExportReader;
    use crate::lock_manager::LockManager;
    use crate::retry::RetryPolicy;
    use crate::unit_store::{InMemoryUnitStore, UnitStore};

    fn config() -> AllocatorConfig {
        AllocatorConfig {
            retry: RetryPolicy::fixed(50, Duration::ZERO),
            operation_timeout: Duration::from_secs(5),
        }
    }

    async fn project(store: &InMemoryUnitStore) -> ProjectId {
        let project_id = ProjectId::new();
        store.register_project(project_id).await.unwrap();
        project_id
    }

    async fn item(store: &InMemoryUnitStore, project_id: ProjectId, name: &str, qty: i64) -> Item {
        let item = Item::new(project_id, BoxId::new(), name, Quantity::new(qty).unwrap())
            .unwrap()
            .with_description("from the attic")
            .with_photo_ref(format!("photos/{name}.jpg"));
        store.register_item(&item).await.unwrap();
        item
    }

    fn codes(units: &[Unit]) -> Vec<String> {
        units.iter().map(|u| u.legacy_code().to_string()).collect()
    }

    #[tokio::test]
    async fn allocate_lock_allocate_lock() {
        let store = InMemoryUnitStore::new();
        let project_id = project(&store).await;
        let sofa = item(&store, project_id, "sofa", 3).await;
        let lamp = item(&store, project_id, "lamp", 1).await;
        let clock = Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap();

        let allocator = CodeAllocator::new(store.clone(), config());
        let reader =
            ExportReader::new(LockManager::with_clock(store.clone(), config(), FixedClock(clock)));

        allocator.allocate_item(&sofa).await.unwrap();
        let first = reader.snapshot(project_id).await.unwrap();
        assert_eq!(codes(&first.locked), ["LEG0001", "LEG0002", "LEG0003"]);
        assert!(first.open.is_empty());

        let lamp_units = allocator.allocate_item(&lamp).await.unwrap();
        assert_eq!(codes(&lamp_units), ["LEG0004"]);
        assert!(!lamp_units[0].is_locked());

        let second = reader.snapshot(project_id).await.unwrap();
        assert_eq!(second.lock.locked, 1);
        assert_eq!(
            codes(&second.locked),
            ["LEG0001", "LEG0002", "LEG0003", "LEG0004"]
        );
        for unit in &first.locked {
            assert!(second.locked.contains(unit));
        }

        let sofa_units = store.units_for_item(project_id, sofa.id).await.unwrap();
        assert_eq!(codes(&sofa_units), ["LEG0001", "LEG0002", "LEG0003"]);
    }

    #[tokio::test]
    async fn failed_allocation_does_not_disturb_numbering_or_locks() {
        let store = InMemoryUnitStore::new();
        let project_id = project(&store).await;
        let chair = item(&store, project_id, "chair", 2).await;
        let allocator = CodeAllocator::new(store.clone(), config());
        let locks = LockManager::new(store.clone(), config());

        allocator.allocate_item(&chair).await.unwrap();
        locks.lock_open_units(project_id).await.unwrap();

        store.fail_insert_at(1);
        assert!(matches!(
            allocator.allocate(project_id, chair.id, 4).await,
            Err(UnitError::StoreUnavailable(_))
        ));
        assert_eq!(store.list_units(project_id).await.unwrap().len(), 2);

        let next = allocator.allocate(project_id, chair.id, 1).await.unwrap();
        assert_eq!(codes(&next), ["LEG0003"]);
        assert_eq!(locks.lock_open_units(project_id).await.unwrap().locked, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn many_clients_share_one_project() {
        let store = InMemoryUnitStore::new();
        let project_id = project(&store).await;
        let mut items = Vec::new();
        for n in 0..6 {
            items.push(item(&store, project_id, &format!("box-{n}"), 1 + n % 3).await);
        }
        let expected: usize = items.iter().map(|i| i.quantity.get() as usize).sum();

        // Independent clients: each builds its own allocator over a shared store.
        let mut handles = Vec::new();
        for item in items {
            let store = Arc::new(store.clone());
            handles.push(tokio::spawn(async move {
                let allocator = CodeAllocator::new(store.clone(), config());
                let locks = LockManager::new(store, config());
                let units = allocator.allocate_item(&item).await?;
                locks.lock_open_units(item.project_id).await?;
                Ok::<_, UnitError>(units)
            }));
        }

        let mut batches = Vec::new();
        for handle in handles {
            batches.push(handle.await.unwrap().unwrap());
        }
        for batch in &batches {
            for pair in batch.windows(2) {
                assert_eq!(pair[0].suffix() + 1, pair[1].suffix());
            }
        }

        let all = store.list_units(project_id).await.unwrap();
        assert_eq!(all.len(), expected);
        let suffixes: Vec<u64> = all.iter().map(Unit::suffix).collect();
        assert_eq!(suffixes, (1..=expected as u64).collect::<Vec<_>>());
        // Each client locked after its own allocation committed.
        assert!(all.iter().all(Unit::is_locked));
    }
}
