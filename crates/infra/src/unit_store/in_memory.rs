use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use unitledger_core::{Entity, ItemId, ProjectId, UnitId};
use unitledger_units::{Item, Unit, UnitState};

use super::r#trait::{Isolation, StoreError, UnitStore, UnitTransaction};

/// One committed unit plus the commit sequence numbers snapshots are judged against.
#[derive(Debug, Clone)]
struct UnitRow {
    unit: Unit,
    inserted_seq: u64,
    locked_seq: Option<u64>,
}

impl UnitRow {
    fn visible_at(&self, seq: u64) -> bool {
        self.inserted_seq <= seq
    }

    /// The unit as a reader at `seq` would have seen it.
    fn as_of(&self, seq: u64) -> Unit {
        match self.locked_seq {
            Some(locked) if locked > seq => Unit::restore(
                *self.unit.id(),
                self.unit.project_id(),
                self.unit.item_id(),
                self.unit.legacy_code(),
                UnitState::Open,
                self.unit.created_at(),
            ),
            _ => self.unit.clone(),
        }
    }
}

/// Failures armed by tests; each fires once.
#[derive(Debug, Default)]
struct Faults {
    /// Fail `insert_units` when it reaches this row index of the batch.
    fail_insert_at: Option<usize>,
    /// Reject this many upcoming commits that carry inserts with a conflict.
    conflicts: u32,
    unavailable: bool,
}

#[derive(Debug, Default)]
struct State {
    commit_seq: u64,
    projects: HashSet<ProjectId>,
    items: HashMap<ItemId, ProjectId>,
    units: HashMap<ProjectId, Vec<UnitRow>>,
    faults: Faults,
}

/// In-memory unit store.
///
/// Intended for tests/dev. Behaves like a snapshot-isolated database with a
/// unique index on `(project_id, legacy_code)`: writes are buffered per
/// transaction and validated at commit, so the first committer wins.
#[derive(Debug, Clone, Default)]
pub struct InMemoryUnitStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryUnitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `insert_units` call fail at row `index` of its batch, after
    /// the preceding rows were staged.
    pub fn fail_insert_at(&self, index: usize) {
        if let Ok(mut state) = self.state.write() {
            state.faults.fail_insert_at = Some(index);
        }
    }

    /// Reject the next `count` commits that insert units with a conflict, as if
    /// another writer had taken the same codes first.
    pub fn inject_conflicts(&self, count: u32) {
        if let Ok(mut state) = self.state.write() {
            state.faults.conflicts = count;
        }
    }

    /// Simulate a storage outage: every operation fails until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut state) = self.state.write() {
            state.faults.unavailable = unavailable;
        }
    }

    /// Directly seed committed units, bypassing allocation (fixtures only).
    pub fn seed_units(&self, units: Vec<Unit>) -> Result<(), StoreError> {
        let mut state = write(&self.state)?;
        state.commit_seq += 1;
        let seq = state.commit_seq;
        for unit in units {
            let locked_seq = unit.is_locked().then_some(seq);
            state
                .units
                .entry(unit.project_id())
                .or_default()
                .push(UnitRow {
                    unit,
                    inserted_seq: seq,
                    locked_seq,
                });
        }
        Ok(())
    }
}

fn read(state: &RwLock<State>) -> Result<RwLockReadGuard<'_, State>, StoreError> {
    let guard = state
        .read()
        .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;
    if guard.faults.unavailable {
        return Err(StoreError::Unavailable("store offline".to_string()));
    }
    Ok(guard)
}

fn write(state: &RwLock<State>) -> Result<RwLockWriteGuard<'_, State>, StoreError> {
    let guard = state
        .write()
        .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;
    if guard.faults.unavailable {
        return Err(StoreError::Unavailable("store offline".to_string()));
    }
    Ok(guard)
}

fn sorted(mut units: Vec<Unit>) -> Vec<Unit> {
    units.sort_by_key(Unit::suffix);
    units
}

#[async_trait]
impl UnitStore for InMemoryUnitStore {
    type Tx = InMemoryUnitTransaction;

    async fn begin(
        &self,
        project_id: ProjectId,
        isolation: Isolation,
    ) -> Result<Self::Tx, StoreError> {
        let snapshot_seq = read(&self.state)?.commit_seq;
        Ok(InMemoryUnitTransaction {
            state: self.state.clone(),
            project_id,
            isolation,
            snapshot_seq,
            pending_inserts: Vec::new(),
            pending_locks: Vec::new(),
        })
    }

    async fn register_project(&self, project_id: ProjectId) -> Result<(), StoreError> {
        write(&self.state)?.projects.insert(project_id);
        Ok(())
    }

    async fn register_item(&self, item: &Item) -> Result<(), StoreError> {
        let mut state = write(&self.state)?;
        if !state.projects.contains(&item.project_id) {
            return Err(StoreError::NotFound(format!("project {}", item.project_id)));
        }
        if let Some(owner) = state.items.get(item.id()).copied() {
            if owner != item.project_id {
                return Err(StoreError::Conflict(format!(
                    "item {} already belongs to project {owner}",
                    item.id()
                )));
            }
        }
        state.items.insert(*item.id(), item.project_id);
        Ok(())
    }

    async fn list_units(&self, project_id: ProjectId) -> Result<Vec<Unit>, StoreError> {
        let state = read(&self.state)?;
        let units = state
            .units
            .get(&project_id)
            .map(|rows| rows.iter().map(|r| r.unit.clone()).collect())
            .unwrap_or_default();
        Ok(sorted(units))
    }

    async fn units_for_item(
        &self,
        project_id: ProjectId,
        item_id: ItemId,
    ) -> Result<Vec<Unit>, StoreError> {
        let state = read(&self.state)?;
        let units = state
            .units
            .get(&project_id)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.unit.item_id() == item_id)
                    .map(|r| r.unit.clone())
                    .collect()
            })
            .unwrap_or_default();
        Ok(sorted(units))
    }
}

/// Buffered transaction over [`InMemoryUnitStore`].
#[derive(Debug)]
pub struct InMemoryUnitTransaction {
    state: Arc<RwLock<State>>,
    project_id: ProjectId,
    isolation: Isolation,
    snapshot_seq: u64,
    pending_inserts: Vec<Unit>,
    pending_locks: Vec<(UnitId, DateTime<Utc>)>,
}

impl InMemoryUnitTransaction {
    fn read_seq(&self, state: &State) -> u64 {
        match self.isolation {
            Isolation::Snapshot => self.snapshot_seq,
            Isolation::ReadCommitted => state.commit_seq,
        }
    }

    /// Committed units of this project as this transaction sees them.
    fn visible_units(&self, state: &State) -> Vec<Unit> {
        let seq = self.read_seq(state);
        state
            .units
            .get(&self.project_id)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.visible_at(seq))
                    .map(|r| r.as_of(seq))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn is_pending_lock(&self, id: &UnitId) -> bool {
        self.pending_locks.iter().any(|(pending, _)| pending == id)
    }
}

#[async_trait]
impl UnitTransaction for InMemoryUnitTransaction {
    fn project_id(&self) -> ProjectId {
        self.project_id
    }

    async fn project_exists(&mut self) -> Result<bool, StoreError> {
        Ok(read(&self.state)?.projects.contains(&self.project_id))
    }

    async fn item_project(&mut self, item_id: ItemId) -> Result<Option<ProjectId>, StoreError> {
        Ok(read(&self.state)?.items.get(&item_id).copied())
    }

    async fn max_suffix(&mut self) -> Result<u64, StoreError> {
        let state = read(&self.state)?;
        let committed = self
            .visible_units(&state)
            .iter()
            .map(Unit::suffix)
            .max()
            .unwrap_or(0);
        let pending = self.pending_inserts.iter().map(Unit::suffix).max().unwrap_or(0);
        Ok(committed.max(pending))
    }

    async fn insert_units(&mut self, units: &[Unit]) -> Result<(), StoreError> {
        let fail_at = write(&self.state)?.faults.fail_insert_at.take();

        for (idx, unit) in units.iter().enumerate() {
            if fail_at == Some(idx) {
                return Err(StoreError::Unavailable(format!(
                    "injected failure while inserting row {idx}"
                )));
            }
            if unit.project_id() != self.project_id {
                return Err(StoreError::Conflict(format!(
                    "unit {} targets project {}, transaction is scoped to {}",
                    unit.legacy_code(),
                    unit.project_id(),
                    self.project_id
                )));
            }
            self.pending_inserts.push(unit.clone());
        }
        Ok(())
    }

    async fn select_open_units(&mut self) -> Result<Vec<Unit>, StoreError> {
        let state = read(&self.state)?;
        let mut open: Vec<Unit> = self
            .visible_units(&state)
            .into_iter()
            .chain(self.pending_inserts.iter().cloned())
            .filter(|u| !u.is_locked() && !self.is_pending_lock(u.id()))
            .collect();
        open.sort_by_key(Unit::suffix);
        Ok(open)
    }

    async fn mark_locked(
        &mut self,
        unit_ids: &[UnitId],
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let open: HashSet<UnitId> = self
            .select_open_units()
            .await?
            .iter()
            .map(|u| *u.id())
            .collect();

        let mut transitioned = 0;
        for id in unit_ids {
            if open.contains(id) && !self.is_pending_lock(id) {
                self.pending_locks.push((*id, at));
                transitioned += 1;
            }
        }
        Ok(transitioned)
    }

    async fn commit(self) -> Result<(), StoreError> {
        let mut state = write(&self.state)?;

        if !self.pending_inserts.is_empty() {
            if !state.projects.contains(&self.project_id) {
                return Err(StoreError::NotFound(format!("project {}", self.project_id)));
            }
            if state.faults.conflicts > 0 {
                state.faults.conflicts -= 1;
                return Err(StoreError::Conflict("injected write conflict".to_string()));
            }
        }

        // Unique index on (project_id, legacy_code), checked against everything
        // committed so far regardless of this transaction's snapshot.
        let rows = state.units.get(&self.project_id).map(Vec::as_slice).unwrap_or(&[]);
        let mut taken: HashSet<u64> = rows.iter().map(|r| r.unit.suffix()).collect();
        for unit in &self.pending_inserts {
            if !taken.insert(unit.suffix()) {
                return Err(StoreError::Conflict(format!(
                    "duplicate legacy_code {} in project {}",
                    unit.legacy_code(),
                    self.project_id
                )));
            }
            if !state.items.contains_key(&unit.item_id()) {
                return Err(StoreError::NotFound(format!("item {}", unit.item_id())));
            }
        }

        // Row-level first-committer-wins for lock updates.
        for (id, _) in &self.pending_locks {
            match rows.iter().find(|r| r.unit.id() == id) {
                Some(row) if row.locked_seq.is_some() => {
                    return Err(StoreError::Conflict(format!(
                        "unit {} was locked by a concurrent transaction",
                        row.unit.legacy_code()
                    )));
                }
                Some(_) => {}
                None if self.pending_inserts.iter().any(|u| u.id() == id) => {}
                None => return Err(StoreError::NotFound(format!("unit {id}"))),
            }
        }

        state.commit_seq += 1;
        let seq = state.commit_seq;
        let rows = state.units.entry(self.project_id).or_default();

        for unit in self.pending_inserts {
            rows.push(UnitRow {
                unit,
                inserted_seq: seq,
                locked_seq: None,
            });
        }
        for (id, at) in self.pending_locks {
            if let Some(row) = rows.iter_mut().find(|r| *r.unit.id() == id) {
                if row.unit.lock(at) {
                    row.locked_seq = Some(seq);
                }
            }
        }

        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unitledger_core::BoxId;
    use unitledger_units::{LegacyCode, Quantity};

    async fn setup() -> (InMemoryUnitStore, ProjectId, ItemId) {
        let store = InMemoryUnitStore::new();
        let project_id = ProjectId::new();
        store.register_project(project_id).await.unwrap();
        let item = Item::new(project_id, BoxId::new(), "Lamp", Quantity::new(1).unwrap()).unwrap();
        store.register_item(&item).await.unwrap();
        (store, project_id, *item.id())
    }

    fn unit(project_id: ProjectId, item_id: ItemId, suffix: u64) -> Unit {
        Unit::open(project_id, item_id, LegacyCode::new(suffix).unwrap(), Utc::now())
    }

    #[tokio::test]
    async fn uncommitted_writes_are_invisible() {
        let (store, project_id, item_id) = setup().await;

        let mut tx = store.begin(project_id, Isolation::ReadCommitted).await.unwrap();
        tx.insert_units(&[unit(project_id, item_id, 1)]).await.unwrap();
        assert_eq!(tx.max_suffix().await.unwrap(), 1);
        assert!(store.list_units(project_id).await.unwrap().is_empty());

        drop(tx);
        assert!(store.list_units(project_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unique_code_is_enforced_at_commit() {
        let (store, project_id, item_id) = setup().await;

        let mut a = store.begin(project_id, Isolation::ReadCommitted).await.unwrap();
        let mut b = store.begin(project_id, Isolation::ReadCommitted).await.unwrap();
        assert_eq!(a.max_suffix().await.unwrap(), 0);
        assert_eq!(b.max_suffix().await.unwrap(), 0);

        a.insert_units(&[unit(project_id, item_id, 1)]).await.unwrap();
        b.insert_units(&[unit(project_id, item_id, 1)]).await.unwrap();

        a.commit().await.unwrap();
        assert!(matches!(b.commit().await, Err(StoreError::Conflict(_))));
        assert_eq!(store.list_units(project_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn snapshot_hides_later_commits() {
        let (store, project_id, item_id) = setup().await;
        store.seed_units(vec![unit(project_id, item_id, 1)]).unwrap();

        let mut lock_tx = store.begin(project_id, Isolation::Snapshot).await.unwrap();

        let mut alloc = store.begin(project_id, Isolation::ReadCommitted).await.unwrap();
        alloc.insert_units(&[unit(project_id, item_id, 2)]).await.unwrap();
        alloc.commit().await.unwrap();

        let open = lock_tx.select_open_units().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].suffix(), 1);
        assert_eq!(lock_tx.max_suffix().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_lock_of_same_rows_conflicts() {
        let (store, project_id, item_id) = setup().await;
        store.seed_units(vec![unit(project_id, item_id, 1)]).unwrap();

        let mut first = store.begin(project_id, Isolation::Snapshot).await.unwrap();
        let mut second = store.begin(project_id, Isolation::Snapshot).await.unwrap();

        let ids: Vec<UnitId> = first.select_open_units().await.unwrap().iter().map(|u| *u.id()).collect();
        assert_eq!(first.mark_locked(&ids, Utc::now()).await.unwrap(), 1);
        assert_eq!(second.mark_locked(&ids, Utc::now()).await.unwrap(), 1);

        first.commit().await.unwrap();
        assert!(matches!(second.commit().await, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn mark_locked_skips_locked_and_unknown_units() {
        let (store, project_id, item_id) = setup().await;
        let mut locked = unit(project_id, item_id, 1);
        locked.lock(Utc::now());
        let open = unit(project_id, item_id, 2);
        let open_id = *open.id();
        store.seed_units(vec![locked.clone(), open]).unwrap();

        let mut tx = store.begin(project_id, Isolation::Snapshot).await.unwrap();
        let count = tx
            .mark_locked(&[*locked.id(), open_id, UnitId::new(), open_id], Utc::now())
            .await
            .unwrap();
        assert_eq!(count, 1);
        tx.commit().await.unwrap();

        let units = store.list_units(project_id).await.unwrap();
        assert!(units.iter().all(Unit::is_locked));
        assert_eq!(units[0].state(), locked.state());
    }

    #[tokio::test]
    async fn outage_fails_every_operation() {
        let (store, project_id, _) = setup().await;
        store.set_unavailable(true);
        assert!(matches!(
            store.begin(project_id, Isolation::ReadCommitted).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(matches!(store.list_units(project_id).await, Err(StoreError::Unavailable(_))));

        store.set_unavailable(false);
        assert!(store.list_units(project_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn items_must_belong_to_a_registered_project() {
        let store = InMemoryUnitStore::new();
        let item = Item::new(ProjectId::new(), BoxId::new(), "Desk", Quantity::new(1).unwrap()).unwrap();
        assert!(matches!(store.register_item(&item).await, Err(StoreError::NotFound(_))));
    }
}
