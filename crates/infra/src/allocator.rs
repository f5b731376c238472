//! Legacy code allocation.
//!
//! Every allocation runs as one store transaction per attempt:
//!
//! ```text
//! allocate(project, item, quantity)
//!   ↓
//! 1. Validate quantity (no store access on bad input)
//!   ↓
//! 2. Begin transaction, check project and item ownership
//!   ↓
//! 3. Read the current max suffix, plan `quantity` consecutive codes after it
//!   ↓
//! 4. Insert every unit, commit
//!   ↓
//! Conflict at any step → drop the transaction, back off, start again at 2
//! ```
//!
//! The next code is always derived from committed rows, never from a counter
//! held in memory, so independent processes can allocate against the same
//! project. The storage unique index decides races; the loser re-plans.

use tracing::{debug, instrument};

use unitledger_core::{ItemId, ProjectId};
use unitledger_units::{plan_codes, Item, Quantity, Unit};

use crate::clock::{Clock, SystemClock};
use crate::config::AllocatorConfig;
use crate::error::UnitError;
use crate::retry::{run_with_retry, RetryError};
use crate::unit_store::{Isolation, UnitStore, UnitTransaction};

/// Assigns strictly increasing, project-unique legacy codes to new units.
#[derive(Debug, Clone)]
pub struct CodeAllocator<S, C = SystemClock> {
    store: S,
    config: AllocatorConfig,
    clock: C,
}

impl<S: UnitStore> CodeAllocator<S> {
    pub fn new(store: S, config: AllocatorConfig) -> Self {
        Self::with_clock(store, config, SystemClock)
    }
}

impl<S, C> CodeAllocator<S, C>
where
    S: UnitStore,
    C: Clock,
{
    pub fn with_clock(store: S, config: AllocatorConfig, clock: C) -> Self {
        Self {
            store,
            config,
            clock,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Allocate `quantity` new open units for `item_id`, numbered consecutively
    /// after the project's current maximum.
    ///
    /// Returns the units ordered by suffix. Either every unit is persisted or
    /// none is. Conflicts with concurrent allocators are retried internally;
    /// when they persist, [`UnitError::AllocationFailed`] is returned.
    #[instrument(skip_all, fields(project_id = %project_id, item_id = %item_id, quantity = quantity), err)]
    pub async fn allocate(
        &self,
        project_id: ProjectId,
        item_id: ItemId,
        quantity: i64,
    ) -> Result<Vec<Unit>, UnitError> {
        let quantity = Quantity::new(quantity)?;

        run_with_retry(
            &self.config.retry,
            self.config.operation_timeout,
            "allocate",
            move |attempt| self.attempt(project_id, item_id, quantity, attempt),
        )
        .await
        .map_err(|err| match err {
            RetryError::Exhausted {
                attempts,
                last_error,
            } => UnitError::AllocationFailed {
                attempts,
                last_error,
            },
            RetryError::Failed(err) => err,
        })
    }

    /// Allocate the units described by an item (its quantity, its project).
    pub async fn allocate_item(&self, item: &Item) -> Result<Vec<Unit>, UnitError> {
        self.allocate(item.project_id, item.id, i64::from(item.quantity))
            .await
    }

    #[instrument(
        skip_all,
        fields(project_id = %project_id, item_id = %item_id, quantity = quantity.get(), attempt = attempt)
    )]
    async fn attempt(
        &self,
        project_id: ProjectId,
        item_id: ItemId,
        quantity: Quantity,
        attempt: u32,
    ) -> Result<Vec<Unit>, UnitError> {
        let mut tx = self.store.begin(project_id, Isolation::ReadCommitted).await?;

        if !tx.project_exists().await? {
            tx.rollback().await?;
            return Err(UnitError::NotFound(format!("project {project_id}")));
        }
        match tx.item_project(item_id).await? {
            Some(owner) if owner == project_id => {}
            Some(owner) => {
                tx.rollback().await?;
                return Err(UnitError::NotFound(format!(
                    "item {item_id} belongs to project {owner}, not {project_id}"
                )));
            }
            None => {
                tx.rollback().await?;
                return Err(UnitError::NotFound(format!("item {item_id}")));
            }
        }

        let max_suffix = tx.max_suffix().await?;
        let created_at = self.clock.now();
        let units: Vec<Unit> = plan_codes(max_suffix, quantity)?
            .into_iter()
            .map(|code| Unit::open(project_id, item_id, code, created_at))
            .collect();

        tx.insert_units(&units).await?;
        tx.commit().await?;

        debug!(
            first = %units[0].legacy_code(),
            last = %units[units.len() - 1].legacy_code(),
            "allocated units"
        );
        Ok(units)
    }
}
