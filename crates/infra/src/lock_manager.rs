//! Freezing open units for export.
//!
//! A lock run takes a snapshot when its transaction begins and locks every unit
//! that is open in that snapshot. Allocations that commit after the snapshot
//! point are not seen and stay open until the next run. Two lock runs racing
//! on the same rows resolve first-committer-wins; the loser retries against a
//! fresh snapshot, where those rows are already locked.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument};

use unitledger_core::{Entity, ProjectId, UnitId};
use unitledger_units::LegacyCode;

use crate::clock::{Clock, SystemClock};
use crate::config::AllocatorConfig;
use crate::error::UnitError;
use crate::retry::{run_with_retry, RetryError};
use crate::unit_store::{Isolation, UnitStore, UnitTransaction};

/// Result of one lock run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockOutcome {
    pub project_id: ProjectId,
    /// Units moved from open to locked by this run.
    pub locked: u64,
    pub locked_at: DateTime<Utc>,
    pub locked_codes: Vec<LegacyCode>,
}

/// Performs the one-way open → locked transition for a project.
#[derive(Debug, Clone)]
pub struct LockManager<S, C = SystemClock> {
    store: S,
    config: AllocatorConfig,
    clock: C,
}

impl<S: UnitStore> LockManager<S> {
    pub fn new(store: S, config: AllocatorConfig) -> Self {
        Self::with_clock(store, config, SystemClock)
    }
}

impl<S, C> LockManager<S, C>
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

    /// Lock every unit of the project that is open at the snapshot point.
    ///
    /// Calling this again with no allocation in between locks nothing and
    /// succeeds. Units that are already locked keep their original timestamp.
    #[instrument(skip_all, fields(project_id = %project_id), err)]
    pub async fn lock_open_units(&self, project_id: ProjectId) -> Result<LockOutcome, UnitError> {
        let outcome = run_with_retry(
            &self.config.retry,
            self.config.operation_timeout,
            "lock_open_units",
            move |attempt| self.attempt(project_id, attempt),
        )
        .await
        .map_err(|err| match err {
            RetryError::Exhausted {
                attempts,
                last_error,
            } => UnitError::Conflict(format!(
                "lock still contended after {attempts} attempts: {last_error}"
            )),
            RetryError::Failed(err) => err,
        })?;

        info!(locked = outcome.locked, "lock run complete");
        Ok(outcome)
    }

    #[instrument(skip_all, fields(project_id = %project_id, attempt = attempt))]
    async fn attempt(&self, project_id: ProjectId, attempt: u32) -> Result<LockOutcome, UnitError> {
        let mut tx = self.store.begin(project_id, Isolation::Snapshot).await?;

        if !tx.project_exists().await? {
            tx.rollback().await?;
            return Err(UnitError::NotFound(format!("project {project_id}")));
        }

        let locked_at = self.clock.now();
        let open = tx.select_open_units().await?;
        if open.is_empty() {
            tx.rollback().await?;
            debug!("no open units");
            return Ok(LockOutcome {
                project_id,
                locked: 0,
                locked_at,
                locked_codes: Vec::new(),
            });
        }

        let ids: Vec<UnitId> = open.iter().map(|u| *u.id()).collect();
        let locked = tx.mark_locked(&ids, locked_at).await?;
        if locked != ids.len() as u64 {
            // Snapshot reads and the row update disagree; let the retry re-read.
            return Err(UnitError::Conflict(format!(
                "locked {locked} of {} selected units",
                ids.len()
            )));
        }
        tx.commit().await?;

        Ok(LockOutcome {
            project_id,
            locked,
            locked_at,
            locked_codes: open.iter().map(|u| u.legacy_code()).collect(),
        })
    }
}
