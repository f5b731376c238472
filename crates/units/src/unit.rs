use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use unitledger_core::{Entity, ItemId, ProjectId, UnitId};

use crate::code::LegacyCode;

/// Lifecycle state of a unit.
///
/// Transitions only ever go `Open` → `Locked`; a locked unit stays locked.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum UnitState {
    /// Not yet part of a frozen export snapshot.
    Open,
    /// Frozen by an export at `locked_at`.
    Locked { locked_at: DateTime<Utc> },
}

impl UnitState {
    /// Rebuild the state from its persisted form (nullable `locked_at`).
    pub fn from_locked_at(locked_at: Option<DateTime<Utc>>) -> Self {
        match locked_at {
            Some(locked_at) => Self::Locked { locked_at },
            None => Self::Open,
        }
    }

    pub fn locked_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Open => None,
            Self::Locked { locked_at } => Some(*locked_at),
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked { .. })
    }
}

/// One physical instance of an item, identified by its legacy code.
///
/// The code is fixed at construction; there is no way to change it afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    id: UnitId,
    project_id: ProjectId,
    item_id: ItemId,
    legacy_code: LegacyCode,
    #[serde(flatten)]
    state: UnitState,
    created_at: DateTime<Utc>,
}

impl Unit {
    /// A freshly allocated, open unit.
    pub fn open(
        project_id: ProjectId,
        item_id: ItemId,
        legacy_code: LegacyCode,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: UnitId::new(),
            project_id,
            item_id,
            legacy_code,
            state: UnitState::Open,
            created_at,
        }
    }

    /// Rehydrate a unit from storage.
    pub fn restore(
        id: UnitId,
        project_id: ProjectId,
        item_id: ItemId,
        legacy_code: LegacyCode,
        state: UnitState,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            project_id,
            item_id,
            legacy_code,
            state,
            created_at,
        }
    }

    pub fn project_id(&self) -> ProjectId {
        self.project_id
    }

    pub fn item_id(&self) -> ItemId {
        self.item_id
    }

    pub fn legacy_code(&self) -> LegacyCode {
        self.legacy_code
    }

    pub fn suffix(&self) -> u64 {
        self.legacy_code.suffix()
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_locked(&self) -> bool {
        self.state.is_locked()
    }

    /// Lock the unit at `at`.
    ///
    /// Returns `true` if the unit moved from open to locked. An already-locked
    /// unit keeps its original timestamp and `false` is returned.
    pub fn lock(&mut self, at: DateTime<Utc>) -> bool {
        match self.state {
            UnitState::Open => {
                self.state = UnitState::Locked { locked_at: at };
                true
            }
            UnitState::Locked { .. } => false,
        }
    }
}

impl Entity for Unit {
    type Id = UnitId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
