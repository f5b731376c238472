use serde::{Deserialize, Serialize};

use unitledger_core::{BoxId, DomainError, DomainResult, Entity, ItemId, ProjectId};

use crate::quantity::Quantity;

/// A logical inventory entry; allocating for it produces `quantity` units.
///
/// Display fields are carried for the export join and are never interpreted here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub project_id: ProjectId,
    pub box_id: BoxId,
    pub name: String,
    pub description: String,
    pub quantity: Quantity,
    pub condition: String,
    pub photo_ref: Option<String>,
}

impl Item {
    pub fn new(
        project_id: ProjectId,
        box_id: BoxId,
        name: impl Into<String>,
        quantity: Quantity,
    ) -> DomainResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DomainError::validation("name cannot be empty"));
        }
        Ok(Self {
            id: ItemId::new(),
            project_id,
            box_id,
            name,
            description: String::new(),
            quantity,
            condition: String::new(),
            photo_ref: None,
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = condition.into();
        self
    }

    pub fn with_photo_ref(mut self, photo_ref: impl Into<String>) -> Self {
        self.photo_ref = Some(photo_ref.into());
        self
    }
}

impl Entity for Item {
    type Id = ItemId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
