//! Relation definitions between entities.

use serde::{Deserialize, Serialize};

use super::entity::EntityKind;

/// Behavior when a referenced entity is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteBehavior {
    /// Delete related entities.
    Cascade,
    /// Set foreign key to null.
    SetNull,
}

/// A foreign-key relation: `from_entity.from_field` points at `to_entity`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationDef {
    /// Relation name (unique within the catalog).
    pub name: String,
    pub from_entity: EntityKind,
    pub from_field: String,
    pub to_entity: EntityKind,
    pub on_delete: DeleteBehavior,
}

impl RelationDef {
    /// Create a relation that cascades deletes.
    pub fn cascade(
        name: impl Into<String>,
        from_entity: EntityKind,
        from_field: impl Into<String>,
        to_entity: EntityKind,
    ) -> Self {
        Self {
            name: name.into(),
            from_entity,
            from_field: from_field.into(),
            to_entity,
            on_delete: DeleteBehavior::Cascade,
        }
    }

    /// Set delete behavior.
    pub fn with_on_delete(mut self, on_delete: DeleteBehavior) -> Self {
        self.on_delete = on_delete;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relation_builder() {
        let rel = RelationDef::cascade(
            "enrollment_institution",
            EntityKind::Enrollment,
            "institution_id",
            EntityKind::Institution,
        )
        .with_on_delete(DeleteBehavior::SetNull);

        assert_eq!(rel.on_delete, DeleteBehavior::SetNull);
        assert_eq!(rel.from_entity, EntityKind::Enrollment);
        assert_eq!(rel.to_entity, EntityKind::Institution);
    }
}
