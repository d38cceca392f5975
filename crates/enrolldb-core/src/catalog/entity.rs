//! Entity definitions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The five canonical entity types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Tenant,
    Person,
    Institution,
    Course,
    Enrollment,
}

impl EntityKind {
    /// All kinds, parents before children.
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Tenant,
        EntityKind::Person,
        EntityKind::Institution,
        EntityKind::Course,
        EntityKind::Enrollment,
    ];

    /// Stable one-byte tag used in storage keys.
    pub fn tag(self) -> u8 {
        match self {
            EntityKind::Tenant => 1,
            EntityKind::Person => 2,
            EntityKind::Institution => 3,
            EntityKind::Course => 4,
            EntityKind::Enrollment => 5,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        EntityKind::ALL.into_iter().find(|k| k.tag() == tag)
    }

    pub fn name(self) -> &'static str {
        match self {
            EntityKind::Tenant => "tenant",
            EntityKind::Person => "person",
            EntityKind::Institution => "institution",
            EntityKind::Course => "course",
            EntityKind::Enrollment => "enrollment",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        EntityKind::ALL.into_iter().find(|k| k.name() == name)
    }

    /// Whether rows of this kind live in tenant partitions rather than the
    /// global tree.
    pub fn is_partitioned(self) -> bool {
        self == EntityKind::Enrollment
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Column types known to the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    /// Engine-assigned identity.
    Id,
    /// Foreign key to another entity.
    Reference(EntityKind),
    /// Bounded UTF-8 text.
    Text { max_len: usize },
    Date,
    Integer,
    Bool,
    /// Enrollment status enum.
    Status,
    /// Semi-structured document bag.
    Document,
}

impl FieldType {
    /// Whether the column can appear in a sorted secondary index.
    pub fn is_indexable(&self) -> bool {
        !matches!(self, FieldType::Document)
    }
}

/// A column definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
}

impl FieldDef {
    /// Create a required field.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: false,
        }
    }

    /// Create a nullable field.
    pub fn nullable(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            nullable: true,
            ..Self::new(name, field_type)
        }
    }
}

/// An entity definition (table schema).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDef {
    pub kind: EntityKind,
    pub fields: Vec<FieldDef>,
    /// Rows are logically deleted through an `is_deleted` flag.
    pub soft_delete: bool,
}

impl EntityDef {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            fields: vec![FieldDef::new("id", FieldType::Id)],
            soft_delete: false,
        }
    }

    pub fn with_field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_soft_delete(mut self) -> Self {
        self.soft_delete = true;
        self
    }

    pub fn get_field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn document_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields
            .iter()
            .filter(|f| f.field_type == FieldType::Document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_roundtrip_and_unique() {
        let mut tags: Vec<u8> = EntityKind::ALL.iter().map(|k| k.tag()).collect();
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::from_tag(kind.tag()), Some(kind));
            assert_eq!(EntityKind::parse(kind.name()), Some(kind));
        }
        tags.dedup();
        assert_eq!(tags.len(), 5);
        assert_eq!(EntityKind::from_tag(0), None);
    }

    #[test]
    fn test_entity_def_builder() {
        let def = EntityDef::new(EntityKind::Person)
            .with_field(FieldDef::new("name", FieldType::Text { max_len: 255 }))
            .with_field(FieldDef::nullable("metadata", FieldType::Document));

        assert!(def.get_field("id").is_some());
        assert!(def.get_field("metadata").unwrap().nullable);
        assert_eq!(def.document_fields().count(), 1);
        assert!(!def.soft_delete);
    }
}
