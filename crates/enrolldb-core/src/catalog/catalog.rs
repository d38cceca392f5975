//! The canonical enrollment catalog.

use std::collections::BTreeMap;

use super::entity::{EntityDef, EntityKind, FieldDef, FieldType};
use super::model::Row;
use super::relation::{DeleteBehavior, RelationDef};
use crate::document::Document;
use crate::error::{Error, Result};
use crate::storage::IndexValue;

/// Maximum length of bounded text columns, in bytes.
pub const MAX_TEXT_LEN: usize = 255;

/// Schema registry for the five entity types and their relations.
#[derive(Debug, Clone)]
pub struct Catalog {
    entities: BTreeMap<EntityKind, EntityDef>,
    relations: Vec<RelationDef>,
}

impl Catalog {
    /// Build the standard tenant / person / institution / course / enrollment schema.
    pub fn standard() -> Self {
        let text = FieldType::Text {
            max_len: MAX_TEXT_LEN,
        };
        let long_text = FieldType::Text { max_len: 4096 };

        let tenant = EntityDef::new(EntityKind::Tenant)
            .with_field(FieldDef::new("name", text))
            .with_field(FieldDef::nullable("description", long_text));

        let person = EntityDef::new(EntityKind::Person)
            .with_field(FieldDef::new("name", text))
            .with_field(FieldDef::nullable("birth_date", FieldType::Date))
            .with_field(FieldDef::new("metadata", FieldType::Document));

        let institution = EntityDef::new(EntityKind::Institution)
            .with_field(FieldDef::new(
                "tenant_id",
                FieldType::Reference(EntityKind::Tenant),
            ))
            .with_field(FieldDef::new("name", text))
            .with_field(FieldDef::nullable("location", text))
            .with_field(FieldDef::new("details", FieldType::Document));

        let course = EntityDef::new(EntityKind::Course)
            .with_field(FieldDef::new(
                "tenant_id",
                FieldType::Reference(EntityKind::Tenant),
            ))
            .with_field(FieldDef::new(
                "institution_id",
                FieldType::Reference(EntityKind::Institution),
            ))
            .with_field(FieldDef::new("name", text))
            .with_field(FieldDef::nullable("duration_hours", FieldType::Integer))
            .with_field(FieldDef::new("details", FieldType::Document));

        let enrollment = EntityDef::new(EntityKind::Enrollment)
            .with_field(FieldDef::new(
                "tenant_id",
                FieldType::Reference(EntityKind::Tenant),
            ))
            .with_field(FieldDef::nullable(
                "institution_id",
                FieldType::Reference(EntityKind::Institution),
            ))
            .with_field(FieldDef::new(
                "person_id",
                FieldType::Reference(EntityKind::Person),
            ))
            .with_field(FieldDef::new(
                "course_id",
                FieldType::Reference(EntityKind::Course),
            ))
            .with_field(FieldDef::new("enrollment_date", FieldType::Date))
            .with_field(FieldDef::new("status", FieldType::Status))
            .with_field(FieldDef::new("is_deleted", FieldType::Bool))
            .with_soft_delete();

        let relations = vec![
            RelationDef::cascade(
                "institution_tenant",
                EntityKind::Institution,
                "tenant_id",
                EntityKind::Tenant,
            ),
            RelationDef::cascade(
                "course_tenant",
                EntityKind::Course,
                "tenant_id",
                EntityKind::Tenant,
            ),
            RelationDef::cascade(
                "course_institution",
                EntityKind::Course,
                "institution_id",
                EntityKind::Institution,
            ),
            RelationDef::cascade(
                "enrollment_tenant",
                EntityKind::Enrollment,
                "tenant_id",
                EntityKind::Tenant,
            ),
            RelationDef::cascade(
                "enrollment_institution",
                EntityKind::Enrollment,
                "institution_id",
                EntityKind::Institution,
            )
            .with_on_delete(DeleteBehavior::SetNull),
            RelationDef::cascade(
                "enrollment_person",
                EntityKind::Enrollment,
                "person_id",
                EntityKind::Person,
            ),
            RelationDef::cascade(
                "enrollment_course",
                EntityKind::Enrollment,
                "course_id",
                EntityKind::Course,
            ),
        ];

        let entities = [tenant, person, institution, course, enrollment]
            .into_iter()
            .map(|def| (def.kind, def))
            .collect();

        Self {
            entities,
            relations,
        }
    }

    /// Look up an entity definition.
    pub fn entity(&self, kind: EntityKind) -> &EntityDef {
        // Every kind is registered by `standard`.
        &self.entities[&kind]
    }

    pub fn relations(&self) -> &[RelationDef] {
        &self.relations
    }

    /// Relations whose target is `kind`, i.e. the edges a delete of `kind`
    /// has to follow.
    pub fn relations_to(&self, kind: EntityKind) -> impl Iterator<Item = &RelationDef> {
        self.relations.iter().filter(move |r| r.to_entity == kind)
    }

    /// Validate a row against its entity definition.
    pub fn check_shape(&self, row: &Row) -> Result<()> {
        let def = self.entity(row.kind());

        for field in &def.fields {
            if field.field_type == FieldType::Document {
                match row.document(&field.name) {
                    Some(Document::Object(_)) => {}
                    Some(Document::Null) | None if field.nullable => {}
                    _ => {
                        return Err(shape_error(row, &field.name, "must be a document object"));
                    }
                }
                continue;
            }

            let value = row
                .field(&field.name)
                .ok_or_else(|| shape_error(row, &field.name, "missing column"))?;

            if value == IndexValue::Null {
                if field.nullable {
                    continue;
                }
                return Err(shape_error(row, &field.name, "must not be null"));
            }

            match (field.field_type, &value) {
                (FieldType::Id, IndexValue::Int(id)) | (FieldType::Reference(_), IndexValue::Int(id)) => {
                    if *id <= 0 {
                        return Err(shape_error(row, &field.name, "identifier must be positive"));
                    }
                }
                (FieldType::Text { max_len }, IndexValue::Text(s)) => {
                    if !field.nullable && s.trim().is_empty() {
                        return Err(shape_error(row, &field.name, "must not be blank"));
                    }
                    if s.len() > max_len {
                        return Err(shape_error(
                            row,
                            &field.name,
                            &format!("exceeds {} bytes", max_len),
                        ));
                    }
                }
                (FieldType::Date, IndexValue::Date(_))
                | (FieldType::Integer, IndexValue::Int(_))
                | (FieldType::Bool, IndexValue::Bool(_))
                | (FieldType::Status, IndexValue::Text(_)) => {}
                _ => return Err(shape_error(row, &field.name, "has the wrong type")),
            }
        }

        Ok(())
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::standard()
    }
}

fn shape_error(row: &Row, field: &str, problem: &str) -> Error {
    Error::ConstraintViolation(format!("{}.{} {}", row.kind(), field, problem))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Institution, InstitutionId, Person, PersonId, TenantId};

    fn person(name: &str, metadata: Document) -> Row {
        Row::Person(Person {
            id: PersonId(1),
            name: name.to_string(),
            birth_date: None,
            metadata,
        })
    }

    #[test]
    fn test_standard_relations() {
        let catalog = Catalog::standard();

        let to_institution: Vec<_> = catalog
            .relations_to(EntityKind::Institution)
            .map(|r| (r.from_entity, r.on_delete))
            .collect();
        assert!(to_institution.contains(&(EntityKind::Course, DeleteBehavior::Cascade)));
        assert!(to_institution.contains(&(EntityKind::Enrollment, DeleteBehavior::SetNull)));

        assert_eq!(catalog.relations_to(EntityKind::Tenant).count(), 3);
        assert_eq!(catalog.relations_to(EntityKind::Enrollment).count(), 0);
        assert!(catalog.entity(EntityKind::Enrollment).soft_delete);
    }

    #[test]
    fn test_shape_accepts_valid_row() {
        let catalog = Catalog::standard();
        assert!(catalog.check_shape(&person("Ada", Document::object())).is_ok());
    }

    #[test]
    fn test_shape_rejects_blank_name() {
        let catalog = Catalog::standard();
        let err = catalog
            .check_shape(&person("   ", Document::object()))
            .unwrap_err();
        assert!(matches!(err, Error::ConstraintViolation(msg) if msg.contains("person.name")));
    }

    #[test]
    fn test_shape_rejects_scalar_metadata() {
        let catalog = Catalog::standard();
        let err = catalog
            .check_shape(&person("Ada", Document::String("x".into())))
            .unwrap_err();
        assert!(matches!(err, Error::ConstraintViolation(msg) if msg.contains("metadata")));
    }

    #[test]
    fn test_shape_rejects_long_location() {
        let catalog = Catalog::standard();
        let row = Row::Institution(Institution {
            id: InstitutionId(1),
            tenant_id: TenantId(1),
            name: "North High".into(),
            location: Some("x".repeat(MAX_TEXT_LEN + 1)),
            details: Document::object(),
        });
        assert!(catalog.check_shape(&row).is_err());
    }

    #[test]
    fn test_shape_rejects_zero_reference() {
        let catalog = Catalog::standard();
        let row = Row::Institution(Institution {
            id: InstitutionId(1),
            tenant_id: TenantId(0),
            name: "North High".into(),
            location: None,
            details: Document::object(),
        });
        let err = catalog.check_shape(&row).unwrap_err();
        assert!(matches!(err, Error::ConstraintViolation(msg) if msg.contains("tenant_id")));
    }
}
