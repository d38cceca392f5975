//! Index definitions.

use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, EntityKind, FieldType, Row};
use crate::error::{Conflict, Error, Result};
use crate::storage::IndexValue;

/// Which uniqueness rule a database enforces for enrollments.
///
/// Exactly one policy is active per database; it is chosen at open time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UniquenessPolicy {
    /// At most one non-deleted enrollment per (tenant, person, institution).
    #[default]
    ActiveTriple,
    /// At most one enrollment per (tenant, institution, course, person),
    /// soft-deleted or not.
    AbsoluteCourse,
}

/// Row filter for partial indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowPredicate {
    /// Only rows that are not soft-deleted.
    NotDeleted,
}

impl RowPredicate {
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            RowPredicate::NotDeleted => row.field("is_deleted") != Some(IndexValue::Bool(true)),
        }
    }
}

/// Error reported when a unique index rejects a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Violation {
    Generic,
    ActiveEnrollment,
    CourseEnrollment,
}

/// Index structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    /// Ordered composite index; serves equality prefixes and a trailing range.
    Sorted,
    /// Equality-only unique index. Rows with a null column do not take part.
    Unique {
        partial: Option<RowPredicate>,
        violation: Violation,
    },
    /// Path and token index over one document column.
    Inverted,
}

/// Tree an index lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    Global,
    Partition,
}

/// A secondary index definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub entity: EntityKind,
    pub columns: Vec<String>,
    pub kind: IndexKind,
    pub placement: Placement,
    #[serde(default)]
    pub builtin: bool,
}

impl IndexDef {
    fn new(name: &str, entity: EntityKind, columns: &[&str], kind: IndexKind) -> Self {
        let placement = if entity.is_partitioned() {
            Placement::Partition
        } else {
            Placement::Global
        };
        Self {
            name: name.to_string(),
            entity,
            columns: columns.iter().map(|c| c.to_string()).collect(),
            kind,
            placement,
            builtin: false,
        }
    }

    /// Ordered composite index.
    pub fn sorted(name: &str, entity: EntityKind, columns: &[&str]) -> Self {
        Self::new(name, entity, columns, IndexKind::Sorted)
    }

    /// Unique index.
    pub fn unique(name: &str, entity: EntityKind, columns: &[&str]) -> Self {
        Self::new(
            name,
            entity,
            columns,
            IndexKind::Unique {
                partial: None,
                violation: Violation::Generic,
            },
        )
    }

    /// Inverted index over one document column.
    pub fn inverted(name: &str, entity: EntityKind, column: &str) -> Self {
        Self::new(name, entity, &[column], IndexKind::Inverted)
    }

    /// Restrict a unique index to rows matching `predicate`.
    pub fn with_partial(mut self, predicate: RowPredicate) -> Self {
        if let IndexKind::Unique { partial, .. } = &mut self.kind {
            *partial = Some(predicate);
        }
        self
    }

    pub fn with_violation(mut self, kind: Violation) -> Self {
        if let IndexKind::Unique { violation, .. } = &mut self.kind {
            *violation = kind;
        }
        self
    }

    pub fn with_placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }

    fn builtin(mut self) -> Self {
        self.builtin = true;
        self
    }

    /// The built-in index set for a uniqueness policy.
    pub fn standard(policy: UniquenessPolicy) -> Vec<IndexDef> {
        use EntityKind::*;

        let mut defs = vec![
            IndexDef::unique("tenant_name", Tenant, &["name"]),
            IndexDef::sorted("person_name", Person, &["name"]),
            IndexDef::sorted("person_birth_date", Person, &["birth_date"]),
            IndexDef::inverted("person_metadata", Person, "metadata"),
            IndexDef::sorted("institution_tenant", Institution, &["tenant_id"]),
            IndexDef::sorted(
                "institution_tenant_name",
                Institution,
                &["tenant_id", "name"],
            ),
            IndexDef::inverted("institution_details", Institution, "details"),
            IndexDef::sorted("course_tenant", Course, &["tenant_id"]),
            IndexDef::sorted(
                "course_tenant_institution",
                Course,
                &["tenant_id", "institution_id"],
            ),
            IndexDef::inverted("course_details", Course, "details"),
            IndexDef::sorted("enrollment_tenant", Enrollment, &["tenant_id"]),
            IndexDef::sorted("enrollment_status", Enrollment, &["tenant_id", "status"]),
            IndexDef::sorted(
                "enrollment_tenant_institution",
                Enrollment,
                &["tenant_id", "institution_id"],
            ),
            IndexDef::sorted(
                "enrollment_tenant_person",
                Enrollment,
                &["tenant_id", "person_id"],
            ),
            IndexDef::sorted(
                "enrollment_tenant_course",
                Enrollment,
                &["tenant_id", "course_id"],
            ),
            IndexDef::sorted(
                "enrollment_tenant_institution_course",
                Enrollment,
                &["tenant_id", "institution_id", "course_id"],
            ),
            IndexDef::sorted(
                "enrollment_person_global",
                Enrollment,
                &["person_id", "tenant_id"],
            )
            .with_placement(Placement::Global),
        ];

        defs.push(match policy {
            UniquenessPolicy::ActiveTriple => IndexDef::unique(
                "enrollment_active_unique",
                Enrollment,
                &["tenant_id", "person_id", "institution_id"],
            )
            .with_partial(RowPredicate::NotDeleted)
            .with_violation(Violation::ActiveEnrollment),
            UniquenessPolicy::AbsoluteCourse => IndexDef::unique(
                "enrollment_course_unique",
                Enrollment,
                &["tenant_id", "institution_id", "course_id", "person_id"],
            )
            .with_violation(Violation::CourseEnrollment),
        });

        defs.into_iter().map(IndexDef::builtin).collect()
    }

    pub fn is_unique(&self) -> bool {
        matches!(self.kind, IndexKind::Unique { .. })
    }

    /// Whether the first column is the tenant scope.
    pub fn leads_with_tenant(&self) -> bool {
        self.columns.first().is_some_and(|c| c == "tenant_id")
    }

    /// Whether `row` has entries in this index at all.
    pub fn covers(&self, row: &Row) -> bool {
        if row.kind() != self.entity {
            return false;
        }
        match &self.kind {
            IndexKind::Unique {
                partial: Some(predicate),
                ..
            } => predicate.matches(row),
            _ => true,
        }
    }

    /// Column values of a row, in index order.
    pub fn values(&self, row: &Row) -> Vec<IndexValue> {
        self.columns
            .iter()
            .map(|c| row.field(c).unwrap_or(IndexValue::Null))
            .collect()
    }

    /// Check a custom definition against the catalog.
    pub fn validate(&self, catalog: &Catalog) -> Result<()> {
        let invalid = |msg: String| Err(Error::Config(format!("index '{}': {}", self.name, msg)));

        if self.name.trim().is_empty() || self.name.contains('\0') {
            return invalid("name must be non-blank and free of NUL bytes".into());
        }
        if self.columns.is_empty() {
            return invalid("at least one column is required".into());
        }

        let entity = catalog.entity(self.entity);
        for column in &self.columns {
            let field = match entity.get_field(column) {
                Some(field) => field,
                None => return invalid(format!("{} has no column '{}'", self.entity, column)),
            };
            let document = field.field_type == FieldType::Document;
            match self.kind {
                IndexKind::Inverted if !document => {
                    return invalid(format!("'{}' is not a document column", column));
                }
                IndexKind::Sorted | IndexKind::Unique { .. } if !field.field_type.is_indexable() => {
                    return invalid(format!("'{}' cannot be indexed by value", column));
                }
                _ => {}
            }
        }

        if self.kind == IndexKind::Inverted && self.columns.len() != 1 {
            return invalid("inverted indexes cover exactly one column".into());
        }
        if self.placement == Placement::Partition && !self.entity.is_partitioned() {
            return invalid(format!("{} rows are not partitioned", self.entity));
        }
        Ok(())
    }

    /// The constraint error raised when `row` collides with an existing entry.
    pub(crate) fn violation(&self, row: &Row) -> Conflict {
        let violation = match self.kind {
            IndexKind::Unique { violation, .. } => violation,
            _ => Violation::Generic,
        };

        match (violation, row.as_enrollment()) {
            (Violation::ActiveEnrollment, Some(e)) => match e.institution_id {
                Some(institution_id) => Conflict::DuplicateActive {
                    tenant_id: e.tenant_id,
                    person_id: e.person_id,
                    institution_id,
                },
                None => self.generic_violation(row),
            },
            (Violation::CourseEnrollment, Some(e)) => Conflict::DuplicateEnrollment {
                key: format!(
                    "tenant {} institution {} course {} person {}",
                    e.tenant_id,
                    e.institution_id.map(|i| i.to_string()).unwrap_or_else(|| "null".into()),
                    e.course_id,
                    e.person_id
                ),
            },
            _ => self.generic_violation(row),
        }
    }

    fn generic_violation(&self, row: &Row) -> Conflict {
        let value = self
            .values(row)
            .iter()
            .map(IndexValue::display)
            .collect::<Vec<_>>()
            .join(", ");
        Conflict::Unique {
            index: self.name.clone(),
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{
        Enrollment, EnrollmentId, EnrollmentStatus, InstitutionId, PersonId, TenantId, CourseId,
    };
    use chrono::NaiveDate;

    fn enrollment(deleted: bool) -> Row {
        Row::Enrollment(Enrollment {
            id: EnrollmentId(1),
            tenant_id: TenantId(1),
            institution_id: Some(InstitutionId(5)),
            person_id: PersonId(3),
            course_id: CourseId(9),
            enrollment_date: NaiveDate::from_ymd_opt(2024, 9, 1).unwrap(),
            status: EnrollmentStatus::Active,
            is_deleted: deleted,
        })
    }

    fn names(defs: &[IndexDef]) -> Vec<&str> {
        defs.iter().map(|d| d.name.as_str()).collect()
    }

    #[test]
    fn test_policy_selects_exactly_one_enrollment_unique() {
        let active = IndexDef::standard(UniquenessPolicy::ActiveTriple);
        assert!(names(&active).contains(&"enrollment_active_unique"));
        assert!(!names(&active).contains(&"enrollment_course_unique"));

        let absolute = IndexDef::standard(UniquenessPolicy::AbsoluteCourse);
        assert!(names(&absolute).contains(&"enrollment_course_unique"));
        assert!(!names(&absolute).contains(&"enrollment_active_unique"));

        assert!(active.iter().all(|d| d.builtin));
    }

    #[test]
    fn test_standard_defs_are_valid() {
        let catalog = Catalog::standard();
        for def in IndexDef::standard(UniquenessPolicy::ActiveTriple) {
            def.validate(&catalog).unwrap();
        }
    }

    #[test]
    fn test_partial_unique_skips_deleted_rows() {
        let def = IndexDef::standard(UniquenessPolicy::ActiveTriple)
            .into_iter()
            .find(|d| d.name == "enrollment_active_unique")
            .unwrap();
        assert!(def.covers(&enrollment(false)));
        assert!(!def.covers(&enrollment(true)));
        assert!(matches!(
            def.violation(&enrollment(false)),
            Conflict::DuplicateActive {
                institution_id: InstitutionId(5),
                ..
            }
        ));
    }

    #[test]
    fn test_validate_rejects_bad_columns() {
        let catalog = Catalog::standard();
        assert!(IndexDef::sorted("x", EntityKind::Course, &["nope"])
            .validate(&catalog)
            .is_err());
        assert!(IndexDef::sorted("x", EntityKind::Course, &["details"])
            .validate(&catalog)
            .is_err());
        assert!(IndexDef::inverted("x", EntityKind::Course, "name")
            .validate(&catalog)
            .is_err());
        assert!(IndexDef::sorted("x", EntityKind::Course, &[])
            .validate(&catalog)
            .is_err());
        IndexDef::sorted("course_name", EntityKind::Course, &["name"])
            .validate(&catalog)
            .unwrap();
    }

    #[test]
    fn test_values_follow_column_order() {
        let def = IndexDef::sorted(
            "e",
            EntityKind::Enrollment,
            &["course_id", "tenant_id", "missing"],
        );
        assert_eq!(
            def.values(&enrollment(false)),
            vec![IndexValue::Int(9), IndexValue::Int(1), IndexValue::Null]
        );
        assert_eq!(def.placement, Placement::Partition);
        assert!(!def.leads_with_tenant());
    }
}
