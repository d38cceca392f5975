//! Entity records and their identifiers.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::entity::EntityKind;
use crate::document::Document;
use crate::storage::IndexValue;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Raw numeric value.
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

entity_id!(
    /// Tenant identifier.
    TenantId
);
entity_id!(
    /// Person identifier.
    PersonId
);
entity_id!(
    /// Institution identifier.
    InstitutionId
);
entity_id!(
    /// Course identifier.
    CourseId
);
entity_id!(
    /// Enrollment identifier.
    EnrollmentId
);

/// Top-level isolation boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub description: Option<String>,
}

/// A learner. Persons are shared across tenants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: PersonId,
    pub name: String,
    pub birth_date: Option<NaiveDate>,
    pub metadata: Document,
}

/// A school, university or training provider owned by a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Institution {
    pub id: InstitutionId,
    pub tenant_id: TenantId,
    pub name: String,
    pub location: Option<String>,
    pub details: Document,
}

/// A course offered by an institution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Course {
    pub id: CourseId,
    pub tenant_id: TenantId,
    pub institution_id: InstitutionId,
    pub name: String,
    pub duration_hours: Option<u32>,
    pub details: Document,
}

/// Enrollment state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Pending,
    Active,
    Completed,
    Withdrawn,
}

impl EnrollmentStatus {
    /// Stable lowercase name, used in index keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentStatus::Pending => "pending",
            EnrollmentStatus::Active => "active",
            EnrollmentStatus::Completed => "completed",
            EnrollmentStatus::Withdrawn => "withdrawn",
        }
    }

    /// Parse a status name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EnrollmentStatus::Pending),
            "active" => Some(EnrollmentStatus::Active),
            "completed" => Some(EnrollmentStatus::Completed),
            "withdrawn" => Some(EnrollmentStatus::Withdrawn),
            _ => None,
        }
    }
}

impl fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A person's enrollment in a course, scoped to a tenant partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: EnrollmentId,
    pub tenant_id: TenantId,
    /// Nulled when the institution is deleted.
    pub institution_id: Option<InstitutionId>,
    pub person_id: PersonId,
    pub course_id: CourseId,
    pub enrollment_date: NaiveDate,
    pub status: EnrollmentStatus,
    pub is_deleted: bool,
}

/// Input for creating a tenant.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTenant {
    pub name: String,
    pub description: Option<String>,
}

impl NewTenant {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub(crate) fn with_id(self, id: TenantId) -> Tenant {
        Tenant {
            id,
            name: self.name,
            description: self.description,
        }
    }
}

/// Input for creating a person.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPerson {
    pub name: String,
    pub birth_date: Option<NaiveDate>,
    pub metadata: Document,
}

impl NewPerson {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            birth_date: None,
            metadata: Document::object(),
        }
    }

    pub fn with_birth_date(mut self, date: NaiveDate) -> Self {
        self.birth_date = Some(date);
        self
    }

    pub fn with_metadata(mut self, metadata: impl Into<Document>) -> Self {
        self.metadata = metadata.into();
        self
    }

    pub(crate) fn with_id(self, id: PersonId) -> Person {
        Person {
            id,
            name: self.name,
            birth_date: self.birth_date,
            metadata: self.metadata,
        }
    }
}

/// Input for creating an institution.
#[derive(Debug, Clone, PartialEq)]
pub struct NewInstitution {
    pub tenant_id: TenantId,
    pub name: String,
    pub location: Option<String>,
    pub details: Document,
}

impl NewInstitution {
    pub fn new(tenant_id: TenantId, name: impl Into<String>) -> Self {
        Self {
            tenant_id,
            name: name.into(),
            location: None,
            details: Document::object(),
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<Document>) -> Self {
        self.details = details.into();
        self
    }

    pub(crate) fn with_id(self, id: InstitutionId) -> Institution {
        Institution {
            id,
            tenant_id: self.tenant_id,
            name: self.name,
            location: self.location,
            details: self.details,
        }
    }
}

/// Input for creating a course.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCourse {
    pub tenant_id: TenantId,
    pub institution_id: InstitutionId,
    pub name: String,
    pub duration_hours: Option<u32>,
    pub details: Document,
}

impl NewCourse {
    pub fn new(tenant_id: TenantId, institution_id: InstitutionId, name: impl Into<String>) -> Self {
        Self {
            tenant_id,
            institution_id,
            name: name.into(),
            duration_hours: None,
            details: Document::object(),
        }
    }

    pub fn with_duration_hours(mut self, hours: u32) -> Self {
        self.duration_hours = Some(hours);
        self
    }

    pub fn with_details(mut self, details: impl Into<Document>) -> Self {
        self.details = details.into();
        self
    }

    pub(crate) fn with_id(self, id: CourseId) -> Course {
        Course {
            id,
            tenant_id: self.tenant_id,
            institution_id: self.institution_id,
            name: self.name,
            duration_hours: self.duration_hours,
            details: self.details,
        }
    }
}

/// Input for creating an enrollment.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEnrollment {
    pub tenant_id: TenantId,
    pub institution_id: Option<InstitutionId>,
    pub person_id: PersonId,
    pub course_id: CourseId,
    pub enrollment_date: NaiveDate,
    pub status: EnrollmentStatus,
}

impl NewEnrollment {
    pub fn new(
        tenant_id: TenantId,
        institution_id: Option<InstitutionId>,
        person_id: PersonId,
        course_id: CourseId,
        enrollment_date: NaiveDate,
    ) -> Self {
        Self {
            tenant_id,
            institution_id,
            person_id,
            course_id,
            enrollment_date,
            status: EnrollmentStatus::Active,
        }
    }

    pub fn with_status(mut self, status: EnrollmentStatus) -> Self {
        self.status = status;
        self
    }

    pub(crate) fn with_id(self, id: EnrollmentId) -> Enrollment {
        Enrollment {
            id,
            tenant_id: self.tenant_id,
            institution_id: self.institution_id,
            person_id: self.person_id,
            course_id: self.course_id,
            enrollment_date: self.enrollment_date,
            status: self.status,
            is_deleted: false,
        }
    }
}

/// Typed pointer to a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: u64,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: u64) -> Self {
        Self { kind, id }
    }

    pub fn tenant(id: TenantId) -> Self {
        Self::new(EntityKind::Tenant, id.0)
    }

    pub fn person(id: PersonId) -> Self {
        Self::new(EntityKind::Person, id.0)
    }

    pub fn institution(id: InstitutionId) -> Self {
        Self::new(EntityKind::Institution, id.0)
    }

    pub fn course(id: CourseId) -> Self {
        Self::new(EntityKind::Course, id.0)
    }

    pub fn enrollment(id: EnrollmentId) -> Self {
        Self::new(EntityKind::Enrollment, id.0)
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

/// Any stored row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Row {
    Tenant(Tenant),
    Person(Person),
    Institution(Institution),
    Course(Course),
    Enrollment(Enrollment),
}

impl Row {
    /// Entity type of this row.
    pub fn kind(&self) -> EntityKind {
        match self {
            Row::Tenant(_) => EntityKind::Tenant,
            Row::Person(_) => EntityKind::Person,
            Row::Institution(_) => EntityKind::Institution,
            Row::Course(_) => EntityKind::Course,
            Row::Enrollment(_) => EntityKind::Enrollment,
        }
    }

    /// Numeric row id.
    pub fn id(&self) -> u64 {
        match self {
            Row::Tenant(t) => t.id.0,
            Row::Person(p) => p.id.0,
            Row::Institution(i) => i.id.0,
            Row::Course(c) => c.id.0,
            Row::Enrollment(e) => e.id.0,
        }
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.kind(), self.id())
    }

    /// Owning tenant, if the entity is tenant-scoped.
    ///
    /// A tenant row reports itself.
    pub fn tenant_id(&self) -> Option<TenantId> {
        match self {
            Row::Tenant(t) => Some(t.id),
            Row::Person(_) => None,
            Row::Institution(i) => Some(i.tenant_id),
            Row::Course(c) => Some(c.tenant_id),
            Row::Enrollment(e) => Some(e.tenant_id),
        }
    }

    /// Scalar column value by name, as used in index keys.
    pub fn field(&self, name: &str) -> Option<IndexValue> {
        let text = |s: &str| IndexValue::Text(s.to_string());
        let opt_text = |s: &Option<String>| match s {
            Some(s) => IndexValue::Text(s.clone()),
            None => IndexValue::Null,
        };
        let id = |v: u64| IndexValue::Int(v as i64);

        let value = match (self, name) {
            (_, "id") => id(self.id()),
            (Row::Tenant(t), "name") => text(&t.name),
            (Row::Tenant(t), "description") => opt_text(&t.description),
            (Row::Person(p), "name") => text(&p.name),
            (Row::Person(p), "birth_date") => match p.birth_date {
                Some(d) => IndexValue::Date(d),
                None => IndexValue::Null,
            },
            (Row::Institution(i), "tenant_id") => id(i.tenant_id.0),
            (Row::Institution(i), "name") => text(&i.name),
            (Row::Institution(i), "location") => opt_text(&i.location),
            (Row::Course(c), "tenant_id") => id(c.tenant_id.0),
            (Row::Course(c), "institution_id") => id(c.institution_id.0),
            (Row::Course(c), "name") => text(&c.name),
            (Row::Course(c), "duration_hours") => match c.duration_hours {
                Some(h) => IndexValue::Int(h as i64),
                None => IndexValue::Null,
            },
            (Row::Enrollment(e), "tenant_id") => id(e.tenant_id.0),
            (Row::Enrollment(e), "institution_id") => match e.institution_id {
                Some(i) => id(i.0),
                None => IndexValue::Null,
            },
            (Row::Enrollment(e), "person_id") => id(e.person_id.0),
            (Row::Enrollment(e), "course_id") => id(e.course_id.0),
            (Row::Enrollment(e), "enrollment_date") => IndexValue::Date(e.enrollment_date),
            (Row::Enrollment(e), "status") => text(e.status.as_str()),
            (Row::Enrollment(e), "is_deleted") => IndexValue::Bool(e.is_deleted),
            _ => return None,
        };
        Some(value)
    }

    /// Semi-structured attribute by name.
    pub fn document(&self, name: &str) -> Option<&Document> {
        match (self, name) {
            (Row::Person(p), "metadata") => Some(&p.metadata),
            (Row::Institution(i), "details") => Some(&i.details),
            (Row::Course(c), "details") => Some(&c.details),
            _ => None,
        }
    }

    /// Outgoing foreign references as (field, target) pairs. Null references
    /// are omitted.
    pub fn references(&self) -> Vec<(&'static str, EntityRef)> {
        match self {
            Row::Tenant(_) | Row::Person(_) => Vec::new(),
            Row::Institution(i) => vec![("tenant_id", EntityRef::tenant(i.tenant_id))],
            Row::Course(c) => vec![
                ("tenant_id", EntityRef::tenant(c.tenant_id)),
                ("institution_id", EntityRef::institution(c.institution_id)),
            ],
            Row::Enrollment(e) => {
                let mut refs = vec![("tenant_id", EntityRef::tenant(e.tenant_id))];
                if let Some(institution_id) = e.institution_id {
                    refs.push(("institution_id", EntityRef::institution(institution_id)));
                }
                refs.push(("person_id", EntityRef::person(e.person_id)));
                refs.push(("course_id", EntityRef::course(e.course_id)));
                refs
            }
        }
    }

    pub fn as_enrollment(&self) -> Option<&Enrollment> {
        match self {
            Row::Enrollment(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_tenant(self) -> Option<Tenant> {
        match self {
            Row::Tenant(t) => Some(t),
            _ => None,
        }
    }

    pub fn into_person(self) -> Option<Person> {
        match self {
            Row::Person(p) => Some(p),
            _ => None,
        }
    }

    pub fn into_institution(self) -> Option<Institution> {
        match self {
            Row::Institution(i) => Some(i),
            _ => None,
        }
    }

    pub fn into_course(self) -> Option<Course> {
        match self {
            Row::Course(c) => Some(c),
            _ => None,
        }
    }

    pub fn into_enrollment(self) -> Option<Enrollment> {
        match self {
            Row::Enrollment(e) => Some(e),
            _ => None,
        }
    }
}
