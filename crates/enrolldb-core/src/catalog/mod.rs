//! Entity catalog.
//!
//! The catalog defines the canonical shapes of tenants, persons,
//! institutions, courses and enrollments, plus the relation graph that
//! drives referential checks and delete planning.

mod catalog;
mod entity;
mod model;
mod relation;

pub use catalog::{Catalog, MAX_TEXT_LEN};
pub use entity::{EntityDef, EntityKind, FieldDef, FieldType};
pub use model::{
    Course, CourseId, Enrollment, EnrollmentId, EnrollmentStatus, EntityRef, Institution,
    InstitutionId, NewCourse, NewEnrollment, NewInstitution, NewPerson, NewTenant, Person,
    PersonId, Row, Tenant, TenantId,
};
pub use relation::{DeleteBehavior, RelationDef};
