//! The storage interface consumed by API layers.

use std::collections::BTreeMap;

use crate::catalog::{
    Course, CourseId, Enrollment, EnrollmentId, Institution, InstitutionId, NewCourse,
    NewEnrollment, NewInstitution, NewPerson, NewTenant, Person, PersonId, Tenant, TenantId,
};
use crate::constraint::DeleteOutcome;
use crate::error::{Error, Result};
use crate::query::{ExecutionPlan, QueryIntent, QueryOutput, RosterEntry};

/// CRUD per entity plus the bounded queries.
///
/// Every operation on enrollments and every query takes the tenant scope
/// explicitly. Enrollments have no physical delete: they are soft-deleted
/// and restored, and only disappear when a parent delete cascades.
pub trait EnrollmentStore: Send + Sync {
    fn create_tenant(&self, tenant: NewTenant) -> Result<Tenant>;
    fn get_tenant(&self, id: TenantId) -> Result<Tenant>;
    fn update_tenant(&self, tenant: Tenant) -> Result<Tenant>;
    /// Delete a tenant with all its institutions, courses and enrollments.
    fn delete_tenant(&self, id: TenantId) -> Result<DeleteOutcome>;

    fn create_person(&self, person: NewPerson) -> Result<Person>;
    fn get_person(&self, id: PersonId) -> Result<Person>;
    fn update_person(&self, person: Person) -> Result<Person>;
    /// Delete a person and their enrollments in every tenant.
    fn delete_person(&self, id: PersonId) -> Result<DeleteOutcome>;

    fn create_institution(&self, institution: NewInstitution) -> Result<Institution>;
    fn get_institution(&self, id: InstitutionId) -> Result<Institution>;
    fn update_institution(&self, institution: Institution) -> Result<Institution>;
    /// Delete an institution and its courses; its remaining enrollments keep
    /// their history with the institution cleared.
    fn delete_institution(&self, id: InstitutionId) -> Result<DeleteOutcome>;

    fn create_course(&self, course: NewCourse) -> Result<Course>;
    fn get_course(&self, id: CourseId) -> Result<Course>;
    fn update_course(&self, course: Course) -> Result<Course>;
    fn delete_course(&self, id: CourseId) -> Result<DeleteOutcome>;

    fn create_enrollment(&self, enrollment: NewEnrollment) -> Result<Enrollment>;
    fn get_enrollment(&self, tenant_id: TenantId, id: EnrollmentId) -> Result<Enrollment>;
    /// Replace an enrollment's attributes. The delete flag is left as stored.
    fn update_enrollment(&self, enrollment: Enrollment) -> Result<Enrollment>;
    fn soft_delete_enrollment(&self, tenant_id: TenantId, id: EnrollmentId) -> Result<Enrollment>;
    /// Undo a soft delete, subject to the uniqueness rule in force.
    fn restore_enrollment(&self, tenant_id: TenantId, id: EnrollmentId) -> Result<Enrollment>;

    fn execute(&self, intent: &QueryIntent) -> Result<QueryOutput>;
    fn explain(&self, intent: &QueryIntent) -> Result<ExecutionPlan>;

    /// Active enrollments per course; courses without a match are absent.
    fn count_enrollments_by_course(
        &self,
        tenant_id: TenantId,
        institution_id: InstitutionId,
        search_term: &str,
    ) -> Result<BTreeMap<CourseId, u64>> {
        let intent =
            QueryIntent::count_enrollments_by_course(tenant_id, institution_id, search_term);
        self.execute(&intent)?
            .into_course_counts()
            .ok_or_else(|| Error::InvalidQuery("intent returned a roster".into()))
    }

    /// One roster page, by person name.
    fn list_roster(
        &self,
        tenant_id: TenantId,
        institution_id: InstitutionId,
        course_id: CourseId,
        page_size: usize,
        offset: usize,
    ) -> Result<Vec<RosterEntry>> {
        let intent =
            QueryIntent::list_roster(tenant_id, institution_id, course_id, page_size, offset);
        self.execute(&intent)?
            .into_roster()
            .ok_or_else(|| Error::InvalidQuery("intent returned course counts".into()))
    }
}
