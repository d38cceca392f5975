//! Bounded query intents and their results.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::catalog::{
    CourseId, EnrollmentId, EnrollmentStatus, InstitutionId, PersonId, TenantId,
};
use crate::error::{Error, Result};

/// Default upper bound on `page_size`.
pub const DEFAULT_MAX_PAGE_SIZE: usize = 500;

/// The closed set of read operations.
///
/// Every intent carries its tenant scope. It is optional only so that a
/// request decoded from an outer layer can be rejected with
/// [`Error::MissingTenantScope`] instead of being scoped by accident.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum QueryIntent {
    /// Active enrollments per course at an institution, optionally narrowed
    /// by a full-text search over the enrolled persons' metadata.
    CountEnrollmentsByCourse {
        tenant_id: Option<TenantId>,
        institution_id: InstitutionId,
        #[serde(default)]
        search_term: String,
    },
    /// One page of a course roster ordered by person name.
    ListRoster {
        tenant_id: Option<TenantId>,
        institution_id: InstitutionId,
        course_id: CourseId,
        page_size: usize,
        #[serde(default)]
        offset: usize,
    },
}

impl QueryIntent {
    pub fn count_enrollments_by_course(
        tenant_id: TenantId,
        institution_id: InstitutionId,
        search_term: impl Into<String>,
    ) -> Self {
        QueryIntent::CountEnrollmentsByCourse {
            tenant_id: Some(tenant_id),
            institution_id,
            search_term: search_term.into(),
        }
    }

    pub fn list_roster(
        tenant_id: TenantId,
        institution_id: InstitutionId,
        course_id: CourseId,
        page_size: usize,
        offset: usize,
    ) -> Self {
        QueryIntent::ListRoster {
            tenant_id: Some(tenant_id),
            institution_id,
            course_id,
            page_size,
            offset,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            QueryIntent::CountEnrollmentsByCourse { .. } => "count_enrollments_by_course",
            QueryIntent::ListRoster { .. } => "list_roster",
        }
    }

    /// The result of this intent over no enrollments.
    pub fn empty_output(&self) -> QueryOutput {
        match self {
            QueryIntent::CountEnrollmentsByCourse { .. } => {
                QueryOutput::CourseCounts(BTreeMap::new())
            }
            QueryIntent::ListRoster { .. } => QueryOutput::Roster(Vec::new()),
        }
    }

    /// The tenant scope, or [`Error::MissingTenantScope`].
    pub fn tenant_scope(&self) -> Result<TenantId> {
        let tenant_id = match self {
            QueryIntent::CountEnrollmentsByCourse { tenant_id, .. }
            | QueryIntent::ListRoster { tenant_id, .. } => *tenant_id,
        };
        tenant_id.ok_or(Error::MissingTenantScope)
    }

    /// Check the scope and parameter bounds.
    pub fn validate(&self, max_page_size: usize) -> Result<TenantId> {
        let tenant_id = self.tenant_scope()?;
        if let QueryIntent::ListRoster { page_size, .. } = self {
            if *page_size == 0 || *page_size > max_page_size {
                return Err(Error::InvalidQuery(format!(
                    "page_size must be between 1 and {}, got {}",
                    max_page_size, page_size
                )));
            }
        }
        Ok(tenant_id)
    }
}

/// One roster line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub enrollment_id: EnrollmentId,
    pub person_id: PersonId,
    pub person_name: String,
    pub birth_date: Option<NaiveDate>,
    pub enrollment_date: NaiveDate,
    pub status: EnrollmentStatus,
}

/// Result of an intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOutput {
    /// Courses with at least one matching enrollment.
    CourseCounts(BTreeMap<CourseId, u64>),
    Roster(Vec<RosterEntry>),
}

impl QueryOutput {
    pub fn into_course_counts(self) -> Option<BTreeMap<CourseId, u64>> {
        match self {
            QueryOutput::CourseCounts(counts) => Some(counts),
            QueryOutput::Roster(_) => None,
        }
    }

    pub fn into_roster(self) -> Option<Vec<RosterEntry>> {
        match self {
            QueryOutput::Roster(entries) => Some(entries),
            QueryOutput::CourseCounts(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_scope_is_rejected() {
        let intent = QueryIntent::CountEnrollmentsByCourse {
            tenant_id: None,
            institution_id: InstitutionId(5),
            search_term: String::new(),
        };
        assert!(matches!(
            intent.validate(DEFAULT_MAX_PAGE_SIZE),
            Err(Error::MissingTenantScope)
        ));
    }

    #[test]
    fn test_page_size_bounds() {
        let roster = |page_size| {
            QueryIntent::list_roster(TenantId(1), InstitutionId(5), CourseId(9), page_size, 0)
        };
        assert!(matches!(roster(0).validate(10), Err(Error::InvalidQuery(_))));
        assert!(matches!(roster(11).validate(10), Err(Error::InvalidQuery(_))));
        assert_eq!(roster(10).validate(10).unwrap(), TenantId(1));
    }

    #[test]
    fn test_intent_from_json() {
        let intent: QueryIntent = serde_json::from_str(
            r#"{"intent":"list_roster","tenant_id":1,"institution_id":5,"course_id":9,"page_size":2}"#,
        )
        .unwrap();
        assert_eq!(
            intent,
            QueryIntent::list_roster(TenantId(1), InstitutionId(5), CourseId(9), 2, 0)
        );

        let unscoped: QueryIntent = serde_json::from_str(
            r#"{"intent":"count_enrollments_by_course","tenant_id":null,"institution_id":5}"#,
        )
        .unwrap();
        assert!(matches!(
            unscoped.tenant_scope(),
            Err(Error::MissingTenantScope)
        ));
    }
}
