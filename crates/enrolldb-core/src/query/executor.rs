//! Query executor for bounded intents.
//!
//! Every intent resolves its tenant to a partition, holds that partition's
//! read lock for the duration of the query, and reads enrollments only from
//! the partition tree.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::debug;

use super::explain::ExecutionPlan;
use super::intent::{QueryIntent, QueryOutput, RosterEntry, DEFAULT_MAX_PAGE_SIZE};
use crate::catalog::{EntityKind, Row, TenantId};
use crate::document::tokenize;
use crate::error::{Error, Result};
use crate::index::{IndexManager, IndexTrees, QueryShape};
use crate::partition::PartitionRouter;
use crate::storage::key::row_key;
use crate::storage::{read_row, IndexValue, StorageEngine};

/// Default wait for a partition lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Query executor that runs intents against storage.
pub struct QueryExecutor<'a> {
    storage: &'a StorageEngine,
    indexes: &'a IndexManager,
    router: &'a PartitionRouter,
    lock_timeout: Duration,
    max_page_size: usize,
}

impl<'a> QueryExecutor<'a> {
    pub fn new(
        storage: &'a StorageEngine,
        indexes: &'a IndexManager,
        router: &'a PartitionRouter,
    ) -> Self {
        Self {
            storage,
            indexes,
            router,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_max_page_size(mut self, max_page_size: usize) -> Self {
        self.max_page_size = max_page_size;
        self
    }

    /// Execute an intent.
    pub fn execute(&self, intent: &QueryIntent) -> Result<QueryOutput> {
        let tenant_id = intent.validate(self.max_page_size)?;
        let partition = match self.router.read(tenant_id, self.lock_timeout) {
            Ok(partition) => partition,
            // A tenant that no longer exists has nothing to return; a live
            // tenant without a partition is still a routing error.
            Err(Error::UnroutablePartition { .. }) if !self.tenant_exists(tenant_id)? => {
                debug!(tenant_id = tenant_id.0, "query for unknown tenant");
                return Ok(intent.empty_output());
            }
            Err(e) => return Err(e),
        };
        let trees = IndexTrees::with_partition(self.storage.global(), partition.tree());

        let shape = enrollment_shape(intent, tenant_id);
        let plan = self.indexes.choose_index(&shape);
        let enrollments = self.indexes.fetch(trees, &plan, &shape)?;
        debug!(
            intent = intent.name(),
            tenant_id = tenant_id.0,
            partition = partition.id().0,
            rows = enrollments.len(),
            "fetched enrollments"
        );

        match intent {
            QueryIntent::CountEnrollmentsByCourse { search_term, .. } => {
                let persons =
                    self.indexes
                        .search_tokens(trees, EntityKind::Person, "metadata", search_term)?;

                let mut counts = BTreeMap::new();
                for enrollment in enrollments.iter().filter_map(Row::as_enrollment) {
                    if let Some(persons) = &persons {
                        if !persons.contains(&enrollment.person_id.0) {
                            continue;
                        }
                    }
                    *counts.entry(enrollment.course_id).or_insert(0u64) += 1;
                }
                Ok(QueryOutput::CourseCounts(counts))
            }
            QueryIntent::ListRoster {
                page_size, offset, ..
            } => {
                let mut entries = Vec::with_capacity(enrollments.len());
                for enrollment in enrollments.into_iter().filter_map(Row::into_enrollment) {
                    let person = read_row(
                        self.storage.global(),
                        EntityKind::Person,
                        enrollment.person_id.0,
                    )?
                    .and_then(Row::into_person);
                    let Some(person) = person else {
                        continue;
                    };
                    entries.push(RosterEntry {
                        enrollment_id: enrollment.id,
                        person_id: person.id,
                        person_name: person.name,
                        birth_date: person.birth_date,
                        enrollment_date: enrollment.enrollment_date,
                        status: enrollment.status,
                    });
                }

                entries.sort_by(|a, b| {
                    a.person_name
                        .cmp(&b.person_name)
                        .then(a.person_id.cmp(&b.person_id))
                        .then(a.enrollment_id.cmp(&b.enrollment_id))
                });
                Ok(QueryOutput::Roster(
                    entries.into_iter().skip(*offset).take(*page_size).collect(),
                ))
            }
        }
    }

    fn tenant_exists(&self, tenant_id: TenantId) -> Result<bool> {
        Ok(self
            .storage
            .global()
            .contains_key(row_key(EntityKind::Tenant, tenant_id.0))?)
    }

    /// Describe how an intent would run. Takes no locks.
    pub fn explain(&self, intent: &QueryIntent) -> Result<ExecutionPlan> {
        let tenant_id = intent.validate(self.max_page_size)?;
        let partition = match self.router.route(tenant_id) {
            Ok(partition) => Some(partition),
            Err(Error::UnroutablePartition { .. }) if !self.tenant_exists(tenant_id)? => None,
            Err(e) => return Err(e),
        };

        let shape = enrollment_shape(intent, tenant_id);
        let index = self.indexes.choose_index(&shape);
        let residual = index
            .residual
            .iter()
            .filter_map(|column| {
                shape
                    .equality(column)
                    .map(|value| format!("{} = {}", column, value.display()))
            })
            .collect();

        let mut plan = ExecutionPlan {
            intent: intent.name(),
            tenant_id,
            partition: partition.as_ref().map(|p| p.id()),
            partition_name: partition.as_ref().map(|p| p.name().to_string()),
            index,
            residual,
            search: None,
            order_by: None,
            limit: None,
            offset: None,
        };

        match intent {
            QueryIntent::CountEnrollmentsByCourse { search_term, .. } => {
                let terms = tokenize(search_term);
                if !terms.is_empty() {
                    let access = match self.indexes.inverted_index(EntityKind::Person, "metadata")
                    {
                        Some(def) => format!("token prefix scan {}", def.name),
                        None => "full scan of person".to_string(),
                    };
                    plan.search = Some(format!("{} for [{}]", access, terms.join(", ")));
                }
            }
            QueryIntent::ListRoster {
                page_size, offset, ..
            } => {
                plan.order_by = Some("person.name, person.id, enrollment.id".to_string());
                plan.limit = Some(*page_size);
                plan.offset = Some(*offset);
            }
        }
        Ok(plan)
    }
}

/// Equality filters on enrollments for an intent; soft-deleted rows never match.
fn enrollment_shape(intent: &QueryIntent, tenant_id: TenantId) -> QueryShape {
    let id = |v: u64| IndexValue::Int(v as i64);
    let shape = QueryShape::new(EntityKind::Enrollment).eq("tenant_id", id(tenant_id.0));
    let shape = match intent {
        QueryIntent::CountEnrollmentsByCourse { institution_id, .. } => {
            shape.eq("institution_id", id(institution_id.0))
        }
        QueryIntent::ListRoster {
            institution_id,
            course_id,
            ..
        } => shape
            .eq("institution_id", id(institution_id.0))
            .eq("course_id", id(course_id.0)),
    };
    shape.eq("is_deleted", IndexValue::Bool(false))
}
