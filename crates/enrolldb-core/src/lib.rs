//! enrolldb core - Tenant-partitioned storage, constraints and bounded queries.
//!
//! This crate provides the persistence layer for multi-tenant education
//! enrollment data: the entity catalog, referential and uniqueness
//! constraints, per-tenant partition routing, index maintenance and a closed
//! set of query intents.

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod catalog;
pub mod config;
pub mod constraint;
pub mod database;
pub mod document;
pub mod error;
pub mod index;
pub mod partition;
pub mod query;
pub mod storage;
pub mod store;

pub use catalog::{
    Catalog, Course, CourseId, DeleteBehavior, Enrollment, EnrollmentId, EnrollmentStatus,
    EntityKind, EntityRef, Institution, InstitutionId, NewCourse, NewEnrollment, NewInstitution,
    NewPerson, NewTenant, Person, PersonId, RelationDef, Row, Tenant, TenantId,
};
pub use config::DatabaseConfig;
pub use constraint::{DeleteOutcome, DeletePlan, PlanStep};
pub use database::Database;
pub use document::Document;
pub use error::{Error, Result};
pub use index::{IndexDef, IndexKind, Placement, UniquenessPolicy};
pub use partition::{
    AutoPartition, Migration, PartitionId, PartitionMapConfig, PartitionSpec, PartitionSummary,
};
pub use query::{ExecutionPlan, QueryIntent, QueryOutput, RosterEntry};
pub use storage::{RetryPolicy, StorageConfig};
pub use store::EnrollmentStore;
