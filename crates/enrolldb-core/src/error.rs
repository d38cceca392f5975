//! Core error types.

use thiserror::Error;

use crate::catalog::{EntityKind, InstitutionId, PersonId, TenantId};
use crate::partition::PartitionId;

/// Core database errors.
#[derive(Debug, Error)]
pub enum Error {
    /// An insert or update references a parent row that does not exist
    /// (or is not visible within the row's tenant).
    #[error("{entity}.{field} references missing {target} {id}")]
    DanglingReference {
        entity: EntityKind,
        field: &'static str,
        target: EntityKind,
        id: u64,
    },

    /// A second non-deleted enrollment for the same (tenant, person, institution).
    #[error(
        "active enrollment already exists for person {person_id} at institution {institution_id} in tenant {tenant_id}"
    )]
    DuplicateActiveEnrollment {
        tenant_id: TenantId,
        person_id: PersonId,
        institution_id: InstitutionId,
    },

    /// A second enrollment for the same (tenant, institution, course, person),
    /// enforced only under the absolute uniqueness policy.
    #[error("enrollment already exists: {key}")]
    DuplicateEnrollment { key: String },

    /// The tenant has no partition assignment.
    #[error("tenant {tenant_id} is not assigned to any partition")]
    UnroutablePartition { tenant_id: TenantId },

    /// The tenant's partition is being rebalanced.
    #[error("partition {partition} is locked for migration")]
    PartitionLocked { partition: PartitionId },

    /// A query arrived without a tenant scope.
    #[error("query is missing the mandatory tenant scope")]
    MissingTenantScope,

    /// Generic catalog shape or constraint mismatch.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Row not found.
    #[error("{entity} {id} not found")]
    NotFound { entity: EntityKind, id: u64 },

    /// Query parameters outside the accepted bounds.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Transient failures persisted past the retry budget.
    #[error("storage unavailable after {attempts} attempts: {reason}")]
    StorageUnavailable { attempts: u32, reason: String },

    /// A partition lock could not be acquired in time.
    #[error("timed out waiting for partition {partition} lock")]
    LockTimeout { partition: PartitionId },

    /// Rows a delete plan was computed from changed before it committed.
    #[error("{entity} {id} changed while the write was being planned")]
    WriteConflict { entity: EntityKind, id: u64 },

    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Key decoding error.
    #[error("invalid key format")]
    InvalidKey,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the failure is worth retrying locally.
    ///
    /// Constraint and routing errors describe caller or data bugs and are
    /// always surfaced unmodified.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::LockTimeout { .. } | Error::WriteConflict { .. } => true,
            Error::Storage(sled::Error::Io(_)) => true,
            _ => false,
        }
    }
}

/// A constraint failure detected inside a storage transaction.
///
/// Transactions may be re-run by sled, so the failure has to be reproducible
/// as a fresh [`Error`] each time.
#[derive(Debug, Clone, PartialEq)]
pub enum Conflict {
    /// Referenced row vanished before commit.
    Dangling {
        entity: EntityKind,
        field: &'static str,
        target: EntityKind,
        id: u64,
    },
    /// Active triple already taken.
    DuplicateActive {
        tenant_id: TenantId,
        person_id: PersonId,
        institution_id: InstitutionId,
    },
    /// Absolute enrollment key already taken.
    DuplicateEnrollment { key: String },
    /// Any other unique index.
    Unique { index: String, value: String },
    /// The row being updated was removed concurrently.
    Missing { entity: EntityKind, id: u64 },
    /// A dependency stamp moved after planning.
    Stale { entity: EntityKind, id: u64 },
}

impl From<Conflict> for Error {
    fn from(conflict: Conflict) -> Self {
        match conflict {
            Conflict::Dangling {
                entity,
                field,
                target,
                id,
            } => Error::DanglingReference {
                entity,
                field,
                target,
                id,
            },
            Conflict::DuplicateActive {
                tenant_id,
                person_id,
                institution_id,
            } => Error::DuplicateActiveEnrollment {
                tenant_id,
                person_id,
                institution_id,
            },
            Conflict::DuplicateEnrollment { key } => Error::DuplicateEnrollment { key },
            Conflict::Unique { index, value } => Error::ConstraintViolation(format!(
                "unique index '{}' already contains {}",
                index, value
            )),
            Conflict::Missing { entity, id } => Error::NotFound { entity, id },
            Conflict::Stale { entity, id } => Error::WriteConflict { entity, id },
        }
    }
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let timeout = Error::LockTimeout {
            partition: PartitionId(3),
        };
        assert!(timeout.is_transient());

        let io = Error::Storage(sled::Error::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "disk hiccup",
        )));
        assert!(io.is_transient());

        assert!(Error::WriteConflict {
            entity: EntityKind::Person,
            id: 9
        }
        .is_transient());

        assert!(!Error::MissingTenantScope.is_transient());
        assert!(!Error::UnroutablePartition {
            tenant_id: TenantId(1)
        }
        .is_transient());
    }

    #[test]
    fn test_conflict_into_error() {
        let err: Error = Conflict::DuplicateActive {
            tenant_id: TenantId(1),
            person_id: PersonId(2),
            institution_id: InstitutionId(5),
        }
        .into();
        assert!(matches!(
            err,
            Error::DuplicateActiveEnrollment {
                institution_id: InstitutionId(5),
                ..
            }
        ));

        let err: Error = Conflict::Unique {
            index: "tenant_name".into(),
            value: "acme".into(),
        }
        .into();
        assert!(err.to_string().contains("tenant_name"));
    }
}
