//! Tenant partitioning.
//!
//! Enrollments are list-partitioned by tenant: every tenant is assigned to
//! exactly one partition, each partition is backed by its own sled tree and
//! guarded by its own read/write lock. Unassigned tenants are never routed to
//! a default; moving a tenant between partitions is an explicit, offline
//! migration during which the tenant cannot be routed at all.

mod map;
mod router;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use map::{
    Migration, PartitionInfo, PartitionMap, PartitionMapConfig, PartitionSpec, PartitionSummary,
};
pub use router::{PartitionHandle, PartitionReadGuard, PartitionRouter, PartitionWriteGuard};
pub(crate) use router::MapEdit;

/// Partition identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(pub u32);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What happens to routing when a tenant is created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoPartition {
    /// Create and assign a dedicated `tenant-<id>` partition.
    #[default]
    PerTenant,
    /// Leave the tenant unroutable until an administrator assigns it.
    Disabled,
}

/// Name of the partition [`AutoPartition::PerTenant`] creates.
pub fn dedicated_partition_name(tenant_id: crate::catalog::TenantId) -> String {
    format!("tenant-{}", tenant_id)
}
