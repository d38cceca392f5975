//! Query explanation.

use std::fmt;

use serde::Serialize;

use crate::catalog::TenantId;
use crate::index::IndexPlan;
use crate::partition::PartitionId;

/// How an intent would run, without running it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionPlan {
    pub intent: &'static str,
    pub tenant_id: TenantId,
    /// Resolved partition; `None` when the tenant no longer exists and the
    /// intent would return an empty result without reading anything.
    pub partition: Option<PartitionId>,
    pub partition_name: Option<String>,
    /// Access path for the enrollment rows.
    pub index: IndexPlan,
    /// Predicates applied after the index lookup.
    pub residual: Vec<String>,
    /// Person lookup feeding the enrollment filter, if any.
    pub search: Option<String>,
    pub order_by: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} for tenant {}", self.intent, self.tenant_id)?;
        match (self.partition, &self.partition_name) {
            (Some(partition), Some(name)) => writeln!(f, "  partition: {} ({})", partition, name)?,
            _ => writeln!(f, "  partition: none (unknown tenant)")?,
        }
        writeln!(f, "  enrollments: {}", self.index)?;
        if let Some(search) = &self.search {
            writeln!(f, "  persons: {}", search)?;
        }
        if !self.residual.is_empty() {
            writeln!(f, "  filter: {}", self.residual.join(" AND "))?;
        }
        if let Some(order_by) = &self.order_by {
            writeln!(f, "  order by: {}", order_by)?;
        }
        if let (Some(limit), Some(offset)) = (self.limit, self.offset) {
            writeln!(f, "  limit {} offset {}", limit, offset)?;
        }
        Ok(())
    }
}
