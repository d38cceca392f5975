//! The routing table.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::PartitionId;
use crate::catalog::TenantId;
use crate::error::{Error, Result};

/// Metadata of one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub name: String,
}

/// An in-flight tenant move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Migration {
    pub from: PartitionId,
    pub to: PartitionId,
}

/// Listing entry for administrative output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionSummary {
    pub id: PartitionId,
    pub name: String,
    pub tenants: Vec<TenantId>,
    /// Whether a migration into or out of this partition is in progress.
    pub locked: bool,
}

/// Tenant to partition assignments plus in-flight migrations.
///
/// The map is plain data; [`super::PartitionRouter`] owns the live copy and
/// persists it in the meta tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitionMap {
    next_partition: u32,
    partitions: BTreeMap<PartitionId, PartitionInfo>,
    assignments: BTreeMap<TenantId, PartitionId>,
    #[serde(default)]
    migrations: BTreeMap<TenantId, Migration>,
}

impl PartitionMap {
    /// Resolve the partition a tenant's rows live in.
    pub fn resolve(&self, tenant_id: TenantId) -> Result<PartitionId> {
        if let Some(migration) = self.migrations.get(&tenant_id) {
            return Err(Error::PartitionLocked {
                partition: migration.from,
            });
        }
        self.assignments
            .get(&tenant_id)
            .copied()
            .ok_or(Error::UnroutablePartition { tenant_id })
    }

    pub fn assignment(&self, tenant_id: TenantId) -> Option<PartitionId> {
        self.assignments.get(&tenant_id).copied()
    }

    pub fn migration(&self, tenant_id: TenantId) -> Option<Migration> {
        self.migrations.get(&tenant_id).copied()
    }

    pub fn info(&self, id: PartitionId) -> Option<&PartitionInfo> {
        self.partitions.get(&id)
    }

    pub fn partition_by_name(&self, name: &str) -> Option<PartitionId> {
        self.partitions
            .iter()
            .find(|(_, info)| info.name == name)
            .map(|(id, _)| *id)
    }

    /// Tenants assigned to a partition.
    pub fn tenants_of(&self, id: PartitionId) -> Vec<TenantId> {
        self.assignments
            .iter()
            .filter(|(_, p)| **p == id)
            .map(|(t, _)| *t)
            .collect()
    }

    /// Register a new, empty partition.
    pub fn create(&mut self, name: &str) -> Result<PartitionId> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Config("partition name must not be blank".into()));
        }
        if self.partition_by_name(name).is_some() {
            return Err(Error::Config(format!("partition '{}' already exists", name)));
        }

        self.next_partition += 1;
        let id = PartitionId(self.next_partition);
        self.partitions.insert(
            id,
            PartitionInfo {
                name: name.to_string(),
            },
        );
        Ok(id)
    }

    /// Forget a partition. It must host no tenants and take part in no migration.
    pub fn remove(&mut self, id: PartitionId) -> Result<PartitionInfo> {
        if !self.partitions.contains_key(&id) {
            return Err(Error::Config(format!("unknown partition {}", id)));
        }
        let tenants = self.tenants_of(id);
        if !tenants.is_empty() {
            return Err(Error::Config(format!(
                "partition {} still hosts {} tenant(s)",
                id,
                tenants.len()
            )));
        }
        if self.migrations.values().any(|m| m.to == id || m.from == id) {
            return Err(Error::PartitionLocked { partition: id });
        }
        self.partitions
            .remove(&id)
            .ok_or_else(|| Error::Config(format!("unknown partition {}", id)))
    }

    /// Assign a tenant. Re-assigning to the same partition is a no-op.
    pub fn assign(&mut self, tenant_id: TenantId, id: PartitionId) -> Result<()> {
        if !self.partitions.contains_key(&id) {
            return Err(Error::Config(format!("unknown partition {}", id)));
        }
        match self.assignments.get(&tenant_id) {
            Some(current) if *current == id => Ok(()),
            Some(current) => Err(Error::Config(format!(
                "tenant {} is already assigned to partition {}; migrate it instead",
                tenant_id, current
            ))),
            None => {
                self.assignments.insert(tenant_id, id);
                Ok(())
            }
        }
    }

    /// Drop a tenant's assignment, returning the partition it had.
    pub fn unassign(&mut self, tenant_id: TenantId) -> Result<Option<PartitionId>> {
        if let Some(migration) = self.migrations.get(&tenant_id) {
            return Err(Error::PartitionLocked {
                partition: migration.from,
            });
        }
        Ok(self.assignments.remove(&tenant_id))
    }

    /// Mark a tenant as moving to `to`. Routing fails until the move ends.
    pub fn begin_migration(&mut self, tenant_id: TenantId, to: PartitionId) -> Result<Migration> {
        let from = self.resolve(tenant_id)?;
        if !self.partitions.contains_key(&to) {
            return Err(Error::Config(format!("unknown partition {}", to)));
        }
        if from == to {
            return Err(Error::Config(format!(
                "tenant {} already lives in partition {}",
                tenant_id, to
            )));
        }
        let migration = Migration { from, to };
        self.migrations.insert(tenant_id, migration);
        Ok(migration)
    }

    /// Point the tenant at its new partition and unlock it.
    pub fn complete_migration(&mut self, tenant_id: TenantId) -> Result<Migration> {
        let migration = self.take_migration(tenant_id)?;
        self.assignments.insert(tenant_id, migration.to);
        Ok(migration)
    }

    /// Unlock the tenant, leaving it where it was.
    pub fn abort_migration(&mut self, tenant_id: TenantId) -> Result<Migration> {
        self.take_migration(tenant_id)
    }

    fn take_migration(&mut self, tenant_id: TenantId) -> Result<Migration> {
        self.migrations
            .remove(&tenant_id)
            .ok_or_else(|| Error::Config(format!("tenant {} is not being migrated", tenant_id)))
    }

    /// Listing of every partition with its tenants.
    pub fn summaries(&self) -> Vec<PartitionSummary> {
        self.partitions
            .iter()
            .map(|(id, info)| PartitionSummary {
                id: *id,
                name: info.name.clone(),
                tenants: self.tenants_of(*id),
                locked: self
                    .migrations
                    .values()
                    .any(|m| m.from == *id || m.to == *id),
            })
            .collect()
    }

    /// Merge a declarative config into the map.
    ///
    /// Partitions are matched by name and created when missing. Tenants
    /// already assigned elsewhere are a configuration error. Returns whether
    /// anything changed.
    pub fn apply_config(&mut self, config: &PartitionMapConfig) -> Result<bool> {
        let before = self.clone();
        for spec in &config.partitions {
            let id = match self.partition_by_name(&spec.name) {
                Some(id) => id,
                None => self.create(&spec.name)?,
            };
            for tenant_id in &spec.tenants {
                self.assign(*tenant_id, id)?;
            }
        }
        Ok(*self != before)
    }
}

/// Declarative initial routing, loaded from JSON.
///
/// ```json
/// { "partitions": [ { "name": "eu", "tenants": [1, 2] }, { "name": "us" } ] }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitionMapConfig {
    #[serde(default)]
    pub partitions: Vec<PartitionSpec>,
}

/// One partition of a [`PartitionMapConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionSpec {
    pub name: String,
    #[serde(default)]
    pub tenants: Vec<TenantId>,
}

impl PartitionMapConfig {
    /// Parse from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))
    }

    /// Read from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }
}
