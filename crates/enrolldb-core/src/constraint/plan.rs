//! Delete plans.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use sled::Tree;

use crate::catalog::{EntityKind, EntityRef, Row};
use crate::error::{Conflict, Error, Result};
use crate::index::{IndexManager, IndexTrees};
use crate::partition::PartitionId;
use crate::storage::key::{row_key, stamp_key};
use crate::storage::{encode_row, WriteBatch};

/// One mutation of a delete plan.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanStep {
    /// Physically remove a row and its index entries.
    Remove {
        row: Row,
        partition: Option<PartitionId>,
    },
    /// Rewrite a dependent with a reference cleared.
    SetNull {
        before: Row,
        after: Row,
        field: String,
        partition: Option<PartitionId>,
    },
}

impl PlanStep {
    pub fn target(&self) -> EntityRef {
        match self {
            PlanStep::Remove { row, .. } => row.entity_ref(),
            PlanStep::SetNull { before, .. } => before.entity_ref(),
        }
    }

    pub fn partition(&self) -> Option<PartitionId> {
        match self {
            PlanStep::Remove { partition, .. } | PlanStep::SetNull { partition, .. } => *partition,
        }
    }
}

impl fmt::Display for PlanStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanStep::Remove { row, .. } => write!(f, "remove {}", row.entity_ref()),
            PlanStep::SetNull { before, field, .. } => {
                write!(f, "set {}.{} = null", before.entity_ref(), field)
            }
        }
    }
}

/// A value the plan was computed from, re-checked at commit.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Observed {
    pub partition: Option<PartitionId>,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub target: EntityRef,
}

/// Every mutation a delete implies, ordered dependents first.
///
/// Reference clearing comes before removals; removals are in post-order so a
/// row is never removed while a dependent of it is still planned to exist.
#[derive(Debug, Clone, PartialEq)]
pub struct DeletePlan {
    pub root: EntityRef,
    pub steps: Vec<PlanStep>,
    /// Partitions whose trees the plan writes.
    pub partitions: BTreeSet<PartitionId>,
    pub(crate) observed: Vec<Observed>,
}

impl DeletePlan {
    pub fn removed(&self) -> impl Iterator<Item = EntityRef> + '_ {
        self.steps.iter().filter_map(|s| match s {
            PlanStep::Remove { row, .. } => Some(row.entity_ref()),
            PlanStep::SetNull { .. } => None,
        })
    }

    pub fn nulled(&self) -> impl Iterator<Item = EntityRef> + '_ {
        self.steps.iter().filter_map(|s| match s {
            PlanStep::SetNull { before, .. } => Some(before.entity_ref()),
            PlanStep::Remove { .. } => None,
        })
    }

    /// Number of steps touching rows of `kind`.
    pub fn count(&self, kind: EntityKind) -> usize {
        self.steps.iter().filter(|s| s.target().kind == kind).count()
    }

    /// Whether two plans touch the same rows and partitions.
    pub fn same_footprint(&self, other: &DeletePlan) -> bool {
        self.partitions == other.partitions
            && self.steps.iter().map(PlanStep::target).collect::<BTreeSet<_>>()
                == other.steps.iter().map(PlanStep::target).collect::<BTreeSet<_>>()
    }

    /// Queue every mutation and guard of the plan.
    ///
    /// `trees` must hold the tree of every partition in [`Self::partitions`].
    pub fn stage(
        &self,
        batch: &mut WriteBatch,
        indexes: &IndexManager,
        global: &Tree,
        trees: &BTreeMap<PartitionId, Tree>,
    ) -> Result<()> {
        for observed in &self.observed {
            let tree = match observed.partition {
                None => global,
                Some(_) => {
                    index_trees(global, trees, observed.partition)?.rows(EntityKind::Enrollment)?
                }
            };
            batch.require_unchanged(
                tree,
                observed.key.clone(),
                observed.value.clone(),
                Conflict::Stale {
                    entity: observed.target.kind,
                    id: observed.target.id,
                },
            );
        }

        for step in &self.steps {
            let step_trees = index_trees(global, trees, step.partition())?;
            match step {
                PlanStep::Remove { row, .. } => {
                    let rows = step_trees.rows(row.kind())?;
                    batch.remove(rows, row_key(row.kind(), row.id()));
                    if !row.kind().is_partitioned() {
                        batch.remove(global, stamp_key(row.kind(), row.id()));
                    }
                    indexes.maintain(batch, step_trees, Some(row), None)?;
                }
                PlanStep::SetNull { before, after, .. } => {
                    let rows = step_trees.rows(after.kind())?;
                    batch.put(rows, row_key(after.kind(), after.id()), encode_row(after)?);
                    indexes.maintain(batch, step_trees, Some(before), Some(after))?;
                }
            }
        }
        Ok(())
    }
}

fn index_trees<'a>(
    global: &'a Tree,
    trees: &'a BTreeMap<PartitionId, Tree>,
    partition: Option<PartitionId>,
) -> Result<IndexTrees<'a>> {
    match partition {
        None => Ok(IndexTrees::global(global)),
        Some(id) => trees
            .get(&id)
            .map(|tree| IndexTrees::with_partition(global, tree))
            .ok_or_else(|| Error::Config(format!("partition {} is not locked", id))),
    }
}

/// What a committed delete did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub removed: Vec<EntityRef>,
    pub nulled: Vec<EntityRef>,
}

impl From<&DeletePlan> for DeleteOutcome {
    fn from(plan: &DeletePlan) -> Self {
        Self {
            removed: plan.removed().collect(),
            nulled: plan.nulled().collect(),
        }
    }
}

impl DeleteOutcome {
    pub fn removed_count(&self, kind: EntityKind) -> usize {
        self.removed.iter().filter(|r| r.kind == kind).count()
    }
}
