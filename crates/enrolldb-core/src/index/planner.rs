//! Index selection.

use std::fmt;

use serde::Serialize;

use super::def::{IndexDef, IndexKind, Placement};
use crate::catalog::{EntityKind, Row};
use crate::storage::IndexValue;

/// Inclusive bounds on one column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RangeFilter {
    pub column: String,
    pub lower: Option<IndexValue>,
    pub upper: Option<IndexValue>,
}

impl RangeFilter {
    pub fn matches(&self, value: &IndexValue) -> bool {
        if *value == IndexValue::Null {
            return false;
        }
        let above = self.lower.as_ref().is_none_or(|lower| value >= lower);
        let below = self.upper.as_ref().is_none_or(|upper| value <= upper);
        above && below
    }
}

/// The filter part of a lookup: equality on some columns, optionally a
/// range on one more.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryShape {
    pub entity: EntityKind,
    pub equals: Vec<(String, IndexValue)>,
    pub range: Option<RangeFilter>,
}

impl QueryShape {
    pub fn new(entity: EntityKind) -> Self {
        Self {
            entity,
            equals: Vec::new(),
            range: None,
        }
    }

    /// Add an equality filter. A repeated column keeps its first value.
    pub fn eq(mut self, column: &str, value: IndexValue) -> Self {
        if self.equality(column).is_none() {
            self.equals.push((column.to_string(), value));
        }
        self
    }

    pub fn range(
        mut self,
        column: &str,
        lower: Option<IndexValue>,
        upper: Option<IndexValue>,
    ) -> Self {
        self.range = Some(RangeFilter {
            column: column.to_string(),
            lower,
            upper,
        });
        self
    }

    pub fn equality(&self, column: &str) -> Option<&IndexValue> {
        self.equals
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v)
    }

    /// Whether a row satisfies every filter of the shape.
    pub fn matches(&self, row: &Row) -> bool {
        if row.kind() != self.entity {
            return false;
        }
        let equal = self
            .equals
            .iter()
            .all(|(column, value)| row.field(column).as_ref() == Some(value));
        let in_range = self.range.as_ref().is_none_or(|range| {
            row.field(&range.column)
                .is_some_and(|value| range.matches(&value))
        });
        equal && in_range
    }
}

/// How rows are located.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Access {
    /// Prefix (and optional range) scan of a sorted or unique index.
    IndexScan {
        index: String,
        placement: Placement,
        prefix: Vec<IndexValue>,
        range: Option<RangeFilter>,
    },
    /// Scan every row of the entity in the target tree.
    FullScan,
}

/// Result of index selection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexPlan {
    pub entity: EntityKind,
    pub access: Access,
    /// Columns that must be re-checked on the fetched rows.
    pub residual: Vec<String>,
}

impl IndexPlan {
    pub fn index_name(&self) -> Option<&str> {
        match &self.access {
            Access::IndexScan { index, .. } => Some(index),
            Access::FullScan => None,
        }
    }
}

impl fmt::Display for IndexPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.access {
            Access::IndexScan {
                index,
                prefix,
                range,
                ..
            } => {
                let values: Vec<String> = prefix.iter().map(IndexValue::display).collect();
                write!(f, "index scan {} [{}]", index, values.join(", "))?;
                if let Some(range) = range {
                    write!(f, " range on {}", range.column)?;
                }
            }
            Access::FullScan => write!(f, "full scan of {}", self.entity)?,
        }
        if !self.residual.is_empty() {
            write!(f, ", residual: {}", self.residual.join(", "))?;
        }
        Ok(())
    }
}

/// Candidate ranking: more leading equality columns, then a usable range,
/// then tenant-leading, then name.
#[derive(Debug)]
struct Candidate<'a> {
    def: &'a IndexDef,
    matched: usize,
    range: bool,
}

fn candidate<'a>(def: &'a IndexDef, shape: &QueryShape) -> Option<Candidate<'a>> {
    if def.entity != shape.entity {
        return None;
    }

    let matched = def
        .columns
        .iter()
        .take_while(|c| shape.equality(c).is_some())
        .count();

    let range = match (&def.kind, &shape.range) {
        (IndexKind::Sorted, Some(range)) => def.columns.get(matched) == Some(&range.column),
        _ => false,
    };

    match &def.kind {
        IndexKind::Inverted => None,
        IndexKind::Unique { partial, .. } => {
            (partial.is_none() && matched == def.columns.len()).then_some(Candidate {
                def,
                matched,
                range: false,
            })
        }
        IndexKind::Sorted => (matched > 0 || range).then_some(Candidate {
            def,
            matched,
            range,
        }),
    }
}

/// Pick the best index for a shape among `defs`.
pub fn choose<'a>(defs: impl IntoIterator<Item = &'a IndexDef>, shape: &QueryShape) -> IndexPlan {
    let best = defs
        .into_iter()
        .filter_map(|def| candidate(def, shape))
        .max_by(|a, b| {
            a.matched
                .cmp(&b.matched)
                .then(a.range.cmp(&b.range))
                .then(a.def.leads_with_tenant().cmp(&b.def.leads_with_tenant()))
                .then(b.def.name.cmp(&a.def.name))
        });

    let mut residual: Vec<String> = shape.equals.iter().map(|(c, _)| c.clone()).collect();
    if let Some(range) = &shape.range {
        residual.push(range.column.clone());
    }

    match best {
        Some(Candidate {
            def,
            matched,
            range,
        }) => {
            let served = &def.columns[..matched + usize::from(range)];
            residual.retain(|c| !served.contains(c));
            IndexPlan {
                entity: shape.entity,
                access: Access::IndexScan {
                    index: def.name.clone(),
                    placement: def.placement,
                    prefix: def.columns[..matched]
                        .iter()
                        .filter_map(|c| shape.equality(c).cloned())
                        .collect(),
                    range: if range { shape.range.clone() } else { None },
                },
                residual,
            }
        }
        None => IndexPlan {
            entity: shape.entity,
            access: Access::FullScan,
            residual,
        },
    }
}
