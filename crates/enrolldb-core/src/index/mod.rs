//! Secondary indexes.
//!
//! Four entry families share the global and partition trees:
//!
//! - sorted entries `x | name | values.. | id` for equality prefixes and ranges;
//! - unique entries `u | name | values..` owned by exactly one row;
//! - path entries `p | name | path | value | id` for document containment;
//! - token entries `t | name | token | 0x00 | id` for full-text prefix search.
//!
//! Entries are written in the same batch as the row they describe, so a
//! committed row and its entries are always consistent.

mod def;
mod manager;
mod planner;

pub use def::{IndexDef, IndexKind, Placement, RowPredicate, UniquenessPolicy, Violation};
pub use manager::{IndexHit, IndexManager, IndexTrees};
pub use planner::{choose, Access, IndexPlan, QueryShape, RangeFilter};
