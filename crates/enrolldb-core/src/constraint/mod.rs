//! Constraint enforcement.
//!
//! Inserts and updates are validated up front and their parent references
//! are re-checked inside the commit. Deletes are planned as an explicit,
//! dependents-first list of removals and reference clearings that commits
//! in a single batch.

mod plan;
mod validator;

pub use plan::{DeleteOutcome, DeletePlan, PlanStep};
pub use validator::{ConstraintEngine, MAX_CASCADE_DEPTH};
