//! Query façade.
//!
//! Reads are expressed as a closed set of [`QueryIntent`]s; there is no way
//! to pass a free-form predicate. Each intent is tenant-scoped and bounded.
//!
//! Roster pages are addressed by offset. Pages are consistent with each
//! other only while the roster is not being modified.

mod executor;
mod explain;
mod intent;

pub use executor::{QueryExecutor, DEFAULT_LOCK_TIMEOUT};
pub use explain::ExecutionPlan;
pub use intent::{QueryIntent, QueryOutput, RosterEntry, DEFAULT_MAX_PAGE_SIZE};
