//! Storage layer for enrolldb.
//!
//! This module provides a sled-based storage engine: one `meta` tree, one
//! `global` tree for non-partitioned rows and one tree per partition, with
//! atomic multi-tree write batches and bounded retry for transient failures.

mod batch;
mod config;
mod engine;
mod record;
mod retry;

pub mod key;

pub use batch::WriteBatch;
pub use config::{RetryPolicy, StorageConfig};
pub use engine::{encode_meta, encode_row, read_row, read_row_image, scan_rows, StorageEngine};
pub use key::IndexValue;
pub use record::{current_timestamp, Record};
pub use retry::with_retry;
