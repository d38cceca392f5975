//! Database configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::index::UniquenessPolicy;
use crate::partition::{AutoPartition, PartitionMapConfig};
use crate::query::{DEFAULT_LOCK_TIMEOUT, DEFAULT_MAX_PAGE_SIZE};
use crate::storage::{RetryPolicy, StorageConfig};

/// Everything [`crate::Database::open`] needs.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Storage location and sled tuning.
    pub storage: StorageConfig,

    /// Retry budget for transient failures.
    pub retry: RetryPolicy,

    /// How long a write or query waits for its partition lock.
    pub lock_timeout: Duration,

    /// Routing of newly created tenants.
    pub auto_partition: AutoPartition,

    /// Enrollment uniqueness rule; fixed for the lifetime of the data.
    pub uniqueness: UniquenessPolicy,

    /// Upper bound on roster page sizes.
    pub max_page_size: usize,

    /// Declarative partitions and assignments merged in at open.
    pub partition_map: Option<PartitionMapConfig>,
}

impl DatabaseConfig {
    /// Configuration for a database stored at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_storage(StorageConfig::new(path))
    }

    /// Configuration for a throwaway database, removed on drop.
    pub fn temporary() -> Self {
        Self::with_storage(StorageConfig::temporary())
    }

    fn with_storage(storage: StorageConfig) -> Self {
        Self {
            storage,
            retry: RetryPolicy::default(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            auto_partition: AutoPartition::default(),
            uniqueness: UniquenessPolicy::default(),
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
            partition_map: None,
        }
    }

    pub fn with_cache_capacity(mut self, bytes: u64) -> Self {
        self.storage = self.storage.with_cache_capacity(bytes);
        self
    }

    pub fn with_flush_every_ms(mut self, ms: Option<u64>) -> Self {
        self.storage = self.storage.with_flush_every_ms(ms);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_auto_partition(mut self, auto: AutoPartition) -> Self {
        self.auto_partition = auto;
        self
    }

    pub fn with_uniqueness(mut self, policy: UniquenessPolicy) -> Self {
        self.uniqueness = policy;
        self
    }

    /// Set the page size bound. Zero is raised to one.
    pub fn with_max_page_size(mut self, max_page_size: usize) -> Self {
        self.max_page_size = max_page_size.max(1);
        self
    }

    pub fn with_partition_map(mut self, map: PartitionMapConfig) -> Self {
        self.partition_map = Some(map);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DatabaseConfig::temporary();
        assert_eq!(config.auto_partition, AutoPartition::PerTenant);
        assert_eq!(config.uniqueness, UniquenessPolicy::ActiveTriple);
        assert_eq!(config.max_page_size, 500);
        assert!(config.storage.temporary);
    }

    #[test]
    fn test_builders() {
        let config = DatabaseConfig::new("/tmp/enrolldb-test")
            .with_lock_timeout(Duration::from_millis(10))
            .with_auto_partition(AutoPartition::Disabled)
            .with_uniqueness(UniquenessPolicy::AbsoluteCourse)
            .with_max_page_size(0)
            .with_cache_capacity(1024);

        assert_eq!(config.lock_timeout, Duration::from_millis(10));
        assert_eq!(config.auto_partition, AutoPartition::Disabled);
        assert_eq!(config.uniqueness, UniquenessPolicy::AbsoluteCourse);
        assert_eq!(config.max_page_size, 1);
        assert_eq!(config.storage.cache_capacity, 1024);
    }
}
