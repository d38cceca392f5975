//! Partition router.

use std::collections::BTreeSet;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, Mutex, MutexGuard, RawRwLock, RwLock};
use sled::Tree;
use tracing::{debug, info};

use super::map::{Migration, PartitionMap, PartitionMapConfig, PartitionSummary};
use super::{AutoPartition, PartitionId};
use crate::catalog::TenantId;
use crate::error::{Error, Result};
use crate::storage::{encode_meta, StorageEngine, WriteBatch};

/// Meta key of the persisted routing table.
pub(crate) const PARTITION_MAP_KEY: &str = "partition_map";

/// A resolved partition: its tree and its lock.
#[derive(Debug)]
pub struct PartitionHandle {
    id: PartitionId,
    name: String,
    tree: Tree,
    lock: Arc<RwLock<()>>,
}

impl PartitionHandle {
    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tree holding the partition's enrollment rows and indexes.
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    fn write_for(self: &Arc<Self>, timeout: Duration) -> Result<PartitionWriteGuard> {
        let lock = self
            .lock
            .try_write_arc_for(timeout)
            .ok_or(Error::LockTimeout { partition: self.id })?;
        Ok(PartitionWriteGuard {
            handle: Arc::clone(self),
            _lock: lock,
        })
    }

    fn read_for(self: &Arc<Self>, timeout: Duration) -> Result<PartitionReadGuard> {
        let lock = self
            .lock
            .try_read_arc_for(timeout)
            .ok_or(Error::LockTimeout { partition: self.id })?;
        Ok(PartitionReadGuard {
            handle: Arc::clone(self),
            _lock: lock,
        })
    }
}

/// Exclusive access to a partition for the lifetime of the guard.
pub struct PartitionWriteGuard {
    handle: Arc<PartitionHandle>,
    _lock: ArcRwLockWriteGuard<RawRwLock, ()>,
}

impl Deref for PartitionWriteGuard {
    type Target = PartitionHandle;

    fn deref(&self) -> &PartitionHandle {
        &self.handle
    }
}

/// Shared access to a partition for the lifetime of the guard.
pub struct PartitionReadGuard {
    handle: Arc<PartitionHandle>,
    _lock: ArcRwLockReadGuard<RawRwLock, ()>,
}

impl Deref for PartitionReadGuard {
    type Target = PartitionHandle;

    fn deref(&self) -> &PartitionHandle {
        &self.handle
    }
}

/// Routes tenants to partitions and owns the routing table.
///
/// The table is loaded once at open and only changes through the
/// administrative methods. Changes are serialized by an internal mutex that
/// is always acquired after any partition lock the caller holds.
pub struct PartitionRouter {
    storage: Arc<StorageEngine>,
    map: RwLock<PartitionMap>,
    admin: Mutex<()>,
    handles: DashMap<PartitionId, Arc<PartitionHandle>>,
    auto: AutoPartition,
}

impl PartitionRouter {
    /// Load the persisted routing table and merge an optional declarative config.
    pub fn open(
        storage: Arc<StorageEngine>,
        auto: AutoPartition,
        config: Option<&PartitionMapConfig>,
    ) -> Result<Self> {
        let mut map: PartitionMap = storage.load_meta(PARTITION_MAP_KEY)?.unwrap_or_default();

        if let Some(config) = config {
            if map.apply_config(config)? {
                storage.store_meta(PARTITION_MAP_KEY, &map)?;
                info!(
                    partitions = config.partitions.len(),
                    "applied partition map config"
                );
            }
        }

        Ok(Self {
            storage,
            map: RwLock::new(map),
            admin: Mutex::new(()),
            handles: DashMap::new(),
            auto,
        })
    }

    pub fn auto_partition(&self) -> AutoPartition {
        self.auto
    }

    /// Resolve a tenant to its partition.
    ///
    /// Fails with [`Error::UnroutablePartition`] when the tenant has no
    /// assignment and [`Error::PartitionLocked`] while it is being migrated.
    pub fn route(&self, tenant_id: TenantId) -> Result<Arc<PartitionHandle>> {
        let id = self.map.read().resolve(tenant_id)?;
        debug!(tenant_id = tenant_id.0, partition = id.0, "routed tenant");
        self.handle(id)
    }

    /// Like [`Self::route`], but an unassigned tenant yields `None`.
    ///
    /// Used where "no partition" simply means "no enrollments".
    pub fn try_route(&self, tenant_id: TenantId) -> Result<Option<Arc<PartitionHandle>>> {
        match self.route(tenant_id) {
            Ok(handle) => Ok(Some(handle)),
            Err(Error::UnroutablePartition { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Route a tenant and take its partition's write lock.
    ///
    /// The route is re-checked once the lock is held, so a migration that
    /// started while waiting is reported as [`Error::PartitionLocked`].
    pub fn write(&self, tenant_id: TenantId, timeout: Duration) -> Result<PartitionWriteGuard> {
        let handle = self.route(tenant_id)?;
        let guard = handle.write_for(timeout)?;
        self.confirm_route(tenant_id, guard.id())?;
        Ok(guard)
    }

    /// Route a tenant and take its partition's read lock.
    pub fn read(&self, tenant_id: TenantId, timeout: Duration) -> Result<PartitionReadGuard> {
        let handle = self.route(tenant_id)?;
        let guard = handle.read_for(timeout)?;
        self.confirm_route(tenant_id, guard.id())?;
        Ok(guard)
    }

    fn confirm_route(&self, tenant_id: TenantId, locked: PartitionId) -> Result<()> {
        let current = self.map.read().resolve(tenant_id)?;
        if current != locked {
            return Err(Error::PartitionLocked { partition: locked });
        }
        Ok(())
    }

    /// Write-lock a set of partitions in ascending id order.
    ///
    /// Partitions dropped after the caller collected `ids` are skipped, so
    /// the returned guards may cover fewer ids than requested.
    pub(crate) fn lock_partitions(
        &self,
        ids: &BTreeSet<PartitionId>,
        timeout: Duration,
    ) -> Result<Vec<PartitionWriteGuard>> {
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(handle) = self.existing_handle(*id)? {
                guards.push(handle.write_for(timeout)?);
            }
        }
        Ok(guards)
    }

    /// Handle of a partition by id, bypassing tenant routing.
    pub(crate) fn handle(&self, id: PartitionId) -> Result<Arc<PartitionHandle>> {
        self.existing_handle(id)?
            .ok_or_else(|| Error::Config(format!("unknown partition {}", id)))
    }

    fn existing_handle(&self, id: PartitionId) -> Result<Option<Arc<PartitionHandle>>> {
        if let Some(handle) = self.handles.get(&id) {
            return Ok(Some(Arc::clone(handle.value())));
        }

        let Some(name) = self.map.read().info(id).map(|info| info.name.clone()) else {
            return Ok(None);
        };
        let handle = Arc::new(PartitionHandle {
            id,
            name,
            tree: self.storage.partition_tree(id)?,
            lock: Arc::new(RwLock::new(())),
        });

        Ok(Some(Arc::clone(
            self.handles.entry(id).or_insert(handle).value(),
        )))
    }

    /// Forget a partition that is no longer in the map and drop its tree.
    pub(crate) fn release_tree(&self, id: PartitionId) -> Result<()> {
        self.handles.remove(&id);
        self.storage.drop_partition_tree(id)?;
        Ok(())
    }

    /// Copy of the current routing table.
    pub fn snapshot(&self) -> PartitionMap {
        self.map.read().clone()
    }

    /// Every partition with its tenants.
    pub fn partitions(&self) -> Vec<PartitionSummary> {
        self.map.read().summaries()
    }

    /// Create an empty partition.
    pub fn create_partition(&self, name: &str) -> Result<PartitionId> {
        let mut edit = self.edit();
        let id = edit.map.create(name)?;
        edit.persist()?;
        info!(partition = id.0, name, "created partition");
        Ok(id)
    }

    /// Drop an empty partition and its tree.
    pub fn drop_partition(&self, id: PartitionId, timeout: Duration) -> Result<()> {
        let handle = self.handle(id)?;
        let _guard = handle.write_for(timeout)?;

        let mut edit = self.edit();
        edit.map.remove(id)?;
        edit.persist()?;

        self.release_tree(id)?;
        info!(partition = id.0, "dropped partition");
        Ok(())
    }

    /// Assign a tenant that has no partition yet.
    pub fn assign_tenant(&self, tenant_id: TenantId, id: PartitionId) -> Result<()> {
        let mut edit = self.edit();
        edit.map.assign(tenant_id, id)?;
        edit.persist()?;
        info!(tenant_id = tenant_id.0, partition = id.0, "assigned tenant");
        Ok(())
    }

    /// Lock a tenant for an offline move to `to`.
    ///
    /// Waits for in-flight writers on the source partition to finish; from
    /// then on every route for the tenant fails with
    /// [`Error::PartitionLocked`].
    pub fn begin_migration(
        &self,
        tenant_id: TenantId,
        to: PartitionId,
        timeout: Duration,
    ) -> Result<Migration> {
        let source = self.route(tenant_id)?;
        let _guard = source.write_for(timeout)?;

        let mut edit = self.edit();
        let migration = edit.map.begin_migration(tenant_id, to)?;
        edit.persist()?;
        info!(
            tenant_id = tenant_id.0,
            from = migration.from.0,
            to = migration.to.0,
            "began tenant migration"
        );
        Ok(migration)
    }

    /// Cancel a migration; the tenant stays in its source partition.
    pub fn abort_migration(&self, tenant_id: TenantId) -> Result<Migration> {
        let mut edit = self.edit();
        let migration = edit.map.abort_migration(tenant_id)?;
        edit.persist()?;
        info!(
            tenant_id = tenant_id.0,
            partition = migration.from.0,
            "aborted tenant migration"
        );
        Ok(migration)
    }

    /// Start a serialized change to the routing table.
    pub(crate) fn edit(&self) -> MapEdit<'_> {
        let admin = self.admin.lock();
        let map = self.map.read().clone();
        MapEdit {
            router: self,
            _admin: admin,
            map,
        }
    }
}

/// A pending routing table change.
///
/// The edited copy either commits together with a row batch
/// ([`MapEdit::stage`] then [`MapEdit::install`]) or on its own
/// ([`MapEdit::persist`]). Dropping the edit discards it.
pub(crate) struct MapEdit<'a> {
    router: &'a PartitionRouter,
    _admin: MutexGuard<'a, ()>,
    pub map: PartitionMap,
}

impl MapEdit<'_> {
    /// Add the edited table to a batch.
    pub fn stage(&self, batch: &mut WriteBatch) -> Result<()> {
        batch.put(
            self.router.storage.meta(),
            PARTITION_MAP_KEY.as_bytes().to_vec(),
            encode_meta(&self.map)?,
        );
        Ok(())
    }

    /// Make the edited table live after its batch committed.
    pub fn install(self) {
        *self.router.map.write() = self.map;
    }

    /// Persist and install.
    pub fn persist(self) -> Result<()> {
        self.router.storage.store_meta(PARTITION_MAP_KEY, &self.map)?;
        self.install();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageConfig;

    const TIMEOUT: Duration = Duration::from_millis(50);

    fn router() -> PartitionRouter {
        let storage = Arc::new(StorageEngine::open(&StorageConfig::temporary()).unwrap());
        PartitionRouter::open(storage, AutoPartition::Disabled, None).unwrap()
    }

    #[test]
    fn test_route_requires_assignment() {
        let router = router();
        assert!(matches!(
            router.route(TenantId(1)),
            Err(Error::UnroutablePartition { .. })
        ));
        assert!(router.try_route(TenantId(1)).unwrap().is_none());

        let p = router.create_partition("main").unwrap();
        router.assign_tenant(TenantId(1), p).unwrap();
        let handle = router.route(TenantId(1)).unwrap();
        assert_eq!(handle.id(), p);
        assert_eq!(handle.name(), "main");
    }

    #[test]
    fn test_write_lock_times_out() {
        let router = router();
        let p = router.create_partition("main").unwrap();
        router.assign_tenant(TenantId(1), p).unwrap();
        router.assign_tenant(TenantId(2), p).unwrap();

        let held = router.write(TenantId(1), TIMEOUT).unwrap();
        assert!(matches!(
            router.write(TenantId(2), TIMEOUT),
            Err(Error::LockTimeout { partition }) if partition == p
        ));
        assert!(matches!(
            router.read(TenantId(2), TIMEOUT),
            Err(Error::LockTimeout { .. })
        ));
        drop(held);

        let _a = router.read(TenantId(1), TIMEOUT).unwrap();
        let _b = router.read(TenantId(2), TIMEOUT).unwrap();
    }

    #[test]
    fn test_migration_blocks_routing() {
        let router = router();
        let a = router.create_partition("a").unwrap();
        let b = router.create_partition("b").unwrap();
        router.assign_tenant(TenantId(4), a).unwrap();

        router.begin_migration(TenantId(4), b, TIMEOUT).unwrap();
        assert!(matches!(
            router.write(TenantId(4), TIMEOUT),
            Err(Error::PartitionLocked { .. })
        ));
        assert!(router.partitions().iter().all(|p| p.locked));

        router.abort_migration(TenantId(4)).unwrap();
        assert_eq!(router.route(TenantId(4)).unwrap().id(), a);
    }

    #[test]
    fn test_begin_migration_waits_for_writers() {
        let router = router();
        let a = router.create_partition("a").unwrap();
        let b = router.create_partition("b").unwrap();
        router.assign_tenant(TenantId(4), a).unwrap();

        let writer = router.write(TenantId(4), TIMEOUT).unwrap();
        assert!(matches!(
            router.begin_migration(TenantId(4), b, TIMEOUT),
            Err(Error::LockTimeout { .. })
        ));
        drop(writer);
        router.begin_migration(TenantId(4), b, TIMEOUT).unwrap();
    }

    #[test]
    fn test_drop_partition() {
        let router = router();
        let p = router.create_partition("spare").unwrap();
        router.assign_tenant(TenantId(1), p).unwrap();
        assert!(router.drop_partition(p, TIMEOUT).is_err());

        let q = router.create_partition("empty").unwrap();
        router.drop_partition(q, TIMEOUT).unwrap();
        assert_eq!(router.partitions().len(), 1);
    }

    #[test]
    fn test_lock_partitions_in_order() {
        let router = router();
        let a = router.create_partition("a").unwrap();
        let b = router.create_partition("b").unwrap();
        let ids = BTreeSet::from([b, a]);

        let guards = router.lock_partitions(&ids, TIMEOUT).unwrap();
        let locked: Vec<_> = guards.iter().map(|g| g.id()).collect();
        assert_eq!(locked, vec![a, b]);
    }

    #[test]
    fn test_lock_partitions_skips_dropped() {
        let router = router();
        let a = router.create_partition("a").unwrap();
        let b = router.create_partition("b").unwrap();
        router.drop_partition(a, TIMEOUT).unwrap();

        let guards = router
            .lock_partitions(&BTreeSet::from([a, b]), TIMEOUT)
            .unwrap();
        let locked: Vec<_> = guards.iter().map(|g| g.id()).collect();
        assert_eq!(locked, vec![b]);
        drop(guards);

        assert!(matches!(router.handle(a), Err(Error::Config(_))));
    }

    #[test]
    fn test_routing_table_persists() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig::new(dir.path());
        let p;
        {
            let storage = Arc::new(StorageEngine::open(&config).unwrap());
            let router = PartitionRouter::open(storage, AutoPartition::Disabled, None).unwrap();
            p = router.create_partition("eu").unwrap();
            router.assign_tenant(TenantId(9), p).unwrap();
        }
        let storage = Arc::new(StorageEngine::open(&config).unwrap());
        let router = PartitionRouter::open(storage, AutoPartition::Disabled, None).unwrap();
        assert_eq!(router.route(TenantId(9)).unwrap().id(), p);
    }

    #[test]
    fn test_open_applies_config() {
        let storage = Arc::new(StorageEngine::open(&StorageConfig::temporary()).unwrap());
        let config = PartitionMapConfig::from_json(
            r#"{"partitions": [{"name": "eu", "tenants": [1]}]}"#,
        )
        .unwrap();
        let router = PartitionRouter::open(storage, AutoPartition::Disabled, Some(&config)).unwrap();

        assert_eq!(router.route(TenantId(1)).unwrap().name(), "eu");
    }
}
