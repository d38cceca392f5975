//! Storage engine implementation.

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Db, Tree};

use super::key::{decode_id, row_key, row_prefix, stamp_key};
use super::{Record, StorageConfig};
use crate::catalog::{EntityKind, EntityRef, Row};
use crate::error::{Error, Result};
use crate::partition::PartitionId;

/// Tree name for sequences and persisted administrative state.
const META_TREE: &str = "meta";

/// Tree name for non-partitioned rows and their indexes.
const GLOBAL_TREE: &str = "global";

/// Prefix of per-partition tree names.
const PARTITION_TREE_PREFIX: &str = "partition:";

/// Prefix for id sequences in the meta tree.
const SEQUENCE_PREFIX: &str = "seq:";

/// The main storage engine wrapping sled.
pub struct StorageEngine {
    /// The underlying sled database.
    db: Db,

    /// Tree for sequences, the routing table and custom index definitions.
    meta: Tree,

    /// Tree for tenants, persons, institutions, courses and global indexes.
    global: Tree,
}

impl StorageEngine {
    /// Open or create a storage engine with the given configuration.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let db = config.to_sled_config().open()?;
        let meta = db.open_tree(META_TREE)?;
        let global = db.open_tree(GLOBAL_TREE)?;

        Ok(Self { db, meta, global })
    }

    /// Check if the database was recovered from a previous crash.
    pub fn was_recovered(&self) -> bool {
        self.db.was_recovered()
    }

    pub fn meta(&self) -> &Tree {
        &self.meta
    }

    pub fn global(&self) -> &Tree {
        &self.global
    }

    /// Open (or create) the tree backing a partition.
    pub fn partition_tree(&self, id: PartitionId) -> Result<Tree> {
        Ok(self.db.open_tree(partition_tree_name(id))?)
    }

    /// Drop the tree backing a partition. Returns whether it existed.
    pub fn drop_partition_tree(&self, id: PartitionId) -> Result<bool> {
        Ok(self.db.drop_tree(partition_tree_name(id))?)
    }

    /// Allocate the next id for an entity type.
    ///
    /// Sequences start at 1 and never hand out the same id twice, even when
    /// the write that used it is rolled back.
    pub fn next_id(&self, kind: EntityKind) -> Result<u64> {
        let key = format!("{}{}", SEQUENCE_PREFIX, kind.name());
        let next = self.meta.update_and_fetch(key.as_bytes(), |old| {
            let current = old.and_then(decode_id).unwrap_or(0);
            Some((current + 1).to_be_bytes().to_vec())
        })?;

        next.as_deref().and_then(decode_id).ok_or(Error::InvalidKey)
    }

    /// Fresh opaque value for a dependency stamp.
    pub fn next_stamp(&self) -> Result<Vec<u8>> {
        Ok(self.db.generate_id()?.to_be_bytes().to_vec())
    }

    /// Current dependency stamp of a row, if any writer has bumped it.
    pub fn stamp(&self, target: EntityRef) -> Result<Option<Vec<u8>>> {
        Ok(self
            .global
            .get(stamp_key(target.kind, target.id))?
            .map(|v| v.to_vec()))
    }

    /// Load a JSON value from the meta tree.
    pub fn load_meta<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.meta.get(key.as_bytes())? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| Error::Deserialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// Store a JSON value in the meta tree.
    pub fn store_meta<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = encode_meta(value)?;
        self.meta.insert(key.as_bytes(), bytes)?;
        Ok(())
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

/// Serialize a meta value.
pub fn encode_meta<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::Serialization(e.to_string()))
}

/// Encode a row as a stored record.
pub fn encode_row(row: &Row) -> Result<Vec<u8>> {
    Record::from_row(row)?.to_bytes()
}

/// Read one row from a tree.
pub fn read_row(tree: &Tree, kind: EntityKind, id: u64) -> Result<Option<Row>> {
    Ok(read_row_image(tree, kind, id)?.map(|(row, _)| row))
}

/// Read one row together with its stored bytes.
///
/// The bytes identify this exact version of the row and can be used as a
/// commit-time guard.
pub fn read_row_image(tree: &Tree, kind: EntityKind, id: u64) -> Result<Option<(Row, Vec<u8>)>> {
    match tree.get(row_key(kind, id))? {
        Some(bytes) => {
            let row = Record::from_bytes(&bytes)?.row()?;
            if row.kind() != kind {
                return Err(Error::InvalidKey);
            }
            Ok(Some((row, bytes.to_vec())))
        }
        None => Ok(None),
    }
}

/// Iterate every row of a kind stored in a tree, in id order.
pub fn scan_rows(tree: &Tree, kind: EntityKind) -> impl Iterator<Item = Result<Row>> {
    tree.scan_prefix(row_prefix(kind)).map(|entry| {
        let (_, bytes) = entry?;
        Record::from_bytes(&bytes)?.row()
    })
}

fn partition_tree_name(id: PartitionId) -> String {
    format!("{}{}", PARTITION_TREE_PREFIX, id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Person, PersonId};
    use crate::document::Document;

    fn person(id: u64, name: &str) -> Row {
        Row::Person(Person {
            id: PersonId(id),
            name: name.into(),
            birth_date: None,
            metadata: Document::object(),
        })
    }

    #[test]
    fn test_sequences_start_at_one_per_kind() {
        let engine = StorageEngine::open(&StorageConfig::temporary()).unwrap();

        assert_eq!(engine.next_id(EntityKind::Person).unwrap(), 1);
        assert_eq!(engine.next_id(EntityKind::Person).unwrap(), 2);
        assert_eq!(engine.next_id(EntityKind::Course).unwrap(), 1);
    }

    #[test]
    fn test_sequences_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig::new(dir.path());
        {
            let engine = StorageEngine::open(&config).unwrap();
            engine.next_id(EntityKind::Tenant).unwrap();
            engine.next_id(EntityKind::Tenant).unwrap();
            engine.flush().unwrap();
        }
        let engine = StorageEngine::open(&config).unwrap();
        assert_eq!(engine.next_id(EntityKind::Tenant).unwrap(), 3);
    }

    #[test]
    fn test_read_and_scan_rows() {
        let engine = StorageEngine::open(&StorageConfig::temporary()).unwrap();
        let tree = engine.global();
        for (id, name) in [(2, "Bea"), (1, "Ada")] {
            let row = person(id, name);
            tree.insert(row_key(EntityKind::Person, id), encode_row(&row).unwrap())
                .unwrap();
        }

        let ada = read_row(tree, EntityKind::Person, 1).unwrap().unwrap();
        assert_eq!(ada, person(1, "Ada"));
        assert!(read_row(tree, EntityKind::Person, 3).unwrap().is_none());

        let ids: Vec<u64> = scan_rows(tree, EntityKind::Person)
            .map(|r| r.unwrap().id())
            .collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(scan_rows(tree, EntityKind::Tenant).count(), 0);
    }

    #[test]
    fn test_meta_roundtrip_and_partition_trees() {
        let engine = StorageEngine::open(&StorageConfig::temporary()).unwrap();
        engine.store_meta("answer", &vec![4u32, 2]).unwrap();
        assert_eq!(
            engine.load_meta::<Vec<u32>>("answer").unwrap(),
            Some(vec![4, 2])
        );
        assert_eq!(engine.load_meta::<Vec<u32>>("missing").unwrap(), None);

        let tree = engine.partition_tree(PartitionId(3)).unwrap();
        tree.insert(b"k", &b"v"[..]).unwrap();
        assert!(engine.drop_partition_tree(PartitionId(3)).unwrap());
        let reopened = engine.partition_tree(PartitionId(3)).unwrap();
        assert!(reopened.is_empty());
    }

    #[test]
    fn test_stamps_change() {
        let engine = StorageEngine::open(&StorageConfig::temporary()).unwrap();
        let a = engine.next_stamp().unwrap();
        let b = engine.next_stamp().unwrap();
        assert_ne!(a, b);
        assert_eq!(engine.stamp(EntityRef::person(PersonId(1))).unwrap(), None);
    }
}
