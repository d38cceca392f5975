//! Atomic multi-tree write batches.

use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Transactional, Tree};

use crate::error::{Conflict, Error, Result};

#[derive(Debug, Clone)]
enum BatchOp {
    Put {
        slot: usize,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Remove {
        slot: usize,
        key: Vec<u8>,
    },
}

/// A condition re-checked inside the transaction before any write happens.
#[derive(Debug, Clone)]
enum Guard {
    /// The key must exist.
    Present {
        slot: usize,
        key: Vec<u8>,
        conflict: Conflict,
    },
    /// The key must be absent or already hold `owner`.
    VacantOrOwned {
        slot: usize,
        key: Vec<u8>,
        owner: Vec<u8>,
        conflict: Conflict,
    },
    /// The key must still hold the value observed while planning.
    Unchanged {
        slot: usize,
        key: Vec<u8>,
        expected: Option<Vec<u8>>,
        conflict: Conflict,
    },
}

/// Row, index and metadata writes that commit in one sled transaction.
///
/// Writes are buffered in order and replayed inside a transaction spanning
/// every tree they touch. Guards capture the reads a write depends on
/// (parent existence, unique slots, dependency stamps) so a racing writer
/// aborts the batch instead of producing a dangling or duplicate row.
#[derive(Debug, Default)]
pub struct WriteBatch {
    trees: Vec<Tree>,
    ops: Vec<BatchOp>,
    guards: Vec<Guard>,
}

impl WriteBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&mut self, tree: &Tree) -> usize {
        let name = tree.name();
        match self.trees.iter().position(|t| t.name() == name) {
            Some(slot) => slot,
            None => {
                self.trees.push(tree.clone());
                self.trees.len() - 1
            }
        }
    }

    /// Queue an insert or overwrite.
    pub fn put(&mut self, tree: &Tree, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        let slot = self.slot(tree);
        self.ops.push(BatchOp::Put {
            slot,
            key: key.into(),
            value: value.into(),
        });
    }

    /// Queue a removal.
    pub fn remove(&mut self, tree: &Tree, key: impl Into<Vec<u8>>) {
        let slot = self.slot(tree);
        self.ops.push(BatchOp::Remove {
            slot,
            key: key.into(),
        });
    }

    /// Abort with `conflict` unless `key` exists at commit time.
    pub fn require_present(&mut self, tree: &Tree, key: impl Into<Vec<u8>>, conflict: Conflict) {
        let slot = self.slot(tree);
        self.guards.push(Guard::Present {
            slot,
            key: key.into(),
            conflict,
        });
    }

    /// Abort with `conflict` if `key` holds anything other than `owner`.
    pub fn require_vacant_or_owned(
        &mut self,
        tree: &Tree,
        key: impl Into<Vec<u8>>,
        owner: impl Into<Vec<u8>>,
        conflict: Conflict,
    ) {
        let slot = self.slot(tree);
        self.guards.push(Guard::VacantOrOwned {
            slot,
            key: key.into(),
            owner: owner.into(),
            conflict,
        });
    }

    /// Abort with `conflict` if `key` no longer holds `expected`.
    pub fn require_unchanged(
        &mut self,
        tree: &Tree,
        key: impl Into<Vec<u8>>,
        expected: Option<Vec<u8>>,
        conflict: Conflict,
    ) {
        let slot = self.slot(tree);
        self.guards.push(Guard::Unchanged {
            slot,
            key: key.into(),
            expected,
            conflict,
        });
    }

    /// Number of queued writes.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Commit the batch atomically.
    ///
    /// All guards are evaluated first; if any fails nothing is written and
    /// the guard's conflict is returned as an [`Error`].
    pub fn commit(self) -> Result<()> {
        if self.ops.is_empty() && self.guards.is_empty() {
            return Ok(());
        }

        let result: std::result::Result<(), TransactionError<Error>> =
            self.trees.as_slice().transaction(|views| {
                for guard in &self.guards {
                    let failed = match guard {
                        Guard::Present { slot, key, conflict } => {
                            views[*slot].get(key)?.is_none().then_some(conflict)
                        }
                        Guard::VacantOrOwned {
                            slot,
                            key,
                            owner,
                            conflict,
                        } => match views[*slot].get(key)? {
                            Some(current) if current.as_ref() != owner.as_slice() => Some(conflict),
                            _ => None,
                        },
                        Guard::Unchanged {
                            slot,
                            key,
                            expected,
                            conflict,
                        } => {
                            let current = views[*slot].get(key)?;
                            (current.as_deref() != expected.as_deref()).then_some(conflict)
                        }
                    };
                    if let Some(conflict) = failed {
                        return Err(ConflictableTransactionError::Abort(Error::from(
                            conflict.clone(),
                        )));
                    }
                }

                for op in &self.ops {
                    match op {
                        BatchOp::Put { slot, key, value } => {
                            views[*slot].insert(key.as_slice(), value.as_slice())?;
                        }
                        BatchOp::Remove { slot, key } => {
                            views[*slot].remove(key.as_slice())?;
                        }
                    }
                }
                Ok(())
            });

        match result {
            Ok(()) => Ok(()),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(Error::Storage(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::EntityKind;

    fn db() -> sled::Db {
        sled::Config::new().temporary(true).open().unwrap()
    }

    fn missing(id: u64) -> Conflict {
        Conflict::Missing {
            entity: EntityKind::Course,
            id,
        }
    }

    #[test]
    fn test_commit_spans_trees() {
        let db = db();
        let a = db.open_tree("a").unwrap();
        let b = db.open_tree("b").unwrap();
        a.insert(b"old", &b"1"[..]).unwrap();

        let mut batch = WriteBatch::new();
        batch.put(&a, b"k1".to_vec(), b"v1".to_vec());
        batch.put(&b, b"k2".to_vec(), b"v2".to_vec());
        batch.remove(&a, b"old".to_vec());
        assert_eq!(batch.len(), 3);
        batch.commit().unwrap();

        assert_eq!(a.get(b"k1").unwrap().unwrap().as_ref(), b"v1");
        assert_eq!(b.get(b"k2").unwrap().unwrap().as_ref(), b"v2");
        assert!(a.get(b"old").unwrap().is_none());
    }

    #[test]
    fn test_failed_guard_writes_nothing() {
        let db = db();
        let a = db.open_tree("a").unwrap();
        let b = db.open_tree("b").unwrap();

        let mut batch = WriteBatch::new();
        batch.put(&a, b"k1".to_vec(), b"v1".to_vec());
        batch.put(&b, b"k2".to_vec(), b"v2".to_vec());
        batch.require_present(&b, b"parent".to_vec(), missing(5));

        let err = batch.commit().unwrap_err();
        assert!(matches!(err, Error::NotFound { id: 5, .. }));
        assert!(a.is_empty());
        assert!(b.is_empty());
    }

    #[test]
    fn test_vacant_or_owned() {
        let db = db();
        let tree = db.open_tree("u").unwrap();
        tree.insert(b"slot", 7u64.to_be_bytes().to_vec()).unwrap();

        let mut same_owner = WriteBatch::new();
        same_owner.require_vacant_or_owned(
            &tree,
            b"slot".to_vec(),
            7u64.to_be_bytes().to_vec(),
            missing(1),
        );
        same_owner.put(&tree, b"other".to_vec(), b"x".to_vec());
        same_owner.commit().unwrap();

        let mut other_owner = WriteBatch::new();
        other_owner.require_vacant_or_owned(
            &tree,
            b"slot".to_vec(),
            8u64.to_be_bytes().to_vec(),
            missing(2),
        );
        assert!(other_owner.commit().is_err());
    }

    #[test]
    fn test_unchanged_guard() {
        let db = db();
        let tree = db.open_tree("s").unwrap();

        let mut batch = WriteBatch::new();
        batch.require_unchanged(&tree, b"stamp".to_vec(), None, missing(1));
        batch.put(&tree, b"stamp".to_vec(), b"1".to_vec());
        batch.commit().unwrap();

        let mut stale = WriteBatch::new();
        stale.require_unchanged(&tree, b"stamp".to_vec(), None, missing(1));
        assert!(stale.commit().is_err());

        let mut fresh = WriteBatch::new();
        fresh.require_unchanged(&tree, b"stamp".to_vec(), Some(b"1".to_vec()), missing(1));
        fresh.commit().unwrap();
    }

    #[test]
    fn test_empty_batch_is_noop() {
        assert!(WriteBatch::new().is_empty());
        WriteBatch::new().commit().unwrap();
    }
}
