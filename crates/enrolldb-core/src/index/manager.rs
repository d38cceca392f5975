//! Index maintenance and lookups.

use std::collections::BTreeSet;
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;
use sled::Tree;
use tracing::{debug, info};

use super::def::{IndexDef, IndexKind, Placement, UniquenessPolicy};
use super::planner::{self, Access, IndexPlan, QueryShape};
use crate::catalog::{Catalog, EntityKind, Row, TenantId};
use crate::document::{tokenize, Document};
use crate::error::{Error, Result};
use crate::storage::key::{
    decode_id, encode_text_into, index_prefix, prefix_successor, trailing_id, values_prefix,
    INDEX_FAMILY, PATH_FAMILY, TOKEN_FAMILY, UNIQUE_FAMILY,
};
use crate::storage::{read_row, scan_rows, IndexValue, StorageEngine, WriteBatch};

/// Meta key of the persisted custom index definitions.
const INDEX_DEFS_KEY: &str = "index_defs";

/// The trees a write or lookup may touch.
#[derive(Debug, Clone, Copy)]
pub struct IndexTrees<'a> {
    pub global: &'a Tree,
    pub partition: Option<&'a Tree>,
}

impl<'a> IndexTrees<'a> {
    /// Global tree only; enough for non-partitioned entities.
    pub fn global(global: &'a Tree) -> Self {
        Self {
            global,
            partition: None,
        }
    }

    pub fn with_partition(global: &'a Tree, partition: &'a Tree) -> Self {
        Self {
            global,
            partition: Some(partition),
        }
    }

    /// Tree holding an index with the given placement.
    pub fn for_placement(&self, placement: Placement) -> Result<&'a Tree> {
        match placement {
            Placement::Global => Ok(self.global),
            Placement::Partition => self
                .partition
                .ok_or_else(|| Error::Config("partition-local index used without a partition".into())),
        }
    }

    /// Tree holding rows of an entity.
    pub fn rows(&self, entity: EntityKind) -> Result<&'a Tree> {
        if entity.is_partitioned() {
            self.for_placement(Placement::Partition)
        } else {
            Ok(self.global)
        }
    }
}

/// One index match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct IndexHit {
    pub id: u64,
    /// Tenant of the matched row, when the entry records it.
    pub tenant_id: Option<TenantId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    key: Vec<u8>,
    value: Vec<u8>,
}

/// Every entry `row` contributes to `def`.
///
/// Sorted and inverted entries carry the row's tenant as value so that a
/// global index can locate partitioned rows; unique entries carry the owning id.
fn entries(def: &IndexDef, row: &Row) -> Vec<Entry> {
    if !def.covers(row) {
        return Vec::new();
    }

    let id = row.id().to_be_bytes();
    let locator = row
        .tenant_id()
        .map(|t| t.0.to_be_bytes().to_vec())
        .unwrap_or_default();

    match &def.kind {
        IndexKind::Sorted => {
            let mut key = values_prefix(INDEX_FAMILY, &def.name, &def.values(row));
            key.extend_from_slice(&id);
            vec![Entry {
                key,
                value: locator,
            }]
        }
        IndexKind::Unique { .. } => {
            let values = def.values(row);
            if values.contains(&IndexValue::Null) {
                return Vec::new();
            }
            vec![Entry {
                key: values_prefix(UNIQUE_FAMILY, &def.name, &values),
                value: id.to_vec(),
            }]
        }
        IndexKind::Inverted => {
            let Some(doc) = def.columns.first().and_then(|c| row.document(c)) else {
                return Vec::new();
            };
            let mut out = Vec::new();
            for (path, value) in doc.paths() {
                let mut key = index_prefix(PATH_FAMILY, &def.name);
                encode_text_into(&path, &mut key);
                value.encode_sortable_into(&mut key);
                key.extend_from_slice(&id);
                out.push(Entry {
                    key,
                    value: locator.clone(),
                });
            }
            for token in doc.tokens() {
                let mut key = index_prefix(TOKEN_FAMILY, &def.name);
                key.extend_from_slice(token.as_bytes());
                key.push(0x00);
                key.extend_from_slice(&id);
                out.push(Entry {
                    key,
                    value: locator.clone(),
                });
            }
            out
        }
    }
}

/// Owns the index definitions and keeps entries in step with rows.
pub struct IndexManager {
    storage: Arc<StorageEngine>,
    catalog: Arc<Catalog>,
    policy: UniquenessPolicy,
    defs: RwLock<Vec<Arc<IndexDef>>>,
}

impl IndexManager {
    /// Load the built-in set for `policy` plus any persisted custom indexes.
    pub fn open(
        storage: Arc<StorageEngine>,
        catalog: Arc<Catalog>,
        policy: UniquenessPolicy,
    ) -> Result<Self> {
        let mut defs: Vec<Arc<IndexDef>> = IndexDef::standard(policy)
            .into_iter()
            .map(Arc::new)
            .collect();

        let custom: Vec<IndexDef> = storage.load_meta(INDEX_DEFS_KEY)?.unwrap_or_default();
        for def in custom {
            if defs.iter().any(|d| d.name == def.name) {
                continue;
            }
            defs.push(Arc::new(def));
        }

        Ok(Self {
            storage,
            catalog,
            policy,
            defs: RwLock::new(defs),
        })
    }

    pub fn policy(&self) -> UniquenessPolicy {
        self.policy
    }

    /// All index definitions, built-in first.
    pub fn indexes(&self) -> Vec<IndexDef> {
        self.defs.read().iter().map(|d| (**d).clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<IndexDef>> {
        self.defs.read().iter().find(|d| d.name == name).cloned()
    }

    fn defs_for(&self, entity: EntityKind) -> Vec<Arc<IndexDef>> {
        self.defs
            .read()
            .iter()
            .filter(|d| d.entity == entity)
            .cloned()
            .collect()
    }

    /// Queue the index changes for a row transition.
    ///
    /// `before`/`after` are the row images; `None` means the row does not
    /// exist on that side (insert or removal).
    pub fn maintain(
        &self,
        batch: &mut WriteBatch,
        trees: IndexTrees<'_>,
        before: Option<&Row>,
        after: Option<&Row>,
    ) -> Result<()> {
        let Some(entity) = after.or(before).map(Row::kind) else {
            return Ok(());
        };
        for def in self.defs_for(entity) {
            maintain_def(&def, batch, trees, before, after)?;
        }
        Ok(())
    }

    /// Fail early if `row` collides with an entry owned by another row.
    ///
    /// The same check is repeated inside the commit transaction.
    pub fn probe_unique(&self, trees: IndexTrees<'_>, row: &Row) -> Result<()> {
        for def in self.defs_for(row.kind()).iter().filter(|d| d.is_unique()) {
            let tree = trees.for_placement(def.placement)?;
            for entry in entries(def, row) {
                if let Some(owner) = tree.get(&entry.key)? {
                    if owner.as_ref() != entry.value.as_slice() {
                        return Err(def.violation(row).into());
                    }
                }
            }
        }
        Ok(())
    }

    /// Pick the access path for a lookup.
    pub fn choose_index(&self, shape: &QueryShape) -> IndexPlan {
        let defs = self.defs.read();
        let plan = planner::choose(defs.iter().map(|d| d.as_ref()), shape);
        debug!(entity = %shape.entity, plan = %plan, "chose index");
        plan
    }

    /// Matches of an index plan, without loading rows.
    pub fn scan(&self, trees: IndexTrees<'_>, plan: &IndexPlan) -> Result<Vec<IndexHit>> {
        let Access::IndexScan {
            index,
            placement,
            prefix,
            range,
        } = &plan.access
        else {
            return scan_rows(trees.rows(plan.entity)?, plan.entity)
                .map(|row| {
                    let row = row?;
                    Ok(IndexHit {
                        id: row.id(),
                        tenant_id: row.tenant_id(),
                    })
                })
                .collect();
        };

        let def = self
            .get(index)
            .ok_or_else(|| Error::Config(format!("unknown index '{}'", index)))?;
        let tree = trees.for_placement(*placement)?;
        let family = if def.is_unique() {
            UNIQUE_FAMILY
        } else {
            INDEX_FAMILY
        };
        let start = values_prefix(family, &def.name, prefix);

        let (lower, upper) = match range {
            None => (start.clone(), prefix_successor(&start)),
            Some(range) => {
                let lower = match &range.lower {
                    Some(value) => {
                        let mut key = start.clone();
                        value.encode_sortable_into(&mut key);
                        key
                    }
                    None => start.clone(),
                };
                let upper = match &range.upper {
                    Some(value) => {
                        let mut key = start.clone();
                        value.encode_sortable_into(&mut key);
                        prefix_successor(&key)
                    }
                    None => prefix_successor(&start),
                };
                (lower, upper)
            }
        };
        let upper = match upper {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };

        let mut hits = Vec::new();
        for entry in tree.range((Bound::Included(lower), upper)) {
            let (key, value) = entry?;
            let hit = if def.is_unique() {
                IndexHit {
                    id: decode_id(&value).ok_or(Error::InvalidKey)?,
                    tenant_id: None,
                }
            } else {
                IndexHit {
                    id: trailing_id(&key).ok_or(Error::InvalidKey)?,
                    tenant_id: decode_id(&value).map(TenantId),
                }
            };
            hits.push(hit);
        }
        Ok(hits)
    }

    /// Rows matching a shape, in id order.
    ///
    /// Index entries only narrow the candidates; every fetched row is
    /// re-checked against the full shape.
    pub fn select(&self, trees: IndexTrees<'_>, shape: &QueryShape) -> Result<Vec<Row>> {
        let plan = self.choose_index(shape);
        self.fetch(trees, &plan, shape)
    }

    /// Execute a previously chosen plan.
    pub fn fetch(&self, trees: IndexTrees<'_>, plan: &IndexPlan, shape: &QueryShape) -> Result<Vec<Row>> {
        let rows_tree = trees.rows(shape.entity)?;

        if plan.access == Access::FullScan {
            let mut rows = Vec::new();
            for row in scan_rows(rows_tree, shape.entity) {
                let row = row?;
                if shape.matches(&row) {
                    rows.push(row);
                }
            }
            return Ok(rows);
        }

        let ids: BTreeSet<u64> = self.scan(trees, plan)?.into_iter().map(|h| h.id).collect();
        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = read_row(rows_tree, shape.entity, id)? {
                if shape.matches(&row) {
                    rows.push(row);
                }
            }
        }
        Ok(rows)
    }

    /// The inverted index over a document column, if one exists.
    pub fn inverted_index(&self, entity: EntityKind, column: &str) -> Option<Arc<IndexDef>> {
        self.defs
            .read()
            .iter()
            .find(|d| {
                d.entity == entity
                    && d.kind == IndexKind::Inverted
                    && d.columns.first().map(String::as_str) == Some(column)
            })
            .cloned()
    }

    /// Ids of rows whose document column matches every term of `query`.
    ///
    /// Each term must prefix-match some token of the document. A query with
    /// no terms means "no filter" and yields `None`.
    pub fn search_tokens(
        &self,
        trees: IndexTrees<'_>,
        entity: EntityKind,
        column: &str,
        query: &str,
    ) -> Result<Option<BTreeSet<u64>>> {
        let terms = tokenize(query);
        if terms.is_empty() {
            return Ok(None);
        }

        let Some(def) = self.inverted_index(entity, column) else {
            let mut ids = BTreeSet::new();
            for row in scan_rows(trees.rows(entity)?, entity) {
                let row = row?;
                let tokens = row.document(column).map(Document::tokens).unwrap_or_default();
                if terms
                    .iter()
                    .all(|term| tokens.iter().any(|t| t.starts_with(term.as_str())))
                {
                    ids.insert(row.id());
                }
            }
            return Ok(Some(ids));
        };

        let tree = trees.for_placement(def.placement)?;
        let mut matched: Option<BTreeSet<u64>> = None;
        for term in terms {
            let mut prefix = index_prefix(TOKEN_FAMILY, &def.name);
            prefix.extend_from_slice(term.as_bytes());

            let mut ids = BTreeSet::new();
            for key in tree.scan_prefix(prefix).keys() {
                ids.insert(trailing_id(&key?).ok_or(Error::InvalidKey)?);
            }

            let narrowed = match matched {
                Some(acc) => acc.intersection(&ids).copied().collect(),
                None => ids,
            };
            let done = narrowed.is_empty();
            matched = Some(narrowed);
            if done {
                break;
            }
        }
        Ok(matched)
    }

    /// Rows whose document column structurally contains `pattern`.
    pub fn find_containing(
        &self,
        trees: IndexTrees<'_>,
        entity: EntityKind,
        column: &str,
        pattern: &Document,
    ) -> Result<Vec<Row>> {
        let rows_tree = trees.rows(entity)?;
        let leaves = pattern.paths();

        let candidates = match self.inverted_index(entity, column) {
            Some(def) if !leaves.is_empty() => {
                let tree = trees.for_placement(def.placement)?;
                let mut matched: Option<BTreeSet<u64>> = None;
                for (path, value) in leaves {
                    let mut prefix = index_prefix(PATH_FAMILY, &def.name);
                    encode_text_into(&path, &mut prefix);
                    value.encode_sortable_into(&mut prefix);

                    let mut ids = BTreeSet::new();
                    for key in tree.scan_prefix(prefix).keys() {
                        ids.insert(trailing_id(&key?).ok_or(Error::InvalidKey)?);
                    }
                    matched = Some(match matched {
                        Some(acc) => acc.intersection(&ids).copied().collect(),
                        None => ids,
                    });
                }
                matched
            }
            _ => None,
        };

        let rows: Vec<Row> = match candidates {
            Some(ids) => {
                let mut rows = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(row) = read_row(rows_tree, entity, id)? {
                        rows.push(row);
                    }
                }
                rows
            }
            None => scan_rows(rows_tree, entity).collect::<Result<_>>()?,
        };

        Ok(rows
            .into_iter()
            .filter(|row| row.document(column).is_some_and(|d| d.contains(pattern)))
            .collect())
    }

    /// Register a custom index. Entries are not built; see [`Self::backfill`].
    pub fn register(&self, def: IndexDef) -> Result<Arc<IndexDef>> {
        if def.is_unique() {
            return Err(Error::Config(format!(
                "index '{}': unique indexes are built in",
                def.name
            )));
        }
        def.validate(&self.catalog)?;

        let mut defs = self.defs.write();
        if defs.iter().any(|d| d.name == def.name) {
            return Err(Error::Config(format!("index '{}' already exists", def.name)));
        }

        let def = Arc::new(IndexDef {
            builtin: false,
            ..def
        });
        defs.push(Arc::clone(&def));
        if let Err(e) = self.persist_custom(&defs) {
            defs.pop();
            return Err(e);
        }
        info!(index = %def.name, entity = %def.entity, "registered index");
        Ok(def)
    }

    /// Forget a custom index. Its entries are left for [`Self::purge`].
    pub fn unregister(&self, name: &str) -> Result<Arc<IndexDef>> {
        let mut defs = self.defs.write();
        let position = defs
            .iter()
            .position(|d| d.name == name)
            .ok_or_else(|| Error::Config(format!("unknown index '{}'", name)))?;
        if defs[position].builtin {
            return Err(Error::Config(format!(
                "index '{}' is built in and cannot be dropped",
                name
            )));
        }

        let def = defs.remove(position);
        if let Err(e) = self.persist_custom(&defs) {
            defs.insert(position, def);
            return Err(e);
        }
        info!(index = name, "unregistered index");
        Ok(def)
    }

    fn persist_custom(&self, defs: &[Arc<IndexDef>]) -> Result<()> {
        let custom: Vec<&IndexDef> = defs
            .iter()
            .filter(|d| !d.builtin)
            .map(|d| d.as_ref())
            .collect();
        self.storage.store_meta(INDEX_DEFS_KEY, &custom)
    }

    /// Build entries of `def` for every row already stored in `trees`.
    pub fn backfill(&self, def: &IndexDef, trees: IndexTrees<'_>) -> Result<usize> {
        let mut batch = WriteBatch::new();
        let mut rows = 0;
        for row in scan_rows(trees.rows(def.entity)?, def.entity) {
            let row = row?;
            maintain_def(def, &mut batch, trees, None, Some(&row))?;
            rows += 1;
        }
        batch.commit()?;
        Ok(rows)
    }

    /// Delete every entry of `def` from `tree`.
    pub fn purge(&self, def: &IndexDef, tree: &Tree) -> Result<usize> {
        let mut removed = 0;
        for family in [INDEX_FAMILY, UNIQUE_FAMILY, PATH_FAMILY, TOKEN_FAMILY] {
            for key in tree.scan_prefix(index_prefix(family, &def.name)).keys() {
                tree.remove(key?)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn maintain_def(
    def: &IndexDef,
    batch: &mut WriteBatch,
    trees: IndexTrees<'_>,
    before: Option<&Row>,
    after: Option<&Row>,
) -> Result<()> {
    let old = before.map(|r| entries(def, r)).unwrap_or_default();
    let new = after.map(|r| entries(def, r)).unwrap_or_default();
    if old.is_empty() && new.is_empty() {
        return Ok(());
    }

    let tree = trees.for_placement(def.placement)?;
    let new_keys: BTreeSet<&[u8]> = new.iter().map(|e| e.key.as_slice()).collect();
    for entry in &old {
        if !new_keys.contains(entry.key.as_slice()) {
            batch.remove(tree, entry.key.clone());
        }
    }

    for entry in &new {
        if let (true, Some(row)) = (def.is_unique(), after) {
            batch.require_vacant_or_owned(
                tree,
                entry.key.clone(),
                entry.value.clone(),
                def.violation(row),
            );
        }
        if !old.contains(entry) {
            batch.put(tree, entry.key.clone(), entry.value.clone());
        }
    }
    Ok(())
}
