//! Constraint validation and delete planning.
//!
//! The ConstraintEngine checks every write against the catalog, the parent
//! rows it references and the unique indexes, and turns a delete into an
//! explicit [`DeletePlan`] before anything is mutated.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use sled::Tree;
use tracing::debug;

use super::plan::{DeletePlan, Observed, PlanStep};
use crate::catalog::{Catalog, DeleteBehavior, EntityRef, RelationDef, Row, TenantId};
use crate::error::{Conflict, Error, Result};
use crate::index::{IndexManager, IndexTrees, QueryShape};
use crate::partition::{PartitionId, PartitionRouter};
use crate::storage::key::{row_key, stamp_key};
use crate::storage::{read_row, read_row_image, IndexValue, StorageEngine, WriteBatch};

/// Deepest dependency chain a delete may follow.
pub const MAX_CASCADE_DEPTH: usize = 8;

/// Constraint engine for enforcing enrollment invariants.
pub struct ConstraintEngine {
    catalog: Arc<Catalog>,
    storage: Arc<StorageEngine>,
    indexes: Arc<IndexManager>,
    router: Arc<PartitionRouter>,
}

impl ConstraintEngine {
    pub fn new(
        catalog: Arc<Catalog>,
        storage: Arc<StorageEngine>,
        indexes: Arc<IndexManager>,
        router: Arc<PartitionRouter>,
    ) -> Self {
        Self {
            catalog,
            storage,
            indexes,
            router,
        }
    }

    /// Validate a row about to be inserted.
    ///
    /// Checks:
    /// - the row's shape against the catalog
    /// - every non-null reference points at a live parent of the same tenant
    /// - no unique index already holds the row's key
    pub fn validate_insert(&self, trees: IndexTrees<'_>, row: &Row) -> Result<()> {
        self.catalog.check_shape(row)?;
        self.check_references(row)?;
        self.indexes.probe_unique(trees, row)
    }

    /// Validate a row replacing `before`.
    ///
    /// Same checks as an insert, with the row's own unique entries excluded,
    /// plus the tenant scope must not change.
    pub fn validate_update(&self, trees: IndexTrees<'_>, before: &Row, after: &Row) -> Result<()> {
        if before.entity_ref() != after.entity_ref() {
            return Err(Error::ConstraintViolation(format!(
                "cannot replace {} with {}",
                before.entity_ref(),
                after.entity_ref()
            )));
        }
        if before.tenant_id() != after.tenant_id() {
            return Err(Error::ConstraintViolation(format!(
                "{}.tenant_id is immutable",
                before.kind()
            )));
        }
        self.validate_insert(trees, after)
    }

    fn check_references(&self, row: &Row) -> Result<()> {
        for (field, target) in row.references() {
            let dangling = || Error::DanglingReference {
                entity: row.kind(),
                field,
                target: target.kind,
                id: target.id,
            };

            let parent = read_row(self.storage.global(), target.kind, target.id)?
                .ok_or_else(dangling)?;

            // A tenant-scoped parent is only visible inside its own tenant.
            if let (Some(own), Some(theirs)) = (row.tenant_id(), parent.tenant_id()) {
                if own != theirs {
                    return Err(dangling());
                }
            }
        }
        Ok(())
    }

    /// Re-check the row's parents inside the commit and bump their
    /// dependency stamps.
    ///
    /// A delete planned concurrently observes the old stamp and fails at
    /// commit instead of leaving this row orphaned. References already held
    /// by `previous` are re-checked but not stamped.
    pub fn stage_references(
        &self,
        batch: &mut WriteBatch,
        row: &Row,
        previous: Option<&Row>,
    ) -> Result<()> {
        let held: Vec<EntityRef> = previous
            .map(|p| p.references().into_iter().map(|(_, r)| r).collect())
            .unwrap_or_default();

        let global = self.storage.global();
        for (field, target) in row.references() {
            batch.require_present(
                global,
                row_key(target.kind, target.id),
                Conflict::Dangling {
                    entity: row.kind(),
                    field,
                    target: target.kind,
                    id: target.id,
                },
            );
            if !held.contains(&target) {
                batch.put(
                    global,
                    stamp_key(target.kind, target.id),
                    self.storage.next_stamp()?,
                );
            }
        }
        Ok(())
    }

    /// Plan the delete of `target` and everything that depends on it.
    ///
    /// Enrollments are never the root of a delete: they are soft-deleted and
    /// only physically removed through a cascade.
    pub fn validate_delete(&self, target: EntityRef) -> Result<DeletePlan> {
        if target.kind.is_partitioned() {
            return Err(Error::ConstraintViolation(format!(
                "{} rows are soft-deleted, not removed",
                target.kind
            )));
        }

        let (root, image) = read_row_image(self.storage.global(), target.kind, target.id)?
            .ok_or(Error::NotFound {
                entity: target.kind,
                id: target.id,
            })?;

        let mut walk = Walk {
            engine: self,
            visited: BTreeSet::new(),
            removals: Vec::new(),
            nullings: BTreeMap::new(),
            partitions: BTreeSet::new(),
            observed: Vec::new(),
        };
        walk.visit(root, image, None, 0)?;
        let plan = walk.finish(target);

        debug!(
            root = %target,
            steps = plan.steps.len(),
            partitions = plan.partitions.len(),
            "planned delete"
        );
        Ok(plan)
    }

    /// Rows of `relation.from_entity` referencing `parent`, with the
    /// partition they live in and their stored image.
    fn dependents(
        &self,
        relation: &RelationDef,
        parent: &Row,
    ) -> Result<Vec<(Row, Vec<u8>, Option<PartitionId>)>> {
        let global = self.storage.global();
        let reference = IndexValue::Int(parent.id() as i64);
        let mut shape = QueryShape::new(relation.from_entity);
        if let Some(tenant_id) = parent.tenant_id() {
            shape = shape.eq("tenant_id", IndexValue::Int(tenant_id.0 as i64));
        }
        shape = shape.eq(&relation.from_field, reference);

        if !relation.from_entity.is_partitioned() {
            let rows = self.indexes.select(IndexTrees::global(global), &shape)?;
            return self.reload(global, rows, None);
        }

        match parent.tenant_id() {
            Some(tenant_id) => {
                let Some(handle) = self.router.try_route(tenant_id)? else {
                    return Ok(Vec::new());
                };
                let trees = IndexTrees::with_partition(global, handle.tree());
                let rows = self.indexes.select(trees, &shape)?;
                self.reload(handle.tree(), rows, Some(handle.id()))
            }
            None => {
                // Untenanted parents (persons) reach their dependents through
                // the global reverse index.
                let plan = self.indexes.choose_index(&shape);
                let mut by_tenant: BTreeMap<TenantId, BTreeSet<u64>> = BTreeMap::new();
                for hit in self.indexes.scan(IndexTrees::global(global), &plan)? {
                    if let Some(tenant_id) = hit.tenant_id {
                        by_tenant.entry(tenant_id).or_default().insert(hit.id);
                    }
                }

                let mut out = Vec::new();
                for (tenant_id, ids) in by_tenant {
                    let Some(handle) = self.router.try_route(tenant_id)? else {
                        continue;
                    };
                    for id in ids {
                        let found = read_row_image(handle.tree(), relation.from_entity, id)?;
                        if let Some((row, image)) = found {
                            if shape.matches(&row) {
                                out.push((row, image, Some(handle.id())));
                            }
                        }
                    }
                }
                Ok(out)
            }
        }
    }

    fn reload(
        &self,
        tree: &Tree,
        rows: Vec<Row>,
        partition: Option<PartitionId>,
    ) -> Result<Vec<(Row, Vec<u8>, Option<PartitionId>)>> {
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some((row, image)) = read_row_image(tree, row.kind(), row.id())? {
                out.push((row, image, partition));
            }
        }
        Ok(out)
    }
}

/// Clear a nullable reference column.
fn null_reference(row: &Row, field: &str) -> Result<Row> {
    match (row, field) {
        (Row::Enrollment(e), "institution_id") => {
            let mut e = e.clone();
            e.institution_id = None;
            Ok(Row::Enrollment(e))
        }
        _ => Err(Error::ConstraintViolation(format!(
            "{}.{} cannot be set to null",
            row.kind(),
            field
        ))),
    }
}

struct Nulling {
    before: Row,
    after: Row,
    field: String,
    partition: Option<PartitionId>,
}

/// Depth-first traversal of the dependency graph.
struct Walk<'a> {
    engine: &'a ConstraintEngine,
    visited: BTreeSet<EntityRef>,
    removals: Vec<PlanStep>,
    nullings: BTreeMap<EntityRef, Nulling>,
    partitions: BTreeSet<PartitionId>,
    observed: Vec<Observed>,
}

impl Walk<'_> {
    fn visit(
        &mut self,
        row: Row,
        image: Vec<u8>,
        partition: Option<PartitionId>,
        depth: usize,
    ) -> Result<()> {
        if depth > MAX_CASCADE_DEPTH {
            return Err(Error::ConstraintViolation(format!(
                "delete cascades deeper than {} levels",
                MAX_CASCADE_DEPTH
            )));
        }
        let target = row.entity_ref();
        if !self.visited.insert(target) {
            return Ok(());
        }

        if !row.kind().is_partitioned() {
            // Read before enumerating dependents: any child inserted after
            // this point moves the stamp.
            let stamp = self.engine.storage.stamp(target)?;
            self.observed.push(Observed {
                partition: None,
                key: stamp_key(target.kind, target.id),
                value: stamp,
                target,
            });
        }

        let relations: Vec<RelationDef> = self
            .engine
            .catalog
            .relations_to(row.kind())
            .cloned()
            .collect();
        for relation in relations {
            for (dependent, dependent_image, dependent_partition) in
                self.engine.dependents(&relation, &row)?
            {
                match relation.on_delete {
                    DeleteBehavior::Cascade => {
                        self.visit(dependent, dependent_image, dependent_partition, depth + 1)?;
                    }
                    DeleteBehavior::SetNull => {
                        self.set_null(dependent, dependent_image, &relation, dependent_partition)?;
                    }
                }
            }
        }

        self.observe_row(&row, image, partition);
        self.removals.push(PlanStep::Remove { row, partition });
        Ok(())
    }

    fn set_null(
        &mut self,
        row: Row,
        image: Vec<u8>,
        relation: &RelationDef,
        partition: Option<PartitionId>,
    ) -> Result<()> {
        let target = row.entity_ref();
        if self.visited.contains(&target) || self.nullings.contains_key(&target) {
            return Ok(());
        }

        let after = null_reference(&row, &relation.from_field)?;
        self.observe_row(&row, image, partition);
        self.nullings.insert(
            target,
            Nulling {
                before: row,
                after,
                field: relation.from_field.clone(),
                partition,
            },
        );
        Ok(())
    }

    fn observe_row(&mut self, row: &Row, image: Vec<u8>, partition: Option<PartitionId>) {
        if let Some(id) = partition {
            self.partitions.insert(id);
        }
        self.observed.push(Observed {
            partition,
            key: row_key(row.kind(), row.id()),
            value: Some(image),
            target: row.entity_ref(),
        });
    }

    fn finish(self, root: EntityRef) -> DeletePlan {
        let Walk {
            visited,
            removals,
            nullings,
            partitions,
            observed,
            ..
        } = self;

        // A row that is both nulled and removed is only removed.
        let mut steps: Vec<PlanStep> = nullings
            .into_iter()
            .filter(|(target, _)| !visited.contains(target))
            .map(|(_, n)| PlanStep::SetNull {
                before: n.before,
                after: n.after,
                field: n.field,
                partition: n.partition,
            })
            .collect();
        steps.extend(removals);

        let mut seen = BTreeSet::new();
        let observed = observed
            .into_iter()
            .filter(|o| seen.insert((o.partition, o.key.clone())))
            .collect();

        DeletePlan {
            root,
            steps,
            partitions,
            observed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{
        Course, CourseId, Enrollment, EnrollmentId, EnrollmentStatus, EntityKind, Institution,
        InstitutionId, Person, PersonId, Tenant,
    };
    use crate::document::Document;
    use crate::index::UniquenessPolicy;
    use crate::partition::AutoPartition;
    use crate::storage::{encode_row, StorageConfig};
    use chrono::NaiveDate;

    struct Fixture {
        storage: Arc<StorageEngine>,
        indexes: Arc<IndexManager>,
        router: Arc<PartitionRouter>,
        engine: ConstraintEngine,
    }

    fn fixture() -> Fixture {
        let catalog = Arc::new(Catalog::standard());
        let storage = Arc::new(StorageEngine::open(&StorageConfig::temporary()).unwrap());
        let indexes = Arc::new(
            IndexManager::open(
                Arc::clone(&storage),
                Arc::clone(&catalog),
                UniquenessPolicy::ActiveTriple,
            )
            .unwrap(),
        );
        let router = Arc::new(
            PartitionRouter::open(Arc::clone(&storage), AutoPartition::Disabled, None).unwrap(),
        );
        let engine = ConstraintEngine::new(
            catalog,
            Arc::clone(&storage),
            Arc::clone(&indexes),
            Arc::clone(&router),
        );
        Fixture {
            storage,
            indexes,
            router,
            engine,
        }
    }

    impl Fixture {
        fn put(&self, row: Row) {
            let global = self.storage.global();
            let handle = row
                .kind()
                .is_partitioned()
                .then(|| self.router.route(row.tenant_id().unwrap()).unwrap());
            let trees = match &handle {
                Some(handle) => IndexTrees::with_partition(global, handle.tree()),
                None => IndexTrees::global(global),
            };

            let mut batch = WriteBatch::new();
            batch.put(
                trees.rows(row.kind()).unwrap(),
                row_key(row.kind(), row.id()),
                encode_row(&row).unwrap(),
            );
            self.indexes.maintain(&mut batch, trees, None, Some(&row)).unwrap();
            batch.commit().unwrap();
        }
    }

    fn tenant(id: u64) -> Row {
        Row::Tenant(Tenant {
            id: TenantId(id),
            name: format!("tenant {}", id),
            description: None,
        })
    }

    fn institution(id: u64, tenant: u64) -> Row {
        Row::Institution(Institution {
            id: InstitutionId(id),
            tenant_id: TenantId(tenant),
            name: format!("institution {}", id),
            location: None,
            details: Document::object(),
        })
    }

    fn course(id: u64, tenant: u64, institution: u64) -> Row {
        Row::Course(Course {
            id: CourseId(id),
            tenant_id: TenantId(tenant),
            institution_id: InstitutionId(institution),
            name: format!("course {}", id),
            duration_hours: None,
            details: Document::object(),
        })
    }

    fn person(id: u64) -> Row {
        Row::Person(Person {
            id: PersonId(id),
            name: format!("person {}", id),
            birth_date: None,
            metadata: Document::object(),
        })
    }

    fn enrollment(id: u64, tenant: u64, institution: u64, person: u64, course: u64) -> Row {
        Row::Enrollment(Enrollment {
            id: EnrollmentId(id),
            tenant_id: TenantId(tenant),
            institution_id: Some(InstitutionId(institution)),
            person_id: PersonId(person),
            course_id: CourseId(course),
            enrollment_date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            status: EnrollmentStatus::Active,
            is_deleted: false,
        })
    }

    /// Tenant 1 in partition "p1" with two institutions; course 20 belongs to
    /// institution 10, course 21 to institution 11. Enrollment 30 points at
    /// institution 10 but course 21.
    fn seeded() -> Fixture {
        let fx = fixture();
        let partition = fx.router.create_partition("p1").unwrap();
        fx.router.assign_tenant(TenantId(1), partition).unwrap();

        fx.put(tenant(1));
        fx.put(institution(10, 1));
        fx.put(institution(11, 1));
        fx.put(course(20, 1, 10));
        fx.put(course(21, 1, 11));
        fx.put(person(40));
        fx.put(enrollment(30, 1, 10, 40, 21));
        fx.put(enrollment(31, 1, 11, 40, 20));
        fx
    }

    #[test]
    fn test_dangling_reference() {
        let fx = seeded();
        let trees = IndexTrees::global(fx.storage.global());
        let err = fx.engine.validate_insert(trees, &course(22, 1, 99)).unwrap_err();
        assert!(matches!(
            err,
            Error::DanglingReference {
                field: "institution_id",
                target: EntityKind::Institution,
                id: 99,
                ..
            }
        ));
    }

    #[test]
    fn test_cross_tenant_parent_is_dangling() {
        let fx = seeded();
        fx.put(tenant(2));
        let trees = IndexTrees::global(fx.storage.global());
        assert!(matches!(
            fx.engine.validate_insert(trees, &course(22, 2, 10)),
            Err(Error::DanglingReference { .. })
        ));
    }

    #[test]
    fn test_tenant_id_is_immutable() {
        let fx = seeded();
        fx.put(tenant(2));
        let trees = IndexTrees::global(fx.storage.global());
        assert!(matches!(
            fx.engine
                .validate_update(trees, &institution(10, 1), &institution(10, 2)),
            Err(Error::ConstraintViolation(_))
        ));
    }

    #[test]
    fn test_institution_delete_plan() {
        let fx = seeded();
        let plan = fx
            .engine
            .validate_delete(EntityRef::institution(InstitutionId(10)))
            .unwrap();

        // Course 20 goes, and with it enrollment 31; enrollment 30 is only nulled.
        let removed: Vec<EntityRef> = plan.removed().collect();
        assert_eq!(
            removed,
            vec![
                EntityRef::enrollment(EnrollmentId(31)),
                EntityRef::course(CourseId(20)),
                EntityRef::institution(InstitutionId(10)),
            ]
        );
        let nulled: Vec<EntityRef> = plan.nulled().collect();
        assert_eq!(nulled, vec![EntityRef::enrollment(EnrollmentId(30))]);
        assert!(matches!(plan.steps[0], PlanStep::SetNull { .. }));
        assert_eq!(plan.partitions.len(), 1);
    }

    #[test]
    fn test_tenant_delete_plan_removes_everything() {
        let fx = seeded();
        let plan = fx.engine.validate_delete(EntityRef::tenant(TenantId(1))).unwrap();

        assert_eq!(plan.count(EntityKind::Enrollment), 2);
        assert_eq!(plan.count(EntityKind::Course), 2);
        assert_eq!(plan.count(EntityKind::Institution), 2);
        assert_eq!(plan.nulled().count(), 0);
        assert_eq!(plan.steps.last().map(PlanStep::target), Some(EntityRef::tenant(TenantId(1))));
    }

    #[test]
    fn test_person_delete_uses_reverse_index() {
        let fx = seeded();
        let plan = fx.engine.validate_delete(EntityRef::person(PersonId(40))).unwrap();
        assert_eq!(plan.count(EntityKind::Enrollment), 2);
        assert_eq!(plan.partitions.len(), 1);
    }

    #[test]
    fn test_enrollment_is_never_a_delete_root() {
        let fx = seeded();
        assert!(matches!(
            fx.engine.validate_delete(EntityRef::enrollment(EnrollmentId(30))),
            Err(Error::ConstraintViolation(_))
        ));
        assert!(matches!(
            fx.engine.validate_delete(EntityRef::course(CourseId(99))),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_stale_stamp_aborts_plan() {
        let fx = seeded();
        let plan = fx
            .engine
            .validate_delete(EntityRef::institution(InstitutionId(11)))
            .unwrap();

        // A new course for institution 11 lands after planning.
        let mut batch = WriteBatch::new();
        let late = course(22, 1, 11);
        fx.engine.stage_references(&mut batch, &late, None).unwrap();
        batch.commit().unwrap();
        fx.put(late);

        let handle = fx.router.route(TenantId(1)).unwrap();
        let trees = BTreeMap::from([(handle.id(), handle.tree().clone())]);
        let mut batch = WriteBatch::new();
        plan.stage(&mut batch, &fx.indexes, fx.storage.global(), &trees)
            .unwrap();
        assert!(matches!(batch.commit(), Err(Error::WriteConflict { .. })));
    }

    #[test]
    fn test_null_reference_only_for_nullable_columns() {
        let row = enrollment(1, 1, 10, 40, 20);
        let nulled = null_reference(&row, "institution_id").unwrap();
        assert_eq!(nulled.as_enrollment().and_then(|e| e.institution_id), None);
        assert!(null_reference(&row, "course_id").is_err());
    }
}
