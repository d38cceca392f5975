//! Database wrapper combining storage, routing, indexes and constraints.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::NaiveDate;
use sled::Tree;
use tracing::{debug, info, warn};

use crate::catalog::{
    Catalog, Course, CourseId, Enrollment, EnrollmentId, EntityKind, EntityRef, Institution,
    InstitutionId, NewCourse, NewEnrollment, NewInstitution, NewPerson, NewTenant, Person,
    PersonId, Row, Tenant, TenantId,
};
use crate::config::DatabaseConfig;
use crate::constraint::{ConstraintEngine, DeleteOutcome};
use crate::document::Document;
use crate::error::{Conflict, Error, Result};
use crate::index::{IndexDef, IndexManager, IndexTrees, Placement, QueryShape, UniquenessPolicy};
use crate::partition::{
    dedicated_partition_name, AutoPartition, Migration, PartitionId, PartitionRouter,
    PartitionSummary,
};
use crate::query::{ExecutionPlan, QueryExecutor, QueryIntent, QueryOutput};
use crate::storage::key::row_key;
use crate::storage::{
    encode_row, read_row, read_row_image, scan_rows, with_retry, IndexValue, StorageEngine,
    WriteBatch,
};
use crate::store::EnrollmentStore;

/// Meta key recording the uniqueness policy the data was written under.
const UNIQUENESS_POLICY_KEY: &str = "uniqueness_policy";

fn id_value(id: u64) -> IndexValue {
    IndexValue::Int(id as i64)
}

/// An open enrollment database.
///
/// All operations are synchronous and may be called from any number of
/// threads. Enrollment writes serialize per partition; everything else
/// relies on guarded multi-tree transactions.
pub struct Database {
    config: DatabaseConfig,
    storage: Arc<StorageEngine>,
    catalog: Arc<Catalog>,
    router: Arc<PartitionRouter>,
    indexes: Arc<IndexManager>,
    constraints: ConstraintEngine,
}

impl Database {
    /// Open (or create) a database.
    pub fn open(config: DatabaseConfig) -> Result<Self> {
        let storage = Arc::new(StorageEngine::open(&config.storage)?);
        let catalog = Arc::new(Catalog::standard());

        match storage.load_meta::<UniquenessPolicy>(UNIQUENESS_POLICY_KEY)? {
            Some(stored) if stored != config.uniqueness => {
                return Err(Error::Config(format!(
                    "data was written under the {:?} uniqueness policy, not {:?}",
                    stored, config.uniqueness
                )));
            }
            Some(_) => {}
            None => storage.store_meta(UNIQUENESS_POLICY_KEY, &config.uniqueness)?,
        }

        let router = Arc::new(PartitionRouter::open(
            Arc::clone(&storage),
            config.auto_partition,
            config.partition_map.as_ref(),
        )?);
        let indexes = Arc::new(IndexManager::open(
            Arc::clone(&storage),
            Arc::clone(&catalog),
            config.uniqueness,
        )?);
        let constraints = ConstraintEngine::new(
            Arc::clone(&catalog),
            Arc::clone(&storage),
            Arc::clone(&indexes),
            Arc::clone(&router),
        );

        info!(
            recovered = storage.was_recovered(),
            partitions = router.partitions().len(),
            uniqueness = ?config.uniqueness,
            "opened database"
        );

        Ok(Self {
            config,
            storage,
            catalog,
            router,
            indexes,
            constraints,
        })
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn storage(&self) -> &StorageEngine {
        &self.storage
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// The partition router, for administrative inspection.
    pub fn router(&self) -> &PartitionRouter {
        &self.router
    }

    /// The index manager, for administrative inspection.
    pub fn indexes(&self) -> &IndexManager {
        &self.indexes
    }

    pub fn constraints(&self) -> &ConstraintEngine {
        &self.constraints
    }

    /// Create a query executor for this database.
    pub fn executor(&self) -> QueryExecutor<'_> {
        QueryExecutor::new(&self.storage, &self.indexes, &self.router)
            .with_lock_timeout(self.config.lock_timeout)
            .with_max_page_size(self.config.max_page_size)
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.storage.flush()
    }

    fn global(&self) -> &Tree {
        self.storage.global()
    }

    // Global rows

    fn stage_global_insert(&self, row: &Row) -> Result<WriteBatch> {
        let global = self.global();
        let trees = IndexTrees::global(global);
        self.constraints.validate_insert(trees, row)?;

        let mut batch = WriteBatch::new();
        batch.put(global, row_key(row.kind(), row.id()), encode_row(row)?);
        self.constraints.stage_references(&mut batch, row, None)?;
        self.indexes.maintain(&mut batch, trees, None, Some(row))?;
        Ok(batch)
    }

    fn insert_global(&self, operation: &str, row: &Row) -> Result<()> {
        with_retry(&self.config.retry, operation, || {
            self.stage_global_insert(row)?.commit()
        })?;
        debug!(row = %row.entity_ref(), "inserted");
        Ok(())
    }

    fn update_global(&self, operation: &str, row: &Row) -> Result<()> {
        let global = self.global();
        let trees = IndexTrees::global(global);
        let (kind, id) = (row.kind(), row.id());

        with_retry(&self.config.retry, operation, || {
            let (before, image) =
                read_row_image(global, kind, id)?.ok_or(Error::NotFound { entity: kind, id })?;
            self.constraints.validate_update(trees, &before, row)?;

            let mut batch = WriteBatch::new();
            batch.require_unchanged(
                global,
                row_key(kind, id),
                Some(image),
                Conflict::Stale { entity: kind, id },
            );
            batch.put(global, row_key(kind, id), encode_row(row)?);
            self.constraints.stage_references(&mut batch, row, Some(&before))?;
            self.indexes.maintain(&mut batch, trees, Some(&before), Some(row))?;
            batch.commit()
        })?;
        debug!(row = %row.entity_ref(), "updated");
        Ok(())
    }

    fn get_global(&self, kind: EntityKind, id: u64) -> Result<Row> {
        read_row(self.global(), kind, id)?.ok_or(Error::NotFound { entity: kind, id })
    }

    fn delete(&self, target: EntityRef) -> Result<DeleteOutcome> {
        let outcome = with_retry(&self.config.retry, "delete", || self.try_delete(target))?;
        info!(
            root = %target,
            removed = outcome.removed.len(),
            nulled = outcome.nulled.len(),
            "deleted"
        );
        Ok(outcome)
    }

    fn try_delete(&self, target: EntityRef) -> Result<DeleteOutcome> {
        let draft = self.constraints.validate_delete(target)?;

        let mut locked = draft.partitions.clone();
        let tenant = (target.kind == EntityKind::Tenant).then_some(TenantId(target.id));
        if let Some(tenant_id) = tenant {
            if let Some(handle) = self.router.try_route(tenant_id)? {
                locked.insert(handle.id());
            }
        }
        let guards = self.router.lock_partitions(&locked, self.config.lock_timeout)?;

        let held: BTreeSet<PartitionId> = guards.iter().map(|guard| guard.id()).collect();

        // Dependents may have changed while waiting for the locks.
        let plan = self.constraints.validate_delete(target)?;
        if !plan.partitions.is_subset(&held) {
            return Err(Error::WriteConflict {
                entity: target.kind,
                id: target.id,
            });
        }

        let trees: BTreeMap<PartitionId, Tree> = guards
            .iter()
            .map(|guard| (guard.id(), guard.tree().clone()))
            .collect();
        let mut batch = WriteBatch::new();
        plan.stage(&mut batch, &self.indexes, self.global(), &trees)?;

        let Some(tenant_id) = tenant else {
            batch.commit()?;
            return Ok(DeleteOutcome::from(&plan));
        };

        // A deleted tenant loses its assignment, and its dedicated
        // partition if nobody else lives there.
        let mut edit = self.router.edit();
        let released = edit.map.unassign(tenant_id)?;
        let dedicated = released.filter(|id| {
            edit.map.tenants_of(*id).is_empty()
                && edit
                    .map
                    .info(*id)
                    .is_some_and(|info| info.name == dedicated_partition_name(tenant_id))
        });
        if let Some(id) = dedicated {
            edit.map.remove(id)?;
        }
        edit.stage(&mut batch)?;
        batch.commit()?;
        edit.install();
        drop(guards);

        if let Some(id) = dedicated {
            self.router.release_tree(id)?;
            info!(tenant_id = tenant_id.0, partition = id.0, "dropped dedicated partition");
        }
        Ok(DeleteOutcome::from(&plan))
    }

    // Enrollments

    fn modify_enrollment(
        &self,
        operation: &str,
        tenant_id: TenantId,
        id: EnrollmentId,
        change: impl Fn(&Enrollment) -> Enrollment,
    ) -> Result<Enrollment> {
        with_retry(&self.config.retry, operation, || {
            let partition = self.router.write(tenant_id, self.config.lock_timeout)?;
            let trees = IndexTrees::with_partition(self.global(), partition.tree());

            let current = read_row(partition.tree(), EntityKind::Enrollment, id.0)?
                .and_then(Row::into_enrollment)
                .filter(|e| e.tenant_id == tenant_id)
                .ok_or(Error::NotFound {
                    entity: EntityKind::Enrollment,
                    id: id.0,
                })?;
            let updated = change(&current);
            if updated == current {
                return Ok(updated);
            }

            let before = Row::Enrollment(current);
            let after = Row::Enrollment(updated.clone());
            self.constraints.validate_update(trees, &before, &after)?;

            let mut batch = WriteBatch::new();
            batch.put(
                partition.tree(),
                row_key(EntityKind::Enrollment, id.0),
                encode_row(&after)?,
            );
            self.constraints
                .stage_references(&mut batch, &after, Some(&before))?;
            self.indexes
                .maintain(&mut batch, trees, Some(&before), Some(&after))?;
            batch.commit()?;

            debug!(
                operation,
                tenant_id = tenant_id.0,
                partition = partition.id().0,
                enrollment_id = id.0,
                "modified enrollment"
            );
            Ok(updated)
        })
    }

    // Partition administration

    pub fn partitions(&self) -> Vec<PartitionSummary> {
        self.router.partitions()
    }

    pub fn create_partition(&self, name: &str) -> Result<PartitionId> {
        self.router.create_partition(name)
    }

    /// Drop a partition that hosts no tenant.
    pub fn drop_partition(&self, id: PartitionId) -> Result<()> {
        self.router.drop_partition(id, self.config.lock_timeout)
    }

    pub fn assign_tenant(&self, tenant_id: TenantId, partition: PartitionId) -> Result<()> {
        self.router.assign_tenant(tenant_id, partition)
    }

    /// Remove a tenant's assignment. Refused while it has enrollments.
    pub fn unassign_tenant(&self, tenant_id: TenantId) -> Result<PartitionId> {
        let partition = self.router.write(tenant_id, self.config.lock_timeout)?;
        let trees = IndexTrees::with_partition(self.global(), partition.tree());
        let shape =
            QueryShape::new(EntityKind::Enrollment).eq("tenant_id", id_value(tenant_id.0));
        if !self.indexes.select(trees, &shape)?.is_empty() {
            return Err(Error::ConstraintViolation(format!(
                "tenant {} still has enrollments in partition {}",
                tenant_id,
                partition.id()
            )));
        }

        let mut edit = self.router.edit();
        edit.map.unassign(tenant_id)?;
        edit.persist()?;
        info!(
            tenant_id = tenant_id.0,
            partition = partition.id().0,
            "unassigned tenant"
        );
        Ok(partition.id())
    }

    /// Lock a tenant for a move to `to`; see [`Self::complete_migration`].
    pub fn begin_migration(&self, tenant_id: TenantId, to: PartitionId) -> Result<Migration> {
        self.router
            .begin_migration(tenant_id, to, self.config.lock_timeout)
    }

    pub fn abort_migration(&self, tenant_id: TenantId) -> Result<Migration> {
        self.router.abort_migration(tenant_id)
    }

    /// Move a migrating tenant's enrollments and index entries to the target
    /// partition and switch its route, in one batch. Returns the number of
    /// rows moved.
    pub fn complete_migration(&self, tenant_id: TenantId) -> Result<usize> {
        with_retry(&self.config.retry, "complete_migration", || {
            self.try_complete_migration(tenant_id)
        })
    }

    /// Begin and complete a migration in one call.
    pub fn migrate_tenant(&self, tenant_id: TenantId, to: PartitionId) -> Result<usize> {
        self.begin_migration(tenant_id, to)?;
        self.complete_migration(tenant_id)
    }

    fn try_complete_migration(&self, tenant_id: TenantId) -> Result<usize> {
        let migration = self.router.snapshot().migration(tenant_id).ok_or_else(|| {
            Error::Config(format!("tenant {} is not being migrated", tenant_id))
        })?;

        let ids = BTreeSet::from([migration.from, migration.to]);
        let guards = self.router.lock_partitions(&ids, self.config.lock_timeout)?;
        let tree_of = |id: PartitionId| -> Result<Tree> {
            guards
                .iter()
                .find(|guard| guard.id() == id)
                .map(|guard| guard.tree().clone())
                .ok_or_else(|| Error::Config(format!("partition {} is not locked", id)))
        };
        let source = tree_of(migration.from)?;
        let target = tree_of(migration.to)?;

        let global = self.global();
        let from = IndexTrees::with_partition(global, &source);
        let to = IndexTrees::with_partition(global, &target);
        let shape =
            QueryShape::new(EntityKind::Enrollment).eq("tenant_id", id_value(tenant_id.0));
        let rows = self.indexes.select(from, &shape)?;

        let mut batch = WriteBatch::new();
        if migration.from != migration.to {
            for row in &rows {
                let key = row_key(row.kind(), row.id());
                batch.remove(&source, key.clone());
                self.indexes.maintain(&mut batch, from, Some(row), None)?;
                batch.put(&target, key, encode_row(row)?);
                self.indexes.maintain(&mut batch, to, None, Some(row))?;
            }
        }

        let mut edit = self.router.edit();
        if edit.map.migration(tenant_id) != Some(migration) {
            return Err(Error::Config(format!(
                "migration of tenant {} changed while completing",
                tenant_id
            )));
        }
        edit.map.complete_migration(tenant_id)?;
        edit.stage(&mut batch)?;
        batch.commit()?;
        edit.install();

        info!(
            tenant_id = tenant_id.0,
            from = migration.from.0,
            to = migration.to.0,
            rows = rows.len(),
            "completed tenant migration"
        );
        Ok(rows.len())
    }

    // Index administration

    /// Register a custom index and build it over existing rows.
    pub fn create_index(&self, def: IndexDef) -> Result<IndexDef> {
        let def = self.indexes.register(def)?;
        match self.backfill(&def) {
            Ok(rows) => {
                info!(index = %def.name, rows, "built index");
                Ok((*def).clone())
            }
            Err(e) => {
                let rollback = self
                    .indexes
                    .unregister(&def.name)
                    .and_then(|_| self.purge(&def));
                if let Err(cleanup) = rollback {
                    warn!(index = %def.name, error = %cleanup, "failed to roll back index");
                }
                Err(e)
            }
        }
    }

    /// Drop a custom index and its entries.
    pub fn drop_index(&self, name: &str) -> Result<IndexDef> {
        let def = self.indexes.unregister(name)?;
        let entries = self.purge(&def)?;
        info!(index = name, entries, "dropped index");
        Ok((*def).clone())
    }

    fn backfill(&self, def: &IndexDef) -> Result<usize> {
        let global = self.global();
        match def.placement {
            Placement::Global => self.indexes.backfill(def, IndexTrees::global(global)),
            Placement::Partition => {
                let mut rows = 0;
                for summary in self.router.partitions() {
                    let ids = BTreeSet::from([summary.id]);
                    for guard in self.router.lock_partitions(&ids, self.config.lock_timeout)? {
                        let trees = IndexTrees::with_partition(global, guard.tree());
                        rows += self.indexes.backfill(def, trees)?;
                    }
                }
                Ok(rows)
            }
        }
    }

    fn purge(&self, def: &IndexDef) -> Result<usize> {
        match def.placement {
            Placement::Global => self.indexes.purge(def, self.global()),
            Placement::Partition => {
                let mut entries = 0;
                for summary in self.router.partitions() {
                    let ids = BTreeSet::from([summary.id]);
                    for guard in self.router.lock_partitions(&ids, self.config.lock_timeout)? {
                        entries += self.indexes.purge(def, guard.tree())?;
                    }
                }
                Ok(entries)
            }
        }
    }

    // Lookups on global entities

    fn select_global(&self, shape: &QueryShape) -> Result<Vec<Row>> {
        self.indexes
            .select(IndexTrees::global(self.global()), shape)
    }

    /// Persons with exactly this name.
    pub fn find_persons_by_name(&self, name: &str) -> Result<Vec<Person>> {
        let shape =
            QueryShape::new(EntityKind::Person).eq("name", IndexValue::Text(name.to_string()));
        Ok(persons(self.select_global(&shape)?))
    }

    /// Persons born within the inclusive bounds. Persons without a birth
    /// date never match.
    pub fn persons_born_between(
        &self,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Vec<Person>> {
        let shape = QueryShape::new(EntityKind::Person).range(
            "birth_date",
            from.map(IndexValue::Date),
            to.map(IndexValue::Date),
        );
        Ok(persons(self.select_global(&shape)?))
    }

    /// Persons whose metadata contains `pattern`.
    pub fn find_persons(&self, pattern: &Document) -> Result<Vec<Person>> {
        let rows = self.indexes.find_containing(
            IndexTrees::global(self.global()),
            EntityKind::Person,
            "metadata",
            pattern,
        )?;
        Ok(persons(rows))
    }

    /// Persons whose metadata matches every term of `query` by token prefix.
    /// A blank query matches everyone.
    pub fn search_persons(&self, query: &str) -> Result<Vec<Person>> {
        let global = self.global();
        let ids = self.indexes.search_tokens(
            IndexTrees::global(global),
            EntityKind::Person,
            "metadata",
            query,
        )?;

        let rows = match ids {
            Some(ids) => {
                let mut rows = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(row) = read_row(global, EntityKind::Person, id)? {
                        rows.push(row);
                    }
                }
                rows
            }
            None => scan_rows(global, EntityKind::Person).collect::<Result<Vec<_>>>()?,
        };
        Ok(persons(rows))
    }

    pub fn list_institutions(&self, tenant_id: TenantId) -> Result<Vec<Institution>> {
        let shape =
            QueryShape::new(EntityKind::Institution).eq("tenant_id", id_value(tenant_id.0));
        Ok(self
            .select_global(&shape)?
            .into_iter()
            .filter_map(Row::into_institution)
            .collect())
    }

    pub fn list_courses(
        &self,
        tenant_id: TenantId,
        institution_id: Option<InstitutionId>,
    ) -> Result<Vec<Course>> {
        let mut shape = QueryShape::new(EntityKind::Course).eq("tenant_id", id_value(tenant_id.0));
        if let Some(institution_id) = institution_id {
            shape = shape.eq("institution_id", id_value(institution_id.0));
        }
        Ok(self
            .select_global(&shape)?
            .into_iter()
            .filter_map(Row::into_course)
            .collect())
    }

    /// A tenant's courses whose details contain `pattern`.
    pub fn find_courses(&self, tenant_id: TenantId, pattern: &Document) -> Result<Vec<Course>> {
        let rows = self.indexes.find_containing(
            IndexTrees::global(self.global()),
            EntityKind::Course,
            "details",
            pattern,
        )?;
        Ok(rows
            .into_iter()
            .filter_map(Row::into_course)
            .filter(|course| course.tenant_id == tenant_id)
            .collect())
    }
}

fn persons(rows: Vec<Row>) -> Vec<Person> {
    rows.into_iter().filter_map(Row::into_person).collect()
}

impl EnrollmentStore for Database {
    fn create_tenant(&self, tenant: NewTenant) -> Result<Tenant> {
        let tenant = tenant.with_id(TenantId(self.storage.next_id(EntityKind::Tenant)?));
        let row = Row::Tenant(tenant.clone());

        let partition = with_retry(&self.config.retry, "create_tenant", || {
            let mut batch = self.stage_global_insert(&row)?;
            if self.router.auto_partition() == AutoPartition::Disabled {
                batch.commit()?;
                return Ok(None);
            }

            let mut edit = self.router.edit();
            if let Some(assigned) = edit.map.assignment(tenant.id) {
                batch.commit()?;
                return Ok(Some(assigned));
            }
            let name = dedicated_partition_name(tenant.id);
            let id = match edit.map.partition_by_name(&name) {
                Some(id) => id,
                None => edit.map.create(&name)?,
            };
            edit.map.assign(tenant.id, id)?;
            edit.stage(&mut batch)?;
            batch.commit()?;
            edit.install();
            Ok(Some(id))
        })?;

        info!(
            tenant_id = tenant.id.0,
            partition = ?partition.map(|p| p.0),
            "created tenant"
        );
        Ok(tenant)
    }

    fn get_tenant(&self, id: TenantId) -> Result<Tenant> {
        self.get_global(EntityKind::Tenant, id.0)?
            .into_tenant()
            .ok_or(Error::InvalidKey)
    }

    fn update_tenant(&self, tenant: Tenant) -> Result<Tenant> {
        self.update_global("update_tenant", &Row::Tenant(tenant.clone()))?;
        Ok(tenant)
    }

    fn delete_tenant(&self, id: TenantId) -> Result<DeleteOutcome> {
        self.delete(EntityRef::tenant(id))
    }

    fn create_person(&self, person: NewPerson) -> Result<Person> {
        let person = person.with_id(PersonId(self.storage.next_id(EntityKind::Person)?));
        self.insert_global("create_person", &Row::Person(person.clone()))?;
        Ok(person)
    }

    fn get_person(&self, id: PersonId) -> Result<Person> {
        self.get_global(EntityKind::Person, id.0)?
            .into_person()
            .ok_or(Error::InvalidKey)
    }

    fn update_person(&self, person: Person) -> Result<Person> {
        self.update_global("update_person", &Row::Person(person.clone()))?;
        Ok(person)
    }

    fn delete_person(&self, id: PersonId) -> Result<DeleteOutcome> {
        self.delete(EntityRef::person(id))
    }

    fn create_institution(&self, institution: NewInstitution) -> Result<Institution> {
        let institution = institution.with_id(InstitutionId(
            self.storage.next_id(EntityKind::Institution)?,
        ));
        self.insert_global(
            "create_institution",
            &Row::Institution(institution.clone()),
        )?;
        Ok(institution)
    }

    fn get_institution(&self, id: InstitutionId) -> Result<Institution> {
        self.get_global(EntityKind::Institution, id.0)?
            .into_institution()
            .ok_or(Error::InvalidKey)
    }

    fn update_institution(&self, institution: Institution) -> Result<Institution> {
        self.update_global(
            "update_institution",
            &Row::Institution(institution.clone()),
        )?;
        Ok(institution)
    }

    fn delete_institution(&self, id: InstitutionId) -> Result<DeleteOutcome> {
        self.delete(EntityRef::institution(id))
    }

    fn create_course(&self, course: NewCourse) -> Result<Course> {
        let course = course.with_id(CourseId(self.storage.next_id(EntityKind::Course)?));
        self.insert_global("create_course", &Row::Course(course.clone()))?;
        Ok(course)
    }

    fn get_course(&self, id: CourseId) -> Result<Course> {
        self.get_global(EntityKind::Course, id.0)?
            .into_course()
            .ok_or(Error::InvalidKey)
    }

    fn update_course(&self, course: Course) -> Result<Course> {
        self.update_global("update_course", &Row::Course(course.clone()))?;
        Ok(course)
    }

    fn delete_course(&self, id: CourseId) -> Result<DeleteOutcome> {
        self.delete(EntityRef::course(id))
    }

    fn create_enrollment(&self, enrollment: NewEnrollment) -> Result<Enrollment> {
        let tenant_id = enrollment.tenant_id;
        let enrollment =
            enrollment.with_id(EnrollmentId(self.storage.next_id(EntityKind::Enrollment)?));
        let row = Row::Enrollment(enrollment.clone());

        with_retry(&self.config.retry, "create_enrollment", || {
            let partition = self.router.write(tenant_id, self.config.lock_timeout)?;
            let trees = IndexTrees::with_partition(self.global(), partition.tree());
            self.constraints.validate_insert(trees, &row)?;

            let mut batch = WriteBatch::new();
            batch.put(
                partition.tree(),
                row_key(EntityKind::Enrollment, row.id()),
                encode_row(&row)?,
            );
            self.constraints.stage_references(&mut batch, &row, None)?;
            self.indexes.maintain(&mut batch, trees, None, Some(&row))?;
            batch.commit()?;

            debug!(
                tenant_id = tenant_id.0,
                partition = partition.id().0,
                enrollment_id = row.id(),
                "created enrollment"
            );
            Ok(())
        })?;
        Ok(enrollment)
    }

    fn get_enrollment(&self, tenant_id: TenantId, id: EnrollmentId) -> Result<Enrollment> {
        let partition = self.router.read(tenant_id, self.config.lock_timeout)?;
        read_row(partition.tree(), EntityKind::Enrollment, id.0)?
            .and_then(Row::into_enrollment)
            .filter(|e| e.tenant_id == tenant_id)
            .ok_or(Error::NotFound {
                entity: EntityKind::Enrollment,
                id: id.0,
            })
    }

    fn update_enrollment(&self, enrollment: Enrollment) -> Result<Enrollment> {
        self.modify_enrollment(
            "update_enrollment",
            enrollment.tenant_id,
            enrollment.id,
            |current| Enrollment {
                is_deleted: current.is_deleted,
                ..enrollment.clone()
            },
        )
    }

    fn soft_delete_enrollment(&self, tenant_id: TenantId, id: EnrollmentId) -> Result<Enrollment> {
        self.modify_enrollment("soft_delete_enrollment", tenant_id, id, |current| {
            Enrollment {
                is_deleted: true,
                ..current.clone()
            }
        })
    }

    fn restore_enrollment(&self, tenant_id: TenantId, id: EnrollmentId) -> Result<Enrollment> {
        self.modify_enrollment("restore_enrollment", tenant_id, id, |current| Enrollment {
            is_deleted: false,
            ..current.clone()
        })
    }

    fn execute(&self, intent: &QueryIntent) -> Result<QueryOutput> {
        let executor = self.executor();
        with_retry(&self.config.retry, intent.name(), || executor.execute(intent))
    }

    fn explain(&self, intent: &QueryIntent) -> Result<ExecutionPlan> {
        self.executor().explain(intent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> Database {
        Database::open(DatabaseConfig::temporary()).unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 9, 1).unwrap()
    }

    /// One tenant with an institution, a course and `persons` enrolled in it.
    fn enrolled(db: &Database, persons: usize) -> (Tenant, Institution, Course, Vec<Enrollment>) {
        let tenant = db.create_tenant(NewTenant::new("acme")).unwrap();
        let institution = db
            .create_institution(NewInstitution::new(tenant.id, "North"))
            .unwrap();
        let course = db
            .create_course(NewCourse::new(tenant.id, institution.id, "Algebra"))
            .unwrap();
        let enrollments = (0..persons)
            .map(|i| {
                let person = db
                    .create_person(NewPerson::new(format!("Person {:02}", i)))
                    .unwrap();
                db.create_enrollment(NewEnrollment::new(
                    tenant.id,
                    Some(institution.id),
                    person.id,
                    course.id,
                    date(),
                ))
                .unwrap()
            })
            .collect();
        (tenant, institution, course, enrollments)
    }

    #[test]
    fn test_tenant_gets_dedicated_partition() {
        let db = open();
        let tenant = db.create_tenant(NewTenant::new("acme")).unwrap();

        let partitions = db.partitions();
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].name, dedicated_partition_name(tenant.id));
        assert_eq!(partitions[0].tenants, vec![tenant.id]);
    }

    #[test]
    fn test_disabled_auto_partition_leaves_tenant_unroutable() {
        let db = Database::open(
            DatabaseConfig::temporary().with_auto_partition(AutoPartition::Disabled),
        )
        .unwrap();
        let tenant = db.create_tenant(NewTenant::new("acme")).unwrap();
        assert!(db.partitions().is_empty());
        assert!(matches!(
            db.router().route(tenant.id),
            Err(Error::UnroutablePartition { .. })
        ));
    }

    #[test]
    fn test_tenant_delete_drops_dedicated_partition() {
        let db = open();
        let tenant = db.create_tenant(NewTenant::new("acme")).unwrap();
        db.delete_tenant(tenant.id).unwrap();

        assert!(db.partitions().is_empty());
        assert!(matches!(
            db.get_tenant(tenant.id),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_update_rejects_tenant_change() {
        let db = open();
        let a = db.create_tenant(NewTenant::new("a")).unwrap();
        let b = db.create_tenant(NewTenant::new("b")).unwrap();
        let institution = db
            .create_institution(NewInstitution::new(a.id, "North"))
            .unwrap();

        let moved = Institution {
            tenant_id: b.id,
            ..institution.clone()
        };
        assert!(matches!(
            db.update_institution(moved),
            Err(Error::ConstraintViolation(_))
        ));

        let renamed = Institution {
            name: "North Campus".into(),
            ..institution
        };
        db.update_institution(renamed.clone()).unwrap();
        assert_eq!(db.get_institution(renamed.id).unwrap(), renamed);
    }

    #[test]
    fn test_duplicate_tenant_name() {
        let db = open();
        db.create_tenant(NewTenant::new("acme")).unwrap();
        assert!(matches!(
            db.create_tenant(NewTenant::new("acme")),
            Err(Error::ConstraintViolation(_))
        ));
    }

    #[test]
    fn test_policy_is_fixed_per_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let db = Database::open(DatabaseConfig::new(&path)).unwrap();
            db.flush().unwrap();
        }
        let reopened = Database::open(
            DatabaseConfig::new(&path).with_uniqueness(UniquenessPolicy::AbsoluteCourse),
        );
        assert!(matches!(reopened, Err(Error::Config(_))));
    }

    #[test]
    fn test_person_delete_replans_after_partition_drop() {
        let db = open();
        let (tenant, _, _, enrollments) = enrolled(&db, 1);
        let person = enrollments[0].person_id;

        let draft = db
            .constraints()
            .validate_delete(EntityRef::person(person))
            .unwrap();
        assert_eq!(draft.partitions.len(), 1);

        // The tenant goes away between planning and locking, taking its
        // dedicated partition with it.
        db.delete_tenant(tenant.id).unwrap();
        let guards = db
            .router()
            .lock_partitions(&draft.partitions, db.config().lock_timeout)
            .unwrap();
        assert!(guards.is_empty());
        drop(guards);

        let outcome = db.delete_person(person).unwrap();
        assert_eq!(outcome.removed, vec![EntityRef::person(person)]);
        assert!(matches!(
            db.get_person(person),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_conflicting_cascade_changes_nothing() {
        let db = open();
        let (tenant, institution, course, enrollments) = enrolled(&db, 3);

        let plan = db
            .constraints()
            .validate_delete(EntityRef::course(course.id))
            .unwrap();
        assert_eq!(plan.removed().count(), 4);

        // A late enrollment for the course invalidates the plan.
        let late = db.create_person(NewPerson::new("Late")).unwrap();
        db.create_enrollment(NewEnrollment::new(
            tenant.id,
            Some(institution.id),
            late.id,
            course.id,
            date(),
        ))
        .unwrap();

        let partition = db.router().route(tenant.id).unwrap();
        let global_len = db.global().len();
        let partition_len = partition.tree().len();
        let roster = db
            .list_roster(tenant.id, institution.id, course.id, 50, 0)
            .unwrap();
        let counts = db
            .count_enrollments_by_course(tenant.id, institution.id, "")
            .unwrap();

        let trees = BTreeMap::from([(partition.id(), partition.tree().clone())]);
        let mut batch = WriteBatch::new();
        plan.stage(&mut batch, &db.indexes, db.global(), &trees)
            .unwrap();
        assert!(matches!(batch.commit(), Err(Error::WriteConflict { .. })));

        assert_eq!(db.global().len(), global_len);
        assert_eq!(partition.tree().len(), partition_len);
        assert_eq!(db.get_course(course.id).unwrap(), course);
        for enrollment in &enrollments {
            assert_eq!(
                db.get_enrollment(tenant.id, enrollment.id).unwrap(),
                *enrollment
            );
        }
        assert_eq!(
            db.list_roster(tenant.id, institution.id, course.id, 50, 0)
                .unwrap(),
            roster
        );
        assert_eq!(roster.len(), 4);
        assert_eq!(
            db.count_enrollments_by_course(tenant.id, institution.id, "")
                .unwrap(),
            counts
        );

        // Through the public path the delete re-plans and takes the late row too.
        let outcome = db.delete_course(course.id).unwrap();
        assert_eq!(outcome.removed.len(), 5);
        assert!(db
            .count_enrollments_by_course(tenant.id, institution.id, "")
            .unwrap()
            .is_empty());
    }
}
