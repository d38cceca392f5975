//! Command definitions and execution.

use clap::{Args, Subcommand};
use enrolldb_core::{
    CourseId, Database, EnrollmentStore, EntityKind, IndexDef, InstitutionId, PartitionId,
    QueryIntent, TenantId,
};

use crate::formatter::Formatter;

type CommandResult = Result<String, Box<dyn std::error::Error>>;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Inspect and change the partition map
    #[command(subcommand)]
    Partitions(PartitionCommand),

    /// Inspect and change secondary indexes
    #[command(subcommand)]
    Indexes(IndexCommand),

    /// Count active enrollments per course
    Count(CountArgs),

    /// List one roster page
    Roster(RosterArgs),

    /// Show how a query would run without running it
    #[command(subcommand)]
    Explain(ExplainCommand),
}

#[derive(Subcommand, Debug)]
pub enum PartitionCommand {
    /// List partitions and their tenants
    List,
    /// Create an empty partition
    Create { name: String },
    /// Drop a partition that hosts no tenant
    Drop { id: u32 },
    /// Assign an unassigned tenant to a partition
    Assign { tenant: u64, partition: u32 },
    /// Remove a tenant's assignment (the tenant must have no enrollments)
    Unassign { tenant: u64 },
    /// Move a tenant to another partition
    Migrate { tenant: u64, partition: u32 },
    /// Cancel an unfinished migration
    Abort { tenant: u64 },
}

#[derive(Subcommand, Debug)]
pub enum IndexCommand {
    /// List all indexes
    List,
    /// Create and build a custom index
    Create {
        name: String,
        /// Entity the index covers
        #[arg(long, value_parser = parse_entity)]
        entity: EntityKind,
        /// Comma-separated columns
        #[arg(long, value_delimiter = ',', required = true)]
        columns: Vec<String>,
        /// Build an inverted index over a document column
        #[arg(long)]
        inverted: bool,
    },
    /// Drop a custom index
    Drop { name: String },
}

#[derive(Args, Debug)]
pub struct CountArgs {
    #[arg(long)]
    pub tenant: u64,
    #[arg(long)]
    pub institution: u64,
    /// Terms that must prefix-match person metadata
    #[arg(long, default_value = "")]
    pub search: String,
}

impl CountArgs {
    fn intent(&self) -> QueryIntent {
        QueryIntent::count_enrollments_by_course(
            TenantId(self.tenant),
            InstitutionId(self.institution),
            &self.search,
        )
    }
}

#[derive(Args, Debug)]
pub struct RosterArgs {
    #[arg(long)]
    pub tenant: u64,
    #[arg(long)]
    pub institution: u64,
    #[arg(long)]
    pub course: u64,
    #[arg(long, default_value_t = 50)]
    pub page_size: usize,
    #[arg(long, default_value_t = 0)]
    pub offset: usize,
}

impl RosterArgs {
    fn intent(&self) -> QueryIntent {
        QueryIntent::list_roster(
            TenantId(self.tenant),
            InstitutionId(self.institution),
            CourseId(self.course),
            self.page_size,
            self.offset,
        )
    }
}

#[derive(Subcommand, Debug)]
pub enum ExplainCommand {
    Count(CountArgs),
    Roster(RosterArgs),
}

fn parse_entity(s: &str) -> Result<EntityKind, String> {
    EntityKind::parse(&s.to_lowercase()).ok_or_else(|| format!("unknown entity '{}'", s))
}

/// Run a command against an open database.
pub fn execute(db: &Database, command: Command, formatter: &dyn Formatter) -> CommandResult {
    match command {
        Command::Partitions(command) => partitions(db, command, formatter),
        Command::Indexes(command) => indexes(db, command, formatter),
        Command::Count(args) => {
            let counts = db.count_enrollments_by_course(
                TenantId(args.tenant),
                InstitutionId(args.institution),
                &args.search,
            )?;
            Ok(formatter.format_counts(&counts))
        }
        Command::Roster(args) => {
            let roster = db.list_roster(
                TenantId(args.tenant),
                InstitutionId(args.institution),
                CourseId(args.course),
                args.page_size,
                args.offset,
            )?;
            Ok(formatter.format_roster(&roster))
        }
        Command::Explain(command) => {
            let intent = match command {
                ExplainCommand::Count(args) => args.intent(),
                ExplainCommand::Roster(args) => args.intent(),
            };
            Ok(formatter.format_plan(&db.explain(&intent)?))
        }
    }
}

fn partitions(db: &Database, command: PartitionCommand, formatter: &dyn Formatter) -> CommandResult {
    let message = match command {
        PartitionCommand::List => return Ok(formatter.format_partitions(&db.partitions())),
        PartitionCommand::Create { name } => {
            let id = db.create_partition(&name)?;
            format!("created partition {} ({})", id, name)
        }
        PartitionCommand::Drop { id } => {
            db.drop_partition(PartitionId(id))?;
            format!("dropped partition {}", id)
        }
        PartitionCommand::Assign { tenant, partition } => {
            db.assign_tenant(TenantId(tenant), PartitionId(partition))?;
            format!("assigned tenant {} to partition {}", tenant, partition)
        }
        PartitionCommand::Unassign { tenant } => {
            let from = db.unassign_tenant(TenantId(tenant))?;
            format!("removed tenant {} from partition {}", tenant, from)
        }
        PartitionCommand::Migrate { tenant, partition } => {
            let rows = db.migrate_tenant(TenantId(tenant), PartitionId(partition))?;
            format!(
                "moved tenant {} to partition {} ({} rows)",
                tenant, partition, rows
            )
        }
        PartitionCommand::Abort { tenant } => {
            let migration = db.abort_migration(TenantId(tenant))?;
            format!(
                "tenant {} stays in partition {}",
                tenant, migration.from
            )
        }
    };
    Ok(formatter.format_message(&message))
}

fn indexes(db: &Database, command: IndexCommand, formatter: &dyn Formatter) -> CommandResult {
    let message = match command {
        IndexCommand::List => return Ok(formatter.format_indexes(&db.indexes().indexes())),
        IndexCommand::Create {
            name,
            entity,
            columns,
            inverted,
        } => {
            let def = if inverted {
                let [column] = columns.as_slice() else {
                    return Err("an inverted index covers exactly one column".into());
                };
                IndexDef::inverted(&name, entity, column)
            } else {
                let columns: Vec<&str> = columns.iter().map(String::as_str).collect();
                IndexDef::sorted(&name, entity, &columns)
            };
            let def = db.create_index(def)?;
            format!("created index {} on {}({})", def.name, def.entity, def.columns.join(", "))
        }
        IndexCommand::Drop { name } => {
            db.drop_index(&name)?;
            format!("dropped index {}", name)
        }
    };
    Ok(formatter.format_message(&message))
}
