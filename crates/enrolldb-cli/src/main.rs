//! enrolldb administrative command-line tool.
//!
//! Opens a database directory, runs one command against it and exits.

mod commands;
mod formatter;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use enrolldb_core::{
    AutoPartition, Database, DatabaseConfig, PartitionMapConfig, RetryPolicy, UniquenessPolicy,
};
use formatter::OutputFormat;

use commands::Command;

/// Routing of newly created tenants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AutoPartitionArg {
    PerTenant,
    Disabled,
}

impl From<AutoPartitionArg> for AutoPartition {
    fn from(arg: AutoPartitionArg) -> Self {
        match arg {
            AutoPartitionArg::PerTenant => AutoPartition::PerTenant,
            AutoPartitionArg::Disabled => AutoPartition::Disabled,
        }
    }
}

/// Enrollment uniqueness rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum UniquenessArg {
    ActiveTriple,
    AbsoluteCourse,
}

impl From<UniquenessArg> for UniquenessPolicy {
    fn from(arg: UniquenessArg) -> Self {
        match arg {
            UniquenessArg::ActiveTriple => UniquenessPolicy::ActiveTriple,
            UniquenessArg::AbsoluteCourse => UniquenessPolicy::AbsoluteCourse,
        }
    }
}

/// enrolldb administrative tool
#[derive(Parser, Debug)]
#[command(name = "enrolldb")]
#[command(version, about = "enrolldb administrative tool")]
pub struct Args {
    /// Database directory
    #[arg(short = 'd', long, default_value = "./data")]
    pub data_path: PathBuf,

    /// JSON partition map merged into the routing table at open
    #[arg(long)]
    pub partition_map: Option<PathBuf>,

    /// Routing of tenants created through this process
    #[arg(long, default_value = "per-tenant", value_enum)]
    pub auto_partition: AutoPartitionArg,

    /// Uniqueness rule; must match the one the data was written under
    #[arg(long, default_value = "active-triple", value_enum)]
    pub uniqueness: UniquenessArg,

    /// Partition lock timeout in milliseconds
    #[arg(long, default_value_t = 5000)]
    pub lock_timeout_ms: u64,

    /// Attempts for transient failures
    #[arg(long, default_value_t = 5)]
    pub retries: u32,

    /// sled page cache size in MB
    #[arg(long, default_value_t = 64)]
    pub cache_mb: u64,

    /// Output format
    #[arg(long, default_value = "table", value_enum)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

impl Args {
    fn config(&self) -> Result<DatabaseConfig, Box<dyn std::error::Error>> {
        let mut config = DatabaseConfig::new(&self.data_path)
            .with_cache_capacity(self.cache_mb * 1024 * 1024)
            .with_retry(RetryPolicy::default().max_attempts(self.retries))
            .with_lock_timeout(Duration::from_millis(self.lock_timeout_ms))
            .with_auto_partition(self.auto_partition.into())
            .with_uniqueness(self.uniqueness.into());
        if let Some(path) = &self.partition_map {
            config = config.with_partition_map(PartitionMapConfig::from_file(path)?);
        }
        Ok(config)
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "enrolldb=info,enrolldb_core=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.config()?;
    tracing::info!(data_path = %args.data_path.display(), "opening database");
    let db = Database::open(config)?;

    let formatter = formatter::create_formatter(args.format);
    let output = commands::execute(&db, args.command, &*formatter)?;
    db.flush()?;

    println!("{}", output);
    Ok(())
}
