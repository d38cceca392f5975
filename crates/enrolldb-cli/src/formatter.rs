//! Output formatters for command results.

use std::collections::BTreeMap;

use clap::ValueEnum;
use comfy_table::Table;
use enrolldb_core::{CourseId, ExecutionPlan, IndexDef, IndexKind, PartitionSummary, RosterEntry};
use serde::Serialize;

/// Output format for results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format
    Table,
    /// JSON format
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Trait for formatting output.
pub trait Formatter {
    fn format_partitions(&self, partitions: &[PartitionSummary]) -> String;

    fn format_indexes(&self, indexes: &[IndexDef]) -> String;

    fn format_counts(&self, counts: &BTreeMap<CourseId, u64>) -> String;

    fn format_roster(&self, roster: &[RosterEntry]) -> String;

    fn format_plan(&self, plan: &ExecutionPlan) -> String;

    /// Format a simple message.
    fn format_message(&self, message: &str) -> String;
}

/// Create a formatter for the given output format.
pub fn create_formatter(format: OutputFormat) -> Box<dyn Formatter> {
    match format {
        OutputFormat::Table => Box::new(TableFormatter),
        OutputFormat::Json => Box::new(JsonFormatter),
    }
}

fn index_kind(def: &IndexDef) -> &'static str {
    match def.kind {
        IndexKind::Sorted => "sorted",
        IndexKind::Unique { .. } => "unique",
        IndexKind::Inverted => "inverted",
    }
}

/// Table formatter using comfy-table.
pub struct TableFormatter;

impl Formatter for TableFormatter {
    fn format_partitions(&self, partitions: &[PartitionSummary]) -> String {
        if partitions.is_empty() {
            return "No partitions".to_string();
        }

        let mut table = Table::new();
        table.set_header(vec!["Id", "Name", "Tenants", "State"]);
        for partition in partitions {
            let tenants: Vec<String> = partition.tenants.iter().map(|t| t.to_string()).collect();
            table.add_row(vec![
                partition.id.to_string(),
                partition.name.clone(),
                tenants.join(", "),
                if partition.locked { "migrating" } else { "ready" }.to_string(),
            ]);
        }
        table.to_string()
    }

    fn format_indexes(&self, indexes: &[IndexDef]) -> String {
        let mut table = Table::new();
        table.set_header(vec!["Name", "Entity", "Columns", "Kind", "Placement", "Origin"]);
        for def in indexes {
            table.add_row(vec![
                def.name.clone(),
                def.entity.to_string(),
                def.columns.join(", "),
                index_kind(def).to_string(),
                format!("{:?}", def.placement).to_lowercase(),
                if def.builtin { "builtin" } else { "custom" }.to_string(),
            ]);
        }
        table.to_string()
    }

    fn format_counts(&self, counts: &BTreeMap<CourseId, u64>) -> String {
        if counts.is_empty() {
            return "No results".to_string();
        }

        let mut table = Table::new();
        table.set_header(vec!["Course", "Enrollments"]);
        for (course, count) in counts {
            table.add_row(vec![course.to_string(), count.to_string()]);
        }
        table.to_string()
    }

    fn format_roster(&self, roster: &[RosterEntry]) -> String {
        if roster.is_empty() {
            return "No results".to_string();
        }

        let mut table = Table::new();
        table.set_header(vec![
            "Enrollment",
            "Person",
            "Name",
            "Birth date",
            "Enrolled",
            "Status",
        ]);
        for entry in roster {
            table.add_row(vec![
                entry.enrollment_id.to_string(),
                entry.person_id.to_string(),
                entry.person_name.clone(),
                entry
                    .birth_date
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "NULL".to_string()),
                entry.enrollment_date.to_string(),
                entry.status.to_string(),
            ]);
        }
        table.to_string()
    }

    fn format_plan(&self, plan: &ExecutionPlan) -> String {
        plan.to_string().trim_end().to_string()
    }

    fn format_message(&self, message: &str) -> String {
        message.to_string()
    }
}

/// JSON formatter.
pub struct JsonFormatter;

impl JsonFormatter {
    fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
        serde_json::to_string_pretty(value)
            .unwrap_or_else(|e| serde_json::json!({ "error": e.to_string() }).to_string())
    }
}

impl Formatter for JsonFormatter {
    fn format_partitions(&self, partitions: &[PartitionSummary]) -> String {
        Self::to_json(partitions)
    }

    fn format_indexes(&self, indexes: &[IndexDef]) -> String {
        Self::to_json(indexes)
    }

    fn format_counts(&self, counts: &BTreeMap<CourseId, u64>) -> String {
        Self::to_json(counts)
    }

    fn format_roster(&self, roster: &[RosterEntry]) -> String {
        Self::to_json(roster)
    }

    fn format_plan(&self, plan: &ExecutionPlan) -> String {
        Self::to_json(plan)
    }

    fn format_message(&self, message: &str) -> String {
        serde_json::json!({ "message": message }).to_string()
    }
}
