//! ---
//! swm_section: "05-networking-external-interfaces"
//! swm_subsection: "binary"
//! swm_type: "source"
//! swm_scope: "code"
//! swm_description: "Read-only view of the persisted update store."
//! swm_version: "v0.0.0-prealpha"
//! swm_owner: "tbd"
//! ---
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use swm_common::AppConfig;
use swm_persistence::{OperationRecord, Store, UpdateRecord};

#[derive(Debug, Args)]
pub struct StatusOptions {
    /// Restrict output to one update.
    #[arg(long)]
    pub update: Option<String>,
    /// Database file, overriding the configured path.
    #[arg(long, value_name = "FILE")]
    pub database: Option<PathBuf>,
    /// Emit JSON instead of a table.
    #[arg(long)]
    pub json: bool,
}

pub fn run(options: StatusOptions, config: &AppConfig) -> Result<()> {
    let path = options
        .database
        .unwrap_or_else(|| config.database.path.clone());
    let store =
        Store::open(&path).with_context(|| format!("unable to open store {}", path.display()))?;

    let updates: Vec<UpdateRecord> = match &options.update {
        Some(id) => store.update(id)?.into_iter().collect(),
        None => store.list_updates()?,
    };
    let mut report = Vec::with_capacity(updates.len());
    for update in updates {
        let operations = store.operations_for(&update.id)?;
        report.push((update, operations));
    }

    if options.json {
        let value: Vec<_> = report
            .iter()
            .map(|(update, operations)| {
                serde_json::json!({ "update": update, "operations": operations })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    if report.is_empty() {
        println!("no updates recorded in {}", path.display());
    }
    for (update, operations) in &report {
        print_update(update, operations);
    }
    Ok(())
}

fn print_update(update: &UpdateRecord, operations: &[OperationRecord]) {
    println!(
        "{} ({}) {} started={} finished={}",
        update.id,
        update.name,
        update.status,
        timestamp(update.start_time),
        timestamp(update.finish_time),
    );
    for op in operations {
        println!(
            "  {:<16} {:<24} {:<9} code={}",
            op.id,
            op.operation_type,
            op.status.as_str(),
            op.result_code.map_or_else(|| "-".to_string(), |c| c.to_string()),
        );
    }
}

fn timestamp(value: Option<DateTime<Utc>>) -> String {
    value.map_or_else(|| "-".to_string(), |t| t.to_rfc3339())
}
