//! Outbox CLI commands

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Subcommand;

use super::output::Output;
use super::services::Services;
use crate::domain::OutboxStatus;
use crate::engine::OutboxDispatcher;

#[derive(Subcommand)]
pub enum OutboxCommands {
    /// List scheduled effects
    List {
        /// Filter by status (pending, completed, dead)
        #[arg(long)]
        status: Option<String>,
    },

    /// Retry every due pending effect
    Sweep,
}

pub fn run(cmd: OutboxCommands, output: &Output) -> Result<()> {
    match cmd {
        OutboxCommands::List { status } => list(output, status.as_deref()),
        OutboxCommands::Sweep => sweep(output),
    }
}

fn list(output: &Output, status: Option<&str>) -> Result<()> {
    let status: Option<OutboxStatus> = status
        .map(str::parse)
        .transpose()
        .map_err(anyhow::Error::msg)?;
    let services = Services::open()?;
    let entries = services.store.list_outbox(status)?;

    if output.is_json() {
        output.data(&entries);
    } else if entries.is_empty() {
        println!("Outbox is empty.");
    } else {
        println!(
            "{:<48} {:<10} {:>8}  {:<20} LAST ERROR",
            "KEY", "STATUS", "ATTEMPTS", "RUN AT"
        );
        println!("{}", "-".repeat(110));
        for entry in &entries {
            println!(
                "{:<48} {:<10} {:>4}/{:<3}  {:<20} {}",
                entry.idempotency_key,
                entry.status,
                entry.attempts,
                entry.max_attempts,
                entry.run_at.format("%Y-%m-%d %H:%M:%S"),
                entry.last_error.as_deref().unwrap_or("")
            );
        }
    }
    Ok(())
}

fn sweep(output: &Output) -> Result<()> {
    let services = Services::open()?;
    let dispatcher = OutboxDispatcher::new(
        &services.store,
        &services.github,
        services.config().outbox,
    );
    let report = dispatcher.sweep(Utc::now()).context("Outbox sweep failed")?;

    if output.is_json() {
        output.data(&report);
    } else {
        output.success(&format!(
            "Sweep: {} completed, {} failed, {} dead, {} skipped",
            report.completed.len(),
            report.failed.len(),
            report.dead.len(),
            report.skipped
        ));
        for (key, error) in &report.failed {
            println!("  {}: {}", key, error);
        }
    }
    Ok(())
}
