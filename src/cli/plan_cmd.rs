//! Planning and estimation commands

use anyhow::{Context, Result};

use super::output::Output;
use super::services::{interrupt_token, Services};
use crate::domain::{Bead, TaskId, WorkId};
use crate::engine::{record_estimate, AgentEstimator, Estimator, IssueTracker, Planner};
use crate::storage::{CacheWrite, PlannerConfig};

pub struct PlanArgs {
    pub work: String,
    pub beads: Vec<String>,
    pub auto_group: Option<bool>,
    pub budget: Option<u32>,
    pub estimate: bool,
}

/// Packs beads into implement tasks of a work
pub fn plan(output: &Output, args: PlanArgs) -> Result<()> {
    let services = Services::open()?;
    let work_id: WorkId = args.work.parse()?;

    let beads: Vec<Bead> = if args.beads.is_empty() {
        services
            .tracker
            .ready_beads()
            .context("Failed to list ready beads")?
    } else {
        args.beads
            .iter()
            .map(|id| services.tracker.get_bead(id))
            .collect::<Result<_, _>>()?
    };

    let defaults = services.config().planner;
    let config = PlannerConfig {
        budget: args.budget.unwrap_or(defaults.budget),
        auto_group: args.auto_group.unwrap_or(defaults.auto_group),
    };

    let scheduler = services.scheduler(interrupt_token());
    let estimator = AgentEstimator::new(&scheduler);
    let estimator: Option<&dyn Estimator> = args.estimate.then_some(&estimator as &dyn Estimator);

    let report = Planner::new(&services.store, config)
        .plan(&work_id, &beads, estimator)
        .with_context(|| format!("Failed to plan work {}", work_id))?;

    if output.is_json() {
        output.data(&report);
    } else if report.tasks.is_empty() {
        println!("Nothing to plan.");
    } else {
        if !report.estimated.is_empty() {
            println!("Estimated: {}", report.estimated.join(", "));
        }
        println!("Planned {} task(s) for {}:", report.tasks.len(), work_id);
        println!("{:<24} {:>10}  BEADS", "ID", "COMPLEXITY");
        println!("{}", "-".repeat(60));
        for planned in &report.tasks {
            println!(
                "{:<24} {:>10}  {}",
                planned.task.id,
                planned.task.actual_complexity.unwrap_or(0),
                planned.bead_ids.join(", ")
            );
        }
    }
    Ok(())
}

/// Caches an estimate for a bead, optionally completing it within a task
pub fn estimate(
    output: &Output,
    bead: &str,
    score: i64,
    tokens: i64,
    task: Option<&str>,
) -> Result<()> {
    let task: Option<TaskId> = task.map(str::parse).transpose()?;
    let services = Services::open()?;

    let report = record_estimate(&services.store, &services.tracker, bead, score, tokens, task.as_ref())?;

    if output.is_json() {
        output.data(&serde_json::json!({
            "bead_id": report.bead_id,
            "description_hash": report.description_hash,
            "score": report.estimate.score,
            "tokens": report.estimate.tokens,
            "write": match report.write {
                CacheWrite::Inserted => "inserted",
                CacheWrite::Updated => "updated",
                CacheWrite::Unchanged => "unchanged",
            },
            "task_completed": report.task_completed,
        }));
    } else {
        output.success(&format!(
            "Estimated {}: score {}, ~{} tokens",
            report.bead_id, report.estimate.score, report.estimate.tokens
        ));
        if let (Some(task), Some(true)) = (&task, report.task_completed) {
            println!("Task {} completed", task);
        }
    }
    Ok(())
}
