//! Running tasks and reporting their results

use anyhow::{bail, Context, Result};

use super::output::Output;
use super::services::{interrupt_token, Services};
use crate::domain::WorkId;
use crate::engine::{Completer, CompletionRequest, CompletionTarget};

/// Runs every ready task of a work to completion
pub fn run(output: &Output, work: &str) -> Result<()> {
    let work_id: WorkId = work.parse()?;
    let services = Services::open()?;

    let report = services
        .scheduler(interrupt_token())
        .run_work(&work_id)
        .with_context(|| format!("Failed to run work {}", work_id))?;

    if output.is_json() {
        output.data(&report);
    } else {
        output.warnings(&report.warnings);
        println!("Completed: {}", report.completed.len());
        for id in &report.reclaimed {
            println!("  reclaimed abandoned task {}", id);
        }
        for (id, message) in &report.failed {
            println!("  failed {}: {}", id, message);
        }
        for id in &report.blocked {
            println!("  blocked {}", id);
        }
    }

    if report.cancelled {
        for id in &report.released {
            println!("  released {}", id);
        }
        bail!("Interrupted; {} task(s) released", report.released.len());
    }
    if !report.is_success() {
        bail!(
            "{} task(s) failed, {} blocked",
            report.failed.len(),
            report.blocked.len()
        );
    }
    Ok(())
}

/// Marks a task or bead complete, or failed with `--error`
pub fn complete(output: &Output, target: &str, request: CompletionRequest) -> Result<()> {
    let target = CompletionTarget::parse(target)?;
    let services = Services::open()?;

    let completer = Completer::new(
        &services.store,
        &services.tracker,
        &services.github,
        services.config().outbox,
    );
    let report = completer.complete(&target, &request)?;

    if output.is_json() {
        output.data(&report);
        return Ok(());
    }

    output.warnings(&report.warnings);
    if let Some(epic) = &report.review_epic {
        output.success(&format!("Recorded review epic {}", epic));
    }
    for id in &report.completed_tasks {
        output.success(&format!("Completed task {}", id));
    }
    for id in &report.failed_tasks {
        output.success(&format!("Marked task {} failed", id));
    }
    for (task, bead) in &report.beads_marked {
        println!("  {} done in {}", bead, task);
    }
    for (key, outcome) in &report.effects {
        println!("  effect {}: {:?}", key, outcome);
    }
    Ok(())
}
