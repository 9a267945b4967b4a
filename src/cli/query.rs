//! Query commands (ready, blocked, status)

use anyhow::Result;

use super::output::Output;
use super::services::Services;
use crate::domain::{OutboxStatus, WorkId};

/// Show pending tasks whose dependencies have completed
pub fn ready(output: &Output, work: &str) -> Result<()> {
    let work_id: WorkId = work.parse()?;
    let services = Services::open()?;
    services.store.get_work(&work_id)?;
    let ready_tasks = services.store.ready_tasks(&work_id)?;

    if output.is_json() {
        output.data(&ready_tasks);
    } else if ready_tasks.is_empty() {
        println!("No tasks ready to run.");
    } else {
        println!("Ready tasks ({}):", ready_tasks.len());
        println!("{:<24} TYPE", "ID");
        println!("{}", "-".repeat(50));
        for task in ready_tasks {
            println!("{:<24} {}", task.id, task.task_type);
        }
    }

    Ok(())
}

/// Show pending tasks held back by incomplete dependencies
pub fn blocked(output: &Output, work: &str) -> Result<()> {
    let work_id: WorkId = work.parse()?;
    let services = Services::open()?;
    services.store.get_work(&work_id)?;
    let blocked_tasks = services.store.blocked_tasks(&work_id)?;

    if output.is_json() {
        let items: Vec<_> = blocked_tasks
            .iter()
            .map(|(task, blockers)| {
                serde_json::json!({
                    "id": task.id,
                    "task_type": task.task_type,
                    "blocked_by": blockers,
                })
            })
            .collect();
        output.data(&items);
    } else if blocked_tasks.is_empty() {
        println!("No blocked tasks.");
    } else {
        println!("Blocked tasks ({}):", blocked_tasks.len());
        println!("{:<24} {:<12} BLOCKED BY", "ID", "TYPE");
        println!("{}", "-".repeat(70));
        for (task, blockers) in blocked_tasks {
            let blockers: Vec<String> = blockers.iter().map(ToString::to_string).collect();
            println!("{:<24} {:<12} {}", task.id, task.task_type, blockers.join(", "));
        }
    }

    Ok(())
}

/// Show project status overview
pub fn status(output: &Output) -> Result<()> {
    let services = Services::open()?;
    let store = &services.store;

    let counts = store.task_status_counts(None)?;
    let total: u64 = counts.iter().map(|(_, n)| n).sum();
    let pending_effects = store.list_outbox(Some(OutboxStatus::Pending))?;
    let dead_effects = store.list_outbox(Some(OutboxStatus::Dead))?;
    let workflows: Vec<_> = store
        .list_workflows()?
        .into_iter()
        .filter(|w| !w.is_finished())
        .collect();

    if output.is_json() {
        let by_status: serde_json::Map<String, serde_json::Value> = counts
            .iter()
            .map(|(status, n)| (status.to_string(), (*n).into()))
            .collect();
        output.data(&serde_json::json!({
            "tasks": {
                "total": total,
                "by_status": by_status,
            },
            "outbox": {
                "pending": pending_effects.len(),
                "dead": dead_effects.len(),
            },
            "workflows": workflows,
        }));
        return Ok(());
    }

    println!("Project: {}", services.project.root().display());
    println!();
    println!("Tasks: {}", total);
    for (status, n) in &counts {
        println!("  {:<11} {}", status, n);
    }
    println!();
    println!(
        "Outbox: {} pending, {} dead",
        pending_effects.len(),
        dead_effects.len()
    );
    println!();
    if workflows.is_empty() {
        println!("No workflows in flight.");
    } else {
        println!("Workflows in flight:");
        for wf in &workflows {
            println!(
                "  {:<12} step {} [{}]",
                wf.workflow_id, wf.current_step, wf.step_status
            );
        }
    }

    Ok(())
}
