//! Task CLI commands

use anyhow::{bail, Result};
use clap::Subcommand;

use super::output::Output;
use super::services::Services;
use crate::domain::{TaskId, WorkId};
use crate::storage::Transition;

#[derive(Subcommand)]
pub enum TaskCommands {
    /// List the tasks of a work
    List {
        /// Work ID
        work: String,
    },

    /// Show task details
    Show {
        /// Task ID
        id: String,
    },

    /// Put a failed task back to pending
    Requeue {
        /// Task ID
        id: String,
    },

    /// Add a dependency between tasks of one work
    ///
    /// Only a later task may depend on an earlier one.
    Dep {
        /// Task that will be blocked
        task: String,

        /// Task that must be completed first
        depends_on: String,
    },
}

pub fn run(cmd: TaskCommands, output: &Output) -> Result<()> {
    match cmd {
        TaskCommands::List { work } => list_tasks(output, &work),
        TaskCommands::Show { id } => show_task(output, &id),
        TaskCommands::Requeue { id } => requeue_task(output, &id),
        TaskCommands::Dep { task, depends_on } => add_dependency(output, &task, &depends_on),
    }
}

fn list_tasks(output: &Output, work: &str) -> Result<()> {
    let work_id: WorkId = work.parse()?;
    let services = Services::open()?;
    services.store.get_work(&work_id)?;
    let tasks = services.store.list_tasks(&work_id)?;

    if output.is_json() {
        output.data(&tasks);
    } else if tasks.is_empty() {
        println!("No tasks for {}", work_id);
    } else {
        println!("{:<24} {:<22} {:<11} COMPLEXITY", "ID", "TYPE", "STATUS");
        println!("{}", "-".repeat(70));
        for task in &tasks {
            let complexity = task
                .actual_complexity
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{:<24} {:<22} {:<11} {}",
                task.id, task.task_type, task.status, complexity
            );
        }
    }
    Ok(())
}

fn show_task(output: &Output, id_str: &str) -> Result<()> {
    let id: TaskId = id_str.parse()?;
    let services = Services::open()?;
    let task = services.store.get_task(&id)?;
    let beads = services.store.task_beads(&id)?;
    let depends_on = services.store.task_dependencies(&id)?;

    if output.is_json() {
        output.data(&serde_json::json!({
            "task": task,
            "beads": beads,
            "depends_on": depends_on,
        }));
        return Ok(());
    }

    println!("Task:      {}", task.id);
    println!("Type:      {}", task.task_type);
    println!("Status:    {}", task.status);
    if let Some(c) = task.actual_complexity {
        println!(
            "Complexity: {} (budget {})",
            c,
            task.complexity_budget.unwrap_or(0)
        );
    }
    if let Some(owner) = &task.claimed_by {
        println!("Claimed by: {}", owner);
    }
    if let Some(url) = &task.pr_url {
        println!("PR:        {}", url);
    }
    if let Some(epic) = &task.review_epic {
        println!("Review epic: {}", epic);
    }
    if let Some(err) = &task.error_message {
        println!("Error:     {}", err);
    }

    if !beads.is_empty() {
        println!();
        println!("Beads:");
        for bead in &beads {
            let mark = if bead.completed { "x" } else { " " };
            println!("  [{}] {}", mark, bead.bead_id);
        }
    }
    if !depends_on.is_empty() {
        println!();
        println!("Depends on:");
        for dep in &depends_on {
            println!("  {}", dep);
        }
    }
    Ok(())
}

fn requeue_task(output: &Output, id_str: &str) -> Result<()> {
    let id: TaskId = id_str.parse()?;
    let services = Services::open()?;

    match services.store.requeue_task(&id)? {
        Transition::Applied => output.success(&format!("Requeued {}", id)),
        Transition::AlreadyDone => output.success(&format!("{} is already pending", id)),
    }
    Ok(())
}

fn add_dependency(output: &Output, task_str: &str, dep_str: &str) -> Result<()> {
    let task: TaskId = task_str.parse()?;
    let depends_on: TaskId = dep_str.parse()?;
    if task == depends_on {
        bail!("A task cannot depend on itself");
    }
    let services = Services::open()?;
    services.store.add_task_dependency(&task, &depends_on)?;

    output.success(&format!("{} now depends on {}", task, depends_on));
    Ok(())
}
