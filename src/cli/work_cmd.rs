//! Work CLI commands

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Subcommand;

use super::output::Output;
use super::services::Services;
use crate::domain::{Work, WorkId, WorkStatus};
use crate::engine::WorktreeManager;

#[derive(Subcommand)]
pub enum WorkCommands {
    /// Create a work with its branch and worktree
    ///
    /// Examples:
    ///   beadflow work create --branch feature/login
    ///   beadflow work create --branch feature/login --path ../login-tree
    Create {
        /// Branch the work's tasks commit to
        #[arg(long)]
        branch: String,

        /// Branch to start from (defaults to workflow.base_branch)
        #[arg(long)]
        base: Option<String>,

        /// Register an existing checkout instead of creating a worktree
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// List works
    List {
        /// Filter by status (active, completed, abandoned)
        #[arg(long)]
        status: Option<String>,
    },

    /// Show a work and its tasks
    Show {
        /// Work ID
        id: String,
    },

    /// Remove a work's worktree and record
    Remove {
        /// Work ID
        id: String,

        /// Keep the record, marked abandoned
        #[arg(long)]
        keep_record: bool,
    },
}

pub fn run(cmd: WorkCommands, output: &Output) -> Result<()> {
    match cmd {
        WorkCommands::Create { branch, base, path } => create(output, &branch, base, path),
        WorkCommands::List { status } => list(output, status.as_deref()),
        WorkCommands::Show { id } => show(output, &id),
        WorkCommands::Remove { id, keep_record } => remove(output, &id, keep_record),
    }
}

fn create(output: &Output, branch: &str, base: Option<String>, path: Option<PathBuf>) -> Result<()> {
    let branch = branch.trim();
    if branch.is_empty() {
        bail!("Branch name is required");
    }
    let services = Services::open()?;
    if let Some(existing) = services.store.find_work_by_branch(branch)? {
        bail!("Branch {} already belongs to work {}", branch, existing.id);
    }
    let base = base.unwrap_or_else(|| services.config().workflow.base_branch.clone());

    let path = match path {
        Some(path) => {
            if !path.is_dir() {
                bail!("Not a directory: {}", path.display());
            }
            path.canonicalize()
                .with_context(|| format!("Failed to resolve {}", path.display()))?
        }
        None => services
            .worktrees
            .create_worktree(&services.project.worktree_root(), branch, &base)
            .with_context(|| format!("Failed to create worktree for {}", branch))?,
    };

    let work = Work::new(WorkId::new(branch, Utc::now()), branch, path, base);
    services.store.insert_work(&work)?;

    if output.is_json() {
        output.data(&work);
    } else {
        output.success(&format!(
            "Created work {} on {} at {}",
            work.id,
            work.branch_name,
            work.worktree_path.display()
        ));
    }
    Ok(())
}

fn list(output: &Output, status: Option<&str>) -> Result<()> {
    let status: Option<WorkStatus> = status
        .map(str::parse)
        .transpose()
        .map_err(anyhow::Error::msg)?;
    let services = Services::open()?;
    let works = services.store.list_works(status)?;

    if output.is_json() {
        output.data(&works);
    } else if works.is_empty() {
        println!("No works.");
    } else {
        println!("{:<12} {:<10} {:<32} PR", "ID", "STATUS", "BRANCH");
        println!("{}", "-".repeat(80));
        for work in &works {
            println!(
                "{:<12} {:<10} {:<32} {}",
                work.id,
                work.status,
                work.branch_name,
                work.pr_url.as_deref().unwrap_or("-")
            );
        }
    }
    Ok(())
}

fn show(output: &Output, id: &str) -> Result<()> {
    let work_id: WorkId = id.parse()?;
    let services = Services::open()?;
    let work = services.store.get_work(&work_id)?;
    let tasks = services.store.list_tasks(&work_id)?;

    if output.is_json() {
        output.data(&serde_json::json!({
            "work": work,
            "tasks": tasks,
        }));
        return Ok(());
    }

    println!("Work:      {}", work.id);
    println!("Status:    {}", work.status);
    println!("Branch:    {} (from {})", work.branch_name, work.base_branch);
    println!("Worktree:  {}", work.worktree_path.display());
    if let Some(url) = &work.pr_url {
        println!("PR:        {}", url);
    }
    println!();
    if tasks.is_empty() {
        println!("No tasks.");
    } else {
        println!("{:<24} {:<22} STATUS", "TASK", "TYPE");
        for task in &tasks {
            println!("{:<24} {:<22} {}", task.id, task.task_type, task.status);
        }
    }
    Ok(())
}

fn remove(output: &Output, id: &str, keep_record: bool) -> Result<()> {
    let work_id: WorkId = id.parse()?;
    let services = Services::open()?;
    let work = services.store.get_work(&work_id)?;

    if work.worktree_path.exists() {
        services
            .worktrees
            .remove_worktree(&work.worktree_path)
            .with_context(|| format!("Failed to remove worktree {}", work.worktree_path.display()))?;
    }

    if keep_record {
        services.store.set_work_status(&work_id, WorkStatus::Abandoned)?;
        output.success(&format!("Removed worktree of {}; work marked abandoned", work_id));
    } else {
        services.store.delete_work(&work_id)?;
        output.success(&format!("Removed work {}", work_id));
    }
    Ok(())
}
