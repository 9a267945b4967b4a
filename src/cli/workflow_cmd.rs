//! Workflow CLI commands

use anyhow::{Context, Result};
use clap::Subcommand;
use tracing::info;

use super::output::Output;
use super::services::{interrupt_token, Services};
use crate::domain::{WorkflowId, WorkflowState};
use crate::engine::{AgentEstimator, WorkflowDriver, WorkflowLock};

#[derive(Subcommand)]
pub enum WorkflowCommands {
    /// Start the automated workflow for one or more beads
    ///
    /// Examples:
    ///   beadflow workflow start bd-12
    ///   beadflow workflow start bd-epic --base develop
    Start {
        /// Beads or epics to work on
        #[arg(required = true)]
        beads: Vec<String>,

        /// Branch to start from (defaults to workflow.base_branch)
        #[arg(long)]
        base: Option<String>,
    },

    /// Continue a workflow from its persisted step, retrying a failed one
    Resume {
        /// Workflow ID
        id: String,
    },

    /// Show one workflow, or all of them
    Status {
        /// Workflow ID
        id: Option<String>,
    },
}

pub fn run(cmd: WorkflowCommands, output: &Output) -> Result<()> {
    match cmd {
        WorkflowCommands::Start { beads, base } => start(output, &beads, base),
        WorkflowCommands::Resume { id } => resume(output, &id),
        WorkflowCommands::Status { id } => status(output, id.as_deref()),
    }
}

/// Which workflow a command drives
enum Target<'b> {
    New {
        beads: &'b [String],
        base: Option<String>,
    },
    Existing(WorkflowId),
}

fn start(output: &Output, beads: &[String], base: Option<String>) -> Result<()> {
    let services = Services::open()?;
    let state = drive(&services, output, Target::New { beads, base })?;
    print_state(output, &state);
    Ok(())
}

fn resume(output: &Output, id: &str) -> Result<()> {
    let id: WorkflowId = id.parse()?;
    let services = Services::open()?;
    services.store.load_workflow(&id)?;
    let state = drive(&services, output, Target::Existing(id))?;
    print_state(output, &state);
    Ok(())
}

/// Runs a workflow under its lock until it finishes or halts
fn drive(services: &Services, output: &Output, target: Target<'_>) -> Result<WorkflowState> {
    let config = services.config();
    let scheduler = services.scheduler(interrupt_token());
    let estimator = AgentEstimator::new(&scheduler);
    let driver = WorkflowDriver::new(
        &scheduler,
        &services.worktrees,
        config.workflow.clone(),
        services.project.worktree_root(),
    )
    .with_estimator(&estimator)
    .with_poll_interval(config.scheduler.poll_interval());

    let (id, created) = match target {
        Target::New { beads, base } => (driver.create(beads, base)?.workflow_id, true),
        Target::Existing(id) => (id, false),
    };
    let _lock = WorkflowLock::acquire(&services.project.locks_dir(), &id)?;

    if !created && services.store.retry_workflow_step(&id)? {
        info!(workflow = %id, "retrying failed step");
    }
    if output.is_text() {
        println!("Driving workflow {}", id);
    }

    driver.drive(&id).with_context(|| {
        format!(
            "Workflow {} did not finish; resume with 'beadflow workflow resume {}'",
            id, id
        )
    })
}

fn status(output: &Output, id: Option<&str>) -> Result<()> {
    let services = Services::open()?;
    let states = match id {
        Some(id) => {
            let id: WorkflowId = id.parse()?;
            vec![services.store.load_workflow(&id)?]
        }
        None => services.store.list_workflows()?,
    };

    if output.is_json() {
        output.data(&states);
        return Ok(());
    }
    if states.is_empty() {
        println!("No workflows.");
        return Ok(());
    }
    for state in &states {
        print_state(output, state);
        println!();
    }
    Ok(())
}

fn print_state(output: &Output, state: &WorkflowState) {
    if output.is_json() {
        output.data(state);
        return;
    }
    println!("Workflow:  {}", state.workflow_id);
    println!("Beads:     {}", state.payload.requested_beads.join(", "));
    if let Some(work) = &state.work_id {
        println!("Work:      {}", work);
    }
    println!("Step:      {} [{}]", state.current_step, state.step_status);
    if state.payload.review_iteration > 0 {
        println!("Reviews:   {}", state.payload.review_iteration);
    }
    if let Some(err) = &state.error_message {
        println!("Error:     {}", err);
    }
}
