//! Main CLI application structure

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::debug;

use super::output::{Output, OutputFormat};
use super::{execute_cmd, outbox_cmd, plan_cmd, query, task, work_cmd, workflow_cmd};
use crate::engine::CompletionRequest;
use crate::storage::{Config, Project};

#[derive(Parser)]
#[command(name = "beadflow")]
#[command(author, version, about = "Plans, schedules and drives coding-agent work over a bead backlog")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output format (defaults to the global config's default_format)
    #[arg(long, short = 'f', global = true)]
    pub format: Option<OutputFormat>,

    /// Enable debug logging on stderr
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new beadflow project
    Init {
        /// Path to initialize (defaults to current directory)
        #[arg(default_value = ".")]
        path: String,
    },

    /// Pack beads into implement tasks of a work
    ///
    /// Without bead IDs every ready bead is planned.
    Plan {
        /// Beads to plan
        beads: Vec<String>,

        /// Work the tasks belong to
        #[arg(long)]
        work: String,

        /// Pack several beads per task
        #[arg(long, conflicts_with = "no_auto_group")]
        auto_group: bool,

        /// One task per bead
        #[arg(long)]
        no_auto_group: bool,

        /// Complexity budget per task (1-100)
        #[arg(long)]
        budget: Option<u32>,

        /// Fail on beads with no cached estimate instead of running the agent
        #[arg(long)]
        no_estimate: bool,
    },

    /// Record a complexity estimate for a bead
    Estimate {
        /// Bead ID
        bead: String,

        /// Complexity score (1-10)
        #[arg(long, allow_negative_numbers = true)]
        score: i64,

        /// Estimated tokens (5000-50000)
        #[arg(long, allow_negative_numbers = true)]
        tokens: i64,

        /// Estimate task this bead belongs to
        #[arg(long)]
        task: Option<String>,
    },

    /// Run every ready task of a work
    Run {
        /// Work ID
        work: String,
    },

    /// Mark a task or bead complete, or failed with --error
    Complete {
        /// Task ID or bead ID
        target: String,

        /// Pull request URL (pr and update-pr-description tasks)
        #[arg(long)]
        pr: Option<String>,

        /// Record a failure with this message
        #[arg(long, conflicts_with = "pr")]
        error: Option<String>,

        /// Record the epic a review task filed its findings under
        #[arg(long, conflicts_with_all = ["pr", "error"])]
        review_epic: Option<String>,
    },

    /// Manage works
    #[command(subcommand)]
    Work(work_cmd::WorkCommands),

    /// Manage tasks
    #[command(subcommand)]
    Task(task::TaskCommands),

    /// Show tasks ready to run
    Ready {
        /// Work ID
        work: String,
    },

    /// Show blocked tasks
    Blocked {
        /// Work ID
        work: String,
    },

    /// Show project status overview
    Status,

    /// Drive the automated bead-to-PR workflow
    #[command(subcommand)]
    Workflow(workflow_cmd::WorkflowCommands),

    /// Inspect and retry GitHub effects
    #[command(subcommand)]
    Outbox(outbox_cmd::OutboxCommands),
}

/// Main entry point for the CLI
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    crate::logging::init(cli.verbose);

    let format = cli.format.unwrap_or_else(|| {
        Config::load()
            .map(|c| OutputFormat::from(c.global.default_format))
            .unwrap_or_default()
    });
    let output = Output::new(format);
    debug!("beadflow starting");

    match cli.command {
        Commands::Init { path } => {
            let project = Project::init(&path)?;
            debug!(state_dir = %project.state_dir().display(), "initialized");
            output.success(&format!(
                "Initialized beadflow project at {}",
                project.root().display()
            ));
        }

        Commands::Plan {
            beads,
            work,
            auto_group,
            no_auto_group,
            budget,
            no_estimate,
        } => {
            let auto_group = match (auto_group, no_auto_group) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            plan_cmd::plan(
                &output,
                plan_cmd::PlanArgs {
                    work,
                    beads,
                    auto_group,
                    budget,
                    estimate: !no_estimate,
                },
            )?
        }

        Commands::Estimate {
            bead,
            score,
            tokens,
            task,
        } => plan_cmd::estimate(&output, &bead, score, tokens, task.as_deref())?,

        Commands::Run { work } => execute_cmd::run(&output, &work)?,

        Commands::Complete {
            target,
            pr,
            error,
            review_epic,
        } => execute_cmd::complete(
            &output,
            &target,
            CompletionRequest {
                pr_url: pr,
                error,
                review_epic,
            },
        )?,

        Commands::Work(cmd) => work_cmd::run(cmd, &output)?,
        Commands::Task(cmd) => task::run(cmd, &output)?,

        Commands::Ready { work } => query::ready(&output, &work)?,
        Commands::Blocked { work } => query::blocked(&output, &work)?,
        Commands::Status => query::status(&output)?,

        Commands::Workflow(cmd) => workflow_cmd::run(cmd, &output)?,
        Commands::Outbox(cmd) => outbox_cmd::run(cmd, &output)?,
    }

    debug!("command completed");
    Ok(())
}
