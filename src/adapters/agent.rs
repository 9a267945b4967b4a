//! Coding agent run as a child process
//!
//! The prompt goes to the agent's stdin and the process runs inside the
//! work's worktree. The agent reports progress back through the beadflow
//! CLI (`complete`, `estimate`); its exit status only says whether the
//! session as a whole succeeded.

use std::fmt::Write as _;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use tracing::info;

use super::process::{run_command, ProcessError};
use crate::domain::TaskType;
use crate::engine::{AgentError, AgentExecutor, CancelToken, PromptContext};

pub struct CommandAgent {
    command: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandAgent {
    pub fn new(command: impl Into<String>, args: Vec<String>, timeout: Option<Duration>) -> Self {
        Self {
            command: command.into(),
            args,
            timeout,
        }
    }
}

impl AgentExecutor for CommandAgent {
    fn execute(
        &self,
        context: &PromptContext,
        worktree: &Path,
        cancel: &CancelToken,
    ) -> Result<(), AgentError> {
        let prompt = render_prompt(context);
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .current_dir(worktree)
            .env("BEADFLOW_TASK_ID", context.task_id.to_string())
            .env("BEADFLOW_WORK_ID", context.work_id.to_string())
            .env("BEADFLOW_TASK_TYPE", context.task_type.as_str());

        info!(task = %context.task_id, agent = %self.command, "starting agent");
        let output = run_command(cmd, Some(prompt.as_bytes()), self.timeout, Some(cancel))
            .map_err(|e| match e {
                ProcessError::Cancelled => AgentError::Cancelled,
                ProcessError::TimedOut(limit) => AgentError::TimedOut(limit),
                other => AgentError::Spawn(other.to_string()),
            })?;

        if !output.success() {
            return Err(AgentError::Failed(output.failure_message()));
        }
        Ok(())
    }
}

/// Builds the instructions handed to the agent for one task
pub fn render_prompt(ctx: &PromptContext) -> String {
    let mut out = String::new();
    let task = &ctx.task_id;

    let _ = writeln!(out, "You are working on task {} ({}).", task, ctx.task_type);
    let _ = writeln!(
        out,
        "Branch: {} (based on {}). Commit your changes on this branch.",
        ctx.branch, ctx.base_branch
    );
    if let Some(url) = &ctx.pr_url {
        let _ = writeln!(out, "Pull request: {}", url);
    }
    out.push('\n');

    match ctx.task_type {
        TaskType::Estimate => {
            out.push_str("Estimate each bead below. Do not change any code.\n");
            let _ = writeln!(
                out,
                "For each bead run: beadflow estimate <bead-id> --score <1-10> --tokens <5000-50000> --task {}",
                task
            );
        }
        TaskType::Implement => {
            out.push_str("Implement the beads below in order.\n");
            out.push_str("After finishing each bead, close it in the tracker and run: beadflow complete <bead-id>\n");
        }
        TaskType::Review => {
            out.push_str("Review every change on this branch against the base branch.\n");
            out.push_str("File each problem you find as a bead under one review epic, then run:\n");
            let _ = writeln!(out, "beadflow complete {} --review-epic <epic-id>", task);
        }
        TaskType::Pr => {
            out.push_str("Push the branch and open a pull request summarizing the work, then run:\n");
            let _ = writeln!(out, "beadflow complete {} --pr <pull-request-url>", task);
        }
        TaskType::UpdatePrDescription => {
            out.push_str("Push the branch and rewrite the pull request description to cover all of the work, then run:\n");
            let _ = writeln!(out, "beadflow complete {} --pr <pull-request-url>", task);
        }
        TaskType::GithubComment | TaskType::GithubResolveThread => {
            out.push_str("This task is performed by beadflow itself.\n");
        }
    }
    let _ = writeln!(
        out,
        "If you cannot finish, run: beadflow complete {} --error \"<reason>\"",
        task
    );

    if !ctx.beads.is_empty() {
        out.push_str("\n## Beads\n");
        for bead in &ctx.beads {
            let _ = writeln!(out, "\n### {}: {}", bead.id, bead.title);
            if !bead.description.trim().is_empty() {
                let _ = writeln!(out, "{}", bead.description.trim());
            }
        }
    }
    out
}
