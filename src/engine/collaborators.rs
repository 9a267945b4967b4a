//! Interfaces to the systems the engine drives but does not own
//!
//! The issue tracker, the coding agent, git worktrees and GitHub are all
//! reached through these traits. `crate::adapters` implements them over the
//! real command-line tools; tests substitute in-process fakes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use super::cancel::CancelToken;
use crate::domain::{Bead, BeadWithChildren, TaskId, TaskType, WorkId};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Bead not found: {0}")]
    NotFound(String),

    #[error("Issue tracker command failed: {0}")]
    Command(String),

    #[error("Failed to parse issue tracker output: {0}")]
    Parse(String),
}

/// Read access to the bead backlog
pub trait IssueTracker: Send + Sync {
    fn get_bead(&self, id: &str) -> Result<Bead, TrackerError>;

    /// Open beads with no open `blocks` dependency
    fn ready_beads(&self) -> Result<Vec<Bead>, TrackerError>;

    /// Every bead reachable through `blocks` edges from `id`, excluding `id`
    fn transitive_dependencies(&self, id: &str) -> Result<Vec<Bead>, TrackerError>;

    fn bead_with_children(&self, id: &str) -> Result<BeadWithChildren, TrackerError>;
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Failed to start agent: {0}")]
    Spawn(String),

    #[error("Agent failed: {0}")]
    Failed(String),

    #[error("Agent timed out after {}s", .0.as_secs())]
    TimedOut(Duration),

    #[error("Agent run was cancelled")]
    Cancelled,
}

/// What the agent is told about the task it runs
#[derive(Debug, Clone)]
pub struct PromptContext {
    pub task_id: TaskId,
    pub work_id: WorkId,
    pub task_type: TaskType,
    pub branch: String,
    pub base_branch: String,
    pub beads: Vec<Bead>,
    pub pr_url: Option<String>,
}

/// Runs the coding agent for one task, blocking until it exits
pub trait AgentExecutor: Send + Sync {
    fn execute(
        &self,
        context: &PromptContext,
        worktree: &Path,
        cancel: &CancelToken,
    ) -> Result<(), AgentError>;
}

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("Worktree command failed: {0}")]
    Command(String),

    #[error("Worktree path already exists: {0}")]
    PathExists(PathBuf),
}

pub trait WorktreeManager: Send + Sync {
    /// Creates `branch` from `base_branch` in a new worktree under `base_path`
    /// and returns the worktree path.
    fn create_worktree(
        &self,
        base_path: &Path,
        branch: &str,
        base_branch: &str,
    ) -> Result<PathBuf, WorktreeError>;

    fn remove_worktree(&self, path: &Path) -> Result<(), WorktreeError>;

    /// Returns the worktree that has `branch` checked out, if any
    fn find_worktree(&self, branch: &str) -> Result<Option<PathBuf>, WorktreeError>;
}

#[derive(Debug, Error)]
pub enum EffectError {
    #[error("GitHub request failed: {0}")]
    Request(String),

    #[error("Invalid pull request URL: {0}")]
    InvalidUrl(String),
}

/// The two GitHub side effects the outbox performs
pub trait GithubEffects: Send + Sync {
    fn post_comment(
        &self,
        pr_url: &str,
        body: &str,
        reply_to_id: Option<&str>,
    ) -> Result<(), EffectError>;

    fn resolve_thread(&self, pr_url: &str, comment_id: &str) -> Result<(), EffectError>;
}
