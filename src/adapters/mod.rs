//! Concrete collaborators that front external command-line tools
//!
//! - [`BdTracker`] reads beads through the `bd` CLI
//! - [`GitWorktrees`] manages worktrees with `git worktree`
//! - [`CommandAgent`] runs the coding agent
//! - [`GhEffects`] posts comments and resolves review threads with `gh api`

mod agent;
mod bd;
mod git;
mod github;
pub mod process;

pub use agent::{render_prompt, CommandAgent};
pub use bd::BdTracker;
pub use git::GitWorktrees;
pub use github::{GhEffects, PullRequestRef};
