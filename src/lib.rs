//! beadflow - Orchestrates coding-agent sessions over a bead backlog
//!
//! Beads tracked by an external issue tracker are packed into
//! dependency-ordered tasks, run by a coding agent in isolated git
//! worktrees, reviewed until no new issues appear, and turned into a pull
//! request. All progress is persisted so any step survives a restart.

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod engine;
pub mod logging;
pub mod storage;

pub use domain::{Bead, Task, TaskId, TaskStatus, Work, WorkId};
