//! # Storage Layer
//!
//! Persistence for beadflow. Everything the engine schedules lives in one
//! SQLite database so several processes can share it.
//!
//! ## Project Structure
//!
//! ```text
//! .beadflow/
//! ├── beadflow.db        # works, tasks, estimates, outbox, workflow state
//! ├── config.toml        # Project configuration
//! ├── locks/             # One lock file per running workflow driver
//! ├── worktrees/         # Default location for work worktrees
//! └── .gitignore         # Ignores the database, locks and worktrees
//! ```
//!
//! ## Concurrency Safety
//!
//! - WAL mode with a busy timeout; writers queue instead of failing
//! - Task and outbox transitions are conditional updates
//! - Task creation is a single immediate transaction
//!
//! ## Key Types
//!
//! - [`Project`] - Entry point for accessing a beadflow project
//! - [`Store`] - Works, tasks, complexity cache, outbox and workflow state
//! - [`Config`] - Project and global configuration

mod complexity;
mod config;
mod outbox;
mod project;
mod store;
mod tasks;
mod workflow;
mod works;

pub use complexity::{CacheWrite, CachedComplexity};
pub use config::{
    AgentConfig, Config, ConfigError, GithubConfig, GlobalConfig, OutboxConfig, OutputFormat,
    PlannerConfig, ProjectConfig, SchedulerConfig, TrackerConfig, WorkflowConfig,
};
pub use project::{Project, ProjectError};
pub use store::{Store, StoreError, Transition};
