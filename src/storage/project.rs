//! Project management
//!
//! Handles project initialization and provides access to the store.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use thiserror::Error;

use super::{Config, Store};

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("Not in a beadflow project. Run 'beadflow init' first.")]
    NotInProject,
}

const DEFAULT_CONFIG: &str = r#"# beadflow configuration

[planner]
# Soft ceiling on summed complexity per task (1-100)
budget = 70
# Pack several beads per task under the budget; false gives one task per bead
auto_group = false

[scheduler]
max_parallel = 1
poll_interval_ms = 2000
# Processing tasks claimed longer ago than this are re-queued
stale_claim_hours = 4
# 0 disables the per-task timeout
task_timeout_secs = 3600

[workflow]
budget = 70
max_review_iterations = 5
base_branch = "main"
branch_prefix = "beadflow/"
worktree_root = ".beadflow/worktrees"

[outbox]
max_attempts = 5
retry_delay_secs = 60

[agent]
command = "claude"
args = ["--print"]

[tracker]
command = "bd"

[github]
command = "gh"
"#;

const GITIGNORE: &str = r#"# Local state, never committed
beadflow.db
beadflow.db-wal
beadflow.db-shm
locks/
worktrees/
"#;

/// A beadflow project
pub struct Project {
    root: PathBuf,
    config: Config,
}

impl Project {
    /// Opens an existing project at the given path
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();

        if !root.join(".beadflow").is_dir() {
            return Err(ProjectError::NotInProject.into());
        }

        let config = Config::for_project(&root)?;

        Ok(Self { root, config })
    }

    /// Opens the project at the current directory or a parent
    pub fn open_current() -> Result<Self> {
        let root = Config::find_project_root().ok_or(ProjectError::NotInProject)?;

        Self::open(root)
    }

    /// Initializes a new project at the given path
    pub fn init(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let state_dir = root.join(".beadflow");

        fs::create_dir_all(&state_dir).with_context(|| {
            format!("Failed to create .beadflow directory: {}", state_dir.display())
        })?;

        let config_path = state_dir.join("config.toml");
        if !config_path.exists() {
            fs::write(&config_path, DEFAULT_CONFIG)
                .with_context(|| format!("Failed to write config: {}", config_path.display()))?;
        }

        let gitignore_path = state_dir.join(".gitignore");
        if !gitignore_path.exists() {
            fs::write(&gitignore_path, GITIGNORE).with_context(|| {
                format!("Failed to write .gitignore: {}", gitignore_path.display())
            })?;
        }

        let project = Self::open(root)?;
        project.store()?;
        Ok(project)
    }

    /// Returns the project root path
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the .beadflow directory path
    pub fn state_dir(&self) -> PathBuf {
        self.root.join(".beadflow")
    }

    pub fn db_path(&self) -> PathBuf {
        self.state_dir().join("beadflow.db")
    }

    /// Directory holding per-workflow lock files
    pub fn locks_dir(&self) -> PathBuf {
        self.state_dir().join("locks")
    }

    /// Directory new worktrees are created under
    pub fn worktree_root(&self) -> PathBuf {
        let configured = &self.config.project.workflow.worktree_root;
        if configured.is_absolute() {
            configured.clone()
        } else {
            self.root.join(configured)
        }
    }

    /// Returns the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Opens the SQLite store for this project
    pub fn store(&self) -> Result<Store> {
        let path = self.db_path();
        Store::open(&path).with_context(|| format!("Failed to open store: {}", path.display()))
    }
}
