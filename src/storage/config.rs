//! Configuration handling for beadflow
//!
//! Configuration is stored in `.beadflow/config.toml` (project) and
//! `~/.config/beadflow/config.toml` (global).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::ComplexityBudget;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

/// Bin-packing planner settings
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlannerConfig {
    /// Soft ceiling on summed complexity per task (1-100)
    pub budget: u32,

    /// Pack several beads per task; when off every bead gets its own task
    pub auto_group: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            budget: ComplexityBudget::DEFAULT,
            auto_group: false,
        }
    }
}

/// Scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Tasks executed concurrently within one work
    pub max_parallel: usize,

    /// Sleep between polls while tasks are in flight elsewhere
    pub poll_interval_ms: u64,

    /// Claims older than this are treated as abandoned (default: 4)
    pub stale_claim_hours: u32,

    /// Agent invocations running longer than this are killed; 0 disables
    pub task_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: 1,
            poll_interval_ms: 2000,
            stale_claim_hours: 4,
            task_timeout_secs: 3600,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::hours(self.stale_claim_hours as i64)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        (self.task_timeout_secs > 0).then(|| Duration::from_secs(self.task_timeout_secs))
    }
}

/// Automated workflow settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Planner budget used by the PlanTasks step
    pub budget: u32,

    /// Upper bound on review-fix iterations
    pub max_review_iterations: u32,

    /// Branch new works start from
    pub base_branch: String,

    /// Prefix for work branch names
    pub branch_prefix: String,

    /// Where worktrees are created, relative to the project root
    pub worktree_root: PathBuf,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            budget: ComplexityBudget::DEFAULT,
            max_review_iterations: 5,
            base_branch: "main".to_string(),
            branch_prefix: "beadflow/".to_string(),
            worktree_root: PathBuf::from(".beadflow/worktrees"),
        }
    }
}

/// Outbox retry settings
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OutboxConfig {
    pub max_attempts: u32,

    /// Delay before a failed effect becomes due again
    pub retry_delay_secs: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay_secs: 60,
        }
    }
}

impl OutboxConfig {
    pub fn retry_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retry_delay_secs as i64)
    }
}

/// The coding agent executable
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    pub command: String,

    /// Arguments placed before the prompt is written to stdin
    pub args: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: vec!["--print".to_string()],
        }
    }
}

/// The issue tracker CLI
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TrackerConfig {
    pub command: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            command: "bd".to_string(),
        }
    }
}

/// The GitHub CLI used for review-thread effects
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GithubConfig {
    pub command: String,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            command: "gh".to_string(),
        }
    }
}

/// Project-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ProjectConfig {
    pub planner: PlannerConfig,
    pub scheduler: SchedulerConfig,
    pub workflow: WorkflowConfig,
    pub outbox: OutboxConfig,
    pub agent: AgentConfig,
    pub tracker: TrackerConfig,
    pub github: GithubConfig,
}

impl ProjectConfig {
    /// Rejects values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let budget = |name: &str, value: u32| {
            ComplexityBudget::new(value as i64)
                .map(|_| ())
                .map_err(|e| ConfigError::Invalid(format!("{}: {}", name, e)))
        };
        budget("planner.budget", self.planner.budget)?;
        budget("workflow.budget", self.workflow.budget)?;

        if self.scheduler.max_parallel == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_parallel must be at least 1".to_string(),
            ));
        }
        if self.workflow.max_review_iterations == 0 {
            return Err(ConfigError::Invalid(
                "workflow.max_review_iterations must be at least 1".to_string(),
            ));
        }
        if self.outbox.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "outbox.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.agent.command.trim().is_empty() {
            return Err(ConfigError::Invalid("agent.command is empty".to_string()));
        }
        Ok(())
    }
}

/// Global user configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GlobalConfig {
    /// Default output format (text or json)
    pub default_format: OutputFormat,
}

/// Output format for commands
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Combined configuration (global + project)
#[derive(Debug, Clone)]
pub struct Config {
    pub project: ProjectConfig,
    pub global: GlobalConfig,
    pub project_root: Option<PathBuf>,
}

impl Config {
    /// Loads configuration from default locations
    pub fn load() -> Result<Self> {
        let global = Self::load_global()?;
        let project_root = Self::find_project_root();
        let project = match &project_root {
            Some(root) => Self::load_project_config(root)?,
            None => ProjectConfig::default(),
        };

        Ok(Self {
            project,
            global,
            project_root,
        })
    }

    /// Loads configuration for a specific project
    pub fn for_project(project_root: &Path) -> Result<Self> {
        let global = Self::load_global()?;
        let project = Self::load_project_config(project_root)?;

        Ok(Self {
            project,
            global,
            project_root: Some(project_root.to_path_buf()),
        })
    }

    /// Returns the global config directory
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("dev", "beadflow", "beadflow")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    fn load_global() -> Result<GlobalConfig> {
        let config_dir = match Self::global_config_dir() {
            Some(dir) => dir,
            None => return Ok(GlobalConfig::default()),
        };

        let config_path = config_dir.join("config.toml");
        if !config_path.exists() {
            return Ok(GlobalConfig::default());
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read global config: {}", config_path.display()))?;

        toml::from_str(&content)
            .map_err(|e| ConfigError::Parse(e.to_string()))
            .context("Failed to parse global config")
    }

    fn load_project_config(project_root: &Path) -> Result<ProjectConfig> {
        let config_path = project_root.join(".beadflow").join("config.toml");

        if !config_path.exists() {
            return Ok(ProjectConfig::default());
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read project config: {}", config_path.display()))?;

        let config: ProjectConfig = toml::from_str(&content)
            .map_err(|e| ConfigError::Parse(e.to_string()))
            .context("Failed to parse project config")?;

        config
            .validate()
            .with_context(|| format!("Invalid project config: {}", config_path.display()))?;

        Ok(config)
    }

    /// Finds the project root by looking for `.beadflow/` from the current directory up
    pub fn find_project_root() -> Option<PathBuf> {
        Self::find_project_root_from(&std::env::current_dir().ok()?)
    }

    /// Finds the project root by looking for `.beadflow/` from `start` up
    pub fn find_project_root_from(start: &Path) -> Option<PathBuf> {
        let mut current = start.to_path_buf();

        loop {
            if current.join(".beadflow").is_dir() {
                return Some(current);
            }

            if !current.pop() {
                return None;
            }
        }
    }

    /// Returns the project root, or an error if not in a project
    pub fn require_project_root(&self) -> Result<&Path> {
        self.project_root
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Not in a beadflow project. Run 'beadflow init' first."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config() {
        let config = ProjectConfig::default();

        assert_eq!(config.planner.budget, 70);
        assert!(!config.planner.auto_group);
        assert_eq!(config.scheduler.stale_claim_hours, 4);
        assert_eq!(config.workflow.max_review_iterations, 5);
        assert_eq!(config.outbox.max_attempts, 5);
        assert_eq!(config.tracker.command, "bd");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_partial_project_config() {
        let toml = r#"
[planner]
budget = 40

[scheduler]
max_parallel = 3

[agent]
command = "my-agent"
args = ["--headless"]
"#;

        let config: ProjectConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.planner.budget, 40);
        assert!(!config.planner.auto_group);
        assert_eq!(config.scheduler.max_parallel, 3);
        assert_eq!(config.scheduler.poll_interval_ms, 2000);
        assert_eq!(config.agent.args, vec!["--headless"]);
        assert_eq!(config.workflow.base_branch, "main");
    }

    #[test]
    fn planner_grouping_is_opt_in() {
        assert!(!PlannerConfig::default().auto_group);

        let empty: ProjectConfig = toml::from_str("").unwrap();
        assert!(!empty.planner.auto_group);

        let enabled: ProjectConfig = toml::from_str("[planner]\nauto_group = true\n").unwrap();
        assert!(enabled.planner.auto_group);
        assert_eq!(enabled.planner.budget, 70);
    }

    #[test]
    fn out_of_range_budget_is_invalid() {
        let mut config = ProjectConfig::default();
        config.planner.budget = 150;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = ProjectConfig::default();
        config.scheduler.max_parallel = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_project_file_fails_to_load() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".beadflow")).unwrap();
        fs::write(
            dir.path().join(".beadflow").join("config.toml"),
            "[planner]\nbudget = 0\n",
        )
        .unwrap();

        assert!(Config::for_project(dir.path()).is_err());
    }

    #[test]
    fn parse_global_config() {
        let config: GlobalConfig = toml::from_str(r#"default_format = "json""#).unwrap();
        assert_eq!(config.default_format, OutputFormat::Json);
    }

    #[test]
    fn timeouts() {
        let mut scheduler = SchedulerConfig::default();
        assert_eq!(scheduler.task_timeout(), Some(Duration::from_secs(3600)));
        scheduler.task_timeout_secs = 0;
        assert_eq!(scheduler.task_timeout(), None);
        assert_eq!(scheduler.stale_after(), chrono::Duration::hours(4));
    }

    #[test]
    fn find_project_root() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".beadflow")).unwrap();

        let sub_dir = dir.path().join("sub").join("dir");
        fs::create_dir_all(&sub_dir).unwrap();

        let root = Config::find_project_root_from(&sub_dir);
        assert_eq!(root.as_deref(), Some(dir.path()));
    }

    #[test]
    fn config_not_in_project() {
        let config = Config {
            project: ProjectConfig::default(),
            global: GlobalConfig::default(),
            project_root: None,
        };

        assert!(config.require_project_root().is_err());
    }
}
