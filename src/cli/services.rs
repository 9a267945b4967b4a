//! Wiring a project to its store and external collaborators

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::adapters::{BdTracker, CommandAgent, GhEffects, GitWorktrees};
use crate::engine::{CancelToken, Scheduler};
use crate::storage::{Project, ProjectConfig, Store};

/// Everything a command needs, built once per invocation
pub struct Services {
    pub project: Project,
    pub store: Store,
    pub tracker: BdTracker,
    pub agent: CommandAgent,
    pub github: GhEffects,
    pub worktrees: GitWorktrees,
}

impl Services {
    pub fn open() -> Result<Self> {
        let project = Project::open_current()?;
        let config = &project.config().project;
        config.validate().context("Invalid .beadflow/config.toml")?;
        debug!(root = %project.root().display(), "opened project");

        let store = project.store()?;
        let tracker = BdTracker::new(config.tracker.command.clone());
        let agent = CommandAgent::new(
            config.agent.command.clone(),
            config.agent.args.clone(),
            config.scheduler.task_timeout(),
        );
        let github = GhEffects::new(config.github.command.clone());
        let worktrees = GitWorktrees::new(project.root());

        Ok(Self {
            project,
            store,
            tracker,
            agent,
            github,
            worktrees,
        })
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.project.config().project
    }

    pub fn scheduler(&self, cancel: CancelToken) -> Scheduler<'_> {
        Scheduler::new(
            &self.store,
            &self.agent,
            &self.tracker,
            self.config().scheduler.clone(),
        )
        .with_cancel(cancel)
    }
}

/// A token that fires on Ctrl-C or SIGTERM.
///
/// Only one handler can be installed per process; a second install is
/// logged and the returned token is then never cancelled.
pub fn interrupt_token() -> CancelToken {
    let token = CancelToken::new();
    let handler_token = token.clone();
    let installed = ctrlc::set_handler(move || {
        warn!("interrupted, releasing claimed tasks");
        handler_token.cancel();
    });
    if let Err(e) = installed {
        warn!(err = %e, "could not install interrupt handler");
    }
    token
}
