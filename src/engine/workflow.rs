//! Resumable seven-step workflow driver
//!
//! The driver re-reads the persisted state before every step and never acts
//! on what it remembers from the previous one. A step either advances the
//! workflow (persisting its payload in the same update), asks to be polled
//! again, or fails. A failed step is written to the store and halts the
//! workflow until someone retries it. Cancellation is not a failure and is
//! never persisted.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::collaborators::{TrackerError, WorktreeError, WorktreeManager};
use super::collect::collect_beads;
use super::planner::{Estimator, PlanError, Planner};
use super::review::{ReviewError, ReviewFixLoop};
use super::scheduler::{ScheduleError, Scheduler};
use crate::domain::{
    branch_slug, Bead, NewTask, StepStatus, TaskId, TaskStatus, TaskType, Work, WorkId,
    WorkStatus, WorkflowId, WorkflowPayload, WorkflowState, WorkflowStep,
};
use crate::storage::{PlannerConfig, Store, StoreError, WorkflowConfig};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Review(#[from] ReviewError),

    #[error("{0}")]
    Step(String),

    #[error("Workflow {id} halted at step {step}: {message}")]
    Halted {
        id: WorkflowId,
        step: WorkflowStep,
        message: String,
    },

    #[error("Workflow {0} is already being driven by another process")]
    Locked(WorkflowId),

    #[error("Invalid workflow request: {0}")]
    Invalid(String),

    #[error("Workflow lock error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Workflow was cancelled")]
    Cancelled,
}

/// What a step asks the driver to do next
enum StepResult {
    Advance(WorkflowPayload),
    Wait,
}

pub struct WorkflowDriver<'s, 'a> {
    scheduler: &'s Scheduler<'a>,
    worktrees: &'s dyn WorktreeManager,
    estimator: Option<&'s dyn Estimator>,
    config: WorkflowConfig,
    worktree_root: PathBuf,
    poll_interval: Duration,
}

impl<'s, 'a> WorkflowDriver<'s, 'a> {
    pub fn new(
        scheduler: &'s Scheduler<'a>,
        worktrees: &'s dyn WorktreeManager,
        config: WorkflowConfig,
        worktree_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            scheduler,
            worktrees,
            estimator: None,
            config,
            worktree_root: worktree_root.into(),
            poll_interval: Duration::from_secs(2),
        }
    }

    pub fn with_estimator(mut self, estimator: &'s dyn Estimator) -> Self {
        self.estimator = Some(estimator);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn store(&self) -> &'a Store {
        self.scheduler.store()
    }

    /// Records a new workflow for `beads`, positioned at step 0
    pub fn create(
        &self,
        beads: &[String],
        base_branch: Option<String>,
    ) -> Result<WorkflowState, WorkflowError> {
        let beads: Vec<String> = beads
            .iter()
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty())
            .collect();
        if beads.is_empty() {
            return Err(WorkflowError::Invalid("at least one bead ID is required".to_string()));
        }

        let id = WorkflowId::new(&beads.join(","), Utc::now());
        let state = WorkflowState::new(
            id,
            WorkflowPayload {
                requested_beads: beads,
                base_branch,
                ..WorkflowPayload::default()
            },
        );
        self.store().create_workflow(&state)?;
        info!(workflow = %state.workflow_id, beads = ?state.payload.requested_beads, "workflow created");
        Ok(state)
    }

    /// Drives the workflow until it finishes, halts or is cancelled
    pub fn drive(&self, id: &WorkflowId) -> Result<WorkflowState, WorkflowError> {
        let cancel = self.scheduler.cancel_token();
        loop {
            if cancel.is_cancelled() {
                return Err(WorkflowError::Cancelled);
            }

            let state = self.store().load_workflow(id)?;
            if state.is_finished() {
                info!(workflow = %id, "workflow finished");
                return Ok(state);
            }
            if state.step_status == StepStatus::Failed {
                return Err(WorkflowError::Halted {
                    id: id.clone(),
                    step: state.current_step,
                    message: state.error_message.unwrap_or_default(),
                });
            }

            let step = state.current_step;
            match self.run_step(&state) {
                Ok(StepResult::Advance(payload)) => {
                    self.store().advance_workflow(id, step, &payload)?;
                    info!(workflow = %id, %step, "step completed");
                }
                Ok(StepResult::Wait) => {
                    debug!(workflow = %id, %step, "waiting");
                    if !cancel.sleep(self.poll_interval) {
                        return Err(WorkflowError::Cancelled);
                    }
                }
                Err(_) if cancel.is_cancelled() => return Err(WorkflowError::Cancelled),
                Err(e) => {
                    let message = e.to_string();
                    warn!(workflow = %id, %step, error = %message, "step failed");
                    self.store().fail_workflow_step(id, step, &message)?;
                    return Err(WorkflowError::Halted {
                        id: id.clone(),
                        step,
                        message,
                    });
                }
            }
        }
    }

    #[instrument(skip_all, fields(workflow = %state.workflow_id, step = %state.current_step))]
    fn run_step(&self, state: &WorkflowState) -> Result<StepResult, WorkflowError> {
        let payload = state.payload.clone();
        let work_id = state
            .work_id
            .clone()
            .unwrap_or_else(|| state.workflow_id.work_id());

        match state.current_step {
            WorkflowStep::CreateWork => self.create_work(state, payload),
            WorkflowStep::CollectBeads => self.collect(payload),
            WorkflowStep::PlanTasks => self.plan(&work_id, payload),
            WorkflowStep::ExecuteTasks => self.execute(&work_id, payload),
            WorkflowStep::WaitCompletion => self.wait_completion(payload),
            WorkflowStep::ReviewFix => self.review_fix(state, &work_id, payload),
            WorkflowStep::CreatePr => self.create_pr(state, &work_id, payload),
        }
    }

    /// Reuses the work, branch and worktree a previous attempt created
    fn create_work(
        &self,
        state: &WorkflowState,
        payload: WorkflowPayload,
    ) -> Result<StepResult, WorkflowError> {
        let store = self.store();
        let work_id = state.workflow_id.work_id();

        if store.find_work(&work_id)?.is_none() {
            let first = payload
                .requested_beads
                .first()
                .ok_or_else(|| WorkflowError::Invalid("no beads requested".to_string()))?;
            let title = self.scheduler.tracker().get_bead(first)?.title;
            let branch = format!(
                "{}{}-{}",
                self.config.branch_prefix,
                branch_slug(&title),
                work_id.hash()
            );
            let base = payload
                .base_branch
                .clone()
                .unwrap_or_else(|| self.config.base_branch.clone());

            let path = match self.worktrees.find_worktree(&branch)? {
                Some(path) => {
                    info!(branch = %branch, path = %path.display(), "reusing worktree");
                    path
                }
                None => self
                    .worktrees
                    .create_worktree(&self.worktree_root, &branch, &base)?,
            };

            match store.insert_work(&Work::new(work_id.clone(), branch, path, base)) {
                Ok(()) | Err(StoreError::Duplicate { .. }) => {}
                Err(e) => return Err(e.into()),
            }
            info!(work = %work_id, "work created");
        }

        store.save_workflow_progress(
            &state.workflow_id,
            WorkflowStep::CreateWork,
            Some(&work_id),
            &payload,
        )?;
        Ok(StepResult::Advance(payload))
    }

    fn collect(&self, mut payload: WorkflowPayload) -> Result<StepResult, WorkflowError> {
        if !payload.bead_ids.is_empty() {
            return Ok(StepResult::Advance(payload));
        }

        let beads = collect_beads(self.scheduler.tracker(), &payload.requested_beads)?;
        if beads.is_empty() {
            return Err(WorkflowError::Step(
                "no open beads to work on".to_string(),
            ));
        }
        payload.bead_ids = beads.into_iter().map(|b| b.id).collect();
        Ok(StepResult::Advance(payload))
    }

    /// Plans only beads no implement task holds yet, so a retry after a
    /// partial plan picks up where it stopped
    fn plan(
        &self,
        work_id: &WorkId,
        mut payload: WorkflowPayload,
    ) -> Result<StepResult, WorkflowError> {
        let store = self.store();

        let mut task_ids = Vec::new();
        let mut covered = Vec::new();
        for task in store.list_tasks(work_id)? {
            if task.task_type != TaskType::Implement {
                continue;
            }
            covered.extend(store.task_beads(&task.id)?.into_iter().map(|b| b.bead_id));
            task_ids.push(task.id);
        }

        let remaining: Vec<Bead> = payload
            .bead_ids
            .iter()
            .filter(|id| !covered.contains(id))
            .map(|id| self.scheduler.tracker().get_bead(id))
            .collect::<Result<_, _>>()?;

        if !remaining.is_empty() {
            let planner = Planner::new(
                store,
                PlannerConfig {
                    budget: self.config.budget,
                    auto_group: true,
                },
            );
            let report = planner.plan(work_id, &remaining, self.estimator)?;
            task_ids.extend(report.tasks.into_iter().map(|t| t.task.id));
        }

        payload.task_ids = task_ids;
        Ok(StepResult::Advance(payload))
    }

    fn execute(
        &self,
        work_id: &WorkId,
        payload: WorkflowPayload,
    ) -> Result<StepResult, WorkflowError> {
        let report = self.scheduler.run_work(work_id)?;
        if report.cancelled {
            return Err(WorkflowError::Cancelled);
        }
        if !report.blocked.is_empty() {
            warn!(work = %work_id, blocked = ?report.blocked, "tasks blocked behind failures");
        }
        if !report.failed.is_empty() {
            let failures: Vec<String> = report
                .failed
                .iter()
                .map(|(id, msg)| format!("{} ({})", id, msg))
                .collect();
            let mut message = format!("tasks failed: {}", failures.join(", "));
            if !report.blocked.is_empty() {
                let blocked: Vec<String> = report.blocked.iter().map(ToString::to_string).collect();
                message.push_str(&format!("; blocked: {}", blocked.join(", ")));
            }
            return Err(WorkflowError::Step(message));
        }
        Ok(StepResult::Advance(payload))
    }

    fn wait_completion(&self, payload: WorkflowPayload) -> Result<StepResult, WorkflowError> {
        let mut waiting = 0;
        for id in &payload.task_ids {
            let task = self.store().get_task(id)?;
            match task.status {
                TaskStatus::Failed => {
                    return Err(WorkflowError::Step(format!(
                        "task {} failed: {}",
                        id,
                        task.error_message.unwrap_or_default()
                    )))
                }
                TaskStatus::Completed => {}
                TaskStatus::Pending | TaskStatus::Processing => waiting += 1,
            }
        }

        if waiting > 0 {
            debug!(waiting, "tasks still running");
            return Ok(StepResult::Wait);
        }
        Ok(StepResult::Advance(payload))
    }

    fn review_fix(
        &self,
        state: &WorkflowState,
        work_id: &WorkId,
        mut payload: WorkflowPayload,
    ) -> Result<StepResult, WorkflowError> {
        let store = self.store();
        let id = &state.workflow_id;
        let outcome = ReviewFixLoop::new(self.scheduler, self.config.max_review_iterations).run(
            work_id,
            &mut payload,
            &mut |p| store.save_workflow_progress(id, WorkflowStep::ReviewFix, None, p),
        )?;
        info!(iterations = outcome.iterations, fixes = outcome.fix_tasks.len(), "review converged");
        Ok(StepResult::Advance(payload))
    }

    /// Opens the pull request, or refreshes its description if the work has one
    fn create_pr(
        &self,
        state: &WorkflowState,
        work_id: &WorkId,
        mut payload: WorkflowPayload,
    ) -> Result<StepResult, WorkflowError> {
        let store = self.store();
        let work = store.get_work(work_id)?;

        let task_id: TaskId = match payload.pr_task_id.clone() {
            Some(id) => id,
            None => {
                let task_type = if work.pr_url.is_some() {
                    TaskType::UpdatePrDescription
                } else {
                    TaskType::Pr
                };
                let task = store.create_task(&NewTask::new(work_id.clone(), task_type))?;
                payload.pr_task_id = Some(task.id.clone());
                store.save_workflow_progress(
                    &state.workflow_id,
                    WorkflowStep::CreatePr,
                    None,
                    &payload,
                )?;
                task.id
            }
        };

        self.scheduler.run_task(&task_id)?;

        let task = store.get_task(&task_id)?;
        if let Some(url) = task.pr_url.as_deref() {
            if work.pr_url.as_deref() != Some(url) {
                store.set_work_pr_url(work_id, url)?;
            }
        }
        store.set_work_status(work_id, WorkStatus::Completed)?;
        Ok(StepResult::Advance(payload))
    }
}

/// Exclusive per-workflow lock file, released on drop
#[derive(Debug)]
pub struct WorkflowLock {
    file: File,
    path: PathBuf,
}

impl WorkflowLock {
    pub fn acquire(locks_dir: &Path, id: &WorkflowId) -> Result<Self, WorkflowError> {
        fs::create_dir_all(locks_dir)?;
        let path = locks_dir.join(format!("{}.lock", id));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        file.try_lock_exclusive()
            .map_err(|_| WorkflowError::Locked(id.clone()))?;
        debug!(path = %path.display(), "workflow lock acquired");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkflowLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
