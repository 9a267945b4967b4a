//! Task scheduler
//!
//! Workers poll the store for the lowest-sequence ready task of a work,
//! claim it with a conditional update, run the agent against the work's
//! worktree and record the outcome. At most `max_parallel` agent sessions
//! run at once; beyond that the dependency graph is the only ordering.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::cancel::CancelToken;
use super::claims::{is_stale, ClaimOwner};
use super::collaborators::{AgentError, AgentExecutor, IssueTracker, PromptContext};
use super::warnings::Warnings;
use crate::domain::{Bead, Task, TaskId, TaskStatus, TaskType, Work, WorkId};
use crate::storage::{SchedulerConfig, Store, StoreError};

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Task {0} is not ready: a dependency has not completed")]
    NotReady(TaskId),

    #[error("Task {id} failed: {message}")]
    TaskFailed { id: TaskId, message: String },

    #[error("A scheduler worker panicked")]
    WorkerPanicked,

    #[error("Scheduling was cancelled")]
    Cancelled,
}

/// What one scheduling run did
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub completed: Vec<TaskId>,
    pub failed: Vec<(TaskId, String)>,

    /// Tasks handed back to pending after cancellation
    pub released: Vec<TaskId>,

    /// Abandoned claims reset to pending
    pub reclaimed: Vec<TaskId>,

    /// Pending tasks left behind a failed dependency
    pub blocked: Vec<TaskId>,

    pub cancelled: bool,
    pub warnings: Warnings,
}

impl RunReport {
    /// True when nothing failed, nothing is blocked and the run was not cut short
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.blocked.is_empty() && !self.cancelled
    }

    fn record(&mut self, id: TaskId, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Completed => self.completed.push(id),
            TaskOutcome::Failed(message) => self.failed.push((id, message)),
            TaskOutcome::Released => self.released.push(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TaskOutcome {
    Completed,
    Failed(String),
    Released,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Scheduler<'a> {
    store: &'a Store,
    agent: &'a dyn AgentExecutor,
    tracker: &'a dyn IssueTracker,
    config: SchedulerConfig,
    owner: ClaimOwner,
    cancel: CancelToken,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        store: &'a Store,
        agent: &'a dyn AgentExecutor,
        tracker: &'a dyn IssueTracker,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            agent,
            tracker,
            config,
            owner: ClaimOwner::current(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_owner(mut self, owner: ClaimOwner) -> Self {
        self.owner = owner;
        self
    }

    pub fn store(&self) -> &'a Store {
        self.store
    }

    pub fn tracker(&self) -> &'a dyn IssueTracker {
        self.tracker
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Runs every ready task of a work until none is ready and none is in flight.
    ///
    /// Task failures are recorded in the report, not returned as errors;
    /// dependents of a failed task stay pending and are listed as blocked.
    pub fn run_work(&self, work_id: &WorkId) -> Result<RunReport, ScheduleError> {
        let work = self.store.get_work(work_id)?;
        let report = Mutex::new(RunReport::default());
        let workers = self.config.max_parallel.max(1);
        info!(work = %work_id, workers, "scheduling work");

        let work = &work;
        let shared = &report;
        thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|n| scope.spawn(move || self.worker(n, work, shared)))
                .collect();

            let mut first_error = None;
            for handle in handles {
                let result = handle.join().unwrap_or(Err(ScheduleError::WorkerPanicked));
                if let Err(e) = result {
                    first_error.get_or_insert(e);
                }
            }
            first_error.map_or(Ok(()), Err)
        })?;

        let mut report = report.into_inner().unwrap_or_else(PoisonError::into_inner);
        report.blocked = self
            .store
            .blocked_tasks(work_id)?
            .into_iter()
            .map(|(task, _)| task.id)
            .collect();

        info!(
            work = %work_id,
            completed = report.completed.len(),
            failed = report.failed.len(),
            blocked = report.blocked.len(),
            "scheduling finished"
        );
        Ok(report)
    }

    fn worker(
        &self,
        worker: usize,
        work: &Work,
        report: &Mutex<RunReport>,
    ) -> Result<(), ScheduleError> {
        let owner = self.owner.to_string();
        loop {
            if self.cancel.is_cancelled() {
                lock(report).cancelled = true;
                return Ok(());
            }

            if let Some(task) = self.store.claim_next_ready(&work.id, &owner)? {
                debug!(worker, task = %task.id, "claimed");
                let (outcome, warnings) = self.execute_claimed(work, &task)?;
                let released = matches!(outcome, TaskOutcome::Released);
                let mut report = lock(report);
                report.warnings.extend(warnings);
                report.record(task.id, outcome);
                if released {
                    // The released task is claimable again; stop every worker
                    // instead of handing it straight back to the agent.
                    report.cancelled = true;
                    self.cancel.cancel();
                    return Ok(());
                }
                continue;
            }

            let processing = self.store.processing_tasks(Some(&work.id))?;
            if processing.is_empty() {
                return Ok(());
            }

            let reclaimed = self.reclaim_stale(&processing)?;
            if !reclaimed.is_empty() {
                lock(report).reclaimed.extend(reclaimed);
                continue;
            }

            debug!(worker, in_flight = processing.len(), "waiting on in-flight tasks");
            if !self.cancel.sleep(self.config.poll_interval()) {
                lock(report).cancelled = true;
                return Ok(());
            }
        }
    }

    /// Resets processing tasks whose claims were abandoned
    pub fn reclaim_stale(&self, processing: &[Task]) -> Result<Vec<TaskId>, ScheduleError> {
        let now = Utc::now();
        let mut reclaimed = Vec::new();
        for task in processing {
            if !is_stale(task, &self.owner, now, self.config.stale_after()) {
                continue;
            }
            if self
                .store
                .reclaim_task(&task.id, task.claimed_by.as_deref())?
            {
                warn!(task = %task.id, owner = ?task.claimed_by, "reclaimed abandoned task");
                reclaimed.push(task.id.clone());
            }
        }
        Ok(reclaimed)
    }

    /// Runs one task to a terminal state.
    ///
    /// A pending task must be ready. A task already processing elsewhere is
    /// waited on. A completed task returns at once; a failed one is an error.
    pub fn run_task(&self, task_id: &TaskId) -> Result<RunReport, ScheduleError> {
        let owner = self.owner.to_string();
        let mut report = RunReport::default();

        loop {
            let task = self.store.get_task(task_id)?;
            match task.status {
                TaskStatus::Completed => {
                    if !report.completed.contains(task_id) {
                        report.completed.push(task_id.clone());
                    }
                    return Ok(report);
                }
                TaskStatus::Failed => {
                    return Err(ScheduleError::TaskFailed {
                        id: task.id,
                        message: task.error_message.unwrap_or_default(),
                    })
                }
                TaskStatus::Pending => {
                    if !self.store.claim_task(task_id, &owner)? {
                        return Err(ScheduleError::NotReady(task_id.clone()));
                    }
                    let work = self.store.get_work(&task.work_id)?;
                    let claimed = self.store.get_task(task_id)?;
                    let (outcome, warnings) = self.execute_claimed(&work, &claimed)?;
                    report.warnings.extend(warnings);
                    match outcome {
                        TaskOutcome::Released => return Err(ScheduleError::Cancelled),
                        TaskOutcome::Failed(message) => {
                            return Err(ScheduleError::TaskFailed {
                                id: task_id.clone(),
                                message,
                            })
                        }
                        TaskOutcome::Completed => report.completed.push(task_id.clone()),
                    }
                }
                TaskStatus::Processing => {
                    let reclaimed = self.reclaim_stale(std::slice::from_ref(&task))?;
                    if !reclaimed.is_empty() {
                        report.reclaimed.extend(reclaimed);
                        continue;
                    }
                    debug!(task = %task_id, "waiting on task claimed elsewhere");
                    if !self.cancel.sleep(self.config.poll_interval()) {
                        return Err(ScheduleError::Cancelled);
                    }
                }
            }
        }
    }

    #[instrument(skip_all, fields(task = %task.id, task_type = %task.task_type))]
    fn execute_claimed(
        &self,
        work: &Work,
        task: &Task,
    ) -> Result<(TaskOutcome, Warnings), ScheduleError> {
        let mut warnings = Warnings::new();
        let context = self.prompt_context(work, task, &mut warnings)?;

        info!("agent started");
        let result = self
            .agent
            .execute(&context, &work.worktree_path, &self.cancel);

        let outcome = match result {
            Ok(()) => self.finish_success(task, &context.beads, &mut warnings)?,
            Err(AgentError::Cancelled) => {
                self.store.release_task(&task.id, &self.owner.to_string())?;
                info!("agent cancelled, task released");
                TaskOutcome::Released
            }
            Err(e) => self.finish_failure(task, &e.to_string())?,
        };
        Ok((outcome, warnings))
    }

    fn prompt_context(
        &self,
        work: &Work,
        task: &Task,
        warnings: &mut Warnings,
    ) -> Result<PromptContext, ScheduleError> {
        let mut beads = Vec::new();
        for member in self.store.task_beads(&task.id)? {
            match self.tracker.get_bead(&member.bead_id) {
                Ok(bead) => beads.push(bead),
                Err(e) => {
                    warnings.push(format!("tracker {}", member.bead_id), e);
                    beads.push(Bead::new(member.bead_id.clone(), member.bead_id));
                }
            }
        }

        Ok(PromptContext {
            task_id: task.id.clone(),
            work_id: work.id.clone(),
            task_type: task.task_type,
            branch: work.branch_name.clone(),
            base_branch: work.base_branch.clone(),
            beads,
            pr_url: work.pr_url.clone(),
        })
    }

    fn finish_success(
        &self,
        task: &Task,
        beads: &[Bead],
        warnings: &mut Warnings,
    ) -> Result<TaskOutcome, ScheduleError> {
        match self
            .store
            .complete_task(&task.id, TaskStatus::Processing, None)
        {
            Ok(_) => {}
            Err(StoreError::Conflict { .. }) => {
                // The agent reported an outcome itself, or the claim was reset
                let current = self.store.get_task(&task.id)?;
                match current.status {
                    TaskStatus::Completed => {}
                    TaskStatus::Failed => {
                        let message = current.error_message.unwrap_or_default();
                        info!(%message, "agent reported failure");
                        return Ok(TaskOutcome::Failed(message));
                    }
                    TaskStatus::Pending | TaskStatus::Processing => {
                        warn!("claim lost while the agent ran");
                        return Ok(TaskOutcome::Released);
                    }
                }
            }
            Err(e) => return Err(e.into()),
        }
        info!("task completed");

        if matches!(task.task_type, TaskType::Implement | TaskType::Estimate) {
            self.complete_closed_beads(task, beads, warnings)?;
        }
        Ok(TaskOutcome::Completed)
    }

    /// Marks the task's beads the tracker now reports closed as complete, and
    /// completes any other open task whose beads are thereby all complete.
    fn complete_closed_beads(
        &self,
        task: &Task,
        beads: &[Bead],
        warnings: &mut Warnings,
    ) -> Result<(), ScheduleError> {
        for bead in beads {
            let closed = match self.tracker.get_bead(&bead.id) {
                Ok(current) => current.status.is_closed(),
                Err(e) => {
                    warnings.push(format!("tracker {}", bead.id), e);
                    continue;
                }
            };
            if !closed {
                continue;
            }

            self.store.complete_task_bead(&task.id, &bead.id)?;
            for other in self.store.open_tasks_with_bead(&bead.id)? {
                self.store.complete_task_bead(&other.id, &bead.id)?;
                if self.store.check_and_complete_task(&other.id)? {
                    info!(task = %other.id, "umbrella task completed with its beads");
                }
            }
        }
        Ok(())
    }

    fn finish_failure(&self, task: &Task, message: &str) -> Result<TaskOutcome, ScheduleError> {
        match self
            .store
            .fail_task(&task.id, TaskStatus::Processing, message)
        {
            Ok(_) => {
                warn!(error = message, "task failed");
                Ok(TaskOutcome::Failed(message.to_string()))
            }
            Err(StoreError::Conflict { .. }) => {
                let current = self.store.get_task(&task.id)?;
                if current.status == TaskStatus::Completed {
                    // Completed through `complete` before the agent exited non-zero
                    Ok(TaskOutcome::Completed)
                } else {
                    Ok(TaskOutcome::Released)
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}
