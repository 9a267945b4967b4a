//! Review-fix convergence loop
//!
//! Each iteration runs a review task, asks the detectors which beads are
//! new actionable issues, and runs one implement task per issue. The loop
//! ends when a review finds nothing, and fails once the iteration cap is
//! reached. Progress is saved after every state change so a restarted
//! workflow picks up the in-flight review instead of starting another.

use std::collections::HashSet;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::collaborators::{IssueTracker, TrackerError};
use super::collect::epic_leaves;
use super::scheduler::{ScheduleError, Scheduler};
use crate::domain::{NewTask, Task, TaskId, TaskType, WorkId, WorkflowPayload};
use crate::storage::{Store, StoreError};

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error("review-fix loop exceeded maximum iterations ({0})")]
    Exceeded(u32),

    #[error("Fix tasks failed: {}", format_failures(.0))]
    FixFailed(Vec<(TaskId, String)>),

    #[error("Review-fix loop was cancelled")]
    Cancelled,
}

fn format_failures(failures: &[(TaskId, String)]) -> String {
    failures
        .iter()
        .map(|(id, msg)| format!("{} ({})", id, msg))
        .collect::<Vec<_>>()
        .join(", ")
}

/// What a detector gets to look at after a review ran
pub struct DetectionContext<'c> {
    pub work_id: &'c WorkId,
    pub review_task: &'c Task,

    /// Ready bead IDs observed before the review ran
    pub pre_review_ready: &'c [String],
}

/// Decides which beads a finished review raised as new issues.
///
/// `Ok(None)` means the detector cannot tell and the next one is asked.
pub trait IssueDetector {
    fn name(&self) -> &'static str;

    fn detect(&self, ctx: &DetectionContext<'_>) -> Result<Option<Vec<String>>, ReviewError>;
}

/// Ready descendants of the epic the review recorded
pub struct EpicIssueDetector<'a> {
    tracker: &'a dyn IssueTracker,
}

impl<'a> EpicIssueDetector<'a> {
    pub fn new(tracker: &'a dyn IssueTracker) -> Self {
        Self { tracker }
    }
}

impl IssueDetector for EpicIssueDetector<'_> {
    fn name(&self) -> &'static str {
        "review-epic"
    }

    fn detect(&self, ctx: &DetectionContext<'_>) -> Result<Option<Vec<String>>, ReviewError> {
        let Some(epic_id) = ctx.review_task.review_epic.as_deref() else {
            return Ok(None);
        };

        let epic = self.tracker.bead_with_children(epic_id)?;
        if !epic.is_epic() {
            return Ok(Some(Vec::new()));
        }

        let ready: HashSet<String> = self
            .tracker
            .ready_beads()?
            .into_iter()
            .map(|b| b.id)
            .collect();
        let mut visited = HashSet::from([epic.bead.id.clone()]);
        let issues = epic_leaves(self.tracker, epic.children, &mut visited)?
            .into_iter()
            .filter(|b| ready.contains(&b.id))
            .map(|b| b.id)
            .collect();
        Ok(Some(issues))
    }
}

/// Beads that became ready while the review ran.
///
/// Beads another work already holds are left out, so a review in one work
/// does not pick up issues filed concurrently for another.
pub struct ReadySnapshotDetector<'a> {
    tracker: &'a dyn IssueTracker,
    store: &'a Store,
}

impl<'a> ReadySnapshotDetector<'a> {
    pub fn new(tracker: &'a dyn IssueTracker, store: &'a Store) -> Self {
        Self { tracker, store }
    }
}

impl IssueDetector for ReadySnapshotDetector<'_> {
    fn name(&self) -> &'static str {
        "ready-snapshot"
    }

    fn detect(&self, ctx: &DetectionContext<'_>) -> Result<Option<Vec<String>>, ReviewError> {
        let before: HashSet<&str> = ctx.pre_review_ready.iter().map(String::as_str).collect();
        let mut issues = Vec::new();
        for bead in self.tracker.ready_beads()? {
            if before.contains(bead.id.as_str()) {
                continue;
            }
            let others = self.store.other_works_holding_bead(&bead.id, ctx.work_id)?;
            if !others.is_empty() {
                debug!(bead = %bead.id, ?others, "new ready bead belongs to another work");
                continue;
            }
            issues.push(bead.id);
        }
        Ok(Some(issues))
    }
}

/// Result of a converged loop
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReviewOutcome {
    /// Review iterations run in total, including the clean one
    pub iterations: u32,
    pub fix_tasks: Vec<TaskId>,
}

pub struct ReviewFixLoop<'s, 'a> {
    scheduler: &'s Scheduler<'a>,
    detectors: Vec<Box<dyn IssueDetector + 's>>,
    max_iterations: u32,
}

impl<'s, 'a> ReviewFixLoop<'s, 'a> {
    /// Loop with the epic detector first and the ready-snapshot fallback
    pub fn new(scheduler: &'s Scheduler<'a>, max_iterations: u32) -> Self {
        let tracker = scheduler.tracker();
        let store = scheduler.store();
        let epic: Box<dyn IssueDetector + 's> = Box::new(EpicIssueDetector::new(tracker));
        let snapshot: Box<dyn IssueDetector + 's> =
            Box::new(ReadySnapshotDetector::new(tracker, store));
        Self {
            scheduler,
            detectors: vec![epic, snapshot],
            max_iterations,
        }
    }

    pub fn with_detectors(mut self, detectors: Vec<Box<dyn IssueDetector + 's>>) -> Self {
        self.detectors = detectors;
        self
    }

    /// Runs iterations until a review comes back clean.
    ///
    /// `save` is called whenever `payload` changes and must persist it.
    pub fn run(
        &self,
        work_id: &WorkId,
        payload: &mut WorkflowPayload,
        save: &mut dyn FnMut(&WorkflowPayload) -> Result<(), StoreError>,
    ) -> Result<ReviewOutcome, ReviewError> {
        let store = self.scheduler.store();

        loop {
            if payload.review_iteration >= self.max_iterations {
                return Err(ReviewError::Exceeded(self.max_iterations));
            }
            if self.scheduler.cancel_token().is_cancelled() {
                return Err(ReviewError::Cancelled);
            }
            let iteration = payload.review_iteration + 1;

            let review_id = match payload.review_task_id.clone() {
                Some(id) => id,
                None => {
                    payload.pre_review_ready = self
                        .scheduler
                        .tracker()
                        .ready_beads()?
                        .into_iter()
                        .map(|b| b.id)
                        .collect();
                    let task = store.create_task(&NewTask::new(work_id.clone(), TaskType::Review))?;
                    info!(work = %work_id, iteration, task = %task.id, "review started");
                    payload.review_task_id = Some(task.id.clone());
                    save(payload)?;
                    task.id
                }
            };

            self.scheduler.run_task(&review_id)?;
            let review = store.get_task(&review_id)?;
            let issues = self.detect(&DetectionContext {
                work_id,
                review_task: &review,
                pre_review_ready: &payload.pre_review_ready,
            })?;

            if issues.is_empty() {
                info!(work = %work_id, iteration, "review came back clean");
                self.end_iteration(payload, save)?;
                return Ok(ReviewOutcome {
                    iterations: payload.review_iteration,
                    fix_tasks: payload.fix_task_ids.clone(),
                });
            }

            info!(work = %work_id, iteration, issues = issues.len(), "review raised issues");
            for task_id in self.fix_tasks(work_id, &review, &issues)? {
                if !payload.fix_task_ids.contains(&task_id) {
                    payload.fix_task_ids.push(task_id);
                }
            }
            save(payload)?;

            let report = self.scheduler.run_work(work_id)?;
            if report.cancelled {
                return Err(ReviewError::Cancelled);
            }
            if !report.failed.is_empty() {
                return Err(ReviewError::FixFailed(report.failed));
            }

            self.end_iteration(payload, save)?;
        }
    }

    fn detect(&self, ctx: &DetectionContext<'_>) -> Result<Vec<String>, ReviewError> {
        for detector in &self.detectors {
            if let Some(issues) = detector.detect(ctx)? {
                debug!(detector = detector.name(), issues = issues.len(), "issues detected");
                return Ok(issues);
            }
        }
        warn!("no detector could decide; treating the review as clean");
        Ok(Vec::new())
    }

    /// One implement task per issue, reusing tasks a previous attempt at this
    /// iteration already created
    fn fix_tasks(
        &self,
        work_id: &WorkId,
        review: &Task,
        issues: &[String],
    ) -> Result<Vec<TaskId>, ReviewError> {
        let store = self.scheduler.store();
        let mut existing: Vec<(TaskId, Vec<String>)> = Vec::new();
        for task in store.list_tasks(work_id)? {
            if task.task_type == TaskType::Implement && task.sequence() > review.sequence() {
                let beads = store
                    .task_beads(&task.id)?
                    .into_iter()
                    .map(|b| b.bead_id)
                    .collect();
                existing.push((task.id, beads));
            }
        }

        let mut ids = Vec::new();
        for bead in issues {
            let reused = existing
                .iter()
                .find(|(_, beads)| beads.contains(bead))
                .map(|(id, _)| id.clone());
            let id = match reused {
                Some(id) => id,
                None => {
                    let task = store.create_task(
                        &NewTask::new(work_id.clone(), TaskType::Implement)
                            .with_beads([bead.clone()])
                            .depending_on([review.id.clone()]),
                    )?;
                    debug!(task = %task.id, bead = %bead, "fix task created");
                    task.id
                }
            };
            ids.push(id);
        }
        Ok(ids)
    }

    fn end_iteration(
        &self,
        payload: &mut WorkflowPayload,
        save: &mut dyn FnMut(&WorkflowPayload) -> Result<(), StoreError>,
    ) -> Result<(), ReviewError> {
        payload.review_iteration += 1;
        payload.review_task_id = None;
        payload.pre_review_ready.clear();
        save(payload)?;
        Ok(())
    }
}
