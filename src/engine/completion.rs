//! Explicit completion and failure reports
//!
//! Agents (and humans) call `complete` with either a task ID or a bead ID.
//! A task target moves the task itself. A bead target marks the bead done in
//! every open task that holds it, which completes those tasks once all their
//! beads are done. Completing a bead that came from a GitHub review comment
//! also schedules the reply and thread resolution through the outbox.

use std::collections::BTreeSet;

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use super::collaborators::{GithubEffects, IssueTracker};
use super::outbox::{DispatchOutcome, OutboxDispatcher};
use super::warnings::Warnings;
use crate::domain::{Task, TaskId, TaskStatus, TaskType, WorkId};
use crate::storage::{OutboxConfig, Store, StoreError};

/// Conditional updates retried when a concurrent writer moved the task first
const MAX_CAS_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Invalid completion request: {0}")]
    Invalid(String),
}

/// What `complete` was pointed at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionTarget {
    Task(TaskId),
    Bead(String),
}

impl CompletionTarget {
    /// Task IDs are recognized by their format; anything else is a bead ID
    pub fn parse(target: &str) -> Result<Self, CompletionError> {
        let target = target.trim();
        if target.is_empty() {
            return Err(CompletionError::Invalid("missing bead or task ID".to_string()));
        }
        Ok(match target.parse::<TaskId>() {
            Ok(id) => CompletionTarget::Task(id),
            Err(_) => CompletionTarget::Bead(target.to_string()),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub pr_url: Option<String>,

    /// Report failure instead of success
    pub error: Option<String>,

    /// Record the epic a review task filed its findings under
    pub review_epic: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CompletionReport {
    pub completed_tasks: Vec<TaskId>,
    pub failed_tasks: Vec<TaskId>,

    /// `(task, bead)` memberships this call marked complete
    pub beads_marked: Vec<(TaskId, String)>,

    pub review_epic: Option<String>,

    /// Outbox effects dispatched for review feedback
    pub effects: Vec<(String, DispatchOutcome)>,

    pub warnings: Warnings,
}

pub struct Completer<'a> {
    store: &'a Store,
    tracker: &'a dyn IssueTracker,
    github: &'a dyn GithubEffects,
    outbox: OutboxConfig,
}

impl<'a> Completer<'a> {
    pub fn new(
        store: &'a Store,
        tracker: &'a dyn IssueTracker,
        github: &'a dyn GithubEffects,
        outbox: OutboxConfig,
    ) -> Self {
        Self {
            store,
            tracker,
            github,
            outbox,
        }
    }

    pub fn complete(
        &self,
        target: &CompletionTarget,
        request: &CompletionRequest,
    ) -> Result<CompletionReport, CompletionError> {
        match target {
            CompletionTarget::Task(id) => self.complete_task(id, request),
            CompletionTarget::Bead(id) => self.complete_bead(id, request),
        }
    }

    fn complete_task(
        &self,
        id: &TaskId,
        request: &CompletionRequest,
    ) -> Result<CompletionReport, CompletionError> {
        let mut report = CompletionReport::default();
        let task = self.store.get_task(id)?;

        if let Some(epic) = &request.review_epic {
            if task.task_type != TaskType::Review {
                return Err(CompletionError::Invalid(format!(
                    "{} is a {} task; only review tasks take a review epic",
                    id, task.task_type
                )));
            }
            self.store.set_review_epic(id, epic)?;
            info!(task = %id, epic = %epic, "review epic recorded");
            report.review_epic = Some(epic.clone());
            return Ok(report);
        }

        if let Some(message) = &request.error {
            self.fail(&task, message)?;
            report.failed_tasks.push(id.clone());
            return Ok(report);
        }

        self.finish(&task, request.pr_url.as_deref())?;
        report.completed_tasks.push(id.clone());

        for member in self.store.task_beads(id)? {
            if self.store.complete_task_bead(id, &member.bead_id)? {
                report.beads_marked.push((id.clone(), member.bead_id));
            }
        }

        if let Some(url) = &request.pr_url {
            if matches!(task.task_type, TaskType::Pr | TaskType::UpdatePrDescription) {
                self.store.set_work_pr_url(&task.work_id, url)?;
                info!(work = %task.work_id, pr = %url, "pull request recorded");
            }
        }
        Ok(report)
    }

    fn complete_bead(
        &self,
        bead_id: &str,
        request: &CompletionRequest,
    ) -> Result<CompletionReport, CompletionError> {
        let mut report = CompletionReport::default();
        let open = self.store.open_tasks_with_bead(bead_id)?;

        if let Some(message) = &request.error {
            for task in &open {
                self.fail(task, &format!("{}: {}", bead_id, message))?;
                report.failed_tasks.push(task.id.clone());
            }
            if open.is_empty() {
                report
                    .warnings
                    .push(bead_id, "not part of any open task; nothing failed");
            }
            return Ok(report);
        }

        for task in &open {
            if self.store.complete_task_bead(&task.id, bead_id)? {
                report.beads_marked.push((task.id.clone(), bead_id.to_string()));
            }
            if self.store.check_and_complete_task(&task.id)? {
                info!(task = %task.id, "all beads complete, task completed");
                report.completed_tasks.push(task.id.clone());
            }
        }
        if open.is_empty() {
            report.warnings.push(bead_id, "not part of any open task");
        }

        self.resolve_review_feedback(bead_id, &mut report);
        Ok(report)
    }

    /// Best effort: every failure here becomes a warning
    fn resolve_review_feedback(&self, bead_id: &str, report: &mut CompletionReport) {
        let bead = match self.tracker.get_bead(bead_id) {
            Ok(bead) => bead,
            Err(e) => {
                report.warnings.push(format!("tracker {}", bead_id), e);
                return;
            }
        };
        let Some(feedback_id) = bead.review_comment_id() else {
            return;
        };

        let works: BTreeSet<WorkId> = match self.store.works_holding_bead(bead_id) {
            Ok(works) => works.into_iter().collect(),
            Err(e) => {
                report.warnings.push(format!("works holding {}", bead_id), e);
                return;
            }
        };

        let outbox = OutboxDispatcher::new(self.store, self.github, self.outbox);
        for work_id in works {
            let pr_url = match self.store.get_work(&work_id) {
                Ok(work) => work.pr_url,
                Err(e) => {
                    report.warnings.push(format!("work {}", work_id), e);
                    continue;
                }
            };
            let Some(pr_url) = pr_url else {
                continue;
            };

            let (effects, warnings) =
                outbox.resolve_review_feedback(&work_id, &pr_url, feedback_id, bead_id);
            report.effects.extend(effects);
            report.warnings.extend(warnings);
        }
    }

    fn finish(&self, task: &Task, pr_url: Option<&str>) -> Result<(), CompletionError> {
        let mut current = task.status;
        for _ in 0..MAX_CAS_ATTEMPTS {
            if current == TaskStatus::Completed {
                return Ok(());
            }
            match self.store.complete_task(&task.id, current, pr_url) {
                Ok(_) => {
                    info!(task = %task.id, "task completed");
                    return Ok(());
                }
                Err(StoreError::Conflict { .. }) => {
                    current = self.store.get_task(&task.id)?.status;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(self.lost_race(task))
    }

    fn fail(&self, task: &Task, message: &str) -> Result<(), CompletionError> {
        let mut current = self.store.get_task(&task.id)?.status;
        for _ in 0..MAX_CAS_ATTEMPTS {
            if current == TaskStatus::Failed {
                return Ok(());
            }
            match self.store.fail_task(&task.id, current, message) {
                Ok(_) => {
                    info!(task = %task.id, error = message, "task failed");
                    return Ok(());
                }
                Err(StoreError::Conflict { .. }) => {
                    current = self.store.get_task(&task.id)?.status;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(self.lost_race(task))
    }

    fn lost_race(&self, task: &Task) -> CompletionError {
        CompletionError::Invalid(format!(
            "{} kept changing state; try again",
            task.id
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Bead, NewTask, Work};
    use crate::engine::testing::{FakeGithub, FakeTracker};
    use std::sync::atomic::Ordering;

    struct Fixture {
        store: Store,
        tracker: FakeTracker,
        github: FakeGithub,
        work: WorkId,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Store::open_in_memory().unwrap();
            let work = WorkId::new("complete", chrono::Utc::now());
            store
                .insert_work(&Work::new(work.clone(), "beadflow/c", "/tmp/c", "main"))
                .unwrap();
            let mut review_bead = Bead::new("bd-9", "Rename field");
            review_bead.external_ref = Some("github-review:4411".to_string());
            Self {
                store,
                tracker: FakeTracker::new(vec![
                    Bead::new("bd-1", "One"),
                    Bead::new("bd-2", "Two"),
                    review_bead,
                ]),
                github: FakeGithub::default(),
                work,
            }
        }

        fn completer(&self) -> Completer<'_> {
            Completer::new(&self.store, &self.tracker, &self.github, OutboxConfig::default())
        }

        fn task(&self, task_type: TaskType, beads: &[&str]) -> Task {
            self.store
                .create_task(
                    &NewTask::new(self.work.clone(), task_type)
                        .with_beads(beads.iter().map(|b| b.to_string())),
                )
                .unwrap()
        }
    }

    fn bead(id: &str) -> CompletionTarget {
        CompletionTarget::Bead(id.to_string())
    }

    #[test]
    fn targets_are_told_apart_by_format() {
        assert!(matches!(
            CompletionTarget::parse("w-abc1234.3").unwrap(),
            CompletionTarget::Task(_)
        ));
        assert_eq!(CompletionTarget::parse("bd-7").unwrap(), bead("bd-7"));
        assert!(CompletionTarget::parse("  ").is_err());
    }

    #[test]
    fn last_bead_completes_the_task() {
        let fx = Fixture::new();
        let task = fx.task(TaskType::Implement, &["bd-1", "bd-2"]);
        let completer = fx.completer();

        let first = completer.complete(&bead("bd-1"), &CompletionRequest::default()).unwrap();
        assert!(first.completed_tasks.is_empty());

        let second = completer.complete(&bead("bd-2"), &CompletionRequest::default()).unwrap();
        assert_eq!(second.completed_tasks, vec![task.id.clone()]);
        assert_eq!(fx.store.get_task(&task.id).unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn completing_a_bead_twice_changes_nothing_more() {
        let fx = Fixture::new();
        let task = fx.task(TaskType::Implement, &["bd-1", "bd-2"]);
        let completer = fx.completer();

        let first = completer.complete(&bead("bd-1"), &CompletionRequest::default()).unwrap();
        let again = completer.complete(&bead("bd-1"), &CompletionRequest::default()).unwrap();

        assert_eq!(first.beads_marked.len(), 1);
        assert!(again.beads_marked.is_empty());
        assert_eq!(fx.store.get_task(&task.id).unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn task_completion_marks_its_beads_and_records_pr() {
        let fx = Fixture::new();
        let pr = fx.task(TaskType::Pr, &[]);
        let request = CompletionRequest {
            pr_url: Some("https://github.com/o/r/pull/12".to_string()),
            ..CompletionRequest::default()
        };

        let report = fx
            .completer()
            .complete(&CompletionTarget::Task(pr.id.clone()), &request)
            .unwrap();

        assert_eq!(report.completed_tasks, vec![pr.id.clone()]);
        let stored = fx.store.get_task(&pr.id).unwrap();
        assert_eq!(stored.pr_url.as_deref(), Some("https://github.com/o/r/pull/12"));
        let work = fx.store.get_work(&fx.work).unwrap();
        assert_eq!(work.pr_url.as_deref(), Some("https://github.com/o/r/pull/12"));
    }

    #[test]
    fn error_fails_the_task() {
        let fx = Fixture::new();
        let task = fx.task(TaskType::Implement, &["bd-1"]);
        let request = CompletionRequest {
            error: Some("cannot reproduce".to_string()),
            ..CompletionRequest::default()
        };

        let report = fx.completer().complete(&bead("bd-1"), &request).unwrap();

        assert_eq!(report.failed_tasks, vec![task.id.clone()]);
        let stored = fx.store.get_task(&task.id).unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("bd-1: cannot reproduce"));
    }

    #[test]
    fn failed_task_cannot_be_completed() {
        let fx = Fixture::new();
        let task = fx.task(TaskType::Review, &[]);
        fx.store
            .fail_task(&task.id, TaskStatus::Pending, "boom")
            .unwrap();

        let result = fx.completer().complete(
            &CompletionTarget::Task(task.id.clone()),
            &CompletionRequest::default(),
        );
        assert!(matches!(result, Err(CompletionError::Store(StoreError::InvalidTask(_)))));
    }

    #[test]
    fn review_epic_only_applies_to_review_tasks() {
        let fx = Fixture::new();
        let review = fx.task(TaskType::Review, &[]);
        let implement = fx.task(TaskType::Implement, &["bd-1"]);
        let request = CompletionRequest {
            review_epic: Some("bd-50".to_string()),
            ..CompletionRequest::default()
        };
        let completer = fx.completer();

        completer
            .complete(&CompletionTarget::Task(review.id.clone()), &request)
            .unwrap();
        assert_eq!(
            fx.store.get_task(&review.id).unwrap().review_epic.as_deref(),
            Some("bd-50")
        );
        assert!(completer
            .complete(&CompletionTarget::Task(implement.id), &request)
            .is_err());
    }

    #[test]
    fn review_feedback_goes_through_the_outbox() {
        let fx = Fixture::new();
        fx.task(TaskType::Implement, &["bd-9"]);
        fx.store
            .set_work_pr_url(&fx.work, "https://github.com/o/r/pull/3")
            .unwrap();

        let report = fx
            .completer()
            .complete(&bead("bd-9"), &CompletionRequest::default())
            .unwrap();

        assert_eq!(report.effects.len(), 2);
        assert!(report.warnings.is_empty());
        let comments = fx.github.comments.lock().unwrap();
        assert_eq!(comments[0].2.as_deref(), Some("4411"));
        assert_eq!(
            *fx.github.resolved.lock().unwrap(),
            vec![("https://github.com/o/r/pull/3".to_string(), "4411".to_string())]
        );
    }

    #[test]
    fn github_outage_does_not_fail_the_completion() {
        let fx = Fixture::new();
        let task = fx.task(TaskType::Implement, &["bd-9"]);
        fx.store
            .set_work_pr_url(&fx.work, "https://github.com/o/r/pull/3")
            .unwrap();
        fx.github.failing.store(true, Ordering::SeqCst);

        let report = fx
            .completer()
            .complete(&bead("bd-9"), &CompletionRequest::default())
            .unwrap();

        assert_eq!(report.completed_tasks, vec![task.id]);
        assert_eq!(report.warnings.len(), 2);
        assert_eq!(fx.store.list_outbox(None).unwrap().len(), 2);
    }
}
