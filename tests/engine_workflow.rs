//! End-to-end tests of the workflow engine over in-memory collaborators
//!
//! These drive a workflow from bead IDs to a recorded pull request, with the
//! agent reporting results the way the real one does through `complete`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use beadflow::domain::{
    Bead, BeadStatus, BeadWithChildren, OutboxStatus, TaskType, WorkStatus, WorkflowStep,
};
use beadflow::engine::{
    record_estimate, AgentError, AgentExecutor, CancelToken, Completer, CompletionRequest,
    CompletionTarget, DispatchOutcome, EffectError, GithubEffects, IssueTracker,
    OutboxDispatcher, PromptContext, Scheduler, TrackerError, WorkflowDriver, WorkflowError,
    WorktreeError, WorktreeManager,
};
use beadflow::storage::{OutboxConfig, SchedulerConfig, Store, WorkflowConfig};
use tempfile::TempDir;

const PR_URL: &str = "https://github.com/acme/shop/pull/42";

// =============================================================================
// Collaborators
// =============================================================================

#[derive(Default)]
struct Tracker {
    beads: Mutex<Vec<Bead>>,
}

impl Tracker {
    fn with(beads: Vec<Bead>) -> Self {
        Self {
            beads: Mutex::new(beads),
        }
    }

    fn file(&self, bead: Bead) {
        self.beads.lock().unwrap().push(bead);
    }

    fn close(&self, id: &str) {
        for bead in self.beads.lock().unwrap().iter_mut() {
            if bead.id == id {
                bead.status = BeadStatus::Closed;
            }
        }
    }
}

impl IssueTracker for Tracker {
    fn get_bead(&self, id: &str) -> Result<Bead, TrackerError> {
        self.beads
            .lock()
            .unwrap()
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .ok_or_else(|| TrackerError::NotFound(id.to_string()))
    }

    fn ready_beads(&self) -> Result<Vec<Bead>, TrackerError> {
        Ok(self
            .beads
            .lock()
            .unwrap()
            .iter()
            .filter(|b| b.status == BeadStatus::Open)
            .cloned()
            .collect())
    }

    fn transitive_dependencies(&self, id: &str) -> Result<Vec<Bead>, TrackerError> {
        self.get_bead(id)?;
        Ok(Vec::new())
    }

    fn bead_with_children(&self, id: &str) -> Result<BeadWithChildren, TrackerError> {
        let bead = self.get_bead(id)?;
        let children = self
            .beads
            .lock()
            .unwrap()
            .iter()
            .filter(|b| b.parent_id() == Some(id))
            .cloned()
            .collect();
        Ok(BeadWithChildren { bead, children })
    }
}

type Behavior<'a> = Box<dyn Fn(&PromptContext) -> Result<(), AgentError> + Send + Sync + 'a>;

struct Agent<'a> {
    behavior: Behavior<'a>,
    calls: Mutex<Vec<TaskType>>,
}

impl<'a> Agent<'a> {
    fn new(behavior: impl Fn(&PromptContext) -> Result<(), AgentError> + Send + Sync + 'a) -> Self {
        Self {
            behavior: Box::new(behavior),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<TaskType> {
        self.calls.lock().unwrap().clone()
    }
}

impl AgentExecutor for Agent<'_> {
    fn execute(
        &self,
        context: &PromptContext,
        _worktree: &Path,
        _cancel: &CancelToken,
    ) -> Result<(), AgentError> {
        self.calls.lock().unwrap().push(context.task_type);
        (self.behavior)(context)
    }
}

#[derive(Default)]
struct Github {
    offline: AtomicBool,
    comments: AtomicUsize,
    resolved: AtomicUsize,
}

impl Github {
    fn check(&self) -> Result<(), EffectError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(EffectError::Request("connection refused".to_string()));
        }
        Ok(())
    }
}

impl GithubEffects for Github {
    fn post_comment(&self, _pr_url: &str, _body: &str, _reply_to: Option<&str>) -> Result<(), EffectError> {
        self.check()?;
        self.comments.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn resolve_thread(&self, _pr_url: &str, _comment_id: &str) -> Result<(), EffectError> {
        self.check()?;
        self.resolved.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Creates plain directories in place of git worktrees
struct Worktrees {
    created: Mutex<Vec<(String, PathBuf)>>,
}

impl Worktrees {
    fn new() -> Self {
        Self {
            created: Mutex::new(Vec::new()),
        }
    }
}

impl WorktreeManager for Worktrees {
    fn create_worktree(&self, base: &Path, branch: &str, _base_branch: &str) -> Result<PathBuf, WorktreeError> {
        let path = base.join(beadflow::domain::branch_slug(branch));
        std::fs::create_dir_all(&path).map_err(|e| WorktreeError::Command(e.to_string()))?;
        self.created.lock().unwrap().push((branch.to_string(), path.clone()));
        Ok(path)
    }

    fn remove_worktree(&self, path: &Path) -> Result<(), WorktreeError> {
        self.created.lock().unwrap().retain(|(_, p)| p != path);
        Ok(())
    }

    fn find_worktree(&self, branch: &str) -> Result<Option<PathBuf>, WorktreeError> {
        Ok(self
            .created
            .lock()
            .unwrap()
            .iter()
            .find(|(b, _)| b == branch)
            .map(|(_, p)| p.clone()))
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        poll_interval_ms: 10,
        ..SchedulerConfig::default()
    }
}

fn backlog() -> Vec<Bead> {
    vec![
        Bead::new("b-1", "Add login form").with_description("Email and password"),
        Bead::new("b-2", "Validate credentials").with_description("Against the user table"),
    ]
}

fn estimate_all(store: &Store, tracker: &Tracker, scores: &[(&str, i64)]) {
    for (bead, score) in scores {
        record_estimate(store, tracker, bead, *score, 12_000, None).unwrap();
    }
}

/// Reports the pull request the way `beadflow complete <task> --pr` does
fn open_pull_request(
    store: &Store,
    tracker: &Tracker,
    github: &Github,
    ctx: &PromptContext,
) -> Result<(), AgentError> {
    Completer::new(store, tracker, github, OutboxConfig::default())
        .complete(
            &CompletionTarget::Task(ctx.task_id.clone()),
            &CompletionRequest {
                pr_url: Some(PR_URL.to_string()),
                ..CompletionRequest::default()
            },
        )
        .map(|_| ())
        .map_err(|e| AgentError::Failed(e.to_string()))
}

// =============================================================================
// Workflow Tests
// =============================================================================

#[test]
fn test_beads_to_pull_request() {
    let dir = TempDir::new().unwrap();
    let store = Store::open_in_memory().unwrap();
    let tracker = Tracker::with(backlog());
    let github = Github::default();
    estimate_all(&store, &tracker, &[("b-1", 3), ("b-2", 5)]);

    let agent = Agent::new(|ctx| match ctx.task_type {
        TaskType::Implement => {
            for bead in &ctx.beads {
                tracker.close(&bead.id);
            }
            Ok(())
        }
        TaskType::Pr => open_pull_request(&store, &tracker, &github, ctx),
        _ => Ok(()),
    });
    let worktrees = Worktrees::new();
    let scheduler = Scheduler::new(&store, &agent, &tracker, scheduler_config());
    let driver = WorkflowDriver::new(&scheduler, &worktrees, WorkflowConfig::default(), dir.path())
        .with_poll_interval(Duration::from_millis(10));

    let state = driver
        .create(&["b-1".to_string(), "b-2".to_string()], None)
        .unwrap();
    let finished = driver.drive(&state.workflow_id).unwrap();

    assert!(finished.is_finished());
    let work_id = finished.work_id.clone().unwrap();
    let work = store.get_work(&work_id).unwrap();
    assert_eq!(work.pr_url.as_deref(), Some(PR_URL));
    assert_eq!(work.status, WorkStatus::Completed);
    assert!(work.branch_name.starts_with("beadflow/add-login-form-"));
    assert!(work.worktree_path.is_dir());

    // Scores 3 and 5 fit one task under the default budget of 70
    assert_eq!(
        agent.calls(),
        vec![TaskType::Implement, TaskType::Review, TaskType::Pr]
    );
}

#[test]
fn test_review_converges_after_a_fix() {
    let dir = TempDir::new().unwrap();
    let store = Store::open_in_memory().unwrap();
    let tracker = Tracker::with(backlog());
    let github = Github::default();
    estimate_all(&store, &tracker, &[("b-1", 3), ("b-2", 5)]);

    let reviews = AtomicUsize::new(0);
    let agent = Agent::new(|ctx| match ctx.task_type {
        TaskType::Implement => {
            for bead in &ctx.beads {
                tracker.close(&bead.id);
            }
            Ok(())
        }
        TaskType::Review => {
            if reviews.fetch_add(1, Ordering::SeqCst) == 0 {
                tracker.file(Bead::new("b-fix", "Handle empty password"));
            }
            Ok(())
        }
        TaskType::Pr => open_pull_request(&store, &tracker, &github, ctx),
        _ => Ok(()),
    });
    let worktrees = Worktrees::new();
    let scheduler = Scheduler::new(&store, &agent, &tracker, scheduler_config());
    let driver = WorkflowDriver::new(&scheduler, &worktrees, WorkflowConfig::default(), dir.path())
        .with_poll_interval(Duration::from_millis(10));

    let state = driver
        .create(&["b-1".to_string(), "b-2".to_string()], None)
        .unwrap();
    let finished = driver.drive(&state.workflow_id).unwrap();

    assert!(finished.is_finished());
    assert_eq!(finished.payload.review_iteration, 2);
    assert_eq!(finished.payload.fix_task_ids.len(), 1);
    assert_eq!(
        agent.calls(),
        vec![
            TaskType::Implement,
            TaskType::Review,
            TaskType::Implement,
            TaskType::Review,
            TaskType::Pr,
        ]
    );

    let fix = store.task_beads(&finished.payload.fix_task_ids[0]).unwrap();
    assert_eq!(fix[0].bead_id, "b-fix");
}

#[test]
fn test_endless_review_halts_at_the_cap() {
    let dir = TempDir::new().unwrap();
    let store = Store::open_in_memory().unwrap();
    let tracker = Tracker::with(backlog());
    estimate_all(&store, &tracker, &[("b-1", 3), ("b-2", 5)]);

    let filed = AtomicUsize::new(0);
    let agent = Agent::new(|ctx| {
        if ctx.task_type == TaskType::Review {
            let n = filed.fetch_add(1, Ordering::SeqCst);
            tracker.file(Bead::new(format!("b-nit-{}", n), "Another nit"));
        }
        Ok(())
    });
    let worktrees = Worktrees::new();
    let scheduler = Scheduler::new(&store, &agent, &tracker, scheduler_config());
    let config = WorkflowConfig {
        max_review_iterations: 2,
        ..WorkflowConfig::default()
    };
    let driver = WorkflowDriver::new(&scheduler, &worktrees, config, dir.path())
        .with_poll_interval(Duration::from_millis(10));

    let state = driver.create(&["b-1".to_string()], None).unwrap();
    let result = driver.drive(&state.workflow_id);

    match result {
        Err(WorkflowError::Halted { step, message, .. }) => {
            assert_eq!(step, WorkflowStep::ReviewFix);
            assert!(message.contains("maximum iterations"));
        }
        other => panic!("expected a halted workflow, got {:?}", other.map(|s| s.current_step)),
    }
    let stored = store.load_workflow(&state.workflow_id).unwrap();
    assert!(stored.is_failed());
    assert_eq!(stored.current_step, WorkflowStep::ReviewFix);
}

// =============================================================================
// Review Feedback Tests
// =============================================================================

#[test]
fn test_fixed_feedback_is_replied_and_resolved_once() {
    let dir = TempDir::new().unwrap();
    let store = Store::open_in_memory().unwrap();
    let mut feedback = Bead::new("b-1", "Rename the handler");
    feedback.external_ref = Some("github-review:987".to_string());
    let tracker = Tracker::with(vec![feedback]);
    let github = Github::default();
    estimate_all(&store, &tracker, &[("b-1", 2)]);

    let agent = Agent::new(|ctx| match ctx.task_type {
        TaskType::Pr => open_pull_request(&store, &tracker, &github, ctx),
        _ => Ok(()),
    });
    let worktrees = Worktrees::new();
    let scheduler = Scheduler::new(&store, &agent, &tracker, scheduler_config());
    let driver = WorkflowDriver::new(&scheduler, &worktrees, WorkflowConfig::default(), dir.path())
        .with_poll_interval(Duration::from_millis(10));
    let state = driver.create(&["b-1".to_string()], None).unwrap();
    driver.drive(&state.workflow_id).unwrap();

    let outbox_config = OutboxConfig::default();
    let completer = Completer::new(&store, &tracker, &github, outbox_config);
    let complete_bead = || {
        completer
            .complete(
                &CompletionTarget::Bead("b-1".to_string()),
                &CompletionRequest::default(),
            )
            .unwrap()
    };

    // GitHub is down: both effects are recorded and left for the sweep
    github.offline.store(true, Ordering::SeqCst);
    let report = complete_bead();
    assert_eq!(report.effects.len(), 2);
    assert!(report
        .effects
        .iter()
        .all(|(_, outcome)| matches!(outcome, DispatchOutcome::Deferred { .. })));
    assert!(report.warnings.len() >= 2);
    assert_eq!(store.list_outbox(Some(OutboxStatus::Pending)).unwrap().len(), 2);

    github.offline.store(false, Ordering::SeqCst);
    let sweep = OutboxDispatcher::new(&store, &github, outbox_config)
        .sweep(chrono::Utc::now() + chrono::Duration::minutes(5))
        .unwrap();
    assert_eq!(sweep.completed.len(), 2);
    assert_eq!(github.comments.load(Ordering::SeqCst), 1);
    assert_eq!(github.resolved.load(Ordering::SeqCst), 1);

    // Completing again never repeats an effect
    let again = complete_bead();
    assert!(again
        .effects
        .iter()
        .all(|(_, outcome)| *outcome == DispatchOutcome::AlreadyCompleted));
    assert_eq!(github.comments.load(Ordering::SeqCst), 1);
    assert_eq!(github.resolved.load(Ordering::SeqCst), 1);
}
