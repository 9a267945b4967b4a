//! In-process collaborators for unit tests

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::cancel::CancelToken;
use super::collaborators::{
    AgentError, AgentExecutor, EffectError, GithubEffects, IssueTracker, PromptContext,
    TrackerError, WorktreeError, WorktreeManager,
};
use crate::domain::{Bead, BeadStatus, BeadWithChildren, TaskId, TaskType};

/// Tracker over an in-memory bead list
pub struct FakeTracker {
    beads: Mutex<Vec<Bead>>,
    calls: AtomicUsize,
}

impl FakeTracker {
    pub fn new(beads: Vec<Bead>) -> Self {
        Self {
            beads: Mutex::new(beads),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn insert(&self, bead: Bead) {
        let mut beads = self.beads.lock().unwrap();
        beads.retain(|b| b.id != bead.id);
        beads.push(bead);
    }

    pub fn close(&self, id: &str) {
        let mut beads = self.beads.lock().unwrap();
        if let Some(bead) = beads.iter_mut().find(|b| b.id == id) {
            bead.status = BeadStatus::Closed;
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn snapshot(&self) -> Vec<Bead> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.beads.lock().unwrap().clone()
    }
}

impl IssueTracker for FakeTracker {
    fn get_bead(&self, id: &str) -> Result<Bead, TrackerError> {
        self.snapshot()
            .into_iter()
            .find(|b| b.id == id)
            .ok_or_else(|| TrackerError::NotFound(id.to_string()))
    }

    fn ready_beads(&self) -> Result<Vec<Bead>, TrackerError> {
        let beads = self.snapshot();
        let open: BTreeMap<&str, bool> = beads
            .iter()
            .map(|b| (b.id.as_str(), !b.status.is_closed()))
            .collect();
        Ok(beads
            .iter()
            .filter(|b| b.status == BeadStatus::Open)
            .filter(|b| {
                b.blocking_ids()
                    .all(|dep| !open.get(dep).copied().unwrap_or(false))
            })
            .cloned()
            .collect())
    }

    fn transitive_dependencies(&self, id: &str) -> Result<Vec<Bead>, TrackerError> {
        let beads = self.snapshot();
        let find = |id: &str| beads.iter().find(|b| b.id == id);
        let root = find(id).ok_or_else(|| TrackerError::NotFound(id.to_string()))?;

        let mut seen: Vec<String> = Vec::new();
        let mut stack: Vec<String> = root.blocking_ids().map(str::to_string).collect();
        while let Some(next) = stack.pop() {
            if next == id || seen.contains(&next) {
                continue;
            }
            if let Some(bead) = find(&next) {
                stack.extend(bead.blocking_ids().map(str::to_string));
            }
            seen.push(next);
        }

        Ok(seen.iter().filter_map(|id| find(id).cloned()).collect())
    }

    fn bead_with_children(&self, id: &str) -> Result<BeadWithChildren, TrackerError> {
        let beads = self.snapshot();
        let bead = beads
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .ok_or_else(|| TrackerError::NotFound(id.to_string()))?;
        let children = beads
            .iter()
            .filter(|b| b.parent_id() == Some(id))
            .cloned()
            .collect();
        Ok(BeadWithChildren { bead, children })
    }
}

type AgentBehavior<'a> = Box<dyn Fn(&PromptContext) -> Result<(), AgentError> + Send + Sync + 'a>;

/// Agent that records calls and runs a test-supplied behavior
pub struct FakeAgent<'a> {
    behavior: AgentBehavior<'a>,
    calls: Mutex<Vec<(TaskId, TaskType)>>,
}

impl<'a> FakeAgent<'a> {
    pub fn succeeding() -> Self {
        Self::with(|_| Ok(()))
    }

    pub fn with(
        behavior: impl Fn(&PromptContext) -> Result<(), AgentError> + Send + Sync + 'a,
    ) -> Self {
        Self {
            behavior: Box::new(behavior),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(TaskId, TaskType)> {
        self.calls.lock().unwrap().clone()
    }
}

impl AgentExecutor for FakeAgent<'_> {
    fn execute(
        &self,
        context: &PromptContext,
        _worktree: &Path,
        cancel: &CancelToken,
    ) -> Result<(), AgentError> {
        self.calls
            .lock()
            .unwrap()
            .push((context.task_id.clone(), context.task_type));
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        (self.behavior)(context)
    }
}

/// GitHub effects that can be told to fail
#[derive(Default)]
pub struct FakeGithub {
    pub failing: AtomicBool,
    pub comments: Mutex<Vec<(String, String, Option<String>)>>,
    pub resolved: Mutex<Vec<(String, String)>>,
}

impl GithubEffects for FakeGithub {
    fn post_comment(
        &self,
        pr_url: &str,
        body: &str,
        reply_to_id: Option<&str>,
    ) -> Result<(), EffectError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EffectError::Request("network unreachable".to_string()));
        }
        self.comments.lock().unwrap().push((
            pr_url.to_string(),
            body.to_string(),
            reply_to_id.map(str::to_string),
        ));
        Ok(())
    }

    fn resolve_thread(&self, pr_url: &str, comment_id: &str) -> Result<(), EffectError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EffectError::Request("network unreachable".to_string()));
        }
        self.resolved
            .lock()
            .unwrap()
            .push((pr_url.to_string(), comment_id.to_string()));
        Ok(())
    }
}

/// Worktree manager that only records what it was asked
#[derive(Default)]
pub struct FakeWorktrees {
    pub created: Mutex<Vec<(PathBuf, String)>>,
}

impl WorktreeManager for FakeWorktrees {
    fn create_worktree(
        &self,
        base_path: &Path,
        branch: &str,
        _base_branch: &str,
    ) -> Result<PathBuf, WorktreeError> {
        let path = base_path.join(crate::domain::branch_slug(branch));
        self.created
            .lock()
            .unwrap()
            .push((path.clone(), branch.to_string()));
        Ok(path)
    }

    fn remove_worktree(&self, path: &Path) -> Result<(), WorktreeError> {
        self.created.lock().unwrap().retain(|(p, _)| p != path);
        Ok(())
    }

    fn find_worktree(&self, branch: &str) -> Result<Option<PathBuf>, WorktreeError> {
        Ok(self
            .created
            .lock()
            .unwrap()
            .iter()
            .find(|(_, b)| b == branch)
            .map(|(p, _)| p.clone()))
    }
}
