//! Write-ahead dispatch of GitHub side effects
//!
//! An effect is recorded under its idempotency key before anything is sent.
//! The dispatcher then tries it once in-process; if that fails the entry
//! stays pending and a later sweep retries it. An attempt is only made after
//! winning a compare-and-swap on the entry's attempt counter, and a completed
//! entry can never win that swap, so no caller executes an effect whose key
//! is already marked completed.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::collaborators::{EffectError, GithubEffects};
use super::warnings::Warnings;
use crate::domain::outbox::{comment_key, meta, resolve_key};
use crate::domain::{NewOutboxEntry, OutboxEntry, TaskType, WorkId};
use crate::storage::{OutboxConfig, Store, StoreError};

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Outbox entry {key} is missing metadata '{field}'")]
    MissingMetadata { key: String, field: &'static str },

    #[error("Outbox entry {key} has type {task_type}, which is not a GitHub effect")]
    NotAnEffect { key: String, task_type: TaskType },
}

/// A GitHub side effect with its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Comment {
        pr_url: String,
        body: String,
        reply_to_id: Option<String>,
    },
    ResolveThread {
        pr_url: String,
        comment_id: String,
    },
}

impl Effect {
    pub fn task_type(&self) -> TaskType {
        match self {
            Effect::Comment { .. } => TaskType::GithubComment,
            Effect::ResolveThread { .. } => TaskType::GithubResolveThread,
        }
    }

    fn metadata(&self) -> BTreeMap<String, String> {
        let mut metadata = BTreeMap::new();
        match self {
            Effect::Comment {
                pr_url,
                body,
                reply_to_id,
            } => {
                metadata.insert(meta::PR_URL.to_string(), pr_url.clone());
                metadata.insert(meta::BODY.to_string(), body.clone());
                if let Some(id) = reply_to_id {
                    metadata.insert(meta::REPLY_TO_ID.to_string(), id.clone());
                }
            }
            Effect::ResolveThread { pr_url, comment_id } => {
                metadata.insert(meta::PR_URL.to_string(), pr_url.clone());
                metadata.insert(meta::COMMENT_ID.to_string(), comment_id.clone());
            }
        }
        metadata
    }

    /// Rebuilds the effect from a stored entry
    pub fn from_entry(entry: &OutboxEntry) -> Result<Self, OutboxError> {
        let require = |field: &'static str| {
            entry
                .meta(field)
                .map(str::to_string)
                .ok_or_else(|| OutboxError::MissingMetadata {
                    key: entry.idempotency_key.clone(),
                    field,
                })
        };

        match entry.task_type {
            TaskType::GithubComment => Ok(Effect::Comment {
                pr_url: require(meta::PR_URL)?,
                body: require(meta::BODY)?,
                reply_to_id: entry.meta(meta::REPLY_TO_ID).map(str::to_string),
            }),
            TaskType::GithubResolveThread => Ok(Effect::ResolveThread {
                pr_url: require(meta::PR_URL)?,
                comment_id: require(meta::COMMENT_ID)?,
            }),
            other => Err(OutboxError::NotAnEffect {
                key: entry.idempotency_key.clone(),
                task_type: other,
            }),
        }
    }

    fn perform(&self, github: &dyn GithubEffects) -> Result<(), EffectError> {
        match self {
            Effect::Comment {
                pr_url,
                body,
                reply_to_id,
            } => github.post_comment(pr_url, body, reply_to_id.as_deref()),
            Effect::ResolveThread { pr_url, comment_id } => {
                github.resolve_thread(pr_url, comment_id)
            }
        }
    }
}

/// What happened to one dispatched effect
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// The effect ran and the entry is completed
    Executed,
    /// The key was already completed; nothing ran
    AlreadyCompleted,
    /// The entry is pending but not due: an attempt is in flight elsewhere
    /// or it is waiting out its retry delay
    Scheduled,
    /// The attempt failed; the entry stays pending for the retry sweep
    Deferred { error: String },
    /// The attempt failed and no attempts remain
    Dead { error: String },
}

/// Outcome of one retry sweep
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub completed: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub dead: Vec<String>,
    /// Entries another sweeper claimed first
    pub skipped: usize,
}

pub struct OutboxDispatcher<'a> {
    store: &'a Store,
    github: &'a dyn GithubEffects,
    config: OutboxConfig,
}

impl<'a> OutboxDispatcher<'a> {
    pub fn new(store: &'a Store, github: &'a dyn GithubEffects, config: OutboxConfig) -> Self {
        Self {
            store,
            github,
            config,
        }
    }

    /// Records the effect, then attempts it immediately
    pub fn dispatch(
        &self,
        work_id: &WorkId,
        idempotency_key: &str,
        effect: &Effect,
    ) -> Result<DispatchOutcome, OutboxError> {
        let now = Utc::now();
        let (entry, created) = self.store.schedule_task_with_retry(&NewOutboxEntry {
            work_id: work_id.clone(),
            task_type: effect.task_type(),
            run_at: now,
            metadata: effect.metadata(),
            idempotency_key: idempotency_key.to_string(),
            max_attempts: self.config.max_attempts,
        })?;

        if created {
            debug!(key = idempotency_key, "outbox entry recorded");
        }
        if entry.is_completed() {
            debug!(key = idempotency_key, "effect already completed, skipping");
            return Ok(DispatchOutcome::AlreadyCompleted);
        }
        if !created && !entry.is_due(now) {
            return Ok(DispatchOutcome::Scheduled);
        }

        self.attempt(&entry, now)
    }

    /// Retries every due entry once
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, OutboxError> {
        let mut report = SweepReport::default();

        for entry in self.store.due_outbox_entries(now)? {
            let key = entry.idempotency_key.clone();

            if entry.attempts >= entry.max_attempts {
                let error = entry
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "attempts exhausted".to_string());
                if self.store.mark_outbox_dead(&key, &error)? {
                    report.dead.push(key);
                }
                continue;
            }

            match self.attempt(&entry, now)? {
                DispatchOutcome::Executed => report.completed.push(key),
                DispatchOutcome::AlreadyCompleted | DispatchOutcome::Scheduled => {
                    report.skipped += 1
                }
                DispatchOutcome::Deferred { error } => report.failed.push((key, error)),
                DispatchOutcome::Dead { error } => {
                    report.failed.push((key.clone(), error));
                    report.dead.push(key);
                }
            }
        }

        info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            dead = report.dead.len(),
            "outbox sweep finished"
        );
        Ok(report)
    }

    fn attempt(
        &self,
        entry: &OutboxEntry,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, OutboxError> {
        let key = entry.idempotency_key.as_str();
        let effect = Effect::from_entry(entry)?;

        let next_run_at = now + self.config.retry_delay();
        if !self
            .store
            .claim_outbox_attempt(key, entry.attempts, next_run_at)?
        {
            return match self.store.outbox_entry(key)? {
                Some(current) if current.is_completed() => Ok(DispatchOutcome::AlreadyCompleted),
                _ => Ok(DispatchOutcome::Scheduled),
            };
        }

        match effect.perform(self.github) {
            Ok(()) => {
                self.store.mark_task_completed_by_idempotency_key(key)?;
                info!(key, "effect completed");
                Ok(DispatchOutcome::Executed)
            }
            Err(e) => {
                let error = e.to_string();
                self.store.record_outbox_failure(key, &error)?;
                if entry.attempts + 1 >= entry.max_attempts {
                    self.store.mark_outbox_dead(key, &error)?;
                    warn!(key, %error, "effect failed, no attempts left");
                    Ok(DispatchOutcome::Dead { error })
                } else {
                    warn!(key, %error, "effect failed, left for retry");
                    Ok(DispatchOutcome::Deferred { error })
                }
            }
        }
    }

    /// Schedules the reply and thread resolution for a fixed review comment.
    ///
    /// Best effort: failures come back as warnings and never as errors.
    pub fn resolve_review_feedback(
        &self,
        work_id: &WorkId,
        pr_url: &str,
        feedback_id: &str,
        bead_id: &str,
    ) -> (Vec<(String, DispatchOutcome)>, Warnings) {
        let mut outcomes = Vec::new();
        let mut warnings = Warnings::new();

        let effects = [
            (
                comment_key(work_id, feedback_id),
                Effect::Comment {
                    pr_url: pr_url.to_string(),
                    body: format!("Addressed in {} ({}).", bead_id, work_id),
                    reply_to_id: Some(feedback_id.to_string()),
                },
            ),
            (
                resolve_key(work_id, feedback_id),
                Effect::ResolveThread {
                    pr_url: pr_url.to_string(),
                    comment_id: feedback_id.to_string(),
                },
            ),
        ];

        for (key, effect) in effects {
            match self.dispatch(work_id, &key, &effect) {
                Ok(outcome) => {
                    match &outcome {
                        DispatchOutcome::Deferred { error } | DispatchOutcome::Dead { error } => {
                            warnings.push(key.clone(), error)
                        }
                        _ => {}
                    }
                    outcomes.push((key, outcome));
                }
                Err(e) => warnings.push(key, e),
            }
        }

        (outcomes, warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OutboxStatus;
    use crate::engine::testing::FakeGithub;
    use std::sync::atomic::Ordering;

    fn work() -> WorkId {
        "w-abc1234".parse().unwrap()
    }

    fn comment() -> Effect {
        Effect::Comment {
            pr_url: "https://github.com/o/r/pull/7".to_string(),
            body: "Fixed".to_string(),
            reply_to_id: Some("77".to_string()),
        }
    }

    #[test]
    fn optimistic_success_completes_the_entry() {
        let store = Store::open_in_memory().unwrap();
        let github = FakeGithub::default();
        let outbox = OutboxDispatcher::new(&store, &github, OutboxConfig::default());
        let key = comment_key(&work(), "77");

        assert_eq!(
            outbox.dispatch(&work(), &key, &comment()).unwrap(),
            DispatchOutcome::Executed
        );
        assert_eq!(github.comments.lock().unwrap().len(), 1);
        assert!(store.outbox_entry(&key).unwrap().unwrap().is_completed());
    }

    #[test]
    fn completed_key_is_never_executed_again() {
        let store = Store::open_in_memory().unwrap();
        let github = FakeGithub::default();
        let outbox = OutboxDispatcher::new(&store, &github, OutboxConfig::default());
        let key = comment_key(&work(), "77");

        outbox.dispatch(&work(), &key, &comment()).unwrap();
        assert_eq!(
            outbox.dispatch(&work(), &key, &comment()).unwrap(),
            DispatchOutcome::AlreadyCompleted
        );
        let report = outbox.sweep(Utc::now() + chrono::Duration::days(1)).unwrap();

        assert!(report.completed.is_empty());
        assert_eq!(github.comments.lock().unwrap().len(), 1);
    }

    #[test]
    fn failed_attempt_is_left_for_the_sweep() {
        let store = Store::open_in_memory().unwrap();
        let github = FakeGithub::default();
        github.failing.store(true, Ordering::SeqCst);
        let outbox = OutboxDispatcher::new(&store, &github, OutboxConfig::default());
        let key = comment_key(&work(), "77");

        let outcome = outbox.dispatch(&work(), &key, &comment()).unwrap();
        assert!(matches!(outcome, DispatchOutcome::Deferred { .. }));

        // Duplicate scheduling collapses onto the pending entry
        let again = outbox.dispatch(&work(), &key, &comment()).unwrap();
        assert_eq!(again, DispatchOutcome::Scheduled);
        assert_eq!(store.list_outbox(None).unwrap().len(), 1);

        // Not due until the retry delay passes
        assert!(outbox.sweep(Utc::now()).unwrap().completed.is_empty());

        github.failing.store(false, Ordering::SeqCst);
        let later = Utc::now() + chrono::Duration::seconds(61);
        let report = outbox.sweep(later).unwrap();
        assert_eq!(report.completed, vec![key.clone()]);

        let entry = store.outbox_entry(&key).unwrap().unwrap();
        assert_eq!(entry.attempts, 2);
        assert_eq!(entry.status, OutboxStatus::Completed);
    }

    #[test]
    fn exhausted_entries_go_dead() {
        let store = Store::open_in_memory().unwrap();
        let github = FakeGithub::default();
        github.failing.store(true, Ordering::SeqCst);
        let config = OutboxConfig {
            max_attempts: 2,
            retry_delay_secs: 0,
        };
        let outbox = OutboxDispatcher::new(&store, &github, config);
        let key = resolve_key(&work(), "5");
        let effect = Effect::ResolveThread {
            pr_url: "https://github.com/o/r/pull/7".to_string(),
            comment_id: "5".to_string(),
        };

        assert!(matches!(
            outbox.dispatch(&work(), &key, &effect).unwrap(),
            DispatchOutcome::Deferred { .. }
        ));
        let report = outbox.sweep(Utc::now() + chrono::Duration::seconds(1)).unwrap();
        assert_eq!(report.dead, vec![key.clone()]);

        let entry = store.outbox_entry(&key).unwrap().unwrap();
        assert_eq!(entry.status, OutboxStatus::Dead);
        assert!(outbox
            .sweep(Utc::now() + chrono::Duration::days(1))
            .unwrap()
            .failed
            .is_empty());
    }

    #[test]
    fn review_feedback_failures_are_warnings() {
        let store = Store::open_in_memory().unwrap();
        let github = FakeGithub::default();
        github.failing.store(true, Ordering::SeqCst);
        let outbox = OutboxDispatcher::new(&store, &github, OutboxConfig::default());

        let (outcomes, warnings) =
            outbox.resolve_review_feedback(&work(), "https://github.com/o/r/pull/7", "77", "bd-4");

        assert_eq!(outcomes.len(), 2);
        assert_eq!(warnings.len(), 2);
        assert!(warnings.has_context("github-comment-w-abc1234-77"));
        assert!(warnings.has_context("github-resolve-w-abc1234-77"));
    }

    #[test]
    fn entry_round_trips_through_metadata() {
        let store = Store::open_in_memory().unwrap();
        let github = FakeGithub::default();
        github.failing.store(true, Ordering::SeqCst);
        let outbox = OutboxDispatcher::new(&store, &github, OutboxConfig::default());
        let key = comment_key(&work(), "77");
        outbox.dispatch(&work(), &key, &comment()).unwrap();

        let entry = store.outbox_entry(&key).unwrap().unwrap();
        assert_eq!(Effect::from_entry(&entry).unwrap(), comment());
    }
}
