//! Outbox entries for external side effects
//!
//! An entry is written before its effect is attempted. The idempotency key
//! is derived from the inputs, so scheduling the same effect twice lands on
//! the same entry, and a completed entry is never executed again.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::id::WorkId;
use super::task::TaskType;

/// Metadata keys understood by the GitHub effect executor
pub mod meta {
    pub const PR_URL: &str = "pr_url";
    pub const BODY: &str = "body";
    pub const REPLY_TO_ID: &str = "reply_to_id";
    pub const COMMENT_ID: &str = "comment_id";
}

/// Idempotency key for a resolution comment on a review thread
pub fn comment_key(work_id: &WorkId, feedback_id: &str) -> String {
    format!("github-comment-{}-{}", work_id, feedback_id)
}

/// Idempotency key for resolving a review thread
pub fn resolve_key(work_id: &WorkId, feedback_id: &str) -> String {
    format!("github-resolve-{}-{}", work_id, feedback_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    #[default]
    Pending,
    Completed,
    /// Attempts exhausted; left for a human
    Dead,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Completed => "completed",
            OutboxStatus::Dead => "dead",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "completed" => Ok(OutboxStatus::Completed),
            "dead" => Ok(OutboxStatus::Dead),
            other => Err(format!("Unknown outbox status: {}", other)),
        }
    }
}

/// A durable intent to perform one external effect
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboxEntry {
    pub idempotency_key: String,
    pub work_id: WorkId,
    pub task_type: TaskType,
    pub run_at: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: OutboxStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    pub fn is_completed(&self) -> bool {
        self.status == OutboxStatus::Completed
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// True when a retry sweep may pick the entry up at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Pending
            && self.run_at <= now
            && self.attempts < self.max_attempts
    }
}

/// Arguments to schedule an effect
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEntry {
    pub work_id: WorkId,
    pub task_type: TaskType,
    pub run_at: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
    pub idempotency_key: String,
    pub max_attempts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_deterministic() {
        let work: WorkId = "w-abc1234".parse().unwrap();

        assert_eq!(comment_key(&work, "77"), "github-comment-w-abc1234-77");
        assert_eq!(resolve_key(&work, "77"), "github-resolve-w-abc1234-77");
        assert_eq!(comment_key(&work, "77"), comment_key(&work, "77"));
    }

    #[test]
    fn due_requires_pending_and_remaining_attempts() {
        let now = Utc::now();
        let mut entry = OutboxEntry {
            idempotency_key: "k".into(),
            work_id: "w-abc1234".parse().unwrap(),
            task_type: TaskType::GithubComment,
            run_at: now,
            metadata: BTreeMap::new(),
            attempts: 0,
            max_attempts: 2,
            status: OutboxStatus::Pending,
            last_error: None,
            created_at: now,
            completed_at: None,
        };
        assert!(entry.is_due(now));

        entry.attempts = 2;
        assert!(!entry.is_due(now));

        entry.attempts = 0;
        entry.status = OutboxStatus::Completed;
        assert!(!entry.is_due(now));
    }
}
