//! Hierarchical ID system for works, tasks and workflows
//!
//! ID Format:
//! - Work IDs: `w-{7-char-hash}` (e.g., `w-7f2b4c1`)
//! - Task IDs: `{work-id}.{sequence}` (e.g., `w-7f2b4c1.1`) for implement tasks,
//!   `{work-id}.{kind}-{sequence}` (e.g., `w-7f2b4c1.review-4`) for the rest
//! - Workflow IDs: `wf-{7-char-hash}`
//!
//! The sequence is allocated from a per-work counter in the store. It is
//! carried in the ID for readability, but ordering always uses the stored
//! counter value, not the rendered string.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum IdError {
    #[error("Invalid work ID format: expected 'w-{{7-char-hash}}', got '{0}'")]
    InvalidWorkId(String),

    #[error("Invalid task ID format: expected '{{work-id}}.{{sequence}}' or '{{work-id}}.{{kind}}-{{sequence}}', got '{0}'")]
    InvalidTaskId(String),

    #[error("Invalid workflow ID format: expected 'wf-{{7-char-hash}}', got '{0}'")]
    InvalidWorkflowId(String),

    #[error("Invalid sequence number: {0}")]
    InvalidSequence(String),
}

/// Generates a 7-character hash from a seed and timestamp
fn generate_hash(seed: &str, timestamp: DateTime<Utc>) -> String {
    let input = format!("{}{}", seed, timestamp.timestamp_nanos_opt().unwrap_or(0));
    short_hash(&input)
}

fn short_hash(input: &str) -> String {
    let hash = blake3::hash(input.as_bytes());
    let hex = hash.to_hex();
    hex[..7].to_string()
}

fn is_short_hash(s: &str) -> bool {
    s.len() == 7 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Work ID in the format `w-{7-char-hash}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkId {
    hash: String,
}

impl WorkId {
    /// Creates a new work ID from a seed (usually a title or branch) and timestamp
    pub fn new(seed: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            hash: generate_hash(seed, timestamp),
        }
    }

    /// Derives a work ID deterministically from a seed.
    ///
    /// Workflows use this so a retried CreateWork step lands on the same work.
    pub fn derive(seed: &str) -> Self {
        Self {
            hash: short_hash(seed),
        }
    }

    /// Returns the hash portion of the ID
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Creates a task ID for this work
    pub fn task_id(&self, label: Option<&str>, sequence: u32) -> TaskId {
        TaskId {
            work: self.clone(),
            label: label.map(str::to_string),
            sequence,
        }
    }
}

impl fmt::Display for WorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w-{}", self.hash)
    }
}

impl FromStr for WorkId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let hash = s
            .strip_prefix("w-")
            .ok_or_else(|| IdError::InvalidWorkId(s.to_string()))?;

        if !is_short_hash(hash) {
            return Err(IdError::InvalidWorkId(s.to_string()));
        }

        Ok(Self {
            hash: hash.to_string(),
        })
    }
}

impl TryFrom<String> for WorkId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WorkId> for String {
    fn from(id: WorkId) -> Self {
        id.to_string()
    }
}

/// Task ID - `{work-id}.{seq}` or `{work-id}.{kind}-{seq}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId {
    work: WorkId,
    /// Kind label for non-implement tasks (`review`, `pr`, ...)
    label: Option<String>,
    sequence: u32,
}

impl TaskId {
    /// Returns the owning work
    pub fn work_id(&self) -> &WorkId {
        &self.work
    }

    /// Returns the kind label, if any
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Returns the sequence number allocated when the task was created
    pub fn sequence(&self) -> u32 {
        self.sequence
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "{}.{}-{}", self.work, label, self.sequence),
            None => write!(f, "{}.{}", self.work, self.sequence),
        }
    }
}

impl FromStr for TaskId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (work_part, rest) = s
            .split_once('.')
            .ok_or_else(|| IdError::InvalidTaskId(s.to_string()))?;

        let work: WorkId = work_part
            .parse()
            .map_err(|_| IdError::InvalidTaskId(s.to_string()))?;

        if rest.is_empty() {
            return Err(IdError::InvalidTaskId(s.to_string()));
        }

        let (label, seq_str) = match rest.rsplit_once('-') {
            Some((label, seq)) => {
                let valid_label = !label.is_empty()
                    && label.chars().all(|c| c.is_ascii_lowercase() || c == '-');
                if !valid_label {
                    return Err(IdError::InvalidTaskId(s.to_string()));
                }
                (Some(label.to_string()), seq)
            }
            None => (None, rest),
        };

        let sequence = seq_str
            .parse::<u32>()
            .map_err(|_| IdError::InvalidSequence(seq_str.to_string()))?;

        Ok(Self {
            work,
            label,
            sequence,
        })
    }
}

impl TryFrom<String> for TaskId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.to_string()
    }
}

/// Workflow ID in the format `wf-{7-char-hash}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkflowId {
    hash: String,
}

impl WorkflowId {
    pub fn new(seed: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            hash: generate_hash(seed, timestamp),
        }
    }

    /// Returns the work ID bound to this workflow
    pub fn work_id(&self) -> WorkId {
        WorkId::derive(&self.to_string())
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wf-{}", self.hash)
    }
}

impl FromStr for WorkflowId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let hash = s
            .strip_prefix("wf-")
            .ok_or_else(|| IdError::InvalidWorkflowId(s.to_string()))?;

        if !is_short_hash(hash) {
            return Err(IdError::InvalidWorkflowId(s.to_string()));
        }

        Ok(Self {
            hash: hash.to_string(),
        })
    }
}

impl TryFrom<String> for WorkflowId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WorkflowId> for String {
    fn from(id: WorkflowId) -> Self {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_id_generation_is_unique_for_different_timestamps() {
        let ts1 = Utc::now();
        let ts2 = ts1 + chrono::Duration::nanoseconds(1);

        assert_ne!(WorkId::new("feature", ts1), WorkId::new("feature", ts2));
    }

    #[test]
    fn work_id_format_is_correct() {
        let s = WorkId::new("Test", Utc::now()).to_string();

        assert!(s.starts_with("w-"));
        assert_eq!(s.len(), 9);
    }

    #[test]
    fn derived_work_id_is_stable() {
        assert_eq!(WorkId::derive("wf-1234567"), WorkId::derive("wf-1234567"));
        assert_ne!(WorkId::derive("wf-1234567"), WorkId::derive("wf-7654321"));
    }

    #[test]
    fn work_id_rejects_invalid_format() {
        assert!("invalid".parse::<WorkId>().is_err());
        assert!("w-short".parse::<WorkId>().is_err());
        assert!("w-gggggg1".parse::<WorkId>().is_err());
    }

    #[test]
    fn implement_task_id_round_trips() {
        let id: TaskId = "w-abc1234.3".parse().unwrap();

        assert_eq!(id.work_id().to_string(), "w-abc1234");
        assert_eq!(id.label(), None);
        assert_eq!(id.sequence(), 3);
        assert_eq!(id.to_string(), "w-abc1234.3");
    }

    #[test]
    fn labelled_task_id_round_trips() {
        let id: TaskId = "w-abc1234.update-pr-12".parse().unwrap();

        assert_eq!(id.label(), Some("update-pr"));
        assert_eq!(id.sequence(), 12);
        assert_eq!(id.to_string(), "w-abc1234.update-pr-12");
    }

    #[test]
    fn task_id_rejects_invalid_format() {
        assert!("w-abc1234".parse::<TaskId>().is_err());
        assert!("w-abc1234.".parse::<TaskId>().is_err());
        assert!("w-abc1234.x".parse::<TaskId>().is_err());
        assert!("w-abc1234.Review-1".parse::<TaskId>().is_err());
        assert!("bd-12.1".parse::<TaskId>().is_err());
    }

    #[test]
    fn workflow_id_binds_a_stable_work() {
        let wf = WorkflowId::new("beads", Utc::now());
        let parsed: WorkflowId = wf.to_string().parse().unwrap();

        assert_eq!(wf, parsed);
        assert_eq!(wf.work_id(), parsed.work_id());
    }
}
