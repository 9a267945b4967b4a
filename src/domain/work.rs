//! Work domain model
//!
//! A work is one branch-scoped unit of effort backed by a git worktree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use super::id::WorkId;

/// Status of a work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    #[default]
    Active,
    Completed,
    Abandoned,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Active => "active",
            WorkStatus::Completed => "completed",
            WorkStatus::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(WorkStatus::Active),
            "completed" => Ok(WorkStatus::Completed),
            "abandoned" => Ok(WorkStatus::Abandoned),
            other => Err(format!("Unknown work status: {}", other)),
        }
    }
}

/// A git-branch-scoped unit of effort
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Work {
    pub id: WorkId,
    pub branch_name: String,
    pub worktree_path: PathBuf,
    pub base_branch: String,
    pub status: WorkStatus,
    pub pr_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Work {
    pub fn new(
        id: WorkId,
        branch_name: impl Into<String>,
        worktree_path: impl Into<PathBuf>,
        base_branch: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            branch_name: branch_name.into(),
            worktree_path: worktree_path.into(),
            base_branch: base_branch.into(),
            status: WorkStatus::Active,
            pr_url: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Turns free text into a branch-safe slug
pub fn branch_slug(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut last_dash = true;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug.truncate(48);
    slug
}
