//! Bead domain model
//!
//! Beads are tracked work items owned by the external issue tracker.
//! This engine only reads them; the types here mirror what the tracker
//! reports so planning and review detection can reason about them.

use serde::{Deserialize, Serialize};

use super::complexity::DescriptionHash;

/// Type of dependency between beads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DependencyType {
    /// The target must close before this bead is ready
    #[default]
    Blocks,
    /// The target is this bead's parent epic
    ParentChild,
    /// Any edge type this engine does not interpret
    #[serde(other)]
    Other,
}

impl DependencyType {
    /// Returns true if this dependency type affects readiness
    pub fn affects_ready(&self) -> bool {
        matches!(self, DependencyType::Blocks)
    }
}

/// A typed edge from one bead to another
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BeadDependency {
    /// The bead this one depends on
    #[serde(alias = "depends_on_id", alias = "id")]
    pub target: String,

    #[serde(rename = "type", alias = "dependency_type", default)]
    pub dep_type: DependencyType,
}

impl BeadDependency {
    pub fn blocks(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            dep_type: DependencyType::Blocks,
        }
    }

    pub fn parent(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            dep_type: DependencyType::ParentChild,
        }
    }
}

/// Status of a bead in the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BeadStatus {
    #[default]
    Open,
    InProgress,
    Blocked,
    Deferred,
    Closed,
}

impl BeadStatus {
    pub fn is_closed(&self) -> bool {
        matches!(self, BeadStatus::Closed)
    }
}

/// A tracked unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bead {
    pub id: String,

    pub title: String,

    #[serde(default)]
    pub description: String,

    /// 0 = critical .. 4 = backlog
    #[serde(default = "default_priority")]
    pub priority: u8,

    #[serde(default)]
    pub status: BeadStatus,

    #[serde(default)]
    pub dependencies: Vec<BeadDependency>,

    /// Link to an external system, e.g. `github-review:123456`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<String>,
}

fn default_priority() -> u8 {
    2
}

impl Bead {
    /// Creates an open bead with no dependencies
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            priority: default_priority(),
            status: BeadStatus::Open,
            dependencies: Vec::new(),
            external_ref: None,
        }
    }

    /// Builder-style description setter
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Builder-style dependency setter
    pub fn with_dependency(mut self, dep: BeadDependency) -> Self {
        self.dependencies.push(dep);
        self
    }

    /// IDs of the beads that must close before this one is ready
    pub fn blocking_ids(&self) -> impl Iterator<Item = &str> {
        self.dependencies
            .iter()
            .filter(|d| d.dep_type.affects_ready())
            .map(|d| d.target.as_str())
    }

    /// The parent epic, if this bead is a child of one
    pub fn parent_id(&self) -> Option<&str> {
        self.dependencies
            .iter()
            .find(|d| d.dep_type == DependencyType::ParentChild)
            .map(|d| d.target.as_str())
    }

    /// Fingerprint of the text an estimate was made against
    pub fn description_hash(&self) -> DescriptionHash {
        DescriptionHash::of(&self.title, &self.description)
    }

    /// The GitHub review comment this bead was created from, if any
    pub fn review_comment_id(&self) -> Option<&str> {
        self.external_ref
            .as_deref()
            .and_then(|r| r.strip_prefix("github-review:"))
            .filter(|id| !id.is_empty())
    }
}

/// A bead plus its `parent-child` children
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeadWithChildren {
    #[serde(flatten)]
    pub bead: Bead,

    #[serde(default)]
    pub children: Vec<Bead>,
}

impl BeadWithChildren {
    /// A bead is an epic iff it has children
    pub fn is_epic(&self) -> bool {
        !self.children.is_empty()
    }
}
