//! Issue tracker backed by the `bd` CLI
//!
//! Every read shells out with `--json`. `bd show` may print a single object
//! or a one-element array depending on the version; both are accepted.

use std::collections::HashSet;
use std::process::Command;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use super::process::run_command;
use crate::domain::{Bead, BeadWithChildren, DependencyType};
use crate::engine::{IssueTracker, TrackerError};

pub struct BdTracker {
    program: String,
}

/// A bead as `bd show` prints it, with its reverse edges
#[derive(Debug, Deserialize)]
struct ShowEntry {
    #[serde(flatten)]
    bead: Bead,

    #[serde(default)]
    dependents: Vec<Dependent>,
}

#[derive(Debug, Deserialize)]
struct Dependent {
    #[serde(flatten)]
    bead: Bead,

    #[serde(default, alias = "type")]
    dependency_type: DependencyType,
}

impl BdTracker {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn query<T: DeserializeOwned>(&self, args: &[&str]) -> Result<T, TrackerError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args).arg("--json");
        debug!(program = %self.program, ?args, "querying tracker");

        let output = run_command(cmd, None, None, None)
            .map_err(|e| TrackerError::Command(format!("{} {}: {}", self.program, args.join(" "), e)))?;
        if !output.success() {
            let message = output.failure_message();
            if message.to_lowercase().contains("not found") {
                if let Some(id) = args.get(1) {
                    return Err(TrackerError::NotFound(id.to_string()));
                }
            }
            return Err(TrackerError::Command(format!(
                "{} {}: {}",
                self.program,
                args.join(" "),
                message
            )));
        }

        serde_json::from_slice(&output.stdout).map_err(|e| TrackerError::Parse(e.to_string()))
    }

    fn show(&self, id: &str) -> Result<ShowEntry, TrackerError> {
        let value: serde_json::Value = self.query(&["show", id])?;
        let value = match value {
            serde_json::Value::Array(mut items) => {
                if items.is_empty() {
                    return Err(TrackerError::NotFound(id.to_string()));
                }
                items.swap_remove(0)
            }
            other => other,
        };
        serde_json::from_value(value).map_err(|e| TrackerError::Parse(e.to_string()))
    }
}

impl IssueTracker for BdTracker {
    fn get_bead(&self, id: &str) -> Result<Bead, TrackerError> {
        Ok(self.show(id)?.bead)
    }

    fn ready_beads(&self) -> Result<Vec<Bead>, TrackerError> {
        self.query(&["ready"])
    }

    fn transitive_dependencies(&self, id: &str) -> Result<Vec<Bead>, TrackerError> {
        let root = self.get_bead(id)?;
        let mut seen = HashSet::from([root.id.clone()]);
        let mut stack: Vec<String> = root.blocking_ids().map(str::to_string).collect();
        let mut found = Vec::new();

        while let Some(next) = stack.pop() {
            if !seen.insert(next.clone()) {
                continue;
            }
            let bead = self.get_bead(&next)?;
            stack.extend(bead.blocking_ids().map(str::to_string));
            found.push(bead);
        }
        Ok(found)
    }

    fn bead_with_children(&self, id: &str) -> Result<BeadWithChildren, TrackerError> {
        let entry = self.show(id)?;
        let children = entry
            .dependents
            .into_iter()
            .filter(|d| d.dependency_type == DependencyType::ParentChild)
            .map(|d| d.bead)
            .collect();
        Ok(BeadWithChildren {
            bead: entry.bead,
            children,
        })
    }
}
