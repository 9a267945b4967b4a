//! Resolving requested beads into the full set a work should process

use std::collections::HashSet;

use tracing::debug;

use super::collaborators::{IssueTracker, TrackerError};
use crate::domain::Bead;

/// Expands each requested bead.
///
/// An epic expands to its non-epic descendants, nested epics included. Any
/// other bead expands to itself plus everything it transitively depends on
/// through `blocks` edges. Closed beads are dropped and the result keeps
/// first-seen order with no duplicates.
pub fn collect_beads(
    tracker: &dyn IssueTracker,
    requested: &[String],
) -> Result<Vec<Bead>, TrackerError> {
    let mut seen = HashSet::new();
    let mut collected = Vec::new();

    for id in requested {
        let root = tracker.bead_with_children(id)?;
        let expanded = if root.is_epic() {
            epic_leaves(tracker, root.children, &mut HashSet::from([root.bead.id.clone()]))?
        } else {
            let mut beads = vec![root.bead];
            beads.extend(tracker.transitive_dependencies(id)?);
            beads
        };

        for bead in expanded {
            if bead.status.is_closed() || !seen.insert(bead.id.clone()) {
                continue;
            }
            collected.push(bead);
        }
    }

    debug!(requested = requested.len(), collected = collected.len(), "collected beads");
    Ok(collected)
}

pub(crate) fn epic_leaves(
    tracker: &dyn IssueTracker,
    children: Vec<Bead>,
    visited: &mut HashSet<String>,
) -> Result<Vec<Bead>, TrackerError> {
    let mut leaves = Vec::new();
    for child in children {
        if !visited.insert(child.id.clone()) {
            continue;
        }
        let node = tracker.bead_with_children(&child.id)?;
        if node.is_epic() {
            leaves.extend(epic_leaves(tracker, node.children, visited)?);
        } else {
            leaves.push(node.bead);
        }
    }
    Ok(leaves)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BeadDependency, BeadStatus};
    use crate::engine::testing::FakeTracker;

    fn ids(beads: &[Bead]) -> Vec<&str> {
        beads.iter().map(|b| b.id.as_str()).collect()
    }

    #[test]
    fn plain_bead_pulls_in_transitive_blockers() {
        let tracker = FakeTracker::new(vec![
            Bead::new("b-1", "Base"),
            Bead::new("b-2", "Middle").with_dependency(BeadDependency::blocks("b-1")),
            Bead::new("b-3", "Top").with_dependency(BeadDependency::blocks("b-2")),
            Bead::new("b-4", "Unrelated"),
        ]);

        let beads = collect_beads(&tracker, &["b-3".to_string()]).unwrap();

        let mut got = ids(&beads);
        got.sort();
        assert_eq!(got, vec!["b-1", "b-2", "b-3"]);
        assert_eq!(beads[0].id, "b-3");
    }

    #[test]
    fn epic_expands_to_leaf_descendants() {
        let tracker = FakeTracker::new(vec![
            Bead::new("e-1", "Epic"),
            Bead::new("e-2", "Sub-epic").with_dependency(BeadDependency::parent("e-1")),
            Bead::new("b-1", "Leaf").with_dependency(BeadDependency::parent("e-1")),
            Bead::new("b-2", "Nested leaf").with_dependency(BeadDependency::parent("e-2")),
        ]);

        let beads = collect_beads(&tracker, &["e-1".to_string()]).unwrap();

        assert_eq!(ids(&beads), vec!["b-2", "b-1"]);
    }

    #[test]
    fn closed_and_repeated_beads_are_dropped() {
        let mut done = Bead::new("b-1", "Done");
        done.status = BeadStatus::Closed;
        let tracker = FakeTracker::new(vec![
            done,
            Bead::new("b-2", "Open").with_dependency(BeadDependency::blocks("b-1")),
        ]);

        let beads =
            collect_beads(&tracker, &["b-2".to_string(), "b-2".to_string()]).unwrap();

        assert_eq!(ids(&beads), vec!["b-2"]);
    }

    #[test]
    fn unknown_bead_is_an_error() {
        let tracker = FakeTracker::new(vec![]);
        assert!(matches!(
            collect_beads(&tracker, &["b-9".to_string()]),
            Err(TrackerError::NotFound(_))
        ));
    }
}
