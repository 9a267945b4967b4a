//! Worktrees managed through `git worktree`

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

use super::process::{run_command, CommandOutput};
use crate::domain::branch_slug;
use crate::engine::{WorktreeError, WorktreeManager};

pub struct GitWorktrees {
    repo_root: PathBuf,
}

impl GitWorktrees {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    fn git(&self, args: &[&str]) -> Result<CommandOutput, WorktreeError> {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(&self.repo_root).args(args);
        debug!(?args, "running git");
        run_command(cmd, None, None, None)
            .map_err(|e| WorktreeError::Command(format!("git {}: {}", args.join(" "), e)))
    }

    fn git_ok(&self, args: &[&str]) -> Result<CommandOutput, WorktreeError> {
        let output = self.git(args)?;
        if !output.success() {
            return Err(WorktreeError::Command(format!(
                "git {}: {}",
                args.join(" "),
                output.failure_message()
            )));
        }
        Ok(output)
    }
}

impl WorktreeManager for GitWorktrees {
    fn create_worktree(
        &self,
        base_path: &Path,
        branch: &str,
        base_branch: &str,
    ) -> Result<PathBuf, WorktreeError> {
        let path = base_path.join(branch_slug(branch));
        if path.exists() {
            return Err(WorktreeError::PathExists(path));
        }
        fs::create_dir_all(base_path).map_err(|e| {
            WorktreeError::Command(format!("create {}: {}", base_path.display(), e))
        })?;
        let target = path.to_string_lossy().into_owned();

        let created = self.git(&["worktree", "add", "-b", branch, &target, base_branch])?;
        if !created.success() {
            // The branch survives a removed worktree; check it out again
            let message = created.failure_message();
            if !message.contains("already exists") {
                return Err(WorktreeError::Command(format!("git worktree add: {}", message)));
            }
            self.git_ok(&["worktree", "add", &target, branch])?;
        }

        info!(branch, path = %path.display(), "worktree created");
        Ok(path)
    }

    fn remove_worktree(&self, path: &Path) -> Result<(), WorktreeError> {
        let target = path.to_string_lossy().into_owned();
        self.git_ok(&["worktree", "remove", "--force", &target])?;
        info!(path = %path.display(), "worktree removed");
        Ok(())
    }

    fn find_worktree(&self, branch: &str) -> Result<Option<PathBuf>, WorktreeError> {
        let output = self.git_ok(&["worktree", "list", "--porcelain"])?;
        Ok(parse_worktree_list(&output.stdout_text())
            .into_iter()
            .find(|(_, b)| b.as_deref() == Some(branch))
            .map(|(path, _)| path))
    }
}

/// Parses `git worktree list --porcelain` into (path, branch) pairs
fn parse_worktree_list(text: &str) -> Vec<(PathBuf, Option<String>)> {
    let mut entries = Vec::new();
    let mut current: Option<(PathBuf, Option<String>)> = None;

    for line in text.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            entries.extend(current.take());
            current = Some((PathBuf::from(path), None));
        } else if let Some(branch) = line.strip_prefix("branch ") {
            if let Some((_, slot)) = current.as_mut() {
                *slot = Some(branch.trim_start_matches("refs/heads/").to_string());
            }
        }
    }
    entries.extend(current);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parses_porcelain_listing() {
        let text = "worktree /repo\nHEAD abc\nbranch refs/heads/main\n\n\
                    worktree /repo/.beadflow/worktrees/x\nHEAD def\nbranch refs/heads/beadflow/x\n\n\
                    worktree /tmp/detached\nHEAD 123\ndetached\n";

        let entries = parse_worktree_list(text);

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].1.as_deref(), Some("beadflow/x"));
        assert_eq!(entries[2].1, None);
    }

    fn git_available() -> bool {
        Command::new("git").arg("--version").output().is_ok()
    }

    fn init_repo(dir: &Path) {
        for args in [
            vec!["init", "-q", "-b", "main"],
            vec![
                "-c",
                "user.email=t@example.com",
                "-c",
                "user.name=t",
                "commit",
                "-q",
                "--allow-empty",
                "-m",
                "init",
            ],
        ] {
            let status = Command::new("git").arg("-C").arg(dir).args(&args).status().unwrap();
            assert!(status.success());
        }
    }

    #[test]
    fn creates_finds_and_removes_worktrees() {
        if !git_available() {
            return;
        }
        let repo = TempDir::new().unwrap();
        init_repo(repo.path());
        let git = GitWorktrees::new(repo.path());
        let root = repo.path().join("trees");

        let path = git.create_worktree(&root, "beadflow/feature", "main").unwrap();
        assert!(path.is_dir());
        let found = git.find_worktree("beadflow/feature").unwrap().unwrap();
        assert_eq!(
            found.canonicalize().unwrap(),
            path.canonicalize().unwrap()
        );

        git.remove_worktree(&path).unwrap();
        assert!(git.find_worktree("beadflow/feature").unwrap().is_none());

        // Branch still exists, so a second create checks it out again
        let again = git.create_worktree(&root, "beadflow/feature", "main").unwrap();
        assert!(again.is_dir());
    }
}
