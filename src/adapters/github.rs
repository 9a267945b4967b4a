//! GitHub effects through the `gh` CLI

use std::process::Command;

use serde_json::Value;
use tracing::{debug, info};

use super::process::run_command;
use crate::engine::{EffectError, GithubEffects};

const THREADS_QUERY: &str = "query($owner: String!, $repo: String!, $number: Int!) {
  repository(owner: $owner, name: $repo) {
    pullRequest(number: $number) {
      reviewThreads(first: 100) {
        nodes { id isResolved comments(first: 100) { nodes { databaseId } } }
      }
    }
  }
}";

const RESOLVE_MUTATION: &str = "mutation($thread: ID!) {
  resolveReviewThread(input: {threadId: $thread}) { thread { id } }
}";

/// Owner, repository and number of a pull request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestRef {
    pub owner: String,
    pub repo: String,
    pub number: u64,
}

impl PullRequestRef {
    /// Parses `https://github.com/<owner>/<repo>/pull/<n>`, with or without a trailing path
    pub fn parse(url: &str) -> Result<Self, EffectError> {
        let invalid = || EffectError::InvalidUrl(url.to_string());
        let rest = url
            .trim()
            .trim_start_matches("https://")
            .trim_start_matches("http://");
        let mut parts = rest.split('/');
        let _host = parts.next().filter(|h| !h.is_empty()).ok_or_else(invalid)?;
        let owner = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
        let repo = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
        if parts.next() != Some("pull") {
            return Err(invalid());
        }
        let number = parts
            .next()
            .and_then(|n| n.split(['#', '?']).next())
            .and_then(|n| n.parse().ok())
            .ok_or_else(invalid)?;

        Ok(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            number,
        })
    }
}

pub struct GhEffects {
    program: String,
}

impl GhEffects {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn api(&self, args: &[String]) -> Result<Value, EffectError> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("api").args(args);
        debug!(program = %self.program, endpoint = ?args.first(), "calling GitHub API");

        let output = run_command(cmd, None, None, None)
            .map_err(|e| EffectError::Request(e.to_string()))?;
        if !output.success() {
            return Err(EffectError::Request(output.failure_message()));
        }
        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&output.stdout).map_err(|e| EffectError::Request(e.to_string()))
    }
}

impl GithubEffects for GhEffects {
    fn post_comment(
        &self,
        pr_url: &str,
        body: &str,
        reply_to_id: Option<&str>,
    ) -> Result<(), EffectError> {
        let pr = PullRequestRef::parse(pr_url)?;
        let endpoint = match reply_to_id {
            Some(id) => format!(
                "repos/{}/{}/pulls/{}/comments/{}/replies",
                pr.owner, pr.repo, pr.number, id
            ),
            None => format!("repos/{}/{}/issues/{}/comments", pr.owner, pr.repo, pr.number),
        };
        self.api(&[endpoint, "-f".to_string(), format!("body={}", body)])?;
        info!(pr = %pr_url, reply_to = ?reply_to_id, "comment posted");
        Ok(())
    }

    fn resolve_thread(&self, pr_url: &str, comment_id: &str) -> Result<(), EffectError> {
        let pr = PullRequestRef::parse(pr_url)?;
        let threads = self.api(&[
            "graphql".to_string(),
            "-f".to_string(),
            format!("query={}", THREADS_QUERY),
            "-F".to_string(),
            format!("owner={}", pr.owner),
            "-F".to_string(),
            format!("repo={}", pr.repo),
            "-F".to_string(),
            format!("number={}", pr.number),
        ])?;

        let Some((thread_id, resolved)) = find_thread(&threads, comment_id) else {
            return Err(EffectError::Request(format!(
                "no review thread contains comment {}",
                comment_id
            )));
        };
        if resolved {
            debug!(thread = %thread_id, "thread already resolved");
            return Ok(());
        }

        self.api(&[
            "graphql".to_string(),
            "-f".to_string(),
            format!("query={}", RESOLVE_MUTATION),
            "-f".to_string(),
            format!("thread={}", thread_id),
        ])?;
        info!(pr = %pr_url, comment = comment_id, "review thread resolved");
        Ok(())
    }
}

/// Finds the review thread holding `comment_id` and whether it is resolved
fn find_thread(response: &Value, comment_id: &str) -> Option<(String, bool)> {
    let threads = response
        .pointer("/data/repository/pullRequest/reviewThreads/nodes")?
        .as_array()?;
    threads.iter().find_map(|thread| {
        let holds = thread
            .pointer("/comments/nodes")?
            .as_array()?
            .iter()
            .any(|c| c.get("databaseId").map(Value::to_string).as_deref() == Some(comment_id));
        if !holds {
            return None;
        }
        Some((
            thread.get("id")?.as_str()?.to_string(),
            thread.get("isResolved").and_then(Value::as_bool).unwrap_or(false),
        ))
    })
}
