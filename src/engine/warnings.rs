//! Non-fatal problems collected alongside a primary result
//!
//! Best-effort side effects (outbox scheduling, tracker lookups for prompt
//! context) never abort the operation they hang off. Their failures land
//! here so callers can show them and tests can assert on them.

use serde::Serialize;
use std::fmt;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Warning {
    /// What was being attempted, e.g. `github-comment w-abc1234/77`
    pub context: String,
    pub message: String,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.context, self.message)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Warnings(Vec<Warning>);

impl Warnings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a warning and logs it
    pub fn push(&mut self, context: impl Into<String>, message: impl fmt::Display) {
        let warning = Warning {
            context: context.into(),
            message: message.to_string(),
        };
        warn!(context = %warning.context, "{}", warning.message);
        self.0.push(warning);
    }

    pub fn extend(&mut self, other: Warnings) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Warning> {
        self.0.iter()
    }

    /// True if any warning's context starts with `prefix`
    pub fn has_context(&self, prefix: &str) -> bool {
        self.0.iter().any(|w| w.context.starts_with(prefix))
    }
}
