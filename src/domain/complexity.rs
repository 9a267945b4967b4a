//! Complexity estimates and their validation
//!
//! Scores and token estimates are validated at construction, so anything
//! that reaches the complexity cache is already in range.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Complexity score must be between {min} and {max}, got {value}")]
    ScoreOutOfRange { value: i64, min: u8, max: u8 },

    #[error("Token estimate must be between {min} and {max}, got {value}")]
    TokensOutOfRange { value: i64, min: u32, max: u32 },

    #[error("Complexity budget must be between {min} and {max}, got {value}")]
    BudgetOutOfRange { value: i64, min: u32, max: u32 },

    #[error("Missing required value: {0}")]
    Missing(&'static str),
}

/// A complexity score in 1..=10
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u8")]
pub struct ComplexityScore(u8);

impl ComplexityScore {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 10;

    pub fn new(value: i64) -> Result<Self, ValidationError> {
        if (Self::MIN as i64..=Self::MAX as i64).contains(&value) {
            Ok(Self(value as u8))
        } else {
            Err(ValidationError::ScoreOutOfRange {
                value,
                min: Self::MIN,
                max: Self::MAX,
            })
        }
    }

    pub fn value(&self) -> u32 {
        self.0 as u32
    }
}

impl TryFrom<i64> for ComplexityScore {
    type Error = ValidationError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ComplexityScore> for u8 {
    fn from(score: ComplexityScore) -> Self {
        score.0
    }
}

impl fmt::Display for ComplexityScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A token estimate in 5,000..=50,000
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u32")]
pub struct TokenEstimate(u32);

impl TokenEstimate {
    pub const MIN: u32 = 5_000;
    pub const MAX: u32 = 50_000;

    pub fn new(value: i64) -> Result<Self, ValidationError> {
        if (Self::MIN as i64..=Self::MAX as i64).contains(&value) {
            Ok(Self(value as u32))
        } else {
            Err(ValidationError::TokensOutOfRange {
                value,
                min: Self::MIN,
                max: Self::MAX,
            })
        }
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl TryFrom<i64> for TokenEstimate {
    type Error = ValidationError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TokenEstimate> for u32 {
    fn from(tokens: TokenEstimate) -> Self {
        tokens.0
    }
}

impl fmt::Display for TokenEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Planner budget in complexity points, 1..=100
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u32")]
pub struct ComplexityBudget(u32);

impl ComplexityBudget {
    pub const MIN: u32 = 1;
    pub const MAX: u32 = 100;
    pub const DEFAULT: u32 = 70;

    pub fn new(value: i64) -> Result<Self, ValidationError> {
        if (Self::MIN as i64..=Self::MAX as i64).contains(&value) {
            Ok(Self(value as u32))
        } else {
            Err(ValidationError::BudgetOutOfRange {
                value,
                min: Self::MIN,
                max: Self::MAX,
            })
        }
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl Default for ComplexityBudget {
    fn default() -> Self {
        Self(Self::DEFAULT)
    }
}

impl TryFrom<i64> for ComplexityBudget {
    type Error = ValidationError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ComplexityBudget> for u32 {
    fn from(budget: ComplexityBudget) -> Self {
        budget.0
    }
}

/// Content hash of a bead's `title + "\n" + description`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DescriptionHash(String);

impl DescriptionHash {
    pub fn of(title: &str, description: &str) -> Self {
        let input = format!("{}\n{}", title, description);
        Self(blake3::hash(input.as_bytes()).to_hex().to_string())
    }

    /// Wraps a hash read back from storage
    pub fn from_stored(hash: String) -> Self {
        Self(hash)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DescriptionHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A cached estimate for one bead
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ComplexityEstimate {
    pub score: ComplexityScore,
    pub tokens: TokenEstimate,
}
