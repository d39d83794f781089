//! Behaviour when the shared store cannot be consulted.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What a check does when the store is unreachable or errors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Admit the call; limiting is suspended while the store is down
    #[default]
    Open,
    /// Reject the call with the store error
    Closed,
}

impl FailurePolicy {
    /// Whether a call is admitted when the store fails.
    pub fn admits_on_store_failure(&self) -> bool {
        matches!(self, FailurePolicy::Open)
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::Open => write!(f, "open"),
            FailurePolicy::Closed => write!(f, "closed"),
        }
    }
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "open" => Ok(FailurePolicy::Open),
            "closed" => Ok(FailurePolicy::Closed),
            other => Err(format!("unknown failure policy '{}', expected open or closed", other)),
        }
    }
}
