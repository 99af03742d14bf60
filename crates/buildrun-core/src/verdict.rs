//! Evaluation verdicts.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Outcome attached to one evaluation.
///
/// The worker never interprets a verdict; it only records the value handed
/// to `finish` and passes it back out on the finished event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// The build does not exhibit the problem.
    Good,
    /// The build exhibits the problem.
    Bad,
    /// The build cannot be judged; try another one.
    Skip,
    /// Evaluate the same build again.
    Retry,
    /// Return to the previously evaluated build.
    Back,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Good => "good",
            Verdict::Bad => "bad",
            Verdict::Skip => "skip",
            Verdict::Retry => "retry",
            Verdict::Back => "back",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verdict {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "g" | "good" => Ok(Verdict::Good),
            "b" | "bad" => Ok(Verdict::Bad),
            "s" | "skip" => Ok(Verdict::Skip),
            "r" | "retry" => Ok(Verdict::Retry),
            "back" => Ok(Verdict::Back),
            other => Err(CoreError::InvalidVerdict(other.to_string())),
        }
    }
}
