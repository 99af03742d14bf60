//! Status enums for evaluations and downloads.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Phase of the evaluation state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvaluationPhase {
    /// No launcher is held.
    #[default]
    Idle,
    /// A launcher is being created/started, or failed to start and awaits `finish`.
    Starting,
    /// The launcher started and the build is under evaluation.
    Running,
    /// The launcher is being stopped and cleaned up.
    Finishing,
}

impl EvaluationPhase {
    /// Returns true if `finish` has something to tear down.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

impl fmt::Display for EvaluationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Finishing => "finishing",
        };
        f.write_str(s)
    }
}

/// Terminal outcome of one download task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "error")]
pub enum DownloadOutcome {
    /// The artifact is complete at its destination.
    Succeeded,
    /// The transfer failed; no file was left at the destination.
    Failed(String),
    /// The transfer was cancelled; no file was left at the destination.
    Cancelled,
}

impl DownloadOutcome {
    /// Returns true if the artifact is ready to be evaluated.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}
