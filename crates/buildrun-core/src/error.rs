//! Core domain errors.

use thiserror::Error;

/// Core domain errors for BuildRun.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    /// A verdict string did not name any known verdict.
    #[error("Invalid verdict: {0}")]
    InvalidVerdict(String),
}
