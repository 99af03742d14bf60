//! Error types for the worker.

use buildrun_core::EvaluationPhase;
use buildrun_launcher::LaunchError;
use thiserror::Error;

/// Errors that can occur while fetching builds.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Transport-level HTTP failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("HTTP {status} fetching {url}")]
    Status { status: u16, url: String },

    /// The body ended before the announced size.
    #[error("Incomplete transfer: received {received} of {expected} bytes")]
    Incomplete { received: u64, expected: u64 },

    /// The persisted file name cannot be used as a destination.
    #[error("Invalid persist name: '{0}'")]
    InvalidName(String),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by the evaluation runner.
#[derive(Debug, Error)]
pub enum EvaluationError {
    /// `evaluate` was called while a previous evaluation was not finished.
    #[error("An evaluation is already active ({0})")]
    AlreadyActive(EvaluationPhase),

    /// The launcher could not be created or started.
    #[error("Launch failed: {0}")]
    Launch(#[from] LaunchError),

    /// `finish` was called while the launcher was still starting.
    #[error("Evaluation aborted while starting")]
    Aborted,
}

/// Errors returned by the worker lifecycle.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker thread or its runtime could not be created.
    #[error("Failed to create worker context: {0}")]
    Runtime(#[source] std::io::Error),

    /// The worker context no longer accepts work.
    #[error("Worker context is closed")]
    ContextClosed,

    /// The download manager could not be set up.
    #[error(transparent)]
    Download(#[from] DownloadError),
}
