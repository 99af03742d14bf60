//! Error types for launchers.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while starting or stopping a build.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The build has no local artifact to launch.
    #[error("Build '{0}' has not been downloaded")]
    MissingBuildFile(String),

    /// Failed to spawn the process.
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The process exited unsuccessfully right after being spawned.
    #[error("Process exited during startup with code {code:?}")]
    ExitedEarly { code: Option<i32> },

    /// The launcher was asked to start twice.
    #[error("Launcher already started")]
    AlreadyStarted,

    /// The process could not be signalled.
    #[error("Failed to stop process: {0}")]
    Stop(#[source] std::io::Error),

    /// The process did not exit in time after being killed.
    #[error("Process did not exit within {0:?}")]
    StopTimeout(Duration),

    /// I/O error while observing the process.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Launcher-specific failure.
    #[error("{0}")]
    Other(String),
}
