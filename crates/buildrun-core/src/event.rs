//! Events emitted by the worker towards controllers and observers.

use crate::ids::{DownloadId, RunId, WorkerId};
use crate::status::DownloadOutcome;
use crate::verdict::Verdict;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A notification from the worker pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum RunnerEvent {
    /// A new download task was created.
    DownloadStarted {
        task: DownloadId,
        url: String,
        dest: PathBuf,
    },
    /// Bytes received so far for a focused download.
    DownloadProgress {
        task: DownloadId,
        received: u64,
        total: Option<u64>,
    },
    /// The artifact at `dest` is ready, or the task ended without it.
    ///
    /// `task` is `None` when the artifact was already on disk and no
    /// transfer happened.
    DownloadFinished {
        task: Option<DownloadId>,
        dest: PathBuf,
        outcome: DownloadOutcome,
    },
    /// A launch attempt finished; `error` is set when it failed.
    EvaluateStarted { error: Option<String> },
    /// The evaluation was torn down.
    EvaluateFinished { verdict: Option<Verdict> },
    /// A worker was created for a new run.
    WorkerCreated { run: RunId, worker: WorkerId },
    /// The manager started or stopped a run.
    RunningStateChanged { running: bool },
}

impl RunnerEvent {
    /// Short name used in logs and JSON output.
    pub fn name(&self) -> &'static str {
        match self {
            Self::DownloadStarted { .. } => "download_started",
            Self::DownloadProgress { .. } => "download_progress",
            Self::DownloadFinished { .. } => "download_finished",
            Self::EvaluateStarted { .. } => "evaluate_started",
            Self::EvaluateFinished { .. } => "evaluate_finished",
            Self::WorkerCreated { .. } => "worker_created",
            Self::RunningStateChanged { .. } => "running_state_changed",
        }
    }
}

/// A RunnerEvent stamped with its originating run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Run that produced the event; `None` for manager-level events.
    pub run: Option<RunId>,
    /// Unix timestamp (milliseconds) when the event was emitted.
    pub timestamp_ms: i64,
    /// The event itself.
    pub event: RunnerEvent,
}

impl EventEnvelope {
    /// Wrap an event, stamping the current time.
    pub fn new(run: Option<RunId>, event: RunnerEvent) -> Self {
        Self {
            run,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            event,
        }
    }
}
