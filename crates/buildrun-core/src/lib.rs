//! BuildRun Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/HTTP
//! - Child processes
//! - Runtime specifics
//!
//! Everything the worker, the launcher and an orchestrator exchange is
//! defined here.

pub mod build;
pub mod error;
pub mod event;
pub mod ids;
pub mod status;
pub mod verdict;

// Re-export commonly used types
pub use build::{AppInfo, BuildInfo};
pub use error::CoreError;
pub use event::{EventEnvelope, RunnerEvent};
pub use ids::{DownloadId, RunId, WorkerId};
pub use status::{DownloadOutcome, EvaluationPhase};
pub use verdict::Verdict;
