//! BuildRun worker
//!
//! Fetches candidate builds and runs them for evaluation, one run at a time:
//!
//! - [`PersistStore`] keeps the persist directory under its size quota
//! - [`DownloadManager`] runs cancellable downloads into that directory
//! - [`EvaluationRunner`] launches a build and tears it down once judged
//! - [`WorkerLifecycleManager`] starts and stops runs, each on its own
//!   [`WorkerContext`]
//!
//! Observers follow a run through the [`EventBus`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use buildrun_core::BuildInfo;
//! use buildrun_launcher::ProcessLauncherFactory;
//! use buildrun_worker::{
//!     http_client, EventBus, Preferences, RunConfig, RunOptions, WorkerHandle,
//!     WorkerLifecycleManager,
//! };
//!
//! async fn run() -> Result<(), Box<dyn std::error::Error>> {
//!     let prefs = Preferences::default();
//!     let bus = EventBus::new();
//!     let mut events = bus.subscribe();
//!     let mut manager = WorkerLifecycleManager::new(
//!         Arc::new(ProcessLauncherFactory::default()),
//!         http_client(&prefs)?,
//!         bus,
//!     );
//!
//!     let config = RunConfig::resolve(&prefs, &RunOptions::default(), Path::new("/tmp/builds"));
//!     manager
//!         .start(
//!             |worker: WorkerHandle| async move {
//!                 let mut build = BuildInfo::from_url("https://example.com/app.bin");
//!                 if let Ok(Some(download)) = worker.downloads().focus(&mut build) {
//!                     download.wait().await;
//!                 }
//!                 let _ = worker.runner().evaluate(&mut build).await;
//!             },
//!             config,
//!         )
//!         .await?;
//!
//!     while let Some(envelope) = events.recv().await {
//!         println!("{:?}", envelope.event);
//!     }
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod download;
pub mod error;
pub mod evaluate;
pub mod events;
pub mod lifecycle;
pub mod network;
pub mod persist;
pub mod worker;

#[cfg(test)]
mod test_support;

// Re-export main types
pub use config::{Preferences, RunConfig, RunOptions};
pub use context::WorkerContext;
pub use download::{DownloadHandle, DownloadManager, DownloadSettings};
pub use error::{DownloadError, EvaluationError, WorkerError};
pub use evaluate::EvaluationRunner;
pub use events::{EventBus, EventEmitter};
pub use lifecycle::{WorkerHook, WorkerLifecycleManager};
pub use network::http_client;
pub use persist::{Admission, PersistStore};
pub use worker::{Job, WorkerHandle};
