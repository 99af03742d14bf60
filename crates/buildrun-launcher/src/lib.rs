//! Launcher seam for BuildRun
//!
//! This crate defines how the worker starts, observes and stops the build
//! under evaluation. The evaluation runner only talks to the [`Launcher`]
//! and [`LauncherFactory`] traits; [`ProcessLauncher`] is the stock
//! implementation that runs the artifact as a child process.
//!
//! # Example
//!
//! ```rust,no_run
//! use buildrun_core::BuildInfo;
//! use buildrun_launcher::{LaunchOptions, Launcher, LauncherFactory, ProcessLauncherFactory};
//!
//! async fn run(build: &BuildInfo) -> Result<(), Box<dyn std::error::Error>> {
//!     let factory = ProcessLauncherFactory::default();
//!     let mut launcher = factory.create(build)?;
//!
//!     launcher.start(&LaunchOptions::default()).await?;
//!     println!("Running: {:?}", launcher.app_info());
//!
//!     launcher.stop().await?;
//!     launcher.cleanup();
//!     Ok(())
//! }
//! ```

mod error;
mod launcher;
mod process;

// Re-export main types
pub use error::LaunchError;
pub use launcher::{LaunchOptions, Launcher, LauncherFactory};
pub use process::{ProcessLauncher, ProcessLauncherConfig, ProcessLauncherFactory};
