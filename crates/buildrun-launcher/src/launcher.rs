//! The launcher traits consumed by the evaluation runner.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use buildrun_core::{AppInfo, BuildInfo};

use crate::error::LaunchError;

/// Options applied to every launch of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchOptions {
    /// Profile directory to run the build with.
    pub profile: Option<PathBuf>,

    /// Preferences to set before the build starts.
    pub preferences: BTreeMap<String, String>,

    /// Add-ons to install into the build.
    pub addons: Vec<PathBuf>,
}

impl LaunchOptions {
    /// Builder method to set the profile.
    pub fn with_profile(mut self, profile: impl Into<PathBuf>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    /// Builder method to add a preference.
    pub fn with_preference(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.preferences.insert(key.into(), value.into());
        self
    }

    /// Builder method to add an add-on.
    pub fn with_addon(mut self, addon: impl Into<PathBuf>) -> Self {
        self.addons.push(addon.into());
        self
    }
}

/// Starts, describes and stops one build under evaluation.
///
/// A launcher is created for a single build and is used at most once.
#[async_trait]
pub trait Launcher: Send {
    /// Start the build. May take a while; callers race it against
    /// their own cancellation.
    async fn start(&mut self, options: &LaunchOptions) -> Result<(), LaunchError>;

    /// Metadata about the running application.
    fn app_info(&self) -> AppInfo;

    /// Stop the build. Errors are informational; callers still call
    /// [`Launcher::cleanup`] afterwards.
    async fn stop(&mut self) -> Result<(), LaunchError>;

    /// Release every resource held by the launcher. Must not fail.
    fn cleanup(&mut self);
}

/// Creates a launcher suited to a build.
pub trait LauncherFactory: Send + Sync {
    fn create(&self, build: &BuildInfo) -> Result<Box<dyn Launcher>, LaunchError>;
}
