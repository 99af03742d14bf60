//! Run configuration.
//!
//! [`Preferences`] is what the preference resolver hands us; [`RunOptions`]
//! is what the caller wants for this particular run. Both are folded into an
//! explicit [`RunConfig`] that `start()` receives.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use buildrun_launcher::LaunchOptions;
use serde::{Deserialize, Serialize};

use crate::download::DownloadSettings;

/// Bytes per GiB, used to turn the size limit preference into a quota.
pub const GIB: f64 = 1_073_741_824.0;

/// Resolved global preferences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    /// Directory where builds are persisted; empty means "use the default".
    pub persist: Option<PathBuf>,

    /// Persist directory size limit in GiB; 0 disables eviction.
    pub persist_size_limit: f64,

    /// Connect timeout for HTTP requests (seconds).
    pub http_timeout_secs: u64,

    /// Retries for the initial request of a download.
    pub http_max_retries: u32,

    /// Minimum delay between two progress events of one download (ms).
    pub progress_interval_ms: u64,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            persist: None,
            persist_size_limit: 20.0,
            http_timeout_secs: 30,
            http_max_retries: 3,
            progress_interval_ms: 100,
        }
    }
}

/// Per-run launch inputs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    pub profile: Option<PathBuf>,
    pub preferences: BTreeMap<String, String>,
    pub addons: Vec<PathBuf>,
}

/// Everything a run needs, resolved up front.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// Directory downloads are persisted to.
    pub persist_dir: PathBuf,

    /// Byte quota of the persist directory; 0 means unlimited.
    pub persist_limit_bytes: u64,

    /// Options applied to every launch.
    pub launch: LaunchOptions,

    /// Minimum delay between two progress events of one download.
    pub progress_interval: Duration,

    /// Retries for the initial request of a download.
    pub max_retries: u32,
}

impl RunConfig {
    /// Fold preferences and run options into a run configuration.
    pub fn resolve(prefs: &Preferences, options: &RunOptions, default_persist_dir: &Path) -> Self {
        let persist_dir = match &prefs.persist {
            Some(dir) if !dir.as_os_str().is_empty() => dir.clone(),
            _ => default_persist_dir.to_path_buf(),
        };

        let profile = options
            .profile
            .clone()
            .filter(|p| !p.as_os_str().is_empty());

        Self {
            persist_dir,
            persist_limit_bytes: persist_limit_bytes(prefs.persist_size_limit),
            launch: LaunchOptions {
                profile,
                preferences: options.preferences.clone(),
                addons: options.addons.clone(),
            },
            progress_interval: Duration::from_millis(prefs.progress_interval_ms),
            max_retries: prefs.http_max_retries,
        }
    }

    /// Settings for the download manager of this run.
    pub fn download_settings(&self) -> DownloadSettings {
        DownloadSettings {
            progress_interval: self.progress_interval,
            max_retries: self.max_retries,
            ..DownloadSettings::default()
        }
    }
}

/// Convert a GiB size limit to a byte quota. Negative values are treated
/// as their absolute value.
pub fn persist_limit_bytes(limit_gib: f64) -> u64 {
    (limit_gib.abs() * GIB) as u64
}
