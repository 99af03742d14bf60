//! Build descriptions passed through the fetch/evaluate pipeline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Metadata reported by a launcher once the build is running.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    /// Application name (e.g. the executable stem).
    pub application_name: Option<String>,

    /// Application version, when the launcher can tell.
    pub application_version: Option<String>,

    /// Source changeset the build was produced from.
    pub changeset: Option<String>,

    /// Source repository the build was produced from.
    pub repository: Option<String>,

    /// Launcher-specific extras (pid, program, ...).
    pub extra: BTreeMap<String, String>,
}

impl AppInfo {
    /// Builder method to set the application name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// Builder method to add an extra key.
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// One candidate build.
///
/// Owned by the orchestrator. The download manager fills in `build_file`
/// and the evaluation runner fills in `app_info`; readers on another context
/// must only look at those after the matching finished/started event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildInfo {
    /// Resolved download URL.
    pub build_url: String,

    /// File name the artifact is persisted under.
    pub persist_name: String,

    /// Local path of the artifact, set once a destination is chosen.
    pub build_file: Option<PathBuf>,

    /// Metadata reported by the launcher.
    pub app_info: Option<AppInfo>,

    /// Free-form label for display (date, changeset, ...).
    pub label: Option<String>,
}

impl BuildInfo {
    /// Create a new BuildInfo.
    pub fn new(build_url: impl Into<String>, persist_name: impl Into<String>) -> Self {
        Self {
            build_url: build_url.into(),
            persist_name: persist_name.into(),
            build_file: None,
            app_info: None,
            label: None,
        }
    }

    /// Derive a BuildInfo from a URL, using the last path segment as the
    /// persisted file name.
    pub fn from_url(build_url: impl Into<String>) -> Self {
        let build_url = build_url.into();
        let persist_name = persist_name_from_url(&build_url);
        Self::new(build_url, persist_name)
    }

    /// Builder method to set a label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Store metadata reported by the launcher.
    pub fn update_from_app_info(&mut self, app_info: AppInfo) {
        self.app_info = Some(app_info);
    }

    /// Path of the fetched artifact, if any.
    pub fn build_file(&self) -> Option<&Path> {
        self.build_file.as_deref()
    }

    /// Human readable name for logs.
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.persist_name)
    }
}

fn persist_name_from_url(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let path = match without_query.split_once("://") {
        Some((_, rest)) => rest.split_once('/').map(|(_, path)| path).unwrap_or(""),
        None => without_query,
    };
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("build")
        .to_string()
}
