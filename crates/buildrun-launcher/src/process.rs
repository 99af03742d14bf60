//! Launcher that runs the fetched artifact as a child process.
//!
//! The artifact itself is executed unless a `program` is configured, in
//! which case `{build}` in the configured arguments is replaced by the
//! artifact path. Launch options are translated to command line flags.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use buildrun_core::{AppInfo, BuildInfo};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::LaunchError;
use crate::launcher::{LaunchOptions, Launcher, LauncherFactory};

/// Placeholder replaced by the artifact path in configured arguments.
const BUILD_PLACEHOLDER: &str = "{build}";

/// How builds are turned into processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncherConfig {
    /// Program to run; `None` runs the artifact itself.
    pub program: Option<String>,

    /// Arguments passed before the option flags.
    pub args: Vec<String>,

    /// A process exiting unsuccessfully within this window fails the start.
    pub startup_grace: Duration,

    /// How long to wait for the process to exit after killing it.
    pub stop_timeout: Duration,

    /// Additional environment variables.
    pub env_vars: Vec<(String, String)>,
}

impl Default for ProcessLauncherConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            startup_grace: Duration::from_millis(500),
            stop_timeout: Duration::from_secs(10),
            env_vars: Vec::new(),
        }
    }
}

impl ProcessLauncherConfig {
    /// Set the program to run.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = Some(program.into());
        self
    }

    /// Append an argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set the startup grace period.
    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    /// Set the stop timeout.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }
}

/// Runs one build as a child process.
pub struct ProcessLauncher {
    build_file: PathBuf,
    config: Arc<ProcessLauncherConfig>,
    child: Option<Child>,
    pid: Option<u32>,
    readers: Vec<JoinHandle<()>>,
}

impl ProcessLauncher {
    /// Create a launcher for the artifact at `build_file`.
    pub fn new(build_file: impl Into<PathBuf>, config: Arc<ProcessLauncherConfig>) -> Self {
        Self {
            build_file: build_file.into(),
            config,
            child: None,
            pid: None,
            readers: Vec::new(),
        }
    }

    fn program(&self) -> String {
        self.config
            .program
            .clone()
            .unwrap_or_else(|| self.build_file.display().to_string())
    }

    fn command(&self, options: &LaunchOptions) -> Command {
        let mut cmd = Command::new(self.program());
        let build = self.build_file.display().to_string();

        for arg in &self.config.args {
            cmd.arg(arg.replace(BUILD_PLACEHOLDER, &build));
        }

        if let Some(profile) = &options.profile {
            cmd.arg("--profile").arg(profile);
        }
        for (key, value) in &options.preferences {
            cmd.arg("--pref").arg(format!("{}={}", key, value));
        }
        for addon in &options.addons {
            cmd.arg("--addon").arg(addon);
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &self.config.env_vars {
            cmd.env(key, value);
        }

        cmd
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn start(&mut self, options: &LaunchOptions) -> Result<(), LaunchError> {
        if self.child.is_some() {
            return Err(LaunchError::AlreadyStarted);
        }

        let program = self.program();
        info!(
            program = %program,
            build = %self.build_file.display(),
            addons = options.addons.len(),
            "Launching build"
        );

        let mut cmd = self.command(options);
        debug!("Full command: {:?}", cmd);

        let mut child = cmd.spawn().map_err(|source| {
            error!(program = %program, error = %source, "Failed to spawn build process");
            LaunchError::Spawn {
                program: program.clone(),
                source,
            }
        })?;
        self.pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            self.readers.push(spawn_line_logger(stdout, false));
        }
        if let Some(stderr) = child.stderr.take() {
            self.readers.push(spawn_line_logger(stderr, true));
        }

        let early = tokio::time::timeout(self.config.startup_grace, child.wait()).await;
        self.child = Some(child);

        match early {
            Err(_) => {
                info!(pid = ?self.pid, "Build process running");
                Ok(())
            }
            Ok(Ok(status)) if status.success() => {
                info!(pid = ?self.pid, "Build process exited cleanly during startup");
                Ok(())
            }
            Ok(Ok(status)) => {
                warn!(pid = ?self.pid, code = ?status.code(), "Build process exited during startup");
                Err(LaunchError::ExitedEarly {
                    code: status.code(),
                })
            }
            Ok(Err(e)) => Err(LaunchError::Io(e)),
        }
    }

    fn app_info(&self) -> AppInfo {
        let mut info = AppInfo::default().with_extra("program", self.program());
        if let Some(stem) = self.build_file.file_stem() {
            info = info.with_name(stem.to_string_lossy());
        }
        if let Some(pid) = self.pid {
            info = info.with_extra("pid", pid.to_string());
        }
        info
    }

    async fn stop(&mut self) -> Result<(), LaunchError> {
        let Some(child) = self.child.as_mut() else {
            return Ok(());
        };

        if let Some(status) = child.try_wait()? {
            debug!(pid = ?self.pid, code = ?status.code(), "Build process already exited");
            return Ok(());
        }

        info!(pid = ?self.pid, "Stopping build process");
        child.start_kill().map_err(LaunchError::Stop)?;

        match tokio::time::timeout(self.config.stop_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                info!(pid = ?self.pid, code = ?status.code(), "Build process stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(LaunchError::Io(e)),
            Err(_) => Err(LaunchError::StopTimeout(self.config.stop_timeout)),
        }
    }

    fn cleanup(&mut self) {
        for reader in self.readers.drain(..) {
            reader.abort();
        }
        // kill_on_drop takes care of a process that refused to stop
        self.child = None;
    }
}

impl Drop for ProcessLauncher {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn spawn_line_logger<R>(stream: R, is_stderr: bool) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break, // EOF
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    if is_stderr {
                        warn!(stderr = %trimmed, "Build stderr");
                    } else {
                        debug!(stdout = %trimmed, "Build stdout");
                    }
                }
                Err(e) => {
                    error!(error = %e, "Error reading build output");
                    break;
                }
            }
        }
    })
}

/// Builds a [`ProcessLauncher`] for each fetched build.
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncherFactory {
    config: Arc<ProcessLauncherConfig>,
}

impl ProcessLauncherFactory {
    pub fn new(config: ProcessLauncherConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ProcessLauncherConfig {
        &self.config
    }
}

impl LauncherFactory for ProcessLauncherFactory {
    fn create(&self, build: &BuildInfo) -> Result<Box<dyn Launcher>, LaunchError> {
        let build_file = build
            .build_file()
            .filter(|path| path.exists())
            .map(Path::to_path_buf)
            .ok_or_else(|| LaunchError::MissingBuildFile(build.display_name().to_string()))?;

        Ok(Box::new(ProcessLauncher::new(build_file, self.config.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> Arc<ProcessLauncherConfig> {
        Arc::new(
            ProcessLauncherConfig::default()
                .with_program("sh")
                .with_arg("-c")
                .with_arg(script)
                .with_arg(BUILD_PLACEHOLDER)
                .with_startup_grace(Duration::from_millis(150))
                .with_stop_timeout(Duration::from_secs(5)),
        )
    }

    #[test]
    fn test_command_includes_options() {
        let launcher = ProcessLauncher::new("/tmp/app.bin", shell("true"));
        let options = LaunchOptions::default()
            .with_profile("/tmp/profile")
            .with_preference("a.b", "1")
            .with_addon("/tmp/x.xpi");

        let cmd = launcher.command(&options);
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert_eq!(
            args,
            vec![
                "-c",
                "true",
                "/tmp/app.bin",
                "--profile",
                "/tmp/profile",
                "--pref",
                "a.b=1",
                "--addon",
                "/tmp/x.xpi"
            ]
        );
    }

    #[test]
    fn test_factory_requires_build_file() {
        let factory = ProcessLauncherFactory::default();
        let build = BuildInfo::new("http://x/app.bin", "app.bin");

        let result = factory.create(&build);
        assert!(matches!(result, Err(LaunchError::MissingBuildFile(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_and_stop_long_running_process() {
        let mut launcher = ProcessLauncher::new("/tmp/app.bin", shell("sleep 30"));

        launcher.start(&LaunchOptions::default()).await.unwrap();
        let info = launcher.app_info();
        assert_eq!(info.application_name.as_deref(), Some("app"));
        assert!(info.extra.contains_key("pid"));

        launcher.stop().await.unwrap();
        launcher.cleanup();
        // a second stop has nothing left to do
        launcher.stop().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_fails_when_process_exits_early() {
        let mut launcher = ProcessLauncher::new("/tmp/app.bin", shell("exit 3"));

        let err = launcher.start(&LaunchOptions::default()).await.unwrap_err();
        assert!(matches!(err, LaunchError::ExitedEarly { code: Some(3) }));

        // stop on an exited process is not an error
        launcher.stop().await.unwrap();
        launcher.cleanup();
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let config = Arc::new(
            ProcessLauncherConfig::default().with_program("/nonexistent/buildrun-test-binary"),
        );
        let mut launcher = ProcessLauncher::new("/tmp/app.bin", config);

        let err = launcher.start(&LaunchOptions::default()).await.unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }
}
