//! BuildRun
//!
//! Fetches the given builds one after the other, launches each one and asks
//! for a verdict on stdin.

mod json_output;

use std::path::PathBuf;
use std::sync::Arc;

use buildrun_core::{BuildInfo, DownloadOutcome, EventEnvelope, RunnerEvent, Verdict};
use buildrun_launcher::{ProcessLauncherConfig, ProcessLauncherFactory};
use buildrun_worker::{
    http_client, EvaluationError, EventBus, Preferences, RunConfig, RunOptions, WorkerHandle,
    WorkerLifecycleManager,
};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Fetch builds and run them for evaluation.
#[derive(Parser, Debug)]
#[command(name = "buildrun", about = "Fetch builds and run them for evaluation")]
struct Args {
    /// Build URL; repeat to evaluate several builds in order
    #[arg(long = "url", required = true)]
    urls: Vec<String>,

    /// Directory where builds are persisted
    #[arg(long)]
    persist: Option<PathBuf>,

    /// Size limit of the persist directory in GiB (0 for unlimited)
    #[arg(long, default_value = "20")]
    persist_size_limit: f64,

    /// Program used to run the build; by default the build itself is executed
    #[arg(long)]
    program: Option<String>,

    /// Argument passed to the program; `{build}` is replaced by the build path
    #[arg(long = "arg", allow_hyphen_values = true)]
    program_args: Vec<String>,

    /// Profile directory passed to the build
    #[arg(long)]
    profile: Option<PathBuf>,

    /// Preference passed to the build, as key=value
    #[arg(long = "pref", value_parser = parse_pref)]
    prefs: Vec<(String, String)>,

    /// Add-on installed into the build
    #[arg(long = "addon")]
    addons: Vec<PathBuf>,

    /// HTTP connect timeout in seconds
    #[arg(long, default_value = "30")]
    http_timeout: u64,

    /// Output events as JSON lines on stdout
    #[arg(long)]
    json: bool,
}

fn parse_pref(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(key, value)| (key.trim().to_string(), value.to_string()))
        .filter(|(key, _)| !key.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{}'", s))
}

/// Verdicts collected by a completed job, per build.
type Summary = Vec<(String, Option<Verdict>)>;

/// Walks the builds in order, asking for a verdict on each.
struct InteractiveJob {
    builds: Vec<BuildInfo>,
    verdicts: mpsc::UnboundedReceiver<Verdict>,
    done: oneshot::Sender<Summary>,
}

impl InteractiveJob {
    async fn run(mut self, worker: WorkerHandle) {
        let mut results: Vec<Option<Verdict>> = vec![None; self.builds.len()];
        let mut index = 0;

        while index < self.builds.len() {
            let mut build = self.builds[index].clone();

            let ready = match worker.downloads().focus(&mut build) {
                Ok(Some(download)) => download.wait().await,
                Ok(None) => DownloadOutcome::Succeeded,
                Err(e) => DownloadOutcome::Failed(e.to_string()),
            };
            if worker.is_cancelled() {
                return;
            }
            if !ready.is_success() {
                warn!(build = %build.display_name(), outcome = ?ready, "Build unavailable, skipping");
                results[index] = Some(Verdict::Skip);
                index += 1;
                continue;
            }

            if let Some(next) = self.builds.get(index + 1) {
                if let Err(e) = worker.downloads().download_in_background(next) {
                    warn!(build = %next.display_name(), error = %e, "Failed to prefetch build");
                }
            }

            match worker.runner().evaluate(&mut build).await {
                Ok(()) => {}
                Err(EvaluationError::Launch(e)) => {
                    warn!(build = %build.display_name(), error = %e, "Build did not start, skipping");
                    worker.runner().finish(Some(Verdict::Skip)).await;
                    results[index] = Some(Verdict::Skip);
                    index += 1;
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Evaluation interrupted");
                    return;
                }
            }

            info!(
                build = %build.display_name(),
                "Type a verdict: good, bad, skip, retry or back"
            );
            let verdict = tokio::select! {
                verdict = self.verdicts.recv() => verdict,
                _ = worker.cancellation().cancelled() => None,
            };
            // stop() tears down the evaluation when there is no verdict
            let Some(verdict) = verdict else {
                return;
            };
            worker.runner().finish(Some(verdict)).await;

            match verdict {
                Verdict::Retry => {}
                Verdict::Back => index = index.saturating_sub(1),
                verdict => {
                    results[index] = Some(verdict);
                    index += 1;
                }
            }
        }

        let summary = self
            .builds
            .iter()
            .map(|b| b.display_name().to_string())
            .zip(results)
            .collect();
        let _ = self.done.send(summary);
    }
}

fn spawn_verdict_reader(verdicts: mpsc::UnboundedSender<Verdict>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match line.parse::<Verdict>() {
                        Ok(verdict) => {
                            if verdicts.send(verdict).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "Ignoring input"),
                    }
                }
                Ok(None) => break, // EOF
                Err(e) => {
                    error!(error = %e, "Error reading stdin");
                    break;
                }
            }
        }
    });
}

fn report(envelope: &EventEnvelope) {
    if json_output::is_json_mode() {
        json_output::emit_envelope(envelope);
        return;
    }

    match &envelope.event {
        RunnerEvent::DownloadStarted { url, dest, .. } => {
            info!(url = %url, dest = %dest.display(), "Downloading build")
        }
        RunnerEvent::DownloadProgress { received, total, .. } => {
            debug!(received, total = ?total, "Download progress")
        }
        RunnerEvent::DownloadFinished { dest, outcome, .. } => match outcome {
            DownloadOutcome::Succeeded => info!(dest = %dest.display(), "Build ready"),
            DownloadOutcome::Failed(e) => warn!(dest = %dest.display(), error = %e, "Download failed"),
            DownloadOutcome::Cancelled => debug!(dest = %dest.display(), "Download cancelled"),
        },
        RunnerEvent::EvaluateStarted { error: None } => info!("Build running"),
        RunnerEvent::EvaluateStarted { error: Some(e) } => warn!(error = %e, "Build failed to start"),
        RunnerEvent::EvaluateFinished { verdict } => info!(verdict = ?verdict, "Evaluation done"),
        RunnerEvent::WorkerCreated { run, worker } => {
            debug!(run_id = %run, worker_id = %worker, "Worker created")
        }
        RunnerEvent::RunningStateChanged { running } => debug!(running, "Running state changed"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Logs go to stderr; stdout is reserved for JSON output
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("buildrun=info".parse()?)
                .add_directive("buildrun_worker=info".parse()?)
                .add_directive("buildrun_launcher=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    if args.json {
        json_output::enable_json_mode();
    }

    let prefs = Preferences {
        persist: args.persist.clone(),
        persist_size_limit: args.persist_size_limit,
        http_timeout_secs: args.http_timeout,
        ..Preferences::default()
    };
    let options = RunOptions {
        profile: args.profile.clone(),
        preferences: args.prefs.iter().cloned().collect(),
        addons: args.addons.clone(),
    };
    let default_persist_dir = std::env::temp_dir().join("buildrun-persist");
    let config = RunConfig::resolve(&prefs, &options, &default_persist_dir);

    let mut launcher_config = ProcessLauncherConfig::default();
    if let Some(program) = &args.program {
        launcher_config = launcher_config.with_program(program.clone());
    }
    for arg in &args.program_args {
        launcher_config = launcher_config.with_arg(arg.clone());
    }

    info!(
        builds = args.urls.len(),
        persist_dir = %config.persist_dir.display(),
        persist_limit_bytes = config.persist_limit_bytes,
        "Starting BuildRun"
    );

    let bus = EventBus::new();
    let mut events = bus.subscribe();
    let mut manager = WorkerLifecycleManager::new(
        Arc::new(ProcessLauncherFactory::new(launcher_config)),
        http_client(&prefs)?,
        bus,
    );

    let (verdict_tx, verdict_rx) = mpsc::unbounded_channel();
    spawn_verdict_reader(verdict_tx);

    let (done_tx, mut done_rx) = oneshot::channel();
    let job = InteractiveJob {
        builds: args.urls.iter().map(BuildInfo::from_url).collect(),
        verdicts: verdict_rx,
        done: done_tx,
    };

    if let Err(e) = manager
        .start(move |worker: WorkerHandle| job.run(worker), config)
        .await
    {
        error!(error = %e, "Failed to start");
        json_output::emit_error(&e.to_string());
        return Err(e.into());
    }

    let summary = loop {
        tokio::select! {
            Some(envelope) = events.recv() => report(&envelope),
            summary = &mut done_rx => break summary.ok(),
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break None;
            }
        }
    };

    manager.shutdown().await;
    while let Ok(envelope) = events.try_recv() {
        report(&envelope);
    }

    if let Some(summary) = summary {
        json_output::emit_summary(&summary);
        if !json_output::is_json_mode() {
            for (build, verdict) in &summary {
                match verdict {
                    Some(verdict) => println!("{}: {}", build, verdict),
                    None => println!("{}: -", build),
                }
            }
        }
    }

    info!("BuildRun stopped");
    Ok(())
}
