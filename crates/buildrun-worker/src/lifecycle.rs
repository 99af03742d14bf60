//! Starting and stopping runs.
//!
//! A run owns one [`WorkerContext`]. Stopping without waiting moves the
//! context into a pending set that is pruned once the context has drained;
//! stopping with `wait` reclaims it, and every pending context, before
//! returning.

use std::sync::{Arc, Mutex};

use buildrun_core::{RunId, RunnerEvent};
use buildrun_launcher::LauncherFactory;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RunConfig;
use crate::context::WorkerContext;
use crate::download::DownloadManager;
use crate::error::WorkerError;
use crate::evaluate::EvaluationRunner;
use crate::events::{lock, EventBus};
use crate::persist::PersistStore;
use crate::worker::{Job, WorkerHandle};

/// Reaction run synchronously when a worker is created, before its job is
/// scheduled.
pub type WorkerHook = Box<dyn Fn(&WorkerHandle) + Send + Sync>;

struct ActiveRun {
    worker: WorkerHandle,
    context: WorkerContext,
}

/// Owns the worker of the current run and the contexts still draining.
pub struct WorkerLifecycleManager {
    factory: Arc<dyn LauncherFactory>,
    client: reqwest::Client,
    bus: Arc<EventBus>,
    current: Option<ActiveRun>,
    runner: Option<EvaluationRunner>,
    downloads: Option<DownloadManager>,
    pending: Arc<Mutex<Vec<WorkerContext>>>,
    hooks: Vec<WorkerHook>,
    contexts_spawned: u64,
}

impl WorkerLifecycleManager {
    pub fn new(
        factory: Arc<dyn LauncherFactory>,
        client: reqwest::Client,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            factory,
            client,
            bus,
            current: None,
            runner: None,
            downloads: None,
            pending: Arc::new(Mutex::new(Vec::new())),
            hooks: Vec::new(),
            contexts_spawned: 0,
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Register a reaction to new workers.
    pub fn on_worker_created<F>(&mut self, hook: F)
    where
        F: Fn(&WorkerHandle) + Send + Sync + 'static,
    {
        self.hooks.push(Box::new(hook));
    }

    /// Returns true while a run is active.
    pub fn is_running(&self) -> bool {
        self.current.is_some()
    }

    /// Worker of the active run.
    pub fn current_worker(&self) -> Option<&WorkerHandle> {
        self.current.as_ref().map(|active| &active.worker)
    }

    /// Evaluation runner of the latest run.
    pub fn runner(&self) -> Option<&EvaluationRunner> {
        self.runner.as_ref()
    }

    /// Download manager of the latest run.
    pub fn downloads(&self) -> Option<&DownloadManager> {
        self.downloads.as_ref()
    }

    /// Contexts stopped without waiting that have not drained yet.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Stop the current run, if any, then start a new one executing `job`.
    pub async fn start<J: Job>(
        &mut self,
        job: J,
        config: RunConfig,
    ) -> Result<WorkerHandle, WorkerError> {
        self.stop(true).await;

        let run = RunId::generate();
        self.bus.set_current(Some(run.clone()));

        match self.launch(Box::new(job), config, run) {
            Ok(worker) => {
                self.bus
                    .emit(None, RunnerEvent::RunningStateChanged { running: true });
                Ok(worker)
            }
            Err(e) => {
                error!(error = %e, "Failed to start worker");
                self.bus.set_current(None);
                Err(e)
            }
        }
    }

    fn launch(
        &mut self,
        job: Box<dyn Job>,
        config: RunConfig,
        run: RunId,
    ) -> Result<WorkerHandle, WorkerError> {
        let emitter = self.bus.emitter(run.clone());

        let downloads = DownloadManager::new(
            config.persist_dir.clone(),
            self.client.clone(),
            PersistStore::new(config.persist_limit_bytes),
            emitter.clone(),
            config.download_settings(),
        )?;
        let runner = EvaluationRunner::new(
            Arc::clone(&self.factory),
            config.launch.clone(),
            emitter.clone(),
        );

        let cancel = CancellationToken::new();
        let worker = WorkerHandle::new(
            run.clone(),
            downloads.clone(),
            runner.clone(),
            emitter.clone(),
            cancel.clone(),
        );

        self.contexts_spawned += 1;
        let context =
            WorkerContext::spawn(format!("buildrun-worker-{}", self.contexts_spawned), cancel)?;

        self.runner = Some(runner);
        self.downloads = Some(downloads);

        info!(
            run_id = %run,
            worker_id = %worker.worker_id(),
            context = %context.name(),
            persist_dir = %config.persist_dir.display(),
            "Worker created"
        );
        emitter.emit(RunnerEvent::WorkerCreated {
            run,
            worker: worker.worker_id().clone(),
        });
        for hook in &self.hooks {
            hook(&worker);
        }

        let job_worker = worker.clone();
        // the receiver is not needed; the job reports through events
        drop(context.submit(async move { job.run(job_worker).await })?);

        self.current = Some(ActiveRun {
            worker: worker.clone(),
            context,
        });
        Ok(worker)
    }

    /// Stop the current run.
    ///
    /// The evaluation is finished with no verdict and every download is
    /// cancelled. With `wait`, returns once the run's context and all
    /// pending contexts have drained; otherwise the context is left to
    /// drain in the background. Emits `RunningStateChanged(false)` once.
    pub async fn stop(&mut self, wait: bool) {
        let active = self.current.take();

        if let Some(runner) = self.runner.clone() {
            let live = active.as_ref().filter(|a| !a.context.is_finished());
            let submitted = live.map(|a| {
                let runner = runner.clone();
                a.context.submit(async move { runner.finish(None).await })
            });

            match submitted {
                Some(Ok(done)) => {
                    if done.await.is_err() {
                        warn!("Worker context went away before the evaluation finished");
                    }
                }
                Some(Err(e)) => {
                    debug!(error = %e, "Finishing evaluation outside the worker context");
                    runner.finish(None).await;
                }
                None => runner.finish(None).await,
            }
        }

        if let Some(downloads) = &self.downloads {
            let cancelled = downloads.cancel_all();
            if !cancelled.is_empty() {
                debug!(count = cancelled.len(), "Cancelled downloads on stop");
            }
        }

        self.bus.set_current(None);

        if let Some(active) = active {
            info!(run_id = %active.worker.run_id(), wait, "Stopping worker");
            active.context.quit();
            if wait {
                active.context.drained().await;
            } else {
                self.defer(active.context);
            }
        }

        if wait {
            let pending = std::mem::take(&mut *lock(&self.pending));
            for context in pending {
                context.drained().await;
            }
        }

        self.bus
            .emit(None, RunnerEvent::RunningStateChanged { running: false });
    }

    /// Stop and wait for everything to drain.
    pub async fn shutdown(&mut self) {
        self.stop(true).await;
    }

    fn defer(&self, context: WorkerContext) {
        let finished = context.finished();
        let name = context.name().to_string();
        lock(&self.pending).push(context);

        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            finished.await;
            let mut pending = lock(&pending);
            pending.retain(|context| !context.is_finished());
            debug!(context = %name, remaining = pending.len(), "Pending worker context drained");
        });
    }
}

impl std::fmt::Debug for WorkerLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLifecycleManager")
            .field("running", &self.is_running())
            .field("pending", &self.pending_count())
            .finish()
    }
}
