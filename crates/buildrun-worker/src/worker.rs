//! The worker bound to one run and the job it executes.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use buildrun_core::{RunId, WorkerId};
use tokio_util::sync::CancellationToken;

use crate::download::DownloadManager;
use crate::evaluate::EvaluationRunner;
use crate::events::EventEmitter;

/// Work scheduled on the worker context when a run starts.
#[async_trait]
pub trait Job: Send + 'static {
    async fn run(self: Box<Self>, worker: WorkerHandle);
}

#[async_trait]
impl<F, Fut> Job for F
where
    F: FnOnce(WorkerHandle) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn run(self: Box<Self>, worker: WorkerHandle) {
        (*self)(worker).await
    }
}

struct WorkerInner {
    run: RunId,
    id: WorkerId,
    downloads: DownloadManager,
    runner: EvaluationRunner,
    emitter: EventEmitter,
    cancel: CancellationToken,
}

/// Everything a job needs: the run's download manager, its evaluation
/// runner and its cancellation token.
#[derive(Clone)]
pub struct WorkerHandle {
    inner: Arc<WorkerInner>,
}

impl WorkerHandle {
    pub(crate) fn new(
        run: RunId,
        downloads: DownloadManager,
        runner: EvaluationRunner,
        emitter: EventEmitter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                run,
                id: WorkerId::generate(),
                downloads,
                runner,
                emitter,
                cancel,
            }),
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.inner.run
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.inner.id
    }

    pub fn downloads(&self) -> &DownloadManager {
        &self.inner.downloads
    }

    pub fn runner(&self) -> &EvaluationRunner {
        &self.inner.runner
    }

    /// Emitter tagged with this run; events are dropped once the run is
    /// no longer current.
    pub fn emitter(&self) -> &EventEmitter {
        &self.inner.emitter
    }

    /// Cancelled when the run is stopped.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("run", &self.inner.run)
            .field("worker", &self.inner.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
