//! Execution context of a worker: a named OS thread driving its own
//! current-thread runtime.
//!
//! Work is handed over through a queue and spawned on the context's
//! runtime. Quitting stops the queue loop and drops the runtime, which
//! drops every task still running on it.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::thread;

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::WorkerError;

type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A dedicated thread running the tasks of one run.
pub struct WorkerContext {
    name: String,
    queue: mpsc::UnboundedSender<BoxedTask>,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl WorkerContext {
    /// Start a context on a new thread called `name`.
    ///
    /// `cancel` ends the context when fired, whether through [`quit`] or by
    /// its other holders.
    ///
    /// [`quit`]: WorkerContext::quit
    pub fn spawn(name: impl Into<String>, cancel: CancellationToken) -> Result<Self, WorkerError> {
        let name = name.into();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(WorkerError::Runtime)?;

        let (queue, mut tasks) = mpsc::unbounded_channel::<BoxedTask>();
        let (done_tx, done) = watch::channel(false);
        let token = cancel.clone();
        let thread_name = name.clone();

        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                debug!(context = %thread_name, "Worker context started");
                runtime.block_on(async move {
                    loop {
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => break,
                            task = tasks.recv() => match task {
                                Some(task) => {
                                    tokio::spawn(task);
                                }
                                None => break,
                            },
                        }
                    }
                });
                // drops every task left on the runtime
                drop(runtime);
                done_tx.send_replace(true);
                info!(context = %thread_name, "Worker context finished");
            })
            .map_err(WorkerError::Runtime)?;

        Ok(Self {
            name,
            queue,
            cancel,
            done,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `fut` on the context. The receiver resolves with its output, or
    /// errors if the context quit before the future completed.
    pub fn submit<F, T>(&self, fut: F) -> Result<oneshot::Receiver<T>, WorkerError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return Err(WorkerError::ContextClosed);
        }

        let (tx, rx) = oneshot::channel();
        let task: BoxedTask = Box::pin(async move {
            let _ = tx.send(fut.await);
        });
        self.queue.send(task).map_err(|_| WorkerError::ContextClosed)?;
        Ok(rx)
    }

    /// Ask the context to terminate. Does not wait.
    pub fn quit(&self) {
        if !self.cancel.is_cancelled() {
            debug!(context = %self.name, "Quitting worker context");
        }
        self.cancel.cancel();
    }

    /// Returns true once the runtime has been torn down.
    pub fn is_finished(&self) -> bool {
        *self.done.borrow()
    }

    /// Resolves once the runtime has been torn down. Does not borrow the
    /// context.
    pub fn finished(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut done = self.done.clone();
        async move {
            // an error means the thread died without reporting
            let _ = done.wait_for(|finished| *finished).await;
        }
    }

    /// Wait for the context to finish and reclaim its thread.
    pub async fn drained(mut self) {
        self.finished().await;

        let Some(thread) = self.thread.take() else {
            return;
        };
        let name = self.name.clone();
        match tokio::task::spawn_blocking(move || thread.join()).await {
            Ok(Ok(())) => debug!(context = %name, "Worker context joined"),
            Ok(Err(_)) => warn!(context = %name, "Worker context panicked"),
            Err(e) => warn!(context = %name, error = %e, "Failed to join worker context"),
        }
    }
}

impl Drop for WorkerContext {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerContext")
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}
