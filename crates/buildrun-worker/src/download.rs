//! Cancellable build downloads.
//!
//! Each download runs as its own task on the worker runtime. Bytes are
//! streamed into a `.part` file next to the destination and renamed into
//! place only once the transfer is complete, so a file present at a
//! destination is always a finished artifact.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use buildrun_core::{BuildInfo, DownloadId, DownloadOutcome, RunnerEvent};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::DownloadError;
use crate::events::{lock, EventEmitter};
use crate::persist::{is_part_file, Admission, PersistStore, PART_EXTENSION};

/// Tuning knobs of a [`DownloadManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSettings {
    /// Minimum delay between two progress events of one task.
    pub progress_interval: Duration,

    /// Retries for the initial request.
    pub max_retries: u32,

    /// Back-off unit; attempt `n` waits `n * retry_backoff`.
    pub retry_backoff: Duration,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            progress_interval: Duration::from_millis(100),
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

struct TaskShared {
    id: DownloadId,
    url: String,
    dest: PathBuf,
    part: PathBuf,
    cancel: CancellationToken,
    forward_progress: AtomicBool,
    progress: Mutex<(u64, Option<u64>)>,
    outcome: watch::Sender<Option<DownloadOutcome>>,
}

/// Handle on one in-flight (or finished) download task.
#[derive(Clone)]
pub struct DownloadHandle {
    shared: Arc<TaskShared>,
}

impl DownloadHandle {
    fn new(url: &str, dest: PathBuf) -> Self {
        let id = DownloadId::generate();
        let part = part_path(&dest, &id);
        let (outcome, _) = watch::channel(None);
        Self {
            shared: Arc::new(TaskShared {
                id,
                url: url.to_string(),
                dest,
                part,
                cancel: CancellationToken::new(),
                forward_progress: AtomicBool::new(false),
                progress: Mutex::new((0, None)),
                outcome,
            }),
        }
    }

    pub fn id(&self) -> &DownloadId {
        &self.shared.id
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    /// Final location of the artifact.
    pub fn dest(&self) -> &Path {
        &self.shared.dest
    }

    /// Request cancellation. Never waits; idempotent.
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Returns true until the task has finished one way or another.
    pub fn is_running(&self) -> bool {
        self.shared.outcome.borrow().is_none()
    }

    /// The terminal outcome, once the task finished.
    pub fn outcome(&self) -> Option<DownloadOutcome> {
        self.shared.outcome.borrow().clone()
    }

    /// Enable or disable progress events for this task.
    pub fn set_progress_forwarding(&self, enabled: bool) {
        self.shared.forward_progress.store(enabled, Ordering::Release);
    }

    fn forwards_progress(&self) -> bool {
        self.shared.forward_progress.load(Ordering::Acquire)
    }

    /// Bytes received so far and the announced total, if known.
    pub fn progress(&self) -> (u64, Option<u64>) {
        *lock(&self.shared.progress)
    }

    fn set_progress(&self, received: u64, total: Option<u64>) {
        *lock(&self.shared.progress) = (received, total);
    }

    /// Wait for the task to finish.
    pub async fn wait(&self) -> DownloadOutcome {
        let mut rx = self.shared.outcome.subscribe();
        let outcome = rx.wait_for(Option::is_some).await.map(|o| o.clone());
        // the sender lives as long as this handle, so the channel cannot close
        outcome.ok().flatten().unwrap_or(DownloadOutcome::Cancelled)
    }
}

impl fmt::Debug for DownloadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadHandle")
            .field("id", &self.shared.id)
            .field("url", &self.shared.url)
            .field("dest", &self.shared.dest)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

struct Inner {
    dest_dir: PathBuf,
    client: reqwest::Client,
    store: Mutex<PersistStore>,
    tasks: Mutex<HashMap<PathBuf, DownloadHandle>>,
    emitter: EventEmitter,
    settings: DownloadSettings,
}

/// Fetches builds into the persist directory.
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

impl DownloadManager {
    /// Create a manager writing into `dest_dir`.
    ///
    /// Leftover `.part` files from an interrupted process are removed and
    /// the remaining files are registered with `store`.
    pub fn new(
        dest_dir: impl Into<PathBuf>,
        client: reqwest::Client,
        mut store: PersistStore,
        emitter: EventEmitter,
        settings: DownloadSettings,
    ) -> Result<Self, DownloadError> {
        let dest_dir = dest_dir.into();
        std::fs::create_dir_all(&dest_dir)?;
        remove_stale_parts(&dest_dir)?;
        store.register_dir_content(&dest_dir)?;

        info!(
            dest_dir = %dest_dir.display(),
            persisted = store.len(),
            quota = store.quota(),
            "Download manager ready"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                dest_dir,
                client,
                store: Mutex::new(store),
                tasks: Mutex::new(HashMap::new()),
                emitter,
                settings,
            }),
        })
    }

    pub fn dest_dir(&self) -> &Path {
        &self.inner.dest_dir
    }

    /// Bytes currently tracked by the persist store, and its quota.
    pub fn persist_usage(&self) -> (u64, u64) {
        let store = lock(&self.inner.store);
        (store.total_bytes(), store.quota())
    }

    /// Destination of an artifact persisted as `persist_name`.
    pub fn dest_for(&self, persist_name: &str) -> Result<PathBuf, DownloadError> {
        let invalid = persist_name.is_empty()
            || persist_name == "."
            || persist_name == ".."
            || persist_name.contains(['/', '\\'])
            || is_part_file(Path::new(persist_name));
        if invalid {
            return Err(DownloadError::InvalidName(persist_name.to_string()));
        }
        Ok(self.inner.dest_dir.join(persist_name))
    }

    /// Handles of every task that has not been cancelled or finished.
    pub fn in_flight(&self) -> Vec<DownloadHandle> {
        lock(&self.inner.tasks).values().cloned().collect()
    }

    /// Start fetching `url` into `persist_name`.
    ///
    /// Returns the handle of a new or already running task for the same
    /// destination, or `None` if the artifact is already on disk. In the
    /// latter case a `DownloadFinished` event with no task is emitted.
    pub fn download(
        &self,
        url: &str,
        persist_name: &str,
    ) -> Result<Option<DownloadHandle>, DownloadError> {
        self.start_task(url, persist_name, true)
    }

    /// Prefetch a build that is likely to be evaluated next.
    ///
    /// No progress is forwarded and a cache hit is silent.
    pub fn download_in_background(
        &self,
        build: &BuildInfo,
    ) -> Result<Option<DownloadHandle>, DownloadError> {
        self.start_task(&build.build_url, &build.persist_name, false)
    }

    /// Make `build` the one being waited for.
    ///
    /// Sets `build.build_file`, cancels every task for another destination,
    /// then downloads this one with progress forwarding enabled.
    pub fn focus(&self, build: &mut BuildInfo) -> Result<Option<DownloadHandle>, DownloadError> {
        let dest = self.dest_for(&build.persist_name)?;
        build.build_file = Some(dest.clone());

        let cancelled = self.cancel(|task| task.dest() != dest);
        if !cancelled.is_empty() {
            debug!(count = cancelled.len(), build = %build.display_name(), "Cancelled unneeded downloads");
        }

        let handle = self.start_task(&build.build_url, &build.persist_name, true)?;
        if let Some(handle) = &handle {
            handle.set_progress_forwarding(true);
        }
        Ok(handle)
    }

    /// Cancel every in-flight task matching `predicate`.
    ///
    /// Matching tasks leave the in-flight table immediately; their tokens
    /// are fired after the table lock is released. Never waits for the
    /// tasks to wind down, so it is safe to call from anywhere.
    pub fn cancel<F>(&self, predicate: F) -> Vec<DownloadHandle>
    where
        F: Fn(&DownloadHandle) -> bool,
    {
        let snapshot: Vec<DownloadHandle> = lock(&self.inner.tasks).values().cloned().collect();
        let matching: Vec<DownloadHandle> = snapshot.into_iter().filter(|h| predicate(h)).collect();
        if matching.is_empty() {
            return matching;
        }

        {
            let mut tasks = lock(&self.inner.tasks);
            for handle in &matching {
                remove_if_same(&mut tasks, handle);
            }
        }

        for handle in &matching {
            debug!(task = %handle.id(), url = %handle.url(), "Cancelling download");
            handle.cancel();
        }
        matching
    }

    /// Cancel every in-flight task.
    pub fn cancel_all(&self) -> Vec<DownloadHandle> {
        self.cancel(|_| true)
    }

    fn start_task(
        &self,
        url: &str,
        persist_name: &str,
        announce_cache_hit: bool,
    ) -> Result<Option<DownloadHandle>, DownloadError> {
        let dest = self.dest_for(persist_name)?;

        let handle = {
            let mut tasks = lock(&self.inner.tasks);
            if let Some(existing) = tasks.get(&dest) {
                return Ok(Some(existing.clone()));
            }
            if dest.is_file() {
                None
            } else {
                let handle = DownloadHandle::new(url, dest.clone());
                tasks.insert(dest.clone(), handle.clone());
                Some(handle)
            }
        };

        let Some(handle) = handle else {
            self.inner.record_cache_hit(&dest);
            if announce_cache_hit {
                self.inner.emitter.emit(RunnerEvent::DownloadFinished {
                    task: None,
                    dest,
                    outcome: DownloadOutcome::Succeeded,
                });
            }
            return Ok(None);
        };

        info!(task = %handle.id(), url = %url, dest = %handle.dest().display(), "Starting download");
        self.inner.emitter.emit(RunnerEvent::DownloadStarted {
            task: handle.id().clone(),
            url: url.to_string(),
            dest: handle.dest().to_path_buf(),
        });

        tokio::spawn(run_task(Arc::clone(&self.inner), handle.clone()));
        Ok(Some(handle))
    }
}

impl fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadManager")
            .field("dest_dir", &self.inner.dest_dir)
            .field("in_flight", &lock(&self.inner.tasks).len())
            .finish()
    }
}

impl Inner {
    fn record_cache_hit(&self, dest: &Path) {
        let mut store = lock(&self.store);
        if !store.touch(dest) {
            // present on disk but unknown to the store
            if let Ok(metadata) = std::fs::metadata(dest) {
                store.commit(dest, metadata.len());
            }
        }
        debug!(dest = %dest.display(), "Build already persisted");
    }

    /// Record the terminal outcome of a task. Only the first call has any
    /// effect, so exactly one finished event is emitted per task.
    fn finish_task(&self, handle: &DownloadHandle, outcome: DownloadOutcome) {
        remove_if_same(&mut lock(&self.tasks), handle);

        let first = handle.shared.outcome.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome.clone());
            true
        });
        if !first {
            return;
        }

        match &outcome {
            DownloadOutcome::Succeeded => {
                info!(task = %handle.id(), dest = %handle.dest().display(), "Download finished")
            }
            DownloadOutcome::Failed(error) => {
                warn!(task = %handle.id(), url = %handle.url(), error = %error, "Download failed")
            }
            DownloadOutcome::Cancelled => debug!(task = %handle.id(), "Download cancelled"),
        }

        self.emitter.emit(RunnerEvent::DownloadFinished {
            task: Some(handle.id().clone()),
            dest: handle.dest().to_path_buf(),
            outcome,
        });
    }

    async fn transfer(&self, handle: &DownloadHandle) -> Result<(), DownloadError> {
        let response = self.send_with_retry(handle).await?;
        let total = response.content_length();

        if let Some(total) = total {
            if lock(&self.store).reserve(handle.dest(), total) == Admission::Deny {
                warn!(task = %handle.id(), size = total, "Build exceeds the persist quota on its own");
            }
        }
        handle.set_progress(0, total);

        let mut part = PartFile::create(&handle.shared.part).await?;
        let mut stream = response.bytes_stream();
        let mut received: u64 = 0;
        let mut reported: Option<u64> = None;
        let mut last_report = Instant::now();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            part.write_all(&chunk).await?;
            received += chunk.len() as u64;
            handle.set_progress(received, total);

            let due = reported.is_none() || last_report.elapsed() >= self.settings.progress_interval;
            if due && reported < Some(received) && handle.forwards_progress() {
                self.emit_progress(handle, received, total);
                reported = Some(received);
                last_report = Instant::now();
            }
        }

        if let Some(expected) = total {
            if received < expected {
                return Err(DownloadError::Incomplete { received, expected });
            }
        }

        if handle.forwards_progress() && reported < Some(received) {
            self.emit_progress(handle, received, total);
        }

        part.persist(handle.dest()).await?;
        lock(&self.store).commit(handle.dest(), received);
        Ok(())
    }

    fn emit_progress(&self, handle: &DownloadHandle, received: u64, total: Option<u64>) {
        self.emitter.emit(RunnerEvent::DownloadProgress {
            task: handle.id().clone(),
            received,
            total,
        });
    }

    async fn send_with_retry(&self, handle: &DownloadHandle) -> Result<reqwest::Response, DownloadError> {
        let mut attempt: u32 = 0;
        loop {
            let result = self.client.get(handle.url()).send().await;
            let retryable = match &result {
                Ok(response) => response.status().is_server_error(),
                Err(e) => e.is_connect() || e.is_timeout(),
            };

            if retryable && attempt < self.settings.max_retries {
                attempt += 1;
                let delay = self.settings.retry_backoff * attempt;
                match &result {
                    Ok(response) => warn!(
                        task = %handle.id(),
                        status = response.status().as_u16(),
                        attempt,
                        "Server error, retrying in {:?}",
                        delay
                    ),
                    Err(e) => warn!(
                        task = %handle.id(),
                        error = %e,
                        attempt,
                        "Request failed, retrying in {:?}",
                        delay
                    ),
                }
                tokio::time::sleep(delay).await;
                continue;
            }

            let response = result?;
            let status = response.status();
            if !status.is_success() {
                return Err(DownloadError::Status {
                    status: status.as_u16(),
                    url: handle.url().to_string(),
                });
            }
            return Ok(response);
        }
    }
}

async fn run_task(inner: Arc<Inner>, handle: DownloadHandle) {
    let guard = TaskGuard {
        inner: Arc::clone(&inner),
        handle: handle.clone(),
        done: false,
    };

    let outcome = tokio::select! {
        biased;
        _ = handle.shared.cancel.cancelled() => DownloadOutcome::Cancelled,
        result = inner.transfer(&handle) => match result {
            Ok(()) => DownloadOutcome::Succeeded,
            Err(e) => DownloadOutcome::Failed(e.to_string()),
        },
    };

    guard.finish(outcome);
}

/// Finishes the task as cancelled if its future is dropped before it
/// completed, e.g. when the worker runtime is torn down.
struct TaskGuard {
    inner: Arc<Inner>,
    handle: DownloadHandle,
    done: bool,
}

impl TaskGuard {
    fn finish(mut self, outcome: DownloadOutcome) {
        self.done = true;
        self.inner.finish_task(&self.handle, outcome);
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if !self.done {
            self.inner.finish_task(&self.handle, DownloadOutcome::Cancelled);
        }
    }
}

/// An in-progress download file, removed on drop unless persisted.
struct PartFile {
    path: PathBuf,
    file: Option<tokio::fs::File>,
    persisted: bool,
}

impl PartFile {
    async fn create(path: &Path) -> io::Result<Self> {
        let file = tokio::fs::File::create(path).await?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            persisted: false,
        })
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.write_all(buf).await,
            None => Err(io::Error::other("part file already closed")),
        }
    }

    /// Flush to disk and move into place.
    async fn persist(mut self, dest: &Path) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        std::fs::rename(&self.path, dest)?;
        self.persisted = true;
        Ok(())
    }
}

impl Drop for PartFile {
    fn drop(&mut self) {
        self.file.take();
        if self.persisted {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed partial download"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove partial download"),
        }
    }
}

fn part_path(dest: &Path, id: &DownloadId) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{}.{}", id, PART_EXTENSION));
    dest.with_file_name(name)
}

fn remove_if_same(tasks: &mut HashMap<PathBuf, DownloadHandle>, handle: &DownloadHandle) {
    if tasks.get(handle.dest()).is_some_and(|t| t.id() == handle.id()) {
        tasks.remove(handle.dest());
    }
}

fn remove_stale_parts(dir: &Path) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && is_part_file(&path) {
            debug!(path = %path.display(), "Removing stale partial download");
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "Failed to remove stale partial download");
            }
        }
    }
    Ok(())
}
