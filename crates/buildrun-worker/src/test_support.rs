//! Shared fixtures for the unit tests: a local HTTP server and a fake
//! launcher.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use buildrun_core::{AppInfo, BuildInfo, EventEnvelope, RunId, RunnerEvent};
use buildrun_launcher::{LaunchError, LaunchOptions, Launcher, LauncherFactory};
use tokio::sync::mpsc;

use crate::events::{EventBus, EventEmitter};

/// Body served at `/build.zip`.
pub(crate) fn build_body() -> Vec<u8> {
    (0..64 * 1024).map(|i| (i % 251) as u8).collect()
}

#[derive(Clone, Default)]
struct ServerState {
    hits: Arc<AtomicUsize>,
    flaky_hits: Arc<AtomicUsize>,
}

/// Local HTTP server serving test artifacts.
///
/// - `/build.zip`: a 64 KiB body with a content length
/// - `/slow`: 1 KiB every 25ms for 5s, no content length
/// - `/missing`: 404
/// - `/flaky`: 503 on the first request, then the build body
pub(crate) struct TestServer {
    addr: SocketAddr,
    state: ServerState,
}

impl TestServer {
    /// Bind on an ephemeral port and serve on the current runtime.
    pub(crate) async fn start() -> Self {
        let state = ServerState::default();
        let app = Router::new()
            .route("/build.zip", get(build))
            .route("/slow", get(slow))
            .route("/missing", get(missing))
            .route("/flaky", get(flaky))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Requests received so far, all routes included.
    pub(crate) fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }
}

async fn build(State(state): State<ServerState>) -> Vec<u8> {
    state.hits.fetch_add(1, Ordering::SeqCst);
    build_body()
}

async fn slow(State(state): State<ServerState>) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let chunks = futures_util::stream::unfold(0u32, |i| async move {
        if i >= 200 {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
        Some((Ok::<_, std::io::Error>(Bytes::from(vec![7u8; 1024])), i + 1))
    });
    Body::from_stream(chunks).into_response()
}

async fn missing(State(state): State<ServerState>) -> StatusCode {
    state.hits.fetch_add(1, Ordering::SeqCst);
    StatusCode::NOT_FOUND
}

async fn flaky(State(state): State<ServerState>) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    if state.flaky_hits.fetch_add(1, Ordering::SeqCst) == 0 {
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    } else {
        build_body().into_response()
    }
}

/// An emitter whose run is current, plus an observer of the bus.
pub(crate) fn test_emitter() -> (EventEmitter, mpsc::UnboundedReceiver<EventEnvelope>) {
    let bus = EventBus::new();
    let run = RunId::generate();
    bus.set_current(Some(run.clone()));
    let rx = bus.subscribe();
    (bus.emitter(run), rx)
}

/// Everything received so far, without waiting.
pub(crate) fn drain(rx: &mut mpsc::UnboundedReceiver<EventEnvelope>) -> Vec<RunnerEvent> {
    let mut events = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        events.push(envelope.event);
    }
    events
}

/// How the fake launchers behave.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeBehavior {
    pub(crate) fail_create: bool,
    pub(crate) fail_start: bool,
    pub(crate) fail_stop: bool,
    pub(crate) start_delay: Duration,
}

/// Factory of fake launchers recording every call.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeFactory {
    behavior: FakeBehavior,
    calls: Arc<Mutex<Vec<String>>>,
    options: Arc<Mutex<Option<LaunchOptions>>>,
}

impl FakeFactory {
    pub(crate) fn new(behavior: FakeBehavior) -> Self {
        Self {
            behavior,
            ..Self::default()
        }
    }

    /// Calls made so far: create, start, stop, cleanup.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Options passed to the last start.
    pub(crate) fn last_options(&self) -> Option<LaunchOptions> {
        self.options.lock().unwrap().clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }
}

impl LauncherFactory for FakeFactory {
    fn create(&self, _build: &BuildInfo) -> Result<Box<dyn Launcher>, LaunchError> {
        self.record("create");
        if self.behavior.fail_create {
            return Err(LaunchError::MissingBuildFile("fake".to_string()));
        }
        Ok(Box::new(FakeLauncher {
            factory: self.clone(),
        }))
    }
}

struct FakeLauncher {
    factory: FakeFactory,
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn start(&mut self, options: &LaunchOptions) -> Result<(), LaunchError> {
        self.factory.record("start");
        *self.factory.options.lock().unwrap() = Some(options.clone());
        if !self.factory.behavior.start_delay.is_zero() {
            tokio::time::sleep(self.factory.behavior.start_delay).await;
        }
        if self.factory.behavior.fail_start {
            return Err(LaunchError::Other("launch refused".to_string()));
        }
        Ok(())
    }

    fn app_info(&self) -> AppInfo {
        AppInfo::default().with_name("fake")
    }

    async fn stop(&mut self) -> Result<(), LaunchError> {
        self.factory.record("stop");
        if self.factory.behavior.fail_stop {
            return Err(LaunchError::Other("stop refused".to_string()));
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        self.factory.record("cleanup");
    }
}
