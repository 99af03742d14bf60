//! Evaluation state machine: launch a build, keep it running while it is
//! judged, then stop it.
//!
//! `Idle -> Starting -> Running -> Finishing -> Idle`. A failed start stays
//! in `Starting` until `finish` is called.

use std::fmt;
use std::sync::{Arc, Mutex};

use buildrun_core::{BuildInfo, EvaluationPhase, RunnerEvent, Verdict};
use buildrun_launcher::{LaunchError, LaunchOptions, Launcher, LauncherFactory};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::EvaluationError;
use crate::events::{lock, EventEmitter};

#[derive(Default)]
struct RunnerState {
    phase: EvaluationPhase,
    launcher: Option<Box<dyn Launcher>>,
    abort: Option<CancellationToken>,
    verdict: Option<Verdict>,
}

struct Inner {
    factory: Arc<dyn LauncherFactory>,
    options: LaunchOptions,
    emitter: EventEmitter,
    state: Mutex<RunnerState>,
}

/// Launches builds and tears them down once a verdict is known.
#[derive(Clone)]
pub struct EvaluationRunner {
    inner: Arc<Inner>,
}

impl EvaluationRunner {
    pub fn new(
        factory: Arc<dyn LauncherFactory>,
        options: LaunchOptions,
        emitter: EventEmitter,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                factory,
                options,
                emitter,
                state: Mutex::new(RunnerState::default()),
            }),
        }
    }

    pub fn phase(&self) -> EvaluationPhase {
        lock(&self.inner.state).phase
    }

    /// Verdict recorded by the last `finish`.
    pub fn verdict(&self) -> Option<Verdict> {
        lock(&self.inner.state).verdict
    }

    pub fn launch_options(&self) -> &LaunchOptions {
        &self.inner.options
    }

    /// Launch `build`.
    ///
    /// On success `build.app_info` is filled in and `EvaluateStarted` is
    /// emitted with no error. On failure `EvaluateStarted` carries the error
    /// text and the runner stays in `Starting` until `finish` is called.
    pub async fn evaluate(&self, build: &mut BuildInfo) -> Result<(), EvaluationError> {
        let abort = {
            let mut state = lock(&self.inner.state);
            if state.phase != EvaluationPhase::Idle {
                error!(phase = %state.phase, build = %build.display_name(), "evaluate() called while an evaluation is active");
                return Err(EvaluationError::AlreadyActive(state.phase));
            }
            let abort = CancellationToken::new();
            state.phase = EvaluationPhase::Starting;
            state.abort = Some(abort.clone());
            state.verdict = None;
            abort
        };

        info!(build = %build.display_name(), "Evaluating build");

        let mut launcher = match self.inner.factory.create(build) {
            Ok(launcher) => launcher,
            Err(e) => {
                if abort.is_cancelled() {
                    return Err(EvaluationError::Aborted);
                }
                return Err(self.start_failed(e));
            }
        };

        let started = tokio::select! {
            biased;
            _ = abort.cancelled() => None,
            result = launcher.start(&self.inner.options) => Some(result),
        };

        let Some(result) = started else {
            return Err(abandon(launcher).await);
        };

        let app_info = result.is_ok().then(|| launcher.app_info());

        // finish() may have run between the start completing and here
        let leftover = {
            let mut state = lock(&self.inner.state);
            if abort.is_cancelled() {
                Some(launcher)
            } else {
                state.launcher = Some(launcher);
                if result.is_ok() {
                    state.phase = EvaluationPhase::Running;
                    state.abort = None;
                }
                None
            }
        };
        if let Some(launcher) = leftover {
            return Err(abandon(launcher).await);
        }

        match result {
            Ok(()) => {
                if let Some(app_info) = app_info {
                    build.update_from_app_info(app_info);
                }
                info!(build = %build.display_name(), "Build started");
                self.inner
                    .emitter
                    .emit(RunnerEvent::EvaluateStarted { error: None });
                Ok(())
            }
            Err(e) => Err(self.start_failed(e)),
        }
    }

    fn start_failed(&self, e: LaunchError) -> EvaluationError {
        warn!(error = %e, "Failed to start build");
        self.inner.emitter.emit(RunnerEvent::EvaluateStarted {
            error: Some(e.to_string()),
        });
        EvaluationError::Launch(e)
    }

    /// Tear down the current evaluation and record `verdict`.
    ///
    /// `finish(None)` is the abort path. Stop errors are logged and
    /// swallowed; cleanup always runs. When nothing is being evaluated only
    /// the verdict is recorded and no event is emitted.
    pub async fn finish(&self, verdict: Option<Verdict>) {
        let launcher = {
            let mut state = lock(&self.inner.state);
            if !state.phase.is_active() {
                debug!(phase = %state.phase, verdict = ?verdict, "Nothing to finish");
                state.verdict = verdict;
                return;
            }
            if let Some(abort) = state.abort.take() {
                abort.cancel();
            }
            state.phase = EvaluationPhase::Finishing;
            state.launcher.take()
        };

        if let Some(mut launcher) = launcher {
            if let Err(e) = launcher.stop().await {
                warn!(error = %e, "Failed to stop build, cleaning up anyway");
            }
            launcher.cleanup();
        }

        {
            let mut state = lock(&self.inner.state);
            state.verdict = verdict;
            state.phase = EvaluationPhase::Idle;
        }

        info!(verdict = ?verdict, "Evaluation finished");
        self.inner
            .emitter
            .emit(RunnerEvent::EvaluateFinished { verdict });
    }
}

impl fmt::Debug for EvaluationRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvaluationRunner")
            .field("phase", &self.phase())
            .field("options", &self.inner.options)
            .finish()
    }
}

/// Stop a launcher whose evaluation was aborted while starting.
async fn abandon(mut launcher: Box<dyn Launcher>) -> EvaluationError {
    warn!("Evaluation aborted while the build was starting");
    if let Err(e) = launcher.stop().await {
        warn!(error = %e, "Failed to stop aborted build");
    }
    launcher.cleanup();
    EvaluationError::Aborted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{drain, test_emitter, FakeBehavior, FakeFactory};
    use std::time::Duration;

    fn runner(behavior: FakeBehavior) -> (EvaluationRunner, FakeFactory, tokio::sync::mpsc::UnboundedReceiver<buildrun_core::EventEnvelope>) {
        let (emitter, rx) = test_emitter();
        let factory = FakeFactory::new(behavior);
        let runner = EvaluationRunner::new(
            Arc::new(factory.clone()),
            LaunchOptions::default().with_preference("a", "1"),
            emitter,
        );
        (runner, factory, rx)
    }

    fn build() -> BuildInfo {
        BuildInfo::new("http://x/app.bin", "app.bin")
    }

    #[tokio::test]
    async fn test_evaluate_then_finish() {
        let (runner, factory, mut rx) = runner(FakeBehavior::default());
        let mut build = build();

        runner.evaluate(&mut build).await.unwrap();
        assert_eq!(runner.phase(), EvaluationPhase::Running);
        assert_eq!(
            build.app_info.as_ref().and_then(|i| i.application_name.as_deref()),
            Some("fake")
        );

        runner.finish(Some(Verdict::Good)).await;
        assert_eq!(runner.phase(), EvaluationPhase::Idle);
        assert_eq!(runner.verdict(), Some(Verdict::Good));

        assert_eq!(factory.calls(), vec!["create", "start", "stop", "cleanup"]);
        assert_eq!(
            drain(&mut rx),
            vec![
                RunnerEvent::EvaluateStarted { error: None },
                RunnerEvent::EvaluateFinished { verdict: Some(Verdict::Good) },
            ]
        );
    }

    #[tokio::test]
    async fn test_evaluate_while_running_is_rejected() {
        let (runner, factory, mut rx) = runner(FakeBehavior::default());
        let mut build = build();

        runner.evaluate(&mut build).await.unwrap();
        drain(&mut rx);

        let err = runner.evaluate(&mut build).await.unwrap_err();
        assert!(matches!(err, EvaluationError::AlreadyActive(EvaluationPhase::Running)));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(factory.calls(), vec!["create", "start"]);
    }

    #[tokio::test]
    async fn test_start_failure_keeps_launcher_until_finish() {
        let (runner, factory, mut rx) = runner(FakeBehavior {
            fail_start: true,
            ..FakeBehavior::default()
        });
        let mut build = build();

        let err = runner.evaluate(&mut build).await.unwrap_err();
        assert!(matches!(err, EvaluationError::Launch(_)));
        assert_eq!(runner.phase(), EvaluationPhase::Starting);
        assert!(build.app_info.is_none());

        // a second evaluate must wait for finish
        assert!(matches!(
            runner.evaluate(&mut build).await,
            Err(EvaluationError::AlreadyActive(EvaluationPhase::Starting))
        ));

        runner.finish(None).await;
        assert_eq!(runner.phase(), EvaluationPhase::Idle);
        assert_eq!(factory.calls(), vec!["create", "start", "stop", "cleanup"]);

        let events = drain(&mut rx);
        assert!(matches!(&events[0], RunnerEvent::EvaluateStarted { error: Some(e) } if e.contains("refused")));
        assert_eq!(events[1], RunnerEvent::EvaluateFinished { verdict: None });
    }

    #[tokio::test]
    async fn test_factory_failure_has_no_launcher() {
        let (runner, factory, mut rx) = runner(FakeBehavior {
            fail_create: true,
            ..FakeBehavior::default()
        });

        assert!(runner.evaluate(&mut build()).await.is_err());
        runner.finish(Some(Verdict::Skip)).await;

        assert_eq!(runner.phase(), EvaluationPhase::Idle);
        assert_eq!(factory.calls(), vec!["create"]);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], RunnerEvent::EvaluateFinished { verdict: Some(Verdict::Skip) });
    }

    #[tokio::test]
    async fn test_stop_failure_is_swallowed() {
        let (runner, factory, mut rx) = runner(FakeBehavior {
            fail_stop: true,
            ..FakeBehavior::default()
        });

        runner.evaluate(&mut build()).await.unwrap();
        runner.finish(Some(Verdict::Bad)).await;

        assert_eq!(runner.phase(), EvaluationPhase::Idle);
        assert_eq!(factory.calls(), vec!["create", "start", "stop", "cleanup"]);
        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[tokio::test]
    async fn test_finish_when_idle_only_records_verdict() {
        let (runner, factory, mut rx) = runner(FakeBehavior::default());

        runner.finish(Some(Verdict::Retry)).await;
        runner.finish(Some(Verdict::Bad)).await;

        assert_eq!(runner.verdict(), Some(Verdict::Bad));
        assert!(factory.calls().is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_finish_aborts_pending_start() {
        let (runner, factory, mut rx) = runner(FakeBehavior {
            start_delay: Duration::from_secs(30),
            ..FakeBehavior::default()
        });

        let evaluating = {
            let runner = runner.clone();
            tokio::spawn(async move {
                let mut build = build();
                runner.evaluate(&mut build).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runner.phase(), EvaluationPhase::Starting);

        runner.finish(None).await;
        let result = evaluating.await.unwrap();

        assert!(matches!(result, Err(EvaluationError::Aborted)));
        assert_eq!(runner.phase(), EvaluationPhase::Idle);
        assert!(factory.calls().contains(&"cleanup".to_string()));
        assert_eq!(
            drain(&mut rx),
            vec![RunnerEvent::EvaluateFinished { verdict: None }]
        );
    }

    #[tokio::test]
    async fn test_launch_options_are_passed_through() {
        let (runner, factory, _rx) = runner(FakeBehavior::default());

        runner.evaluate(&mut build()).await.unwrap();

        assert_eq!(
            factory.last_options().map(|o| o.preferences.len()),
            Some(1)
        );
        assert_eq!(runner.launch_options().preferences.get("a").map(String::as_str), Some("1"));
    }
}
