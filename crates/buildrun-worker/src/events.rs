//! Event fan-out from the worker to observers.
//!
//! Emission is fire-and-forget: an observer that went away (dropped its
//! receiver) is pruned on the next emission and never surfaces as an error
//! to the emitting code. Events tagged with a run that is no longer the
//! current one are discarded here as well.

use std::sync::{Arc, Mutex, MutexGuard};

use buildrun_core::{EventEnvelope, RunId, RunnerEvent};
use tokio::sync::mpsc;
use tracing::trace;

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Broadcasts [`EventEnvelope`]s to every live subscriber.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<EventEnvelope>>>,
    current: Mutex<Option<RunId>>,
}

impl EventBus {
    /// Create a new EventBus wrapped in Arc.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new observer.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<EventEnvelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscribers).push(tx);
        rx
    }

    /// Number of observers still registered.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    /// Mark `run` as the run whose events are delivered.
    pub fn set_current(&self, run: Option<RunId>) {
        *lock(&self.current) = run;
    }

    /// The run whose events are currently delivered.
    pub fn current(&self) -> Option<RunId> {
        lock(&self.current).clone()
    }

    /// Returns true if `run` is the current run.
    pub fn is_current(&self, run: &RunId) -> bool {
        lock(&self.current).as_ref() == Some(run)
    }

    /// Emit an event. Events of a stale run are dropped.
    ///
    /// The current run stays locked until delivery is done, so once
    /// `set_current` returns no event of the previous run gets through.
    pub fn emit(&self, run: Option<&RunId>, event: RunnerEvent) {
        let current = lock(&self.current);
        if let Some(run) = run {
            if current.as_ref() != Some(run) {
                trace!(run_id = %run, event = event.name(), "Discarding event from stale run");
                return;
            }
        }

        let envelope = EventEnvelope::new(run.cloned(), event);
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|tx| {
            let delivered = tx.send(envelope.clone()).is_ok();
            if !delivered {
                trace!(event = envelope.event.name(), "Observer gone, dropping subscriber");
            }
            delivered
        });
        drop(current);
    }

    /// An emitter bound to `run`.
    pub fn emitter(self: &Arc<Self>, run: RunId) -> EventEmitter {
        EventEmitter {
            bus: Arc::clone(self),
            run,
        }
    }
}

/// Emits events on behalf of one run.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    bus: Arc<EventBus>,
    run: RunId,
}

impl EventEmitter {
    pub fn emit(&self, event: RunnerEvent) {
        self.bus.emit(Some(&self.run), event);
    }

    pub fn run_id(&self) -> &RunId {
        &self.run
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }
}
