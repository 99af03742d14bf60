//! JSON output for streaming events to stdout.

use serde::Serialize;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use buildrun_core::{EventEnvelope, RunId, Verdict};

/// Global flag to enable JSON output mode.
static JSON_MODE_ENABLED: AtomicBool = AtomicBool::new(false);

/// Enable JSON output mode.
pub fn enable_json_mode() {
    JSON_MODE_ENABLED.store(true, Ordering::SeqCst);
}

/// Check if JSON mode is enabled.
pub fn is_json_mode() -> bool {
    JSON_MODE_ENABLED.load(Ordering::SeqCst)
}

/// A JSON line written to stdout.
#[derive(Debug, Clone, Serialize)]
pub struct JsonEvent {
    pub event: &'static str,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<RunId>,
    pub data: serde_json::Value,
}

impl JsonEvent {
    /// Create a new JSON event with the current timestamp.
    pub fn new(event: &'static str, run: Option<RunId>, data: serde_json::Value) -> Self {
        Self {
            event,
            timestamp: chrono::Utc::now().to_rfc3339(),
            run,
            data,
        }
    }

    /// Output this event as a JSON line to stdout.
    pub fn emit(&self) {
        if !is_json_mode() {
            return;
        }
        if let Ok(json) = serde_json::to_string(self) {
            let mut stdout = io::stdout().lock();
            let _ = writeln!(stdout, "{}", json);
            let _ = stdout.flush();
        }
    }
}

/// Emit a runner event.
pub fn emit_envelope(envelope: &EventEnvelope) {
    let data = serde_json::to_value(&envelope.event).unwrap_or(serde_json::Value::Null);
    JsonEvent::new(envelope.event.name(), envelope.run.clone(), data).emit();
}

/// Emit the verdicts collected by a completed job.
pub fn emit_summary(verdicts: &[(String, Option<Verdict>)]) {
    let builds: Vec<serde_json::Value> = verdicts
        .iter()
        .map(|(build, verdict)| serde_json::json!({ "build": build, "verdict": verdict }))
        .collect();
    JsonEvent::new("summary", None, serde_json::json!({ "builds": builds })).emit();
}

/// Emit an error event.
pub fn emit_error(message: &str) {
    JsonEvent::new("error", None, serde_json::json!({ "message": message })).emit();
}
