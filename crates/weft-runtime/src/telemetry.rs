//! Transition telemetry.
//!
//! A lightweight event sink the evaluator emits lifecycle events into.
//! Tests read the buffer back; every event is also mirrored to `tracing`
//! so production setups get structured logs without the buffer.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::debug;

/// One recorded event.
#[derive(Debug, Clone)]
pub struct TelemetryEvent {
    pub event_type: String,
    pub at: DateTime<Utc>,
    pub fields: Map<String, Value>,
}

/// Event collector. When disabled, nothing is recorded or allocated.
#[derive(Debug, Default)]
pub struct Telemetry {
    enabled: bool,
    events: Mutex<Vec<TelemetryEvent>>,
}

impl Telemetry {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Record an event.
    pub fn emit(&self, event_type: &str, fields: Map<String, Value>) {
        debug!(event = event_type, ?fields, "telemetry");
        if !self.enabled {
            return;
        }
        self.events.lock().push(TelemetryEvent {
            event_type: event_type.to_string(),
            at: Utc::now(),
            fields,
        });
    }

    /// Snapshot of recorded events.
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().clone()
    }

    /// Event types in emission order.
    pub fn event_types(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .map(|e| e.event_type.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn records_when_enabled() {
        let telemetry = Telemetry::new(true);
        let mut fields = Map::new();
        fields.insert("workflow_id".to_string(), json!("wf-1"));
        telemetry.emit("workflow.start", fields);

        let events = telemetry.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "workflow.start");
        assert_eq!(events[0].fields["workflow_id"], json!("wf-1"));
    }

    #[test]
    fn silent_when_disabled() {
        let telemetry = Telemetry::new(false);
        telemetry.emit("workflow.start", Map::new());
        assert!(telemetry.events().is_empty());
    }
}
