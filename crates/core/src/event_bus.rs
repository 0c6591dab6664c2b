//! Event bus: trait for emitting sequence analytics events.
//!
//! The engine accepts an `Arc<dyn EventSink>` and emits one event per
//! enrollment transition.

use crate::types::{EventType, SequenceEvent};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Trait for emitting analytics events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SequenceEvent);
}

/// No-op sink for tests and deployments without an analytics pipeline.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: SequenceEvent) {}
}

/// Sink that writes every event to the tracing log.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: SequenceEvent) {
        tracing::info!(
            event_type = ?event.event_type,
            sequence_id = %event.sequence_id,
            enrollment_id = ?event.enrollment_id,
            step_id = ?event.step_id,
            "sequence event"
        );
    }
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<SequenceEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<SequenceEvent> {
        self.events.lock().expect("event bus mutex poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().expect("event bus mutex poisoned").len()
    }

    pub fn count_type(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .expect("event bus mutex poisoned")
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: SequenceEvent) {
        self.events.lock().expect("event bus mutex poisoned").push(event);
    }
}

/// Convenience builder for a `SequenceEvent` with minimal boilerplate.
pub fn make_event(
    event_type: EventType,
    sequence_id: Uuid,
    enrollment_id: Option<Uuid>,
    contact_id: Option<String>,
) -> SequenceEvent {
    SequenceEvent {
        event_id: Uuid::new_v4(),
        event_type,
        sequence_id,
        enrollment_id,
        contact_id,
        step_id: None,
        node_id: "local".into(),
        detail: serde_json::Value::Null,
        timestamp: Utc::now(),
    }
}

pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_sink() {
        let sink = capture_sink();
        let sequence_id = Uuid::new_v4();
        assert_eq!(sink.count(), 0);

        sink.emit(make_event(
            EventType::Enrolled,
            sequence_id,
            Some(Uuid::new_v4()),
            Some("contact-1".into()),
        ));
        sink.emit(make_event(EventType::EmailSent, sequence_id, None, None));

        assert_eq!(sink.count(), 2);
        assert_eq!(sink.count_type(EventType::Enrolled), 1);
        assert_eq!(sink.count_type(EventType::Completed), 0);

        let events = sink.events();
        assert_eq!(events[0].contact_id, Some("contact-1".into()));
        assert_eq!(events[1].sequence_id, sequence_id);
    }

    #[test]
    fn test_noop_sink() {
        let sink = noop_sink();
        sink.emit(make_event(EventType::Exited, Uuid::new_v4(), None, None));
    }
}
