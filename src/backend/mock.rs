//! Recording backend for tests and adapter development.
//!
//! Every span lifecycle action is appended to a shared event log that tests
//! can assert against. Useful for:
//! - unit and integration tests of the correlation engine
//! - adapter development without a tracer provider
//! - CI pipelines
//!
//! Implements: REQ-OBS-001/T-001 (Testability)

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::{SpanDescriptor, TraceBackend, TraceSegment, TraceSpan};

/// One observed span lifecycle action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpanEvent {
    /// A span was started.
    Started {
        /// Span id assigned by the backend.
        id: String,
        /// Operation name from the descriptor.
        operation: String,
    },
    /// A span was ended.
    Ended {
        /// Span id.
        id: String,
    },
    /// An error was recorded on a span.
    Error {
        /// Span id.
        id: String,
        /// Error message.
        message: String,
    },
    /// The reaper abandoned a span.
    Abandoned {
        /// Span id.
        id: String,
        /// Reported minimum idle duration.
        idle_at_least: Duration,
    },
    /// A segment was opened within a span.
    SegmentStarted {
        /// Owning span id.
        id: String,
        /// Segment name.
        name: String,
    },
    /// A segment was closed.
    SegmentEnded {
        /// Owning span id.
        id: String,
        /// Segment name.
        name: String,
    },
}

type EventLog = Arc<Mutex<Vec<SpanEvent>>>;

fn push(events: &EventLog, event: SpanEvent) {
    events
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(event);
}

/// Recording [`TraceBackend`].
pub struct MockBackend {
    events: EventLog,
    next_id: AtomicU64,
    ambient_present: AtomicBool,
}

impl MockBackend {
    /// Create a backend with no ambient span.
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
            ambient_present: AtomicBool::new(false),
        }
    }

    /// Create a backend that reports an ambient span with id `"ambient"`,
    /// simulating an outer layer that already opened a trace.
    #[must_use]
    pub fn with_ambient() -> Self {
        let backend = Self::new();
        backend.ambient_present.store(true, Ordering::Release);
        backend
    }

    /// Toggle the simulated ambient span.
    pub fn set_ambient_present(&self, present: bool) {
        self.ambient_present.store(present, Ordering::Release);
    }

    /// Snapshot of all recorded events, in order.
    #[must_use]
    pub fn events(&self) -> Vec<SpanEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Ids of spans that were ended, in order (duplicates preserved).
    #[must_use]
    pub fn ended_ids(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SpanEvent::Ended { id } => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Number of spans started so far.
    #[must_use]
    pub fn started_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, SpanEvent::Started { .. }))
            .count()
    }

    /// Number of spans closed with an abandoned marker.
    #[must_use]
    pub fn abandoned_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, SpanEvent::Abandoned { .. }))
            .count()
    }

    /// Clear the event log.
    pub fn reset(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceBackend for MockBackend {
    fn start_span(&self, descriptor: &SpanDescriptor) -> Box<dyn TraceSpan> {
        let id = format!("span-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        push(
            &self.events,
            SpanEvent::Started {
                id: id.clone(),
                operation: descriptor.operation.clone(),
            },
        );
        Box::new(MockSpan {
            id,
            events: self.events.clone(),
        })
    }

    fn current_active(&self) -> Option<Box<dyn TraceSpan>> {
        if !self.ambient_present.load(Ordering::Acquire) {
            return None;
        }
        Some(Box::new(MockSpan {
            id: "ambient".to_string(),
            events: self.events.clone(),
        }))
    }

    fn correlation_header_name(&self) -> &'static str {
        "x-mock-correlation"
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

struct MockSpan {
    id: String,
    events: EventLog,
}

impl TraceSpan for MockSpan {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn end(&mut self) {
        push(&self.events, SpanEvent::Ended { id: self.id.clone() });
    }

    fn mark_error(&mut self, message: &str) {
        push(
            &self.events,
            SpanEvent::Error {
                id: self.id.clone(),
                message: message.to_string(),
            },
        );
    }

    fn mark_abandoned(&mut self, idle_at_least: Duration) {
        push(
            &self.events,
            SpanEvent::Abandoned {
                id: self.id.clone(),
                idle_at_least,
            },
        );
    }

    fn correlation_token(&self) -> Option<String> {
        Some(format!("mock-token-{}", self.id))
    }

    fn start_segment(&mut self, name: &str) -> Option<Box<dyn TraceSegment>> {
        push(
            &self.events,
            SpanEvent::SegmentStarted {
                id: self.id.clone(),
                name: name.to_string(),
            },
        );
        Some(Box::new(MockSegment {
            id: self.id.clone(),
            name: name.to_string(),
            events: self.events.clone(),
        }))
    }
}

struct MockSegment {
    id: String,
    name: String,
    events: EventLog,
}

impl TraceSegment for MockSegment {
    fn end(&mut self) {
        push(
            &self.events,
            SpanEvent::SegmentEnded {
                id: self.id.clone(),
                name: self.name.clone(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_lifecycle_in_order() {
        let backend = MockBackend::new();
        let mut span = backend.start_span(&SpanDescriptor::inbound("test.op"));
        span.mark_error("boom");
        span.end();

        let events = backend.events();
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], SpanEvent::Started { operation, .. } if operation == "test.op"));
        assert!(matches!(&events[1], SpanEvent::Error { message, .. } if message == "boom"));
        assert!(matches!(&events[2], SpanEvent::Ended { .. }));
    }

    #[test]
    fn test_ambient_span_toggle() {
        let backend = MockBackend::new();
        assert!(backend.current_active().is_none());

        backend.set_ambient_present(true);
        let ambient = backend.current_active().expect("ambient should exist");
        assert_eq!(ambient.id(), "ambient");
    }

    #[test]
    fn test_segment_events_carry_owner_id() {
        let backend = MockBackend::new();
        let mut span = backend.start_span(&SpanDescriptor::inbound("proto"));
        let owner = span.id();
        let mut segment = span.start_segment("content").expect("segments supported");
        segment.end();

        let events = backend.events();
        assert!(matches!(&events[1], SpanEvent::SegmentStarted { id, name } if *id == owner && name == "content"));
        assert!(matches!(&events[2], SpanEvent::SegmentEnded { id, name } if *id == owner && name == "content"));
    }

    #[test]
    fn test_distinct_ids_per_span() {
        let backend = MockBackend::new();
        let a = backend.start_span(&SpanDescriptor::inbound("a"));
        let b = backend.start_span(&SpanDescriptor::inbound("b"));
        assert_ne!(a.id(), b.id());
    }
}
