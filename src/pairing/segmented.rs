//! Segmented pairing: instrument a low-level protocol handler whose request
//! lifecycle is split into begin/content/end/exception phases.
//!
//! Implements: REQ-COR-003 §5.3 (Segmented Variant)
//!
//! Phases may fire repeatedly per logical request (content arrives in
//! chunks). Only the begin phase creates a top-level span — and only when no
//! trace is already active, because protocol-level interception sits below
//! routed request handling and would otherwise double-count the request.
//! Content and end phases open segments within the span; the exception phase
//! marks the span as error without closing it; the end phase performs the
//! actual closure and entry removal.

use std::sync::Arc;

use tracing::debug;

use crate::backend::{SpanDescriptor, TraceBackend, TraceSegment};
use crate::correlation::{CallKey, CorrelationStore, EntryHandle};
use crate::extract::{HttpRequestBindings, request_descriptor};
use crate::invoke::{DynamicInvoker, InvokeError, ObjectHandle};
use crate::metrics::TraceStitchMetrics;

use super::{CallState, Completion, finalize};

const VARIANT: &str = "segmented";

// ─────────────────────────────────────────────────────────────────────────────
// Phases
// ─────────────────────────────────────────────────────────────────────────────

/// One phase of the protocol handler's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Request head received; the span is created (or the active trace
    /// adopted) here.
    Begin,
    /// A content chunk is being processed; may repeat.
    Content,
    /// Request fully received; closes the span.
    End,
    /// A connection-level exception surfaced; marks, never closes.
    Exception,
}

impl Phase {
    fn as_str(&self) -> &'static str {
        match self {
            Phase::Begin => "begin",
            Phase::Content => "content",
            Phase::End => "end",
            Phase::Exception => "exception",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State carried from a phase's begin-hook to its end-hook.
pub enum PhaseToken {
    /// The begin phase registered this entry.
    Span(EntryHandle),
    /// A segment opened within the request's span.
    Segment(Box<dyn TraceSegment>),
    /// The phase only marked the span (exception path).
    Marked(EntryHandle),
}

// ─────────────────────────────────────────────────────────────────────────────
// Pairing
// ─────────────────────────────────────────────────────────────────────────────

/// Pairing protocol for multi-phase protocol handlers.
pub struct SegmentedPairing {
    store: Arc<CorrelationStore>,
    backend: Arc<dyn TraceBackend>,
    invoker: Arc<dyn DynamicInvoker>,
    bindings: HttpRequestBindings,
    metrics: Option<Arc<TraceStitchMetrics>>,
}

impl SegmentedPairing {
    /// Creates the pairing, resolving all member bindings once.
    pub fn new(
        store: Arc<CorrelationStore>,
        backend: Arc<dyn TraceBackend>,
        invoker: Arc<dyn DynamicInvoker>,
    ) -> Result<Self, InvokeError> {
        let bindings = HttpRequestBindings::resolve(invoker.as_ref())?;
        Ok(Self {
            store,
            backend,
            invoker,
            bindings,
            metrics: None,
        })
    }

    /// Attaches metrics.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<TraceStitchMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Phase begin-hook.
    ///
    /// `key` is the protocol handler object's identity, shared by all phases
    /// of one request. `request` is the request object for descriptor
    /// extraction (begin phase only). `detail` carries the exception text for
    /// [`Phase::Exception`].
    pub fn on_phase_begin(
        &self,
        key: CallKey,
        phase: Phase,
        request: Option<&ObjectHandle>,
        detail: Option<&str>,
    ) -> Option<PhaseToken> {
        match phase {
            Phase::Begin => Some(self.begin_request(key, request)),
            Phase::Content | Phase::End => {
                let Some(entry) = self.store.get(key) else {
                    debug!(%key, %phase, "no live entry for phase, skipping");
                    return None;
                };
                let segment = entry.with_span(|span| span.start_segment(phase.as_str()));
                match segment.flatten() {
                    Some(segment) => Some(PhaseToken::Segment(segment)),
                    None => {
                        debug!(%key, %phase, "backend yielded no segment for phase");
                        Some(PhaseToken::Marked(entry))
                    }
                }
            }
            Phase::Exception => {
                let Some(entry) = self.store.get(key) else {
                    debug!(%key, "exception for unknown request, skipping");
                    return None;
                };
                let message = detail.unwrap_or("connection exception");
                entry.with_span(|span| {
                    span.mark_error(&format!("protocol exception: {message}"));
                });
                debug!(%key, %message, "span marked for protocol exception");
                Some(PhaseToken::Marked(entry))
            }
        }
    }

    /// Phase end-hook.
    ///
    /// `error` is an exception raised inside the phase body itself (as
    /// opposed to the protocol-level [`Phase::Exception`]); it marks the span
    /// before phase handling. Returns the terminal state when this call
    /// closed the request.
    pub fn on_phase_end(
        &self,
        key: CallKey,
        phase: Phase,
        token: PhaseToken,
        error: Option<&str>,
    ) -> Option<CallState> {
        if let Some(message) = error {
            if let Some(entry) = self.store.get(key) {
                entry.with_span(|span| {
                    span.mark_error(&format!("{phase} phase failed: {message}"));
                });
            }
        }

        match (phase, token) {
            (Phase::End, token) => {
                if let PhaseToken::Segment(mut segment) = token {
                    segment.end();
                }
                let state = finalize(&self.store, key, &Completion::Success)?;
                if let Some(ref metrics) = self.metrics {
                    metrics.record_call_completed(VARIANT, state.as_label());
                }
                Some(state)
            }
            (_, PhaseToken::Segment(mut segment)) => {
                segment.end();
                None
            }
            // Begin keeps the span open until the end phase; exception marks
            // only. Nothing to close here.
            (_, PhaseToken::Span(_)) | (_, PhaseToken::Marked(_)) => None,
        }
    }

    fn begin_request(&self, key: CallKey, request: Option<&ObjectHandle>) -> PhaseToken {
        let span = match self.backend.current_active() {
            Some(active) => {
                debug!(
                    %key,
                    span_id = %active.id(),
                    "trace already active, reusing for protocol request"
                );
                active
            }
            None => {
                let descriptor = match request {
                    Some(request) => request_descriptor(
                        self.invoker.as_ref(),
                        &self.bindings,
                        request,
                        "protocol.request",
                        self.backend.correlation_header_name(),
                    ),
                    None => SpanDescriptor::inbound("protocol.request"),
                };
                self.backend.start_span(&descriptor)
            }
        };

        let outcome = self.store.put(key, span);
        if outcome.is_joined() {
            debug!(%key, "protocol request already registered, joining; duplicate span discarded");
        }
        let handle = outcome.into_handle();

        if let Some(ref metrics) = self.metrics {
            metrics.record_call_started(VARIANT);
        }
        debug!(
            %key,
            span_id = ?handle.span_id(),
            state = %CallState::Started,
            "protocol request registered"
        );
        PhaseToken::Span(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockBackend, SpanEvent};
    use crate::invoke::{TableInvoker, TableObject, Value};

    fn request_object() -> std::sync::Arc<TableObject> {
        let request = TableObject::new();
        request.set("scheme", Value::Str("http".to_string()));
        request.set("host", Value::Str("edge.example.com".to_string()));
        request.set("uri", Value::Str("/ingest".to_string()));
        request.set("method", Value::Str("POST".to_string()));
        request
    }

    fn pairing(backend: Arc<MockBackend>) -> (SegmentedPairing, Arc<CorrelationStore>) {
        let store = Arc::new(CorrelationStore::new());
        let pairing = SegmentedPairing::new(
            store.clone(),
            backend,
            Arc::new(TableInvoker::new()),
        )
        .expect("bindings resolve");
        (pairing, store)
    }

    #[test]
    fn test_full_phase_lifecycle() {
        let backend = Arc::new(MockBackend::new());
        let (pairing, store) = pairing(backend.clone());
        let request = request_object();
        let key = CallKey::next();

        // Begin: span created, entry registered.
        let begin = pairing
            .on_phase_begin(key, Phase::Begin, Some(&request.handle()), None)
            .expect("begin registers");
        assert!(matches!(begin, PhaseToken::Span(_)));
        assert_eq!(store.live_count(), 1);
        assert!(pairing.on_phase_end(key, Phase::Begin, begin, None).is_none());

        // Two content chunks: each opens and closes a segment.
        for _ in 0..2 {
            let token = pairing
                .on_phase_begin(key, Phase::Content, None, None)
                .expect("content segment");
            assert!(matches!(token, PhaseToken::Segment(_)));
            assert!(pairing.on_phase_end(key, Phase::Content, token, None).is_none());
        }

        // End: final segment, then span closure and removal.
        let token = pairing
            .on_phase_begin(key, Phase::End, None, None)
            .expect("end segment");
        assert_eq!(
            pairing.on_phase_end(key, Phase::End, token, None),
            Some(CallState::Succeeded)
        );
        assert!(store.is_empty());

        let events = backend.events();
        let segments_started = events
            .iter()
            .filter(|e| matches!(e, SpanEvent::SegmentStarted { .. }))
            .count();
        let segments_ended = events
            .iter()
            .filter(|e| matches!(e, SpanEvent::SegmentEnded { .. }))
            .count();
        assert_eq!(segments_started, 3);
        assert_eq!(segments_ended, 3);
        assert_eq!(backend.ended_ids().len(), 1);
    }

    #[test]
    fn test_exception_marks_without_closing() {
        let backend = Arc::new(MockBackend::new());
        let (pairing, store) = pairing(backend.clone());
        let request = request_object();
        let key = CallKey::next();

        let begin = pairing
            .on_phase_begin(key, Phase::Begin, Some(&request.handle()), None)
            .expect("begin registers");
        pairing.on_phase_end(key, Phase::Begin, begin, None);

        let token = pairing
            .on_phase_begin(key, Phase::Exception, None, Some("connection reset"))
            .expect("exception marks");
        assert!(matches!(token, PhaseToken::Marked(_)));
        pairing.on_phase_end(key, Phase::Exception, token, None);

        // Marked but still open and live.
        assert_eq!(store.live_count(), 1);
        assert!(backend.ended_ids().is_empty());
        assert!(backend.events().iter().any(|event| matches!(
            event,
            SpanEvent::Error { message, .. } if message.contains("connection reset")
        )));

        // End still closes normally afterwards.
        let token = pairing
            .on_phase_begin(key, Phase::End, None, None)
            .expect("end segment");
        assert_eq!(
            pairing.on_phase_end(key, Phase::End, token, None),
            Some(CallState::Succeeded)
        );
        assert_eq!(backend.ended_ids().len(), 1);
    }

    #[test]
    fn test_begin_reuses_active_trace() {
        let backend = Arc::new(MockBackend::with_ambient());
        let (pairing, store) = pairing(backend.clone());
        let key = CallKey::next();

        let begin = pairing
            .on_phase_begin(key, Phase::Begin, None, None)
            .expect("begin registers");
        assert!(matches!(begin, PhaseToken::Span(_)));
        assert_eq!(backend.started_count(), 0);
        assert_eq!(store.live_count(), 1);

        let token = pairing
            .on_phase_begin(key, Phase::End, None, None)
            .expect("end segment");
        assert_eq!(
            pairing.on_phase_end(key, Phase::End, token, None),
            Some(CallState::Succeeded)
        );
        assert_eq!(backend.ended_ids(), vec!["ambient".to_string()]);
    }

    #[test]
    fn test_phase_on_unknown_key_is_noop() {
        let backend = Arc::new(MockBackend::new());
        let (pairing, _) = pairing(backend.clone());
        let key = CallKey::next();

        assert!(pairing.on_phase_begin(key, Phase::Content, None, None).is_none());
        assert!(pairing
            .on_phase_begin(key, Phase::Exception, None, Some("late"))
            .is_none());
    }

    #[test]
    fn test_error_inside_phase_marks_span() {
        let backend = Arc::new(MockBackend::new());
        let (pairing, _) = pairing(backend.clone());
        let request = request_object();
        let key = CallKey::next();

        let begin = pairing
            .on_phase_begin(key, Phase::Begin, Some(&request.handle()), None)
            .expect("begin registers");
        pairing.on_phase_end(key, Phase::Begin, begin, Some("parser choked"));

        assert!(backend.events().iter().any(|event| matches!(
            event,
            SpanEvent::Error { message, .. }
                if message.contains("begin phase failed") && message.contains("parser choked")
        )));
    }
}
