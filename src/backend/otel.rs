//! OpenTelemetry backend using the global tracer provider.
//!
//! Spans are created through `opentelemetry::global::tracer`, so the host
//! application controls the provider, exporter and sampling. The correlation
//! token is the W3C `traceparent` value of the span, which lets a downstream
//! service instrumented by any W3C-aware tracer join the trace.
//!
//! # Traceability
//! - Implements: REQ-OBS-001 §4.2 (OpenTelemetry Binding)

use std::time::Duration;

use opentelemetry::global::{self, BoxedSpan};
use opentelemetry::trace::{
    Span, SpanContext, SpanId, SpanKind as OtelSpanKind, Status, TraceContextExt, TraceFlags,
    TraceId, TraceState, Tracer,
};
use opentelemetry::{Context, KeyValue};
use tracing::warn;

use super::{SpanDescriptor, SpanKind, TraceBackend, TraceSegment, TraceSpan};

// ─────────────────────────────────────────────────────────────────────────────
// Span Attribute Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Full request URL.
pub const URL_FULL: &str = "url.full";

/// HTTP request method.
pub const HTTP_REQUEST_METHOD: &str = "http.request.method";

/// Server host name.
pub const SERVER_ADDRESS: &str = "server.address";

/// Server port.
pub const SERVER_PORT: &str = "server.port";

/// Originating peer address of an inbound request.
pub const CLIENT_ADDRESS: &str = "client.address";

/// Set when the reaper force-closed the span without a completion event.
pub const STITCH_ABANDONED: &str = "tracestitch.abandoned";

/// Minimum idle time, in seconds, before the span was abandoned.
pub const STITCH_IDLE_SECONDS: &str = "tracestitch.idle_seconds";

// ─────────────────────────────────────────────────────────────────────────────
// Backend
// ─────────────────────────────────────────────────────────────────────────────

/// OpenTelemetry-backed [`TraceBackend`].
///
/// Implements: REQ-OBS-001 §4.2
pub struct OtelBackend {
    tracer_name: &'static str,
}

impl OtelBackend {
    /// Create a backend obtaining tracers from the global provider under the
    /// default instrumentation scope name.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tracer_name: "tracestitch",
        }
    }

    /// Create a backend with an explicit instrumentation scope name.
    #[must_use]
    pub fn with_tracer_name(tracer_name: &'static str) -> Self {
        Self { tracer_name }
    }
}

impl Default for OtelBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceBackend for OtelBackend {
    fn start_span(&self, descriptor: &SpanDescriptor) -> Box<dyn TraceSpan> {
        let tracer = global::tracer(self.tracer_name);

        let kind = match descriptor.kind {
            SpanKind::InboundRequest => OtelSpanKind::Server,
            SpanKind::OutboundCall => OtelSpanKind::Client,
            SpanKind::Internal => OtelSpanKind::Internal,
        };

        let mut attributes = Vec::new();
        if let Some(ref url) = descriptor.url {
            attributes.push(KeyValue::new(URL_FULL, url.clone()));
        }
        if let Some(ref method) = descriptor.method {
            attributes.push(KeyValue::new(HTTP_REQUEST_METHOD, method.clone()));
        }
        if let Some(ref host) = descriptor.host {
            attributes.push(KeyValue::new(SERVER_ADDRESS, host.clone()));
        }
        if let Some(port) = descriptor.port {
            attributes.push(KeyValue::new(SERVER_PORT, i64::from(port)));
        }
        if let Some(ref remote) = descriptor.remote_host {
            attributes.push(KeyValue::new(CLIENT_ADDRESS, remote.clone()));
        }

        let builder = tracer
            .span_builder(descriptor.operation.clone())
            .with_kind(kind)
            .with_attributes(attributes);

        // An inbound correlation token names the remote parent; without one
        // the span parents to whatever context is current on this thread.
        let span = match descriptor
            .correlation_token
            .as_deref()
            .and_then(parse_traceparent)
        {
            Some(remote) => {
                let parent = Context::new().with_remote_span_context(remote);
                builder.start_with_context(&tracer, &parent)
            }
            None => {
                if descriptor.correlation_token.is_some() {
                    warn!(
                        operation = %descriptor.operation,
                        "inbound correlation token unparseable, starting unlinked trace"
                    );
                }
                builder.start(&tracer)
            }
        };

        Box::new(OtelSpan {
            tracer_name: self.tracer_name,
            span,
        })
    }

    fn current_active(&self) -> Option<Box<dyn TraceSpan>> {
        let cx = Context::current();
        if !cx.span().span_context().is_valid() {
            return None;
        }
        Some(Box::new(AmbientOtelSpan {
            tracer_name: self.tracer_name,
            cx,
        }))
    }

    fn correlation_header_name(&self) -> &'static str {
        "traceparent"
    }

    fn name(&self) -> &'static str {
        "opentelemetry"
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Span Handles
// ─────────────────────────────────────────────────────────────────────────────

/// A span started by [`OtelBackend::start_span`].
struct OtelSpan {
    tracer_name: &'static str,
    span: BoxedSpan,
}

impl TraceSpan for OtelSpan {
    fn id(&self) -> String {
        self.span.span_context().span_id().to_string()
    }

    fn end(&mut self) {
        self.span.end();
    }

    fn mark_error(&mut self, message: &str) {
        self.span.set_status(Status::error(message.to_string()));
    }

    fn mark_abandoned(&mut self, idle_at_least: Duration) {
        self.span.set_attribute(KeyValue::new(STITCH_ABANDONED, true));
        self.span.set_attribute(KeyValue::new(
            STITCH_IDLE_SECONDS,
            idle_at_least.as_secs() as i64,
        ));
        self.span
            .set_status(Status::error("abandoned before completion"));
    }

    fn correlation_token(&self) -> Option<String> {
        Some(format_traceparent(self.span.span_context()))
    }

    fn start_segment(&mut self, name: &str) -> Option<Box<dyn TraceSegment>> {
        let tracer = global::tracer(self.tracer_name);
        let parent = Context::new().with_remote_span_context(self.span.span_context().clone());
        let segment = tracer
            .span_builder(name.to_string())
            .with_kind(OtelSpanKind::Internal)
            .start_with_context(&tracer, &parent);
        Some(Box::new(OtelSegment { span: segment }))
    }
}

/// Handle to the ambient span on the current context.
///
/// Ending through this handle ends the real span; dropping it leaves the
/// span untouched.
struct AmbientOtelSpan {
    tracer_name: &'static str,
    cx: Context,
}

impl TraceSpan for AmbientOtelSpan {
    fn id(&self) -> String {
        self.cx.span().span_context().span_id().to_string()
    }

    fn end(&mut self) {
        self.cx.span().end();
    }

    fn mark_error(&mut self, message: &str) {
        self.cx.span().set_status(Status::error(message.to_string()));
    }

    fn correlation_token(&self) -> Option<String> {
        Some(format_traceparent(self.cx.span().span_context()))
    }

    fn start_segment(&mut self, name: &str) -> Option<Box<dyn TraceSegment>> {
        let tracer = global::tracer(self.tracer_name);
        let segment = tracer
            .span_builder(name.to_string())
            .with_kind(OtelSpanKind::Internal)
            .start_with_context(&tracer, &self.cx);
        Some(Box::new(OtelSegment { span: segment }))
    }
}

/// A segment is a child span in OpenTelemetry terms.
struct OtelSegment {
    span: BoxedSpan,
}

impl TraceSegment for OtelSegment {
    fn end(&mut self) {
        self.span.end();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// W3C traceparent
// ─────────────────────────────────────────────────────────────────────────────

/// Render a span context as a W3C traceparent value:
/// `{version}-{trace_id}-{span_id}-{trace_flags}`.
fn format_traceparent(ctx: &SpanContext) -> String {
    format!(
        "00-{}-{}-{:02x}",
        ctx.trace_id(),
        ctx.span_id(),
        ctx.trace_flags().to_u8()
    )
}

/// Parse a W3C traceparent value back into a remote span context.
///
/// Returns `None` for anything malformed: wrong field count, unknown
/// version, bad lengths, or all-zero ids.
fn parse_traceparent(traceparent: &str) -> Option<SpanContext> {
    let mut parts = traceparent.split('-');
    let version = parts.next()?;
    let trace_id_hex = parts.next()?;
    let span_id_hex = parts.next()?;
    let flags_hex = parts.next()?;
    if parts.next().is_some() || version != "00" {
        return None;
    }

    let trace_id = TraceId::from_hex(trace_id_hex).ok()?;
    let span_id = SpanId::from_hex(span_id_hex).ok()?;
    if trace_id == TraceId::INVALID || span_id == SpanId::INVALID {
        return None;
    }

    if flags_hex.len() != 2 {
        return None;
    }
    let flags = u8::from_str_radix(flags_hex, 16).ok()?;

    Some(SpanContext::new(
        trace_id,
        span_id,
        TraceFlags::new(flags),
        true,
        TraceState::default(),
    ))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider};
    use serial_test::serial;

    fn setup_test_provider() -> (SdkTracerProvider, InMemorySpanExporter) {
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        global::set_tracer_provider(provider.clone());
        (provider, exporter)
    }

    #[test]
    #[serial]
    fn test_start_and_end_span() {
        let (provider, exporter) = setup_test_provider();

        let backend = OtelBackend::new();
        let descriptor = SpanDescriptor::inbound("orders.handler")
            .with_url("https://api.example.com/orders")
            .with_method("GET");

        let mut span = backend.start_span(&descriptor);
        assert!(!span.id().is_empty());
        span.end();
        drop(span);

        provider.force_flush().expect("flush should succeed");
        let finished = exporter.get_finished_spans().expect("should get spans");
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].name.as_ref(), "orders.handler");
    }

    #[test]
    #[serial]
    fn test_correlation_token_roundtrip() {
        let (_provider, _exporter) = setup_test_provider();

        let backend = OtelBackend::new();
        let mut upstream = backend.start_span(&SpanDescriptor::outbound(
            "http.outbound",
            "payments.internal",
            Some(443),
        ));

        let token = upstream.correlation_token().expect("token should exist");
        let remote = parse_traceparent(&token).expect("token should parse");
        assert!(remote.is_valid());

        // A downstream span started with the token joins the same trace.
        let descriptor =
            SpanDescriptor::inbound("payments.handler").with_correlation_token(Some(token));
        let mut downstream = backend.start_span(&descriptor);
        downstream.end();
        upstream.end();
    }

    #[test]
    fn test_parse_traceparent_rejects_malformed() {
        assert!(parse_traceparent("garbage").is_none());
        assert!(
            parse_traceparent("01-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01").is_none()
        );
        assert!(
            parse_traceparent("00-00000000000000000000000000000000-00f067aa0ba902b7-01").is_none()
        );
        assert!(
            parse_traceparent("00-4bf92f3577b34da6a3ce929d0e0e4736-0000000000000000-01").is_none()
        );
        assert!(
            parse_traceparent("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7").is_none()
        );
    }

    #[test]
    fn test_parse_traceparent_valid() {
        let ctx = parse_traceparent("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01")
            .expect("should parse");
        assert_eq!(
            ctx.trace_id(),
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").expect("valid hex")
        );
        assert_eq!(ctx.trace_flags(), TraceFlags::SAMPLED);
    }

    #[test]
    #[serial]
    fn test_no_ambient_span_without_context() {
        let (_provider, _exporter) = setup_test_provider();
        let backend = OtelBackend::new();
        assert!(backend.current_active().is_none());
    }

    #[test]
    #[serial]
    fn test_segment_is_child_span() {
        let (provider, exporter) = setup_test_provider();

        let backend = OtelBackend::new();
        let mut span = backend.start_span(&SpanDescriptor::inbound("proto.request"));
        let mut segment = span.start_segment("content").expect("segment supported");
        segment.end();
        span.end();
        drop(segment);
        drop(span);

        provider.force_flush().expect("flush should succeed");
        let finished = exporter.get_finished_spans().expect("should get spans");
        assert_eq!(finished.len(), 2);
        let content = finished
            .iter()
            .find(|s| s.name.as_ref() == "content")
            .expect("segment span exported");
        let parent = finished
            .iter()
            .find(|s| s.name.as_ref() == "proto.request")
            .expect("request span exported");
        assert_eq!(
            content.span_context.trace_id(),
            parent.span_context.trace_id()
        );
    }
}
