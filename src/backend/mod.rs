//! Tracing-backend boundary: the opaque span handles the correlation engine
//! drives.
//!
//! The engine never assumes a particular backend wire format. Everything it
//! needs from a monitoring backend is expressed by three small traits:
//! [`TraceBackend`] (start spans, expose the ambient span, designate the
//! correlation header), [`TraceSpan`] (end, mark error, report an id and a
//! correlation token, open segments) and [`TraceSegment`] (close a
//! sub-interval).
//!
//! # Submodules
//!
//! - [`otel`] - OpenTelemetry implementation using the global tracer provider
//! - [`mock`] - recording backend for tests and adapter development
//!
//! # Traceability
//! - Implements: REQ-OBS-001 §4 (Backend Contract)

pub mod mock;
pub mod otel;

pub use mock::{MockBackend, SpanEvent};
pub use otel::OtelBackend;

use std::collections::HashMap;
use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// Span Descriptor
// ─────────────────────────────────────────────────────────────────────────────

/// Direction of the instrumented operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    /// A request received by the instrumented process.
    InboundRequest,
    /// A call the instrumented process makes to a remote service.
    OutboundCall,
    /// A sub-operation with no remote peer.
    Internal,
}

impl SpanKind {
    /// Returns the string representation for logging and span attributes.
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanKind::InboundRequest => "inbound",
            SpanKind::OutboundCall => "outbound",
            SpanKind::Internal => "internal",
        }
    }
}

/// Everything the engine knows about an operation when it asks the backend
/// for a span.
///
/// Built either directly by an adapter or by the `extract` module from a
/// framework request object. All fields besides `operation` and `kind` are
/// best-effort: extraction failures degrade to absent values, never abort
/// instrumentation.
///
/// Implements: REQ-OBS-001 §4.1
#[derive(Debug, Clone)]
pub struct SpanDescriptor {
    /// Logical operation name (e.g. a handler type name or `http.outbound`).
    pub operation: String,
    /// Direction of the operation.
    pub kind: SpanKind,
    /// Full request URL, if known.
    pub url: Option<String>,
    /// HTTP method, if known.
    pub method: Option<String>,
    /// Server host serving (inbound) or being called (outbound).
    pub host: Option<String>,
    /// Remote port for outbound calls.
    pub port: Option<u16>,
    /// Originating peer address for inbound requests.
    pub remote_host: Option<String>,
    /// Request headers (first value per name).
    pub headers: HashMap<String, String>,
    /// Request parameters (all values per name).
    pub parameters: HashMap<String, Vec<String>>,
    /// Correlation token extracted from the designated inbound header,
    /// linking this span to an upstream trace.
    pub correlation_token: Option<String>,
}

impl SpanDescriptor {
    fn empty(operation: &str, kind: SpanKind) -> Self {
        Self {
            operation: operation.to_string(),
            kind,
            url: None,
            method: None,
            host: None,
            port: None,
            remote_host: None,
            headers: HashMap::new(),
            parameters: HashMap::new(),
            correlation_token: None,
        }
    }

    /// Descriptor for an inbound request span.
    pub fn inbound(operation: &str) -> Self {
        Self::empty(operation, SpanKind::InboundRequest)
    }

    /// Descriptor for an outbound call span.
    pub fn outbound(operation: &str, host: &str, port: Option<u16>) -> Self {
        let mut descriptor = Self::empty(operation, SpanKind::OutboundCall);
        descriptor.host = Some(host.to_string());
        descriptor.port = port;
        descriptor
    }

    /// Descriptor for an internal span.
    pub fn internal(operation: &str) -> Self {
        Self::empty(operation, SpanKind::Internal)
    }

    /// Sets the full request URL.
    #[must_use]
    pub fn with_url(mut self, url: &str) -> Self {
        self.url = Some(url.to_string());
        self
    }

    /// Sets the HTTP method.
    #[must_use]
    pub fn with_method(mut self, method: &str) -> Self {
        self.method = Some(method.to_string());
        self
    }

    /// Sets the server host.
    #[must_use]
    pub fn with_host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    /// Sets the originating peer address.
    #[must_use]
    pub fn with_remote_host(mut self, remote_host: &str) -> Self {
        self.remote_host = Some(remote_host.to_string());
        self
    }

    /// Sets the request headers.
    #[must_use]
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Sets the request parameters.
    #[must_use]
    pub fn with_parameters(mut self, parameters: HashMap<String, Vec<String>>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Sets the inbound correlation token.
    #[must_use]
    pub fn with_correlation_token(mut self, token: Option<String>) -> Self {
        self.correlation_token = token;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Traits
// ─────────────────────────────────────────────────────────────────────────────

/// An open span owned by the correlation engine until finalized.
///
/// Handles are `Send` because begin and completion hooks run on different
/// threads; the store serializes all access. Every mutation after the owning
/// entry is finalized is a backend-visible bug, which is why the store hands
/// the span out exactly once.
pub trait TraceSpan: Send {
    /// Backend identifier for this span, used in logs.
    fn id(&self) -> String;

    /// Closes the span normally.
    fn end(&mut self);

    /// Records an error on the span without closing it.
    fn mark_error(&mut self, message: &str);

    /// Records that the reaper gave up waiting for completion.
    ///
    /// Distinct from [`mark_error`](Self::mark_error) so downstream consumers
    /// can tell "the operation failed" from "we stopped waiting". The default
    /// degrades to an error mark for backends with no richer signal.
    fn mark_abandoned(&mut self, idle_at_least: Duration) {
        self.mark_error(&format!(
            "abandoned after {}s without completion",
            idle_at_least.as_secs()
        ));
    }

    /// Token to inject into an outgoing request so the downstream service can
    /// join this trace. `None` when the backend has no propagation format.
    fn correlation_token(&self) -> Option<String> {
        None
    }

    /// Opens a sub-interval within this span. `None` when the backend does
    /// not support segments.
    fn start_segment(&mut self, name: &str) -> Option<Box<dyn TraceSegment>> {
        let _ = name;
        None
    }
}

/// A sub-interval within a span, used by protocol handlers whose lifecycle
/// has multiple phases (content chunks, trailers) inside one request.
pub trait TraceSegment: Send {
    /// Closes the segment.
    fn end(&mut self);
}

/// The monitoring backend supplying spans.
///
/// Implements: REQ-OBS-001 §4
pub trait TraceBackend: Send + Sync {
    /// Starts a new span for the described operation. When the descriptor
    /// carries a correlation token the span joins the upstream trace;
    /// otherwise it parents to the ambient span, if any.
    fn start_span(&self, descriptor: &SpanDescriptor) -> Box<dyn TraceSpan>;

    /// Handle to the currently-active ambient span, if one exists on this
    /// execution context. Dropping the handle without calling
    /// [`TraceSpan::end`] leaves the underlying span untouched.
    fn current_active(&self) -> Option<Box<dyn TraceSpan>>;

    /// Name of the header carrying the correlation token on the wire.
    fn correlation_header_name(&self) -> &'static str;

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}
