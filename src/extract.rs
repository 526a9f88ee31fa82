//! Building span descriptors from framework request objects.
//!
//! Adapters resolve a binding set once at construction and hand it back here
//! per call. Every read goes through the dynamic-invocation facade and
//! degrades to a logged default; a request object the facade cannot read
//! still yields a usable descriptor.
//!
//! # Traceability
//! - Implements: REQ-COR-003 §3 (Context Extraction)
//! - Implements: REQ-COR-003 §4 (Correlation Header Injection)

use tracing::{debug, warn};

use crate::backend::SpanDescriptor;
use crate::invoke::{
    Binding, DynamicInvoker, InvokeError, ObjectHandle, Value, map_or_empty, multimap_or_empty,
    object_of, opt_string, string_or,
};

// ─────────────────────────────────────────────────────────────────────────────
// Defaults
// ─────────────────────────────────────────────────────────────────────────────

/// Scheme used when the request object will not yield one.
pub const DEFAULT_SCHEME: &str = "https";

/// Host used when the request object will not yield one.
pub const DEFAULT_HOST: &str = "UNKNOWN-HOST";

/// URI used when the request object will not yield one.
pub const DEFAULT_URI: &str = "/unknown-uri";

/// Method used when the request object will not yield one.
pub const DEFAULT_METHOD: &str = "POST";

// ─────────────────────────────────────────────────────────────────────────────
// Inbound request bindings
// ─────────────────────────────────────────────────────────────────────────────

/// Pre-resolved member bindings over an HTTP request object.
///
/// Resolved once when the owning adapter is constructed; immutable and safely
/// shared afterwards.
#[derive(Debug, Clone)]
pub struct HttpRequestBindings {
    scheme: Binding,
    host: Binding,
    uri: Binding,
    method: Binding,
    headers: Binding,
    params: Binding,
    header: Binding,
    remote_address: Binding,
}

impl HttpRequestBindings {
    /// Resolves the standard member set against the given invoker.
    pub fn resolve(invoker: &dyn DynamicInvoker) -> Result<Self, InvokeError> {
        Ok(Self {
            scheme: invoker.resolve("scheme", &[])?,
            host: invoker.resolve("host", &[])?,
            uri: invoker.resolve("uri", &[])?,
            method: invoker.resolve("method", &[])?,
            headers: invoker.resolve("headers", &[])?,
            params: invoker.resolve("params", &[])?,
            header: invoker.resolve("header", &["string"])?,
            remote_address: invoker.resolve("remote_address", &[])?,
        })
    }

    /// Reads a single named header, `None` when absent or unreadable.
    pub fn read_header(
        &self,
        invoker: &dyn DynamicInvoker,
        request: &ObjectHandle,
        name: &str,
    ) -> Option<String> {
        opt_string(
            invoker,
            &self.header,
            request,
            &[Value::Str(name.to_string())],
        )
    }
}

/// Builds an inbound span descriptor from a framework request object.
///
/// Unreadable members fall back to the module defaults; the correlation token
/// is read from `correlation_header` when present so the span can join the
/// upstream trace.
pub fn request_descriptor(
    invoker: &dyn DynamicInvoker,
    bindings: &HttpRequestBindings,
    request: &ObjectHandle,
    operation: &str,
    correlation_header: &str,
) -> SpanDescriptor {
    let scheme = string_or(invoker, &bindings.scheme, request, &[], DEFAULT_SCHEME);
    let host = string_or(invoker, &bindings.host, request, &[], DEFAULT_HOST);
    let uri = string_or(invoker, &bindings.uri, request, &[], DEFAULT_URI);
    let method = string_or(invoker, &bindings.method, request, &[], DEFAULT_METHOD);

    let url = format!("{scheme}://{host}{uri}");
    debug!(%url, %method, "built request descriptor");

    let mut descriptor = SpanDescriptor::inbound(operation)
        .with_url(&url)
        .with_method(&method)
        .with_host(&host)
        .with_headers(map_or_empty(invoker, &bindings.headers, request))
        .with_parameters(multimap_or_empty(invoker, &bindings.params, request))
        .with_correlation_token(bindings.read_header(invoker, request, correlation_header));

    if let Some(remote) = opt_string(invoker, &bindings.remote_address, request, &[]) {
        descriptor = descriptor.with_remote_host(&remote);
    }
    descriptor
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound target bindings
// ─────────────────────────────────────────────────────────────────────────────

/// Pre-resolved bindings over an outbound call object and its error type.
#[derive(Debug, Clone)]
pub struct OutboundTargetBindings {
    /// The request carried by the call object.
    pub request: Binding,
    /// Full URL on the request object.
    pub url: Binding,
    /// Status code on the failure object.
    pub status_code: Binding,
    /// Message on the failure object.
    pub message: Binding,
}

impl OutboundTargetBindings {
    /// Resolves the standard member set against the given invoker.
    pub fn resolve(invoker: &dyn DynamicInvoker) -> Result<Self, InvokeError> {
        Ok(Self {
            request: invoker.resolve("request", &[])?,
            url: invoker.resolve("url", &[])?,
            status_code: invoker.resolve("status_code", &[])?,
            message: invoker.resolve("message", &[])?,
        })
    }
}

/// Splits a URL into host and port for the outbound span descriptor.
///
/// Falls back to [`DEFAULT_HOST`] when the URL will not parse; outbound
/// instrumentation still proceeds, just with a degraded target label.
pub fn parse_target(url: &str) -> (String, Option<u16>) {
    match url.parse::<http::Uri>() {
        Ok(uri) => match uri.host() {
            Some(host) => (host.to_string(), uri.port_u16()),
            None => {
                warn!(%url, "target URL has no host, using default");
                (DEFAULT_HOST.to_string(), None)
            }
        },
        Err(error) => {
            warn!(%url, %error, "unparseable target URL, using default host");
            (DEFAULT_HOST.to_string(), None)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Correlation header injection
// ─────────────────────────────────────────────────────────────────────────────

/// Pre-resolved bindings for rebuilding an immutable request with one extra
/// header.
#[derive(Debug, Clone)]
pub struct RequestRebuildBindings {
    new_builder: Binding,
    add_header: Binding,
    build: Binding,
}

impl RequestRebuildBindings {
    /// Resolves the builder-chain members against the given invoker.
    pub fn resolve(invoker: &dyn DynamicInvoker) -> Result<Self, InvokeError> {
        Ok(Self {
            new_builder: invoker.resolve("new_builder", &[])?,
            add_header: invoker.resolve("add_header", &["string", "string"])?,
            build: invoker.resolve("build", &[])?,
        })
    }
}

/// Injects the correlation token into an outgoing request.
///
/// The request representation is effectively immutable, so injection means
/// constructing a replacement through its builder: `new_builder` →
/// `add_header(name, token)` → `build`. A missing request, missing token or
/// any facade failure along the chain skips injection silently — the call
/// proceeds uncorrelated rather than failing.
pub fn inject_correlation_header(
    invoker: &dyn DynamicInvoker,
    bindings: &RequestRebuildBindings,
    request: Option<&ObjectHandle>,
    header_name: &str,
    token: Option<&str>,
) {
    let (Some(request), Some(token)) = (request, token) else {
        debug!("no request or no correlation token, skipping header injection");
        return;
    };

    let Some(builder) = object_of(invoker, &bindings.new_builder, request, &[]) else {
        debug!("request builder unavailable, skipping header injection");
        return;
    };

    let args = [
        Value::Str(header_name.to_string()),
        Value::Str(token.to_string()),
    ];
    let Some(builder) = object_of(invoker, &bindings.add_header, &builder, &args) else {
        debug!(header = header_name, "add_header failed, skipping header injection");
        return;
    };

    match invoker.invoke(&bindings.build, &builder, &[]) {
        Ok(Value::Object(_rebuilt)) => {
            debug!(header = header_name, "correlation header injected");
        }
        Ok(other) => {
            debug!(
                header = header_name,
                got = other.type_name(),
                "rebuilt request has unexpected type, header may be lost"
            );
        }
        Err(error) => {
            debug!(header = header_name, %error, "request rebuild failed, header not injected");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
