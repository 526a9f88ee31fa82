//! Outbound-call pairing: instrument a client call whose completion fires on
//! a separate callback object.
//!
//! Implements: REQ-COR-003 §5.1 (Outbound Variant)
//!
//! The begin-hook fires on the dispatch method. Instrumentation requires an
//! active parent trace; a dispatch with no ambient span is simply not
//! instrumented, which is a normal outcome, not an error. Otherwise a client
//! span is started, stashed under the completion callback's identity, and the
//! correlation token is injected into the outgoing request by rebuilding it
//! through its builder.
//!
//! Completion fires on one of two mutually-exclusive callbacks keyed by the
//! same identity. The failure hook marks the span as error and then runs the
//! same finalize transition the success hook runs; the store's exactly-once
//! guarantee makes a callback that somehow fires both harmless.

use std::sync::Arc;

use tracing::{debug, info};

use crate::backend::{SpanDescriptor, TraceBackend};
use crate::correlation::{CallKey, CorrelationStore, EntryHandle};
use crate::extract::{
    self, OutboundTargetBindings, RequestRebuildBindings, inject_correlation_header,
};
use crate::invoke::{DynamicInvoker, InvokeError, ObjectHandle, int_or, object_of, string_or};
use crate::metrics::TraceStitchMetrics;

use super::{CallState, Completion, finalize};

const VARIANT: &str = "outbound";

/// Pairing protocol for outbound client calls.
pub struct OutboundCallPairing {
    store: Arc<CorrelationStore>,
    backend: Arc<dyn TraceBackend>,
    invoker: Arc<dyn DynamicInvoker>,
    target: OutboundTargetBindings,
    rebuild: RequestRebuildBindings,
    metrics: Option<Arc<TraceStitchMetrics>>,
}

impl OutboundCallPairing {
    /// Creates the pairing, resolving all member bindings once.
    pub fn new(
        store: Arc<CorrelationStore>,
        backend: Arc<dyn TraceBackend>,
        invoker: Arc<dyn DynamicInvoker>,
    ) -> Result<Self, InvokeError> {
        let target = OutboundTargetBindings::resolve(invoker.as_ref())?;
        let rebuild = RequestRebuildBindings::resolve(invoker.as_ref())?;
        Ok(Self {
            store,
            backend,
            invoker,
            target,
            rebuild,
            metrics: None,
        })
    }

    /// Attaches metrics.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<TraceStitchMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Begin-hook: fires on the call-dispatch method.
    ///
    /// `callback_key` is the identity of the object the completion callback
    /// will later fire on; `call` is the dispatched call object carrying the
    /// outgoing request. Returns `None` when the call is not instrumented
    /// (no active parent trace).
    pub fn on_dispatch(&self, callback_key: CallKey, call: &ObjectHandle) -> Option<EntryHandle> {
        if self.backend.current_active().is_none() {
            info!(%callback_key, "no active trace for outbound call, skipping instrumentation");
            return None;
        }

        let request = object_of(self.invoker.as_ref(), &self.target.request, call, &[]);
        let url = request
            .as_ref()
            .map(|r| string_or(self.invoker.as_ref(), &self.target.url, r, &[], ""))
            .filter(|u| !u.is_empty());
        let (host, port) = url
            .as_deref()
            .map(extract::parse_target)
            .unwrap_or_else(|| (extract::DEFAULT_HOST.to_string(), None));

        let mut descriptor = SpanDescriptor::outbound("http.outbound", &host, port);
        if let Some(ref url) = url {
            descriptor = descriptor.with_url(url);
        }

        let span = self.backend.start_span(&descriptor);
        let token = span.correlation_token();

        let outcome = self.store.put(callback_key, span);
        if outcome.is_joined() {
            debug!(%callback_key, "in-flight entry already present, joining; duplicate span discarded");
        }
        let handle = outcome.into_handle();

        inject_correlation_header(
            self.invoker.as_ref(),
            &self.rebuild,
            request.as_ref(),
            self.backend.correlation_header_name(),
            token.as_deref(),
        );

        if let Some(ref metrics) = self.metrics {
            metrics.record_call_started(VARIANT);
        }
        debug!(
            %callback_key,
            span_id = ?handle.span_id(),
            %host,
            state = %CallState::Started,
            "outbound call stashed for completion"
        );
        Some(handle)
    }

    /// Success hook: the completion callback's success method fired.
    pub fn on_success(&self, callback_key: CallKey) -> Option<CallState> {
        self.complete(callback_key, Completion::Success)
    }

    /// Failure hook: the completion callback's failure method fired with a
    /// failure object. Status code and message are read through the facade
    /// with defaults, never aborting completion handling.
    pub fn on_failure(&self, callback_key: CallKey, failure: &ObjectHandle) -> Option<CallState> {
        let status = int_or(
            self.invoker.as_ref(),
            &self.target.status_code,
            failure,
            &[],
            -1,
        );
        let message = string_or(
            self.invoker.as_ref(),
            &self.target.message,
            failure,
            &[],
            "unknown error",
        );
        self.complete(
            callback_key,
            Completion::Failure {
                status: Some(status),
                message,
            },
        )
    }

    fn complete(&self, callback_key: CallKey, completion: Completion) -> Option<CallState> {
        let state = finalize(&self.store, callback_key, &completion)?;
        if let Some(ref metrics) = self.metrics {
            metrics.record_call_completed(VARIANT, state.as_label());
        }
        Some(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockBackend, SpanEvent};
    use crate::invoke::{TableInvoker, TableObject, Value};

    fn call_with_request() -> (std::sync::Arc<TableObject>, std::sync::Arc<TableObject>) {
        let rebuilt = TableObject::new();
        let builder = TableObject::new();
        builder.set("add_header", Value::Object(builder.handle()));
        builder.set("build", Value::Object(rebuilt.handle()));

        let request = TableObject::new();
        request.set(
            "url",
            Value::Str("https://payments.internal:8443/v1/charge".to_string()),
        );
        request.set("new_builder", Value::Object(builder.handle()));

        let call = TableObject::new();
        call.set("request", Value::Object(request.handle()));
        (call, builder)
    }

    fn pairing(backend: Arc<MockBackend>) -> (OutboundCallPairing, Arc<CorrelationStore>) {
        let store = Arc::new(CorrelationStore::new());
        let pairing = OutboundCallPairing::new(
            store.clone(),
            backend,
            Arc::new(TableInvoker::new()),
        )
        .expect("bindings resolve");
        (pairing, store)
    }

    #[test]
    fn test_dispatch_without_parent_trace_skips() {
        let backend = Arc::new(MockBackend::new());
        let (pairing, store) = pairing(backend.clone());
        let (call, _) = call_with_request();

        assert!(pairing.on_dispatch(CallKey::next(), &call.handle()).is_none());
        assert!(store.is_empty());
        assert_eq!(backend.started_count(), 0);
    }

    #[test]
    fn test_dispatch_starts_span_and_injects_header() {
        let backend = Arc::new(MockBackend::with_ambient());
        let (pairing, store) = pairing(backend.clone());
        let (call, builder) = call_with_request();

        let key = CallKey::next();
        let handle = pairing
            .on_dispatch(key, &call.handle())
            .expect("instrumented");
        assert!(!handle.is_finished());
        assert_eq!(store.live_count(), 1);

        // The span's own token was added under the backend's header name.
        let calls = builder.recorded_calls();
        let add = calls
            .iter()
            .find(|(member, _)| member == "add_header")
            .expect("header injected");
        assert_eq!(add.1[0], "x-mock-correlation");
        assert!(add.1[1].starts_with("mock-token-"));
    }

    #[test]
    fn test_success_closes_exactly_once() {
        let backend = Arc::new(MockBackend::with_ambient());
        let (pairing, store) = pairing(backend.clone());
        let (call, _) = call_with_request();

        let key = CallKey::next();
        pairing.on_dispatch(key, &call.handle()).expect("instrumented");

        assert_eq!(pairing.on_success(key), Some(CallState::Succeeded));
        assert_eq!(pairing.on_success(key), None);
        assert_eq!(backend.ended_ids().len(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_failure_marks_error_and_closes() {
        let backend = Arc::new(MockBackend::with_ambient());
        let (pairing, _) = pairing(backend.clone());
        let (call, _) = call_with_request();

        let key = CallKey::next();
        pairing.on_dispatch(key, &call.handle()).expect("instrumented");

        let failure = TableObject::new();
        failure.set("status_code", Value::Int(503));
        failure.set("message", Value::Str("service unavailable".to_string()));

        assert_eq!(
            pairing.on_failure(key, &failure.handle()),
            Some(CallState::Failed)
        );

        let events = backend.events();
        assert!(events.iter().any(|event| matches!(
            event,
            SpanEvent::Error { message, .. } if message.contains("503")
        )));
        assert_eq!(backend.ended_ids().len(), 1);

        // The mutually-exclusive success callback racing in afterwards is a no-op.
        assert_eq!(pairing.on_success(key), None);
        assert_eq!(backend.ended_ids().len(), 1);
    }

    #[test]
    fn test_duplicate_dispatch_joins() {
        let backend = Arc::new(MockBackend::with_ambient());
        let (pairing, store) = pairing(backend.clone());
        let (call, _) = call_with_request();

        let key = CallKey::next();
        let first = pairing.on_dispatch(key, &call.handle()).expect("instrumented");
        let second = pairing.on_dispatch(key, &call.handle()).expect("joined");

        assert_eq!(first.key(), second.key());
        assert_eq!(store.live_count(), 1);
        assert_eq!(pairing.on_success(key), Some(CallState::Succeeded));
        assert_eq!(backend.ended_ids().len(), 1);
    }

    #[test]
    fn test_unreadable_failure_object_uses_defaults() {
        let backend = Arc::new(MockBackend::with_ambient());
        let (pairing, _) = pairing(backend.clone());
        let (call, _) = call_with_request();

        let key = CallKey::next();
        pairing.on_dispatch(key, &call.handle()).expect("instrumented");

        let opaque = TableObject::new();
        assert_eq!(
            pairing.on_failure(key, &opaque.handle()),
            Some(CallState::Failed)
        );
        let events = backend.events();
        assert!(events.iter().any(|event| matches!(
            event,
            SpanEvent::Error { message, .. } if message.contains("unknown error")
        )));
    }
}
