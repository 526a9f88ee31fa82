//! Inbound-request pairing: instrument a handler object constructed per
//! request whose completion fires on separate success/failure methods.
//!
//! Implements: REQ-COR-003 §5.2 (Inbound Variant)
//!
//! The begin-hook fires on handler construction. If an outer layer already
//! opened a trace, that span is adopted; otherwise a server span is started
//! from a descriptor extracted off the request object, including the upstream
//! correlation token from the designated header. Either way the span is
//! keyed by the handler object's identity, and the intercepted request rides
//! along as the entry payload.
//!
//! The end-hook's failure path records the status code and message as an
//! error and then always also runs the success-path closure.

use std::sync::Arc;

use tracing::debug;

use crate::backend::{SpanDescriptor, TraceBackend};
use crate::correlation::{CallKey, CorrelationStore, EntryHandle};
use crate::extract::{HttpRequestBindings, request_descriptor};
use crate::invoke::{DynamicInvoker, InvokeError, ObjectHandle};
use crate::metrics::TraceStitchMetrics;

use super::{CallState, Completion, finalize};

const VARIANT: &str = "inbound";

/// Pairing protocol for per-request handler objects.
pub struct InboundRequestPairing {
    store: Arc<CorrelationStore>,
    backend: Arc<dyn TraceBackend>,
    invoker: Arc<dyn DynamicInvoker>,
    bindings: HttpRequestBindings,
    metrics: Option<Arc<TraceStitchMetrics>>,
}

impl InboundRequestPairing {
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

    /// Begin-hook: fires when the handler object is constructed.
    ///
    /// `handler_key` is the handler object's identity; `operation` names the
    /// handler (used as the span operation when a new span is started);
    /// `request` is the inbound request object when the adapter has one.
    pub fn on_construct(
        &self,
        handler_key: CallKey,
        operation: &str,
        request: Option<&ObjectHandle>,
    ) -> EntryHandle {
        let span = match self.backend.current_active() {
            Some(active) => {
                debug!(
                    %handler_key,
                    span_id = %active.id(),
                    "trace already active, adopting for request handler"
                );
                active
            }
            None => {
                let descriptor = match request {
                    Some(request) => request_descriptor(
                        self.invoker.as_ref(),
                        &self.bindings,
                        request,
                        operation,
                        self.backend.correlation_header_name(),
                    ),
                    None => SpanDescriptor::inbound(operation),
                };
                self.backend.start_span(&descriptor)
            }
        };

        let outcome = self.store.put_with_payload(handler_key, span, request.cloned());
        if outcome.is_joined() {
            debug!(%handler_key, "handler already registered, joining; duplicate span discarded");
        }
        let handle = outcome.into_handle();

        if let Some(ref metrics) = self.metrics {
            metrics.record_call_started(VARIANT);
        }
        debug!(
            %handler_key,
            %operation,
            span_id = ?handle.span_id(),
            state = %CallState::Started,
            "request handler registered for completion"
        );
        handle
    }

    /// Success hook: the handler's success completion method fired.
    pub fn on_success(&self, handler_key: CallKey) -> Option<CallState> {
        self.complete(handler_key, Completion::Success)
    }

    /// Failure hook: the handler's failure completion method fired. The
    /// error is recorded with the completion's status code and message, and
    /// the span is then still ended through the success path.
    pub fn on_failure(
        &self,
        handler_key: CallKey,
        status: Option<i64>,
        message: &str,
    ) -> Option<CallState> {
        self.complete(
            handler_key,
            Completion::Failure {
                status,
                message: message.to_string(),
            },
        )
    }

    fn complete(&self, handler_key: CallKey, completion: Completion) -> Option<CallState> {
        let state = finalize(&self.store, handler_key, &completion)?;
        if let Some(ref metrics) = self.metrics {
            metrics.record_call_completed(VARIANT, state.as_label());
        }
        Some(state)
    }
}
