//! Async pairing state machine: the begin/end protocol every interceptor
//! runs on top of the correlation store and reaper.
//!
//! One logical call moves through a small state machine:
//!
//! ```text
//! NONE ──begin──▶ STARTED ──success──▶ SUCCEEDED
//!                    │  ╲──failure──▶ FAILED
//!                    ╰───reaper─────▶ ABANDONED
//! ```
//!
//! `NONE` is implicit (no store entry). `STARTED` is a live entry. Terminal
//! states never transition again; the store's exactly-once finalization is
//! what enforces that under concurrency.
//!
//! The error and success branches share a single [`finalize`] transition
//! rather than duplicating the close sequence in each hook: a failure is
//! recorded on the span and the span is then still ended through the same
//! path a success takes.
//!
//! # Variants
//!
//! - [`outbound`] - client call with completion callbacks
//! - [`inbound`] - request handler constructed per request
//! - [`segmented`] - protocol handler with begin/content/end/exception phases
//!
//! # Traceability
//! - Implements: REQ-COR-003 (Async Pairing State Machine)

pub mod inbound;
pub mod outbound;
pub mod segmented;

pub use inbound::InboundRequestPairing;
pub use outbound::OutboundCallPairing;
pub use segmented::{Phase, PhaseToken, SegmentedPairing};

use tracing::debug;

use crate::correlation::{CallKey, CorrelationStore};

// ─────────────────────────────────────────────────────────────────────────────
// Call State
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of one logical instrumented call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// A begin-hook created (or joined) the live entry.
    Started,
    /// The normal completion hook closed the span.
    Succeeded,
    /// The failure completion hook recorded an error and closed the span.
    Failed,
    /// The reaper gave up waiting and force-closed the span.
    Abandoned,
}

impl CallState {
    /// Metric label for this state.
    #[must_use]
    pub fn as_label(&self) -> &'static str {
        match self {
            CallState::Started => "started",
            CallState::Succeeded => "succeeded",
            CallState::Failed => "failed",
            CallState::Abandoned => "abandoned",
        }
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Completion
// ─────────────────────────────────────────────────────────────────────────────

/// Terminal outcome delivered by a completion hook.
#[derive(Debug, Clone)]
pub enum Completion {
    /// The call completed normally.
    Success,
    /// The call failed; status code and message come from the completion
    /// callback's arguments.
    Failure {
        /// Protocol status code, when the failure carries one.
        status: Option<i64>,
        /// Failure message.
        message: String,
    },
}

/// The single shared finalize transition.
///
/// Whichever hook reaches a live entry first wins the span and closes it;
/// everyone else (a racing duplicate callback, a hook firing after the
/// reaper) observes `None` from the store and does nothing. On failure the
/// error is recorded and the span is still ended normally — error marking and
/// final close are not mutually exclusive.
pub(crate) fn finalize(
    store: &CorrelationStore,
    key: CallKey,
    completion: &Completion,
) -> Option<CallState> {
    let Some(mut span) = store.finish_and_remove(key) else {
        debug!(%key, "no live entry to finalize, already completed or reaped");
        return None;
    };

    let state = match completion {
        Completion::Success => CallState::Succeeded,
        Completion::Failure { status, message } => {
            let text = match status {
                Some(code) => format!("completion failed, status {code}: {message}"),
                None => format!("completion failed: {message}"),
            };
            span.mark_error(&text);
            debug!(%key, span_id = %span.id(), error = %text, "span marked as error");
            CallState::Failed
        }
    };

    span.end();
    debug!(%key, state = %state, "span finalized");
    Some(state)
}
