//! One in-flight call: its span, last-touch clock and finished flag.
//!
//! Implements: REQ-COR-001 §2 (Entry Model)

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::backend::TraceSpan;

use super::CallKey;

/// Shared handle to a live entry.
///
/// Handed out by the store on insert and lookup; holding one does not keep
/// the entry alive in the store.
pub type EntryHandle = Arc<CorrelationEntry>;

/// Association between a call key and its in-flight span.
///
/// The span is exclusively owned by the entry until exactly one finalizer
/// wins the `finished` transition and takes it out; after that the entry is
/// inert and eligible for removal.
pub struct CorrelationEntry {
    key: CallKey,
    /// `None` once the winning finalizer has taken the span.
    span: Mutex<Option<Box<dyn TraceSpan>>>,
    /// Monotonic false → true; the single compare-and-set that guarantees
    /// exactly-once finalization.
    finished: AtomicBool,
    /// Microseconds since the store epoch of the last touch.
    last_touch_micros: AtomicU64,
    epoch: Instant,
    /// Auxiliary object kept alongside the span (request-handler scenarios).
    payload: Option<Arc<dyn Any + Send + Sync>>,
}

impl CorrelationEntry {
    pub(crate) fn new(
        key: CallKey,
        span: Box<dyn TraceSpan>,
        epoch: Instant,
        payload: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Self {
        let entry = Self {
            key,
            span: Mutex::new(Some(span)),
            finished: AtomicBool::new(false),
            last_touch_micros: AtomicU64::new(0),
            epoch,
            payload,
        };
        entry.touch();
        entry
    }

    /// The key this entry is stored under.
    #[must_use]
    pub fn key(&self) -> CallKey {
        self.key
    }

    /// Whether a finalizer has already won this entry.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Refreshes the last-touch clock so the reaper keeps its hands off an
    /// actively observed entry.
    pub fn touch(&self) {
        let now = self.epoch.elapsed().as_micros() as u64;
        self.last_touch_micros.store(now, Ordering::Release);
    }

    /// Time since the last touch.
    #[must_use]
    pub fn idle(&self) -> Duration {
        let now = self.epoch.elapsed().as_micros() as u64;
        let last = self.last_touch_micros.load(Ordering::Acquire);
        Duration::from_micros(now.saturating_sub(last))
    }

    /// Runs `f` against the span if the entry is still live; touches the
    /// entry. Returns `None` once finalized.
    pub fn with_span<R>(&self, f: impl FnOnce(&mut dyn TraceSpan) -> R) -> Option<R> {
        if self.is_finished() {
            return None;
        }
        self.touch();
        let mut guard = self.span.lock().unwrap_or_else(PoisonError::into_inner);
        guard.as_mut().map(|span| f(span.as_mut()))
    }

    /// Backend span id, for logging. Touches the entry.
    #[must_use]
    pub fn span_id(&self) -> Option<String> {
        self.with_span(|span| span.id())
    }

    /// The auxiliary payload stored at insert time, if any.
    #[must_use]
    pub fn payload(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.payload.clone()
    }

    /// Attempts the false → true finished transition. Exactly one caller per
    /// entry ever sees `true`.
    pub(crate) fn try_finish(&self) -> bool {
        self.finished
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Takes the span out. Only the winner of [`try_finish`](Self::try_finish)
    /// may call this.
    pub(crate) fn take_span(&self) -> Option<Box<dyn TraceSpan>> {
        self.span
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl std::fmt::Debug for CorrelationEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationEntry")
            .field("key", &self.key)
            .field("finished", &self.is_finished())
            .field("idle", &self.idle())
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockBackend, SpanDescriptor, TraceBackend};

    fn entry_with_span(backend: &MockBackend) -> CorrelationEntry {
        let span = backend.start_span(&SpanDescriptor::internal("test"));
        CorrelationEntry::new(CallKey::next(), span, Instant::now(), None)
    }

    #[test]
    fn test_finish_transition_happens_once() {
        let backend = MockBackend::new();
        let entry = entry_with_span(&backend);

        assert!(!entry.is_finished());
        assert!(entry.try_finish());
        assert!(entry.is_finished());
        assert!(!entry.try_finish());
    }

    #[test]
    fn test_with_span_denied_after_finish() {
        let backend = MockBackend::new();
        let entry = entry_with_span(&backend);

        assert!(entry.with_span(|span| span.id()).is_some());
        entry.try_finish();
        assert!(entry.with_span(|span| span.id()).is_none());
    }

    #[test]
    fn test_touch_resets_idle() {
        let backend = MockBackend::new();
        let entry = entry_with_span(&backend);

        std::thread::sleep(Duration::from_millis(15));
        assert!(entry.idle() >= Duration::from_millis(10));

        entry.touch();
        assert!(entry.idle() < Duration::from_millis(10));
    }

    #[test]
    fn test_take_span_is_single_shot() {
        let backend = MockBackend::new();
        let entry = entry_with_span(&backend);

        entry.try_finish();
        assert!(entry.take_span().is_some());
        assert!(entry.take_span().is_none());
    }
}
