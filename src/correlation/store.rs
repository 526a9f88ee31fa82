//! Concurrent key → entry store with exactly-once finalization.
//!
//! Implements: REQ-COR-001 (Correlation Store)
//!
//! Uses DashMap for lock-free concurrent access. The store is the only
//! synchronization point between the thread that begins an instrumented call
//! and whichever thread later completes it; map insertion provides the
//! happens-before edge, and the per-entry `finished` compare-and-set decides
//! the single finalizer.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use crate::backend::TraceSpan;
use crate::metrics::TraceStitchMetrics;

use super::entry::{CorrelationEntry, EntryHandle};
use super::CallKey;

// ─────────────────────────────────────────────────────────────────────────────
// Put Outcome
// ─────────────────────────────────────────────────────────────────────────────

/// Result of [`CorrelationStore::put`].
///
/// A duplicate begin-hook for a live key joins the existing entry instead of
/// overwriting it; the span it offered comes back in `rejected` so the caller
/// decides its fate (the pairing layer drops it with a debug log).
pub enum PutOutcome {
    /// A new live entry was created.
    Inserted(EntryHandle),
    /// A live entry already existed; the offered span was not stored.
    Joined {
        /// The pre-existing live entry.
        existing: EntryHandle,
        /// The span offered by this put, unused.
        rejected: Box<dyn TraceSpan>,
    },
}

impl PutOutcome {
    /// The live entry, whether fresh or joined.
    #[must_use]
    pub fn handle(&self) -> &EntryHandle {
        match self {
            PutOutcome::Inserted(handle) => handle,
            PutOutcome::Joined { existing, .. } => existing,
        }
    }

    /// Consumes the outcome, dropping any rejected duplicate span.
    #[must_use]
    pub fn into_handle(self) -> EntryHandle {
        match self {
            PutOutcome::Inserted(handle) => handle,
            PutOutcome::Joined { existing, .. } => existing,
        }
    }

    /// Whether this put joined an existing entry.
    #[must_use]
    pub fn is_joined(&self) -> bool {
        matches!(self, PutOutcome::Joined { .. })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Correlation Store
// ─────────────────────────────────────────────────────────────────────────────

/// Concurrent store of in-flight calls keyed by callback identity.
///
/// All operations are amortized O(1) and never block the caller beyond the
/// DashMap shard lock; they sit on the hot path of every instrumented call.
pub struct CorrelationStore {
    entries: DashMap<CallKey, EntryHandle>,
    /// Base instant for entry last-touch clocks.
    epoch: Instant,
    live: AtomicUsize,
    metrics: Option<Arc<TraceStitchMetrics>>,
}

impl std::fmt::Debug for CorrelationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationStore")
            .field("entries", &self.entries.len())
            .field("live", &self.live.load(Ordering::Acquire))
            .field("has_metrics", &self.metrics.is_some())
            .finish()
    }
}

impl Default for CorrelationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            epoch: Instant::now(),
            live: AtomicUsize::new(0),
            metrics: None,
        }
    }

    /// Creates a store that keeps the live-entry gauge updated.
    #[must_use]
    pub fn with_metrics(metrics: Arc<TraceStitchMetrics>) -> Self {
        Self {
            entries: DashMap::new(),
            epoch: Instant::now(),
            live: AtomicUsize::new(0),
            metrics: Some(metrics),
        }
    }

    /// Inserts a new live entry, or joins the existing one.
    ///
    /// Join semantics are an explicit merge, not an error: the same in-flight
    /// call may re-enter instrumentation (a retry wrapper, a duplicate hook
    /// ordering) and must end up with exactly one span. A finished entry
    /// awaiting removal does not block a fresh insert.
    pub fn put(&self, key: CallKey, span: Box<dyn TraceSpan>) -> PutOutcome {
        self.put_with_payload(key, span, None)
    }

    /// [`put`](Self::put) with an auxiliary payload kept alongside the span.
    pub fn put_with_payload(
        &self,
        key: CallKey,
        span: Box<dyn TraceSpan>,
        payload: Option<Arc<dyn Any + Send + Sync>>,
    ) -> PutOutcome {
        let outcome = match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_finished() {
                    let handle: EntryHandle =
                        Arc::new(CorrelationEntry::new(key, span, self.epoch, payload));
                    occupied.insert(handle.clone());
                    self.live.fetch_add(1, Ordering::AcqRel);
                    PutOutcome::Inserted(handle)
                } else {
                    let existing = occupied.get().clone();
                    existing.touch();
                    PutOutcome::Joined {
                        existing,
                        rejected: span,
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let handle: EntryHandle =
                    Arc::new(CorrelationEntry::new(key, span, self.epoch, payload));
                vacant.insert(handle.clone());
                self.live.fetch_add(1, Ordering::AcqRel);
                PutOutcome::Inserted(handle)
            }
        };

        if let Some(ref metrics) = self.metrics {
            if outcome.is_joined() {
                metrics.record_join();
            }
            metrics.set_entries_live(self.live.load(Ordering::Acquire) as i64);
        }

        outcome
    }

    /// Looks up the live entry for `key`, touching it.
    ///
    /// `None` means "nothing to finalize": the key is absent, or the entry
    /// has already been finalized. Completion hooks treat this as a no-op.
    #[must_use]
    pub fn get(&self, key: CallKey) -> Option<EntryHandle> {
        let handle = self.entries.get(&key)?.clone();
        if handle.is_finished() {
            return None;
        }
        handle.touch();
        Some(handle)
    }

    /// Atomically finishes the entry and removes it, returning the span for
    /// the caller to close.
    ///
    /// Concurrent double-finalization is impossible: only the caller that
    /// wins the entry's finished compare-and-set receives the span; everyone
    /// else gets `None`.
    #[must_use]
    pub fn finish_and_remove(&self, key: CallKey) -> Option<Box<dyn TraceSpan>> {
        let handle = self.entries.get(&key)?.clone();
        if !handle.try_finish() {
            debug!(%key, "entry already finished by a concurrent finalizer");
            return None;
        }
        let span = handle.take_span();

        // A fresh entry may have replaced this finished one in the meantime;
        // only remove the entry we actually finished.
        self.entries
            .remove_if(&key, |_, current| Arc::ptr_eq(current, &handle));
        self.live.fetch_sub(1, Ordering::AcqRel);

        if let Some(ref metrics) = self.metrics {
            metrics.set_entries_live(self.live.load(Ordering::Acquire) as i64);
        }

        span
    }

    /// [`finish_and_remove`](Self::finish_and_remove) under its reaper-facing
    /// name; identical atomicity guarantee.
    #[must_use]
    pub fn force_finish_and_remove(&self, key: CallKey) -> Option<Box<dyn TraceSpan>> {
        self.finish_and_remove(key)
    }

    /// Keys of live entries idle for at least `older_than`.
    ///
    /// Read-only scan for the reaper: does not refresh last-touch clocks.
    #[must_use]
    pub fn snapshot_stale_keys(&self, older_than: Duration) -> Vec<CallKey> {
        self.entries
            .iter()
            .filter(|entry| !entry.value().is_finished() && entry.value().idle() >= older_than)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Number of live (unfinished) entries.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Total number of entries present, including finished ones awaiting
    /// removal.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
