//! Prometheus metrics using the prometheus-client crate.
//!
//! All metrics are optional: the store, reaper and pairing layers take an
//! `Option<Arc<TraceStitchMetrics>>` and skip recording entirely when absent,
//! so instrumented call paths pay nothing unless the host application wires a
//! registry in.
//!
//! # Traceability
//! - Implements: REQ-OBS-001 §5 (Metrics)

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

// ─────────────────────────────────────────────────────────────────────────────
// Label Sets
// ─────────────────────────────────────────────────────────────────────────────

/// Labels for call-started counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct VariantLabels {
    /// Pairing variant: "outbound", "inbound" or "segmented".
    pub variant: String,
}

/// Labels for call-completed counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CompletionLabels {
    /// Pairing variant: "outbound", "inbound" or "segmented".
    pub variant: String,
    /// Terminal state: "succeeded", "failed" or "abandoned".
    pub outcome: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Metrics
// ─────────────────────────────────────────────────────────────────────────────

/// Registry of all correlation-engine metrics.
pub struct TraceStitchMetrics {
    /// `tracestitch_calls_started_total` - instrumented calls begun.
    pub calls_started: Family<VariantLabels, Counter>,
    /// `tracestitch_calls_completed_total` - calls finalized, by outcome.
    pub calls_completed: Family<CompletionLabels, Counter>,
    /// `tracestitch_joins_total` - duplicate begin-hooks merged into an
    /// existing in-flight entry.
    pub joins: Counter,
    /// `tracestitch_entries_live` - current live entries across the store.
    pub entries_live: Gauge,
    /// `tracestitch_entries_reaped_total` - entries force-closed by the
    /// reaper.
    pub entries_reaped: Counter,
    /// `tracestitch_sweep_duration_seconds` - reaper sweep wall time.
    pub sweep_duration_seconds: Histogram,
}

impl TraceStitchMetrics {
    /// Registers all metrics into the given registry.
    #[must_use]
    pub fn new(registry: &mut Registry) -> Self {
        let calls_started = Family::<VariantLabels, Counter>::default();
        registry.register(
            "tracestitch_calls_started",
            "Instrumented calls begun",
            calls_started.clone(),
        );

        let calls_completed = Family::<CompletionLabels, Counter>::default();
        registry.register(
            "tracestitch_calls_completed",
            "Instrumented calls finalized, by terminal state",
            calls_completed.clone(),
        );

        let joins = Counter::default();
        registry.register(
            "tracestitch_joins",
            "Duplicate begin-hooks merged into an existing in-flight entry",
            joins.clone(),
        );

        let entries_live = Gauge::default();
        registry.register(
            "tracestitch_entries_live",
            "Current live correlation entries",
            entries_live.clone(),
        );

        let entries_reaped = Counter::default();
        registry.register(
            "tracestitch_entries_reaped",
            "Entries force-closed by the reaper",
            entries_reaped.clone(),
        );

        let sweep_duration_seconds = Histogram::new(exponential_buckets(0.0001, 2.0, 12));
        registry.register(
            "tracestitch_sweep_duration_seconds",
            "Reaper sweep wall time",
            sweep_duration_seconds.clone(),
        );

        Self {
            calls_started,
            calls_completed,
            joins,
            entries_live,
            entries_reaped,
            sweep_duration_seconds,
        }
    }

    /// Records one instrumented call begun.
    pub fn record_call_started(&self, variant: &str) {
        self.calls_started
            .get_or_create(&VariantLabels {
                variant: variant.to_string(),
            })
            .inc();
    }

    /// Records one call reaching a terminal state.
    pub fn record_call_completed(&self, variant: &str, outcome: &str) {
        self.calls_completed
            .get_or_create(&CompletionLabels {
                variant: variant.to_string(),
                outcome: outcome.to_string(),
            })
            .inc();
    }

    /// Records a duplicate begin-hook joining an existing entry.
    pub fn record_join(&self) {
        self.joins.inc();
    }

    /// Updates the live-entry gauge.
    pub fn set_entries_live(&self, live: i64) {
        self.entries_live.set(live);
    }

    /// Records one entry reclaimed by the reaper.
    pub fn record_reaped(&self) {
        self.entries_reaped.inc();
    }

    /// Records the wall time of one sweep.
    pub fn observe_sweep(&self, seconds: f64) {
        self.sweep_duration_seconds.observe(seconds);
    }
}
