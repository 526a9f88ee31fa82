//! Background sweep that evicts and force-closes abandoned entries.
//!
//! Implements: REQ-COR-002 (Reaper)
//!
//! A dropped connection, a swallowed exception or a leaked callback means the
//! completion hook for an in-flight call never fires. Without intervention
//! the entry would pin its span open forever and the store would grow without
//! bound. The reaper sweeps all registered stores on a fixed cadence and
//! force-closes anything idle past the staleness window, marking the span as
//! abandoned so downstream consumers can tell "the operation finished" from
//! "we gave up waiting".

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::TraceSpan;
use crate::config::CorrelationConfig;
use crate::metrics::TraceStitchMetrics;
use crate::pairing::CallState;

use super::store::CorrelationStore;
use super::CallKey;

/// Periodic sweeper over one or more correlation stores.
///
/// Stores are registered explicitly at construction; the reaper holds the
/// only long-lived references it needs and there is no process-global
/// registry. One reaper task serves all registered stores.
pub struct Reaper {
    stores: Vec<Arc<CorrelationStore>>,
    config: CorrelationConfig,
    shutdown: CancellationToken,
    metrics: Option<Arc<TraceStitchMetrics>>,
}

impl Reaper {
    /// Creates a reaper with no stores registered.
    ///
    /// # Arguments
    ///
    /// * `config` - sweep cadence and staleness window
    /// * `shutdown` - cancelling this token stops the loop after any
    ///   in-flight sweep finishes
    #[must_use]
    pub fn new(config: CorrelationConfig, shutdown: CancellationToken) -> Self {
        Self {
            stores: Vec::new(),
            config,
            shutdown,
            metrics: None,
        }
    }

    /// Registers a store to be swept.
    #[must_use]
    pub fn register(mut self, store: Arc<CorrelationStore>) -> Self {
        self.stores.push(store);
        self
    }

    /// Attaches metrics for sweep timing and eviction counters.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<TraceStitchMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The configured cadence and staleness window.
    #[must_use]
    pub fn config(&self) -> &CorrelationConfig {
        &self.config
    }

    /// Runs the sweep loop until the shutdown token is cancelled.
    ///
    /// The loop is single-threaded with respect to itself: a tick that fires
    /// while a sweep is still running is skipped, not queued. A final sweep
    /// runs on shutdown so entries stale at that moment are still closed.
    pub async fn run(&self) {
        info!(
            sweep_interval_secs = self.config.sweep_interval.as_secs_f64(),
            stale_after_secs = self.config.stale_after.as_secs_f64(),
            stores = self.stores.len(),
            "correlation reaper started"
        );

        let start = tokio::time::Instant::now() + self.config.sweep_interval;
        let mut ticker = tokio::time::interval_at(start, self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!("correlation reaper shutting down");
                    break;
                }

                _ = ticker.tick() => {
                    self.sweep();
                }
            }
        }

        // Entries already stale at shutdown still deserve closure.
        let reaped = self.sweep();
        if reaped > 0 {
            info!(reaped, "final sweep reclaimed entries during shutdown");
        }

        info!("correlation reaper stopped");
    }

    /// Spawns the sweep loop onto the current tokio runtime.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    /// One sweep across all registered stores; returns the number of entries
    /// reclaimed. Callable directly in tests.
    pub fn sweep(&self) -> usize {
        let started = Instant::now();
        let mut reaped = 0;

        for store in &self.stores {
            for key in store.snapshot_stale_keys(self.config.stale_after) {
                match store.force_finish_and_remove(key) {
                    Some(span) => reaped += self.close_abandoned(key, span),
                    None => {
                        debug!(%key, "stale entry finalized concurrently, skipping");
                    }
                }
            }
        }

        if let Some(ref metrics) = self.metrics {
            metrics.observe_sweep(started.elapsed().as_secs_f64());
        }
        if reaped > 0 {
            info!(reaped, "sweep reclaimed abandoned entries");
        }

        reaped
    }

    /// Closes one reclaimed span with the abandoned marker. A panicking span
    /// handle must not take the rest of the sweep down with it; each key is
    /// processed independently.
    fn close_abandoned(&self, key: CallKey, mut span: Box<dyn TraceSpan>) -> usize {
        let stale_after = self.config.stale_after;
        let closed = panic::catch_unwind(AssertUnwindSafe(move || {
            let span_id = span.id();
            span.mark_abandoned(stale_after);
            span.end();
            span_id
        }));

        match closed {
            Ok(span_id) => {
                warn!(
                    %key,
                    %span_id,
                    state = %CallState::Abandoned,
                    idle_at_least_secs = stale_after.as_secs_f64(),
                    "abandoned entry force-closed"
                );
                if let Some(ref metrics) = self.metrics {
                    metrics.record_reaped();
                }
                1
            }
            Err(_) => {
                error!(%key, "span handle panicked while closing, skipping");
                0
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
