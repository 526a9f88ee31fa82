//! TraceStitch — asynchronous span-correlation engine.
//!
//! This library stitches together distributed-tracing spans for third-party
//! request/response call sites whose begin and completion fire in different
//! callback invocations, potentially on different threads, with no
//! caller-supplied correlation id. Framework adapters decide *which* calls to
//! watch and supply object identities; this crate supplies the concurrent
//! correlation store, the background reaper that bounds the lifetime of calls
//! whose completion never arrives, and the pairing protocol that closes every
//! span exactly once.
//!
//! # Traceability
//! - Implements: REQ-COR-001 (Correlation Store)
//! - Implements: REQ-COR-002 (Reaper)
//! - Implements: REQ-COR-003 (Async Pairing State Machine)
//! - Implements: REQ-INV-001 (Dynamic Invocation Facade)
//! - Implements: REQ-OBS-001 (Backend Contract, Metrics)
//! - Implements: REQ-CFG-001 (Configuration)

pub mod backend;
pub mod config;
pub mod correlation;
pub mod extract;
pub mod invoke;
pub mod metrics;
pub mod pairing;

pub use backend::{SpanDescriptor, TraceBackend, TraceSegment, TraceSpan};
pub use config::{ConfigError, CorrelationConfig};
pub use correlation::{CallKey, CorrelationStore, EntryHandle, PutOutcome, Reaper};
pub use invoke::{DynamicInvoker, InvokeError};
pub use metrics::TraceStitchMetrics;
pub use pairing::{
    CallState, InboundRequestPairing, OutboundCallPairing, Phase, SegmentedPairing,
};
