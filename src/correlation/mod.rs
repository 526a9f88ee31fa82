//! Concurrent correlation of in-flight calls to their tracing spans.
//!
//! The begin and completion halves of an instrumented asynchronous call run
//! in different callback invocations, typically on different threads, with no
//! caller-supplied correlation id. This module associates the two through the
//! identity of the object the completion callback will fire on:
//!
//! - [`store`] - concurrent key → entry map with exactly-once finalization
//! - [`entry`] - one in-flight call: span, last-touch clock, finished flag
//! - [`reaper`] - background sweep that force-closes entries whose
//!   completion never arrives
//!
//! # Traceability
//! - Implements: REQ-COR-001 (Correlation Store)
//! - Implements: REQ-COR-002 (Reaper)

pub mod entry;
pub mod reaper;
pub mod store;

pub use entry::{CorrelationEntry, EntryHandle};
pub use reaper::Reaper;
pub use store::{CorrelationStore, PutOutcome};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::invoke::ObjectHandle;

// ─────────────────────────────────────────────────────────────────────────────
// Call Key
// ─────────────────────────────────────────────────────────────────────────────

/// Identity of the object a completion callback will later fire on.
///
/// Keys compare by identity, never by payload: two distinct calls with
/// structurally-equal requests must not collide. An adapter derives the key
/// either from the callback object's allocation address
/// ([`from_handle`](Self::from_handle)) or from a process-wide generation
/// counter ([`next`](Self::next)) when it owns the callback registration
/// itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallKey(u64);

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

impl CallKey {
    /// A fresh key from the process-wide generation counter.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_KEY.fetch_add(1, Ordering::Relaxed))
    }

    /// A key derived from an arbitrary stable address.
    #[must_use]
    pub fn from_address(address: usize) -> Self {
        Self(address as u64)
    }

    /// A key derived from a framework object's identity.
    ///
    /// Stable for the lifetime of the handle; the caller must keep the object
    /// alive until its completion callback has fired or the entry is reaped,
    /// which holds by construction for callback receivers.
    #[must_use]
    pub fn from_handle(handle: &ObjectHandle) -> Self {
        Self::from_address(Arc::as_ptr(handle) as *const () as usize)
    }
}

impl std::fmt::Display for CallKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_keys_are_unique() {
        let a = CallKey::next();
        let b = CallKey::next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_handle_identity_not_value() {
        let first: ObjectHandle = Arc::new("payload".to_string());
        let second: ObjectHandle = Arc::new("payload".to_string());
        assert_ne!(CallKey::from_handle(&first), CallKey::from_handle(&second));

        let alias = first.clone();
        assert_eq!(CallKey::from_handle(&first), CallKey::from_handle(&alias));
    }
}
