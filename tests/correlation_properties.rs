//! Integration tests for the correlation store and reaper guarantees:
//! exactly-once finalization, join idempotence, staleness bounds, touch
//! extension and leak-freedom.

use std::sync::Arc;
use std::sync::Barrier;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use tracestitch::backend::{MockBackend, SpanDescriptor, TraceBackend};
use tracestitch::{CallKey, CorrelationConfig, CorrelationStore, Reaper};

fn span(backend: &MockBackend) -> Box<dyn tracestitch::TraceSpan> {
    backend.start_span(&SpanDescriptor::internal("call"))
}

#[test]
fn join_idempotence_single_span_single_entry() {
    let backend = MockBackend::new();
    let store = CorrelationStore::new();
    let key = CallKey::next();

    let first = store.put(key, span(&backend));
    let first_id = first.handle().span_id().expect("live span");

    let second = store.put(key, span(&backend));
    assert!(second.is_joined());
    assert_eq!(second.handle().span_id().expect("live span"), first_id);
    assert_eq!(store.len(), 1);

    // Exactly one underlying span gets closed at completion.
    let mut reclaimed = store.finish_and_remove(key).expect("finish wins");
    reclaimed.end();
    assert_eq!(backend.ended_ids().len(), 1);
}

#[test]
fn exactly_once_under_concurrent_mixed_finalizers() {
    let backend = MockBackend::new();
    let store = Arc::new(CorrelationStore::new());

    for _ in 0..50 {
        let key = CallKey::next();
        let _ = store.put(key, span(&backend));

        let barrier = Arc::new(Barrier::new(4));
        let mut handles = Vec::new();
        for worker in 0..4 {
            let store = store.clone();
            let barrier = barrier.clone();
            handles.push(std::thread::spawn(move || {
                barrier.wait();
                match worker {
                    // Two normal finalizers, one reaper-style finalizer and
                    // one reader racing on the same key.
                    0 | 1 => store.finish_and_remove(key).is_some(),
                    2 => store.force_finish_and_remove(key).is_some(),
                    _ => {
                        let _ = store.get(key);
                        false
                    }
                }
            }));
        }

        let winners: usize = handles
            .into_iter()
            .map(|h| usize::from(h.join().expect("worker completes")))
            .sum();
        assert_eq!(winners, 1, "exactly one finalizer must win the span");
        assert!(store.get(key).is_none());
    }
    assert!(store.is_empty());
}

#[test]
fn no_leak_after_completion() {
    let backend = MockBackend::new();
    let store = CorrelationStore::new();
    let key = CallKey::next();

    let _ = store.put(key, span(&backend));
    let mut reclaimed = store.finish_and_remove(key).expect("finish wins");
    reclaimed.end();

    assert!(store.snapshot_stale_keys(Duration::ZERO).is_empty());
    assert_eq!(store.live_count(), 0);
    assert!(store.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn reaper_bounds_staleness_and_abandons_once() {
    let backend = Arc::new(MockBackend::new());
    let store = Arc::new(CorrelationStore::new());
    let shutdown = CancellationToken::new();
    let config = CorrelationConfig::new(Duration::from_millis(25), Duration::from_millis(100));
    let reaper = Reaper::new(config, shutdown.clone()).register(store.clone());
    let reaper_task = reaper.spawn();

    let key = CallKey::next();
    let _ = store.put(key, backend.start_span(&SpanDescriptor::internal("never-completes")));

    // Within sweep_interval + stale_after (plus slack) the entry is gone.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(store.get(key).is_none());
    assert!(store.is_empty());
    assert_eq!(backend.abandoned_count(), 1);
    assert_eq!(backend.ended_ids().len(), 1);

    // A straggling completion hook after the reap is a no-op.
    assert!(store.finish_and_remove(key).is_none());
    assert_eq!(backend.ended_ids().len(), 1);

    shutdown.cancel();
    reaper_task.await.expect("reaper joins");
}

#[tokio::test(flavor = "multi_thread")]
async fn touch_extends_lifetime_indefinitely() {
    let backend = Arc::new(MockBackend::new());
    let store = Arc::new(CorrelationStore::new());
    let shutdown = CancellationToken::new();
    let config = CorrelationConfig::new(Duration::from_millis(20), Duration::from_millis(80));
    let reaper = Reaper::new(config, shutdown.clone()).register(store.clone());
    let reaper_task = reaper.spawn();

    let key = CallKey::next();
    let _ = store.put(key, backend.start_span(&SpanDescriptor::internal("slow-but-alive")));

    // Touch at a quarter of the staleness window, across several full
    // windows' worth of wall time.
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.get(key).is_some(), "touched entry must never be reaped");
    }
    assert_eq!(backend.abandoned_count(), 0);

    // Once the touching stops, the reaper takes it.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(store.get(key).is_none());
    assert_eq!(backend.abandoned_count(), 1);

    shutdown.cancel();
    reaper_task.await.expect("reaper joins");
}

#[tokio::test(flavor = "multi_thread")]
async fn reaper_serves_multiple_stores() {
    let backend = Arc::new(MockBackend::new());
    let outbound_store = Arc::new(CorrelationStore::new());
    let inbound_store = Arc::new(CorrelationStore::new());
    let shutdown = CancellationToken::new();
    let config = CorrelationConfig::new(Duration::from_millis(25), Duration::from_millis(75));
    let reaper = Reaper::new(config, shutdown.clone())
        .register(outbound_store.clone())
        .register(inbound_store.clone());
    let reaper_task = reaper.spawn();

    let _ = outbound_store.put(
        CallKey::next(),
        backend.start_span(&SpanDescriptor::internal("a")),
    );
    let _ = inbound_store.put(
        CallKey::next(),
        backend.start_span(&SpanDescriptor::internal("b")),
    );

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(outbound_store.is_empty());
    assert!(inbound_store.is_empty());
    assert_eq!(backend.abandoned_count(), 2);

    shutdown.cancel();
    reaper_task.await.expect("reaper joins");
}
