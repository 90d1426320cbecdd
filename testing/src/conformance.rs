//! A shared suite of assertions run against every [`EventStoreBackend`]
//! implementation, so the in-memory and SQL backends are held to exactly
//! one contract instead of drifting apart under separate test bodies.
//!
//! Each `assert_*` function takes an already-[`Ready`](EventStoreBackend::initialize)
//! backend and a caller-chosen, unique `stream_id` — reusing one backend
//! instance across several assertions only works if each assertion owns
//! its own streams. [`run_full_suite`] wires up a fixed, non-colliding set
//! of stream ids for convenience.

use event_store_core::event::Event;
use event_store_core::event_store::{EventStoreBackend, EventStoreError};
use event_store_core::stream::{StreamId, Version};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

fn tagged(stream: &str, version: u64, tag: &str) -> Event {
    Event::new(
        StreamId::new(stream),
        "Tagged".to_string(),
        json!({ "tag": tag, "i": version }),
        Version::new(version),
        None,
    )
}

/// Append five events to `stream_id` and verify `get_stream` returns them in
/// order with contiguous versions `0..4`.
///
/// # Panics
///
/// Panics (via `assert!`) if the backend violates version contiguity or
/// ordering.
///
/// # Errors
///
/// Propagates any backend error encountered along the way.
#[allow(clippy::panic)] // assertion helper
pub async fn assert_linear_append_and_read(
    backend: &dyn EventStoreBackend,
    stream_id: &str,
) -> Result<(), EventStoreError> {
    for i in 0..5 {
        backend.append_event(tagged(stream_id, i, &i.to_string())).await?;
    }

    let events = wait_until_committed(backend, stream_id, 5).await?;
    assert_eq!(events.len(), 5);
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.version(), Version::new(i as u64));
        assert_eq!(event.data()["i"], json!(i as u64));
    }
    Ok(())
}

/// Two producers both append version `0` to the same stream; exactly one
/// must receive [`EventStoreError::ConcurrencyConflict`]. The loser retries
/// with the now-correct version and both events end up committed in
/// versions `[0, 1]`.
///
/// # Errors
///
/// Propagates any backend error other than the expected conflict.
#[allow(clippy::panic)] // assertion helper
pub async fn assert_conflicting_writers_then_retry(
    backend: &dyn EventStoreBackend,
    stream_id: &str,
) -> Result<(), EventStoreError> {
    let first = backend.append_event(tagged(stream_id, 0, "A")).await;
    let second = backend.append_event(tagged(stream_id, 0, "B")).await;

    let loser = match (first, second) {
        (Ok(_), Err(EventStoreError::ConcurrencyConflict { .. })) => "B",
        (Err(EventStoreError::ConcurrencyConflict { .. }), Ok(_)) => "A",
        other => panic!("expected exactly one winner and one conflict, got {other:?}"),
    };

    backend.append_event(tagged(stream_id, 1, loser)).await?;

    let events = wait_until_committed(backend, stream_id, 2).await?;
    assert_eq!(events.iter().map(Event::version).collect::<Vec<_>>(), vec![
        Version::new(0),
        Version::new(1)
    ]);
    Ok(())
}

/// Appending `version = 0` to a brand new stream must succeed; appending
/// `version = 1` to that same still-empty stream must fail with
/// [`EventStoreError::ConcurrencyConflict`].
///
/// # Errors
///
/// Propagates any backend error other than the expected conflict.
#[allow(clippy::panic)] // assertion helper
pub async fn assert_version_boundary_on_empty_stream(
    backend: &dyn EventStoreBackend,
    stream_id: &str,
) -> Result<(), EventStoreError> {
    let skip_ahead = backend.append_event(tagged(stream_id, 1, "too-far")).await;
    assert!(matches!(skip_ahead, Err(EventStoreError::ConcurrencyConflict { .. })));

    backend.append_event(tagged(stream_id, 0, "first")).await?;
    let events = wait_until_committed(backend, stream_id, 1).await?;
    assert_eq!(events[0].version(), Version::new(0));
    Ok(())
}

/// An unknown stream returns an empty sequence, not an error.
///
/// # Errors
///
/// Propagates any unexpected backend error.
#[allow(clippy::panic)] // assertion helper
pub async fn assert_unknown_stream_returns_empty(
    backend: &dyn EventStoreBackend,
    stream_id: &str,
) -> Result<(), EventStoreError> {
    let events = backend.get_stream(StreamId::new(stream_id), Version::new(0), None).await?;
    assert!(events.is_empty());
    Ok(())
}

/// `get_events_by_type` returns only events of the requested type, in
/// insertion order, honoring the optional `since` filter.
///
/// # Errors
///
/// Propagates any backend error.
#[allow(clippy::panic)] // assertion helper
pub async fn assert_get_events_by_type_filters(
    backend: &dyn EventStoreBackend,
    stream_id: &str,
) -> Result<(), EventStoreError> {
    let wanted_type = format!("{stream_id}-Wanted");
    let other_type = format!("{stream_id}-Other");

    backend
        .append_event(Event::new(
            StreamId::new(stream_id),
            wanted_type.clone(),
            json!({ "n": 0 }),
            Version::new(0),
            None,
        ))
        .await?;
    backend
        .append_event(Event::new(
            StreamId::new(stream_id),
            other_type,
            json!({ "n": 1 }),
            Version::new(1),
            None,
        ))
        .await?;
    backend
        .append_event(Event::new(
            StreamId::new(stream_id),
            wanted_type.clone(),
            json!({ "n": 2 }),
            Version::new(2),
            None,
        ))
        .await?;

    wait_until_committed(backend, stream_id, 3).await?;

    let matches = backend.get_events_by_type(wanted_type, None).await?;
    assert_eq!(matches.len(), 2);
    assert_eq!(matches[0].data()["n"], json!(0));
    assert_eq!(matches[1].data()["n"], json!(2));
    Ok(())
}

/// `list_stream_ids` reflects every stream that has received at least one
/// committed event.
///
/// # Errors
///
/// Propagates any backend error.
#[allow(clippy::panic)] // assertion helper
pub async fn assert_list_stream_ids_reflects_writes(
    backend: &dyn EventStoreBackend,
    stream_id: &str,
) -> Result<(), EventStoreError> {
    backend.append_event(tagged(stream_id, 0, "only")).await?;
    wait_until_committed(backend, stream_id, 1).await?;

    let ids = backend.list_stream_ids().await?;
    assert!(ids.contains(&StreamId::new(stream_id)));
    Ok(())
}

/// Appends to two distinct streams complete without either one waiting on
/// the other's advisory lock — a weak proxy for cross-stream isolation: the
/// pair's wall time stays well under what serialized execution would take.
///
/// # Errors
///
/// Propagates any backend error.
#[allow(clippy::panic)] // assertion helper
pub async fn assert_cross_stream_isolation(
    backend: &dyn EventStoreBackend,
    stream_a: &str,
    stream_b: &str,
) -> Result<(), EventStoreError> {
    let start = Instant::now();
    let (a, b) = tokio::join!(
        backend.append_event(tagged(stream_a, 0, "a")),
        backend.append_event(tagged(stream_b, 0, "b")),
    );
    a?;
    b?;
    let elapsed = start.elapsed();

    wait_until_committed(backend, stream_a, 1).await?;
    wait_until_committed(backend, stream_b, 1).await?;

    // Generous bound: two independent streams should never need to wait for
    // each other's advisory lock, so this should be nowhere near the flush
    // interval times two.
    assert!(elapsed < Duration::from_secs(5), "cross-stream appends took {elapsed:?}");
    Ok(())
}

async fn wait_until_committed(
    backend: &dyn EventStoreBackend,
    stream_id: &str,
    expected_count: usize,
) -> Result<Vec<Event>, EventStoreError> {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let events = backend.get_stream(StreamId::new(stream_id), Version::new(0), None).await?;
        if events.len() >= expected_count {
            return Ok(events);
        }
        if Instant::now() >= deadline {
            return Ok(events);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Run every conformance assertion against `backend`, which must already be
/// [`Ready`](EventStoreBackend::initialize). Each assertion gets its own,
/// non-colliding set of stream ids derived from `label` so the same backend
/// instance can run the whole suite once.
///
/// # Panics
///
/// Panics if any assertion's invariant is violated.
///
/// # Errors
///
/// Propagates the first unexpected backend error encountered.
pub async fn run_full_suite(backend: Arc<dyn EventStoreBackend>, label: &str) -> Result<(), EventStoreError> {
    info!(label, "running conformance suite");
    assert_linear_append_and_read(backend.as_ref(), &format!("{label}-linear")).await?;
    assert_conflicting_writers_then_retry(backend.as_ref(), &format!("{label}-conflict")).await?;
    assert_version_boundary_on_empty_stream(backend.as_ref(), &format!("{label}-boundary")).await?;
    assert_unknown_stream_returns_empty(backend.as_ref(), &format!("{label}-unknown")).await?;
    assert_get_events_by_type_filters(backend.as_ref(), &format!("{label}-by-type")).await?;
    assert_list_stream_ids_reflects_writes(backend.as_ref(), &format!("{label}-listed")).await?;
    assert_cross_stream_isolation(
        backend.as_ref(),
        &format!("{label}-cross-a"),
        &format!("{label}-cross-b"),
    )
    .await?;
    info!(label, "conformance suite passed");
    Ok(())
}
