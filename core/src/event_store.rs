//! The backend adapter contract and its error type.
//!
//! This module defines [`EventStoreBackend`], the capability surface both
//! backend implementations (in-memory and durable SQL) provide, and
//! [`EventStoreError`], the error type that spans both.
//!
//! # Design Philosophy
//!
//! The event store is deliberately simple and focused. It does NOT provide
//! snapshotting, projection management, or a subscription/event-bus
//! mechanism — those are the application's job. This keeps the store
//! focused on its core responsibility: durable, ordered, append-only event
//! persistence with per-stream optimistic concurrency.
//!
//! # Dyn Compatibility
//!
//! This trait uses explicit `Pin<Box<dyn Future>>` returns instead of
//! `async fn` so it can be used as a trait object (`Arc<dyn
//! EventStoreBackend>`), which the write buffer, the migrator, and the
//! backend factory all require.
//!
//! # Implementations
//!
//! - `InMemoryBackend` (in the `memory` crate): non-durable, single-process.
//! - `PostgresBackend` (in the `postgres` crate): durable, `PostgreSQL`-backed.

use crate::event::{Event, EventError};
use crate::stream::{StreamId, Version};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// A boxed, pinned, `Send` future — the return type every
/// [`EventStoreBackend`] method uses for dyn compatibility.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors that can occur during event store operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EventStoreError {
    /// Optimistic concurrency conflict: the supplied version did not match
    /// `last_committed + 1` for the stream.
    #[error("concurrency conflict on stream {stream_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        /// The stream where the conflict occurred.
        stream_id: StreamId,
        /// The version the caller should have supplied.
        expected: Version,
        /// The version the caller actually supplied.
        actual: Version,
    },

    /// The write buffer is at its configured capacity; this append did not
    /// fit within the configured wait timeout.
    #[error("write buffer is full")]
    BufferFullError,

    /// The backend received an operation outside its `Ready` lifecycle state.
    #[error("backend is not ready: {0}")]
    BackendNotReadyError(String),

    /// An event could not be constructed or mutated.
    #[error(transparent)]
    ImmutableEvent(#[from] EventError),

    /// A transient failure: I/O, deadlock victim, or advisory-lock
    /// contention timeout. The flush pipeline retries these automatically
    /// by reinserting the affected batch.
    #[error("transient backend error: {0}")]
    TransientBackendError(String),

    /// A permanent failure: a schema violation, or any constraint other
    /// than the version-uniqueness one. The flush pipeline drops the
    /// affected batch and surfaces this to the append callers instead.
    #[error("permanent backend error: {0}")]
    PermanentBackendError(String),

    /// The operation was cancelled because the backend is shutting down.
    #[error("operation cancelled by shutdown")]
    ShutdownError,

    /// The migrator found that the source and destination diverge on
    /// already-migrated events for a stream.
    #[error("migration consistency error on stream {stream_id}: {reason}")]
    MigrationConsistencyError {
        /// The stream where source and destination diverged.
        stream_id: StreamId,
        /// A human-readable description of the divergence.
        reason: String,
    },
}

impl EventStoreError {
    /// Whether the flush pipeline should retry (reinsert at the head of the
    /// buffer) the batch that produced this error.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::TransientBackendError(_))
    }
}

/// A point-in-time snapshot of operator-visible backend counters.
///
/// Instrumentation itself is emitted inline via the `metrics` crate at each
/// call site (ambient, always-on); this struct is a queryable summary for
/// callers that want the numbers without scraping a metrics endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendMetrics {
    /// Total events successfully committed via `write_stream_events`.
    pub events_committed: u64,
    /// Total events returned across all `get_stream`/`get_events_by_type` calls.
    pub events_read: u64,
    /// Total flush cycles executed by the write buffer.
    pub flush_count: u64,
    /// Total batches reinserted after a transient failure.
    pub flush_retries: u64,
    /// Total `ConcurrencyConflict` errors observed.
    pub concurrency_conflicts: u64,
    /// Current number of events sitting in the write buffer.
    pub buffer_depth: u64,
}

impl BackendMetrics {
    /// Render the snapshot as a plain string-keyed map.
    #[must_use]
    pub fn as_map(&self) -> HashMap<String, u64> {
        HashMap::from([
            ("events_committed".to_string(), self.events_committed),
            ("events_read".to_string(), self.events_read),
            ("flush_count".to_string(), self.flush_count),
            ("flush_retries".to_string(), self.flush_retries),
            ("concurrency_conflicts".to_string(), self.concurrency_conflicts),
            ("buffer_depth".to_string(), self.buffer_depth),
        ])
    }
}

/// The capability surface both backend implementations provide.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` for use from the async scheduler
/// and across the buffer, flush worker, and migrator.
pub trait EventStoreBackend: Send + Sync {
    /// Append a single event, subject to backpressure.
    ///
    /// Conceptually "may buffer": an in-process write buffer typically owns
    /// this path and only later calls
    /// [`write_stream_events`](Self::write_stream_events) to commit durably.
    ///
    /// # Errors
    ///
    /// - [`EventStoreError::BufferFullError`] if the buffer rejects the
    ///   append under backpressure.
    /// - [`EventStoreError::BackendNotReadyError`] outside the `Ready`
    ///   lifecycle state.
    fn append_event(&self, event: Event) -> BoxFuture<'_, Result<Version, EventStoreError>>;

    /// Load events from a stream, `from_version` through `to_version`
    /// inclusive (or through the end of the stream if `to_version` is
    /// `None`).
    ///
    /// Returns an empty sequence for unknown streams — this is not an error,
    /// new streams start empty.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::BackendNotReadyError`] outside `Ready`, or
    /// a transient/permanent backend error on I/O failure.
    fn get_stream(
        &self,
        stream_id: StreamId,
        from_version: Version,
        to_version: Option<Version>,
    ) -> BoxFuture<'_, Result<Vec<Event>, EventStoreError>>;

    /// Load events of a given type across all streams, ordered by
    /// insertion, optionally filtered to those with `timestamp >= since`.
    ///
    /// # Errors
    ///
    /// Same as [`get_stream`](Self::get_stream).
    fn get_events_by_type(
        &self,
        event_type: String,
        since: Option<DateTime<Utc>>,
    ) -> BoxFuture<'_, Result<Vec<Event>, EventStoreError>>;

    /// Commit a batch of events for one stream atomically: either every
    /// event in `events` becomes visible to subsequent reads, or none do.
    ///
    /// Used by the flush pipeline and the migrator. Validates that the
    /// first event's version is the stream's current `next_version`
    /// (per [`crate::version_manager`]) before committing.
    ///
    /// # Errors
    ///
    /// - [`EventStoreError::ConcurrencyConflict`] if the batch's first
    ///   version does not match the stream's expected next version.
    /// - [`EventStoreError::TransientBackendError`] for retriable failures.
    /// - [`EventStoreError::PermanentBackendError`] for non-retriable ones.
    fn write_stream_events(
        &self,
        stream_id: StreamId,
        events: Vec<Event>,
    ) -> BoxFuture<'_, Result<Version, EventStoreError>>;

    /// Enumerate every distinct stream id currently known to the backend.
    ///
    /// Used by the migrator to discover what to migrate; not part of the
    /// hot append/read path.
    ///
    /// # Errors
    ///
    /// Returns a backend error if enumeration fails.
    fn list_stream_ids(&self) -> BoxFuture<'_, Result<Vec<StreamId>, EventStoreError>>;

    /// Transition the backend from `Uninitialized` to `Ready`.
    ///
    /// # Errors
    ///
    /// Returns a backend error if initialization fails (unreachable
    /// database, missing schema, and so on). A caller that cannot tolerate
    /// this failure is expected to implement its own degraded-mode
    /// fallback — that is a collaborator's concern, not this trait's.
    fn initialize(&self) -> BoxFuture<'_, Result<(), EventStoreError>>;

    /// Drain the write buffer and transition to `Closed`.
    ///
    /// Any event still in the buffer that cannot be committed before the
    /// configured shutdown deadline elapses is surfaced as an error to its
    /// own append caller, not to this method's caller.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the drain itself cannot complete cleanly.
    fn close(&self) -> BoxFuture<'_, Result<(), EventStoreError>>;

    /// A point-in-time snapshot of operator-visible counters.
    fn metrics(&self) -> BackendMetrics;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_conflict_error_display() {
        let error = EventStoreError::ConcurrencyConflict {
            stream_id: StreamId::new("test-stream"),
            expected: Version::new(5),
            actual: Version::new(7),
        };

        let display = format!("{error}");
        assert!(display.contains("expected version 5"));
        assert!(display.contains("found 7"));
    }

    #[test]
    fn only_transient_errors_are_retriable() {
        assert!(EventStoreError::TransientBackendError("timeout".into()).is_retriable());
        assert!(!EventStoreError::PermanentBackendError("schema".into()).is_retriable());
        assert!(!EventStoreError::BufferFullError.is_retriable());
    }

    #[test]
    fn metrics_as_map_contains_all_fields() {
        let metrics = BackendMetrics {
            events_committed: 10,
            events_read: 5,
            flush_count: 2,
            flush_retries: 1,
            concurrency_conflicts: 0,
            buffer_depth: 3,
        };
        let map = metrics.as_map();
        assert_eq!(map.get("events_committed"), Some(&10));
        assert_eq!(map.get("buffer_depth"), Some(&3));
        assert_eq!(map.len(), 6);
    }
}
