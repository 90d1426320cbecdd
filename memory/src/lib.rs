//! Non-durable, single-process in-memory event store backend.
//!
//! `InMemoryBackend` stores every stream as a `Vec<Event>` guarded by one
//! exclusive lock, fronted by the shared [`WriteBuffer`] flush pipeline.
//! It exists for tests and local development — nothing here survives a
//! process restart.

use chrono::{DateTime, Utc};
use event_store_core::config::EventStoreConfig;
use event_store_core::event::Event;
use event_store_core::event_store::{BackendMetrics, BoxFuture, EventStoreBackend, EventStoreError};
use event_store_core::stream::{StreamId, Version};
use event_store_core::version_manager;
use event_store_core::write_buffer::{RetryPolicy, StreamWriter, WriteBuffer};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

/// Lifecycle state of a backend instance, per the store's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Uninitialized,
    Initializing,
    Ready,
    Closing,
    Closed,
}

#[derive(Default)]
struct Counters {
    events_committed: AtomicU64,
    events_read: AtomicU64,
    concurrency_conflicts: AtomicU64,
}

/// The raw, lock-guarded map of streams. Implements [`StreamWriter`] so the
/// shared flush pipeline can commit into it without knowing anything about
/// backend lifecycle or buffering.
struct InMemoryStorage {
    streams: Mutex<HashMap<StreamId, Vec<Event>>>,
    counters: Counters,
}

impl InMemoryStorage {
    fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }
}

impl StreamWriter for InMemoryStorage {
    #[instrument(skip(self, events), fields(stream_id = %stream_id))]
    fn write_stream_events(
        &self,
        stream_id: StreamId,
        events: Vec<Event>,
    ) -> BoxFuture<'_, Result<Version, EventStoreError>> {
        Box::pin(async move {
            let Some(first) = events.first() else {
                return Err(EventStoreError::PermanentBackendError(
                    "cannot commit an empty batch".to_string(),
                ));
            };

            let mut streams = self.streams.lock().await;
            let entry = streams.entry(stream_id.clone()).or_default();
            let last_committed = entry.last().map(|e| e.version());
            let expected = version_manager::next_version(last_committed);

            if first.version() != expected {
                self.counters.concurrency_conflicts.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("event_store_concurrency_conflicts_total").increment(1);
                return Err(EventStoreError::ConcurrencyConflict {
                    stream_id,
                    expected,
                    actual: first.version(),
                });
            }

            let committed_version = events
                .last()
                .map_or(expected, Event::version);
            self.counters
                .events_committed
                .fetch_add(events.len() as u64, Ordering::Relaxed);
            metrics::counter!("event_store_events_committed_total", "backend" => "memory")
                .increment(events.len() as u64);
            entry.extend(events);
            Ok(committed_version)
        })
    }
}

/// Non-durable, single-process, `HashMap`-backed [`EventStoreBackend`].
pub struct InMemoryBackend {
    lifecycle: RwLock<LifecycleState>,
    storage: Arc<InMemoryStorage>,
    buffer: Arc<WriteBuffer<InMemoryStorage>>,
    flush_interval: Duration,
    shutdown_deadline: Duration,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
}

impl InMemoryBackend {
    /// Construct a new in-memory backend from `config`. Does not start the
    /// background flush worker — call [`EventStoreBackend::initialize`] for
    /// that.
    #[must_use]
    pub fn new(config: &EventStoreConfig) -> Self {
        let storage = Arc::new(InMemoryStorage::new());
        let buffer = Arc::new(WriteBuffer::new(
            storage.clone(),
            config.buffer_max_entries,
            config.buffer_max_bytes,
            config.append_timeout,
            RetryPolicy::default(),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            lifecycle: RwLock::new(LifecycleState::Uninitialized),
            storage,
            buffer,
            flush_interval: config.flush_interval,
            shutdown_deadline: config.shutdown_deadline,
            shutdown_tx,
            shutdown_rx,
            worker_handle: Mutex::new(None),
        }
    }

    async fn require_ready(&self) -> Result<(), EventStoreError> {
        if *self.lifecycle.read().await == LifecycleState::Ready {
            Ok(())
        } else {
            Err(EventStoreError::BackendNotReadyError(format!(
                "backend is {:?}",
                *self.lifecycle.read().await
            )))
        }
    }
}

impl EventStoreBackend for InMemoryBackend {
    fn append_event(&self, event: Event) -> BoxFuture<'_, Result<Version, EventStoreError>> {
        Box::pin(async move {
            self.require_ready().await?;
            self.buffer.append(event).await
        })
    }

    fn get_stream(
        &self,
        stream_id: StreamId,
        from_version: Version,
        to_version: Option<Version>,
    ) -> BoxFuture<'_, Result<Vec<Event>, EventStoreError>> {
        Box::pin(async move {
            self.require_ready().await?;
            let streams = self.storage.streams.lock().await;
            let events = streams
                .get(&stream_id)
                .map(|events| {
                    events
                        .iter()
                        .filter(|event| {
                            event.version() >= from_version
                                && to_version.is_none_or(|to| event.version() <= to)
                        })
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            self.storage
                .counters
                .events_read
                .fetch_add(events.len() as u64, Ordering::Relaxed);
            Ok(events)
        })
    }

    fn get_events_by_type(
        &self,
        event_type: String,
        since: Option<DateTime<Utc>>,
    ) -> BoxFuture<'_, Result<Vec<Event>, EventStoreError>> {
        Box::pin(async move {
            self.require_ready().await?;
            let streams = self.storage.streams.lock().await;
            let events: Vec<Event> = streams
                .values()
                .flatten()
                .filter(|event| event.event_type() == event_type)
                .filter(|event| since.is_none_or(|since| event.timestamp() >= since))
                .cloned()
                .collect();
            self.storage
                .counters
                .events_read
                .fetch_add(events.len() as u64, Ordering::Relaxed);
            Ok(events)
        })
    }

    fn write_stream_events(
        &self,
        stream_id: StreamId,
        events: Vec<Event>,
    ) -> BoxFuture<'_, Result<Version, EventStoreError>> {
        Box::pin(async move {
            self.require_ready().await?;
            self.storage.write_stream_events(stream_id, events).await
        })
    }

    fn list_stream_ids(&self) -> BoxFuture<'_, Result<Vec<StreamId>, EventStoreError>> {
        Box::pin(async move {
            self.require_ready().await?;
            let streams = self.storage.streams.lock().await;
            Ok(streams.keys().cloned().collect())
        })
    }

    #[instrument(skip(self))]
    fn initialize(&self) -> BoxFuture<'_, Result<(), EventStoreError>> {
        Box::pin(async move {
            *self.lifecycle.write().await = LifecycleState::Initializing;

            let buffer = self.buffer.clone();
            let flush_interval = self.flush_interval;
            let shutdown_rx = self.shutdown_rx.clone();
            let handle = tokio::spawn(async move {
                buffer.run_flush_worker(flush_interval, shutdown_rx).await;
            });
            *self.worker_handle.lock().await = Some(handle);

            *self.lifecycle.write().await = LifecycleState::Ready;
            info!("in-memory backend ready");
            Ok(())
        })
    }

    #[instrument(skip(self))]
    fn close(&self) -> BoxFuture<'_, Result<(), EventStoreError>> {
        Box::pin(async move {
            *self.lifecycle.write().await = LifecycleState::Closing;
            let _send_result = self.shutdown_tx.send(true);

            if let Some(handle) = self.worker_handle.lock().await.take() {
                let abort_handle = handle.abort_handle();
                if tokio::time::timeout(self.shutdown_deadline, handle).await.is_err() {
                    warn!("flush worker did not drain before shutdown deadline, aborting");
                    abort_handle.abort();
                    self.buffer.fail_remaining_with_shutdown().await;
                }
            }

            *self.lifecycle.write().await = LifecycleState::Closed;
            info!("in-memory backend closed");
            Ok(())
        })
    }

    fn metrics(&self) -> BackendMetrics {
        BackendMetrics {
            events_committed: self.storage.counters.events_committed.load(Ordering::Relaxed),
            events_read: self.storage.counters.events_read.load(Ordering::Relaxed),
            flush_count: self.buffer.flush_count(),
            flush_retries: self.buffer.flush_retries(),
            concurrency_conflicts: self.storage.counters.concurrency_conflicts.load(Ordering::Relaxed),
            buffer_depth: self.buffer.try_depth() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_event(stream: &str, version: u64, tag: &str) -> Event {
        Event::new(
            StreamId::new(stream),
            "Tagged".to_string(),
            json!({ "tag": tag }),
            Version::new(version),
            None,
        )
    }

    async fn ready_backend() -> InMemoryBackend {
        let backend = InMemoryBackend::new(&EventStoreConfig::memory());
        backend.initialize().await.expect("initialize should succeed");
        backend
    }

    #[tokio::test]
    async fn append_then_read_roundtrips_in_version_order() {
        let backend = ready_backend().await;
        for i in 0..5 {
            backend
                .append_event(sample_event("s", i, &i.to_string()))
                .await
                .expect("append should succeed");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let events = backend
            .get_stream(StreamId::new("s"), Version::new(0), None)
            .await
            .expect("get_stream should succeed");
        assert_eq!(events.len(), 5);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.version(), Version::new(i as u64));
        }
        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_stream_returns_empty_not_error() {
        let backend = ready_backend().await;
        let events = backend
            .get_stream(StreamId::new("missing"), Version::new(0), None)
            .await
            .expect("unknown streams return empty");
        assert!(events.is_empty());
        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn operations_before_initialize_fail_not_ready() {
        let backend = InMemoryBackend::new(&EventStoreConfig::memory());
        let result = backend.append_event(sample_event("s", 0, "A")).await;
        assert!(matches!(result, Err(EventStoreError::BackendNotReadyError(_))));
    }

    #[tokio::test]
    async fn concurrent_same_version_appends_only_one_wins() {
        let backend = Arc::new(ready_backend().await);
        let a = backend.clone();
        let b = backend.clone();

        let (r1, r2) = tokio::join!(
            a.storage.write_stream_events(StreamId::new("t"), vec![sample_event("t", 0, "A")]),
            b.storage.write_stream_events(StreamId::new("t"), vec![sample_event("t", 0, "B")]),
        );

        let successes = [&r1, &r2].into_iter().filter(|r| r.is_ok()).count();
        let conflicts = [&r1, &r2]
            .into_iter()
            .filter(|r| matches!(r, Err(EventStoreError::ConcurrencyConflict { .. })))
            .count();
        assert_eq!(successes, 1);
        assert_eq!(conflicts, 1);
        backend.close().await.unwrap();
    }
}
