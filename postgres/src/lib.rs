//! Durable, `PostgreSQL`-backed event store backend.
//!
//! `PostgresBackend` persists events into a single `events` table with a
//! `UNIQUE(stream_id, version)` constraint, fronted by the shared
//! [`WriteBuffer`](event_store_core::write_buffer::WriteBuffer) flush
//! pipeline. Concurrent writers to the same stream are serialized with a
//! pair of 32-bit transactional advisory-lock keys
//! ([`event_store_core::lock_keys`]) acquired at the start of each
//! `write_stream_events` transaction; the unique constraint is the backstop
//! if two processes somehow race around the advisory lock.
//!
//! The schema ships as an embedded `sqlx` migration under `migrations/` —
//! the backend cannot function without its own table, so the DDL that
//! defines its contract travels with the crate.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use event_store_core::config::EventStoreConfig;
use event_store_core::event::Event;
use event_store_core::event_store::{BackendMetrics, BoxFuture, EventStoreBackend, EventStoreError};
use event_store_core::lock_keys::stream_lock_keys;
use event_store_core::stream::{StreamId, Version};
use event_store_core::version_manager;
use event_store_core::write_buffer::{RetryPolicy, StreamWriter, WriteBuffer};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use uuid::Uuid;

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

/// Classify a `sqlx` error as retriable (transient) or not (permanent).
///
/// A unique-constraint violation on `(stream_id, version)` at insert time
/// is deliberately classified as transient rather than mapped directly to
/// `ConcurrencyConflict`: it only happens when the advisory lock failed to
/// serialize two writers, which is itself a transient condition, and
/// reinserting the batch makes the retry redo the version check up front,
/// which then raises the precise, correctly-attributed conflict.
fn classify_sqlx_error(error: &sqlx::Error) -> EventStoreError {
    match error {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::WorkerCrashed => EventStoreError::TransientBackendError(error.to_string()),
        sqlx::Error::Database(db_error) if db_error.is_unique_violation() => {
            EventStoreError::TransientBackendError(error.to_string())
        }
        other => EventStoreError::PermanentBackendError(other.to_string()),
    }
}

/// Run a single `sqlx` query future against the per-statement deadline,
/// mapping an elapsed timeout to a retriable error and any `sqlx` error
/// through [`classify_sqlx_error`].
async fn with_timeout<T>(duration: Duration, fut: impl Future<Output = Result<T, sqlx::Error>>) -> Result<T, EventStoreError> {
    match tokio::time::timeout(duration, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(classify_sqlx_error(&error)),
        Err(_elapsed) => Err(EventStoreError::TransientBackendError(
            "query exceeded the configured query_timeout".to_string(),
        )),
    }
}

/// The raw, pool-backed storage layer. Implements [`StreamWriter`] so the
/// shared flush pipeline can commit into it without knowing anything about
/// backend lifecycle or buffering.
struct PostgresStorage {
    pool: OnceCell<PgPool>,
    query_timeout: Duration,
    counters: Counters,
}

impl PostgresStorage {
    fn new(query_timeout: Duration) -> Self {
        Self {
            pool: OnceCell::new(),
            query_timeout,
            counters: Counters::default(),
        }
    }

    fn pool(&self) -> Result<&PgPool, EventStoreError> {
        self.pool
            .get()
            .ok_or_else(|| EventStoreError::BackendNotReadyError("postgres pool not connected".to_string()))
    }

    async fn select_stream(
        &self,
        stream_id: &StreamId,
        from_version: Version,
        to_version: Option<Version>,
    ) -> Result<Vec<Event>, EventStoreError> {
        let pool = self.pool()?;
        let from = i64::try_from(from_version.value())
            .map_err(|e| EventStoreError::PermanentBackendError(e.to_string()))?;
        let to = to_version
            .map(|v| i64::try_from(v.value()).map_err(|e| EventStoreError::PermanentBackendError(e.to_string())))
            .transpose()?;

        let rows = with_timeout(
            self.query_timeout,
            sqlx::query(
                r"
                SELECT event_id, stream_id, event_type, data, version, timestamp, correlation_id
                FROM events
                WHERE stream_id = $1 AND version >= $2 AND ($3::bigint IS NULL OR version <= $3)
                ORDER BY version ASC
                ",
            )
            .bind(stream_id.as_str())
            .bind(from)
            .bind(to)
            .fetch_all(pool),
        )
        .await?;

        let events = rows.iter().map(row_to_event).collect::<Result<Vec<_>, _>>()?;
        self.counters
            .events_read
            .fetch_add(events.len() as u64, Ordering::Relaxed);
        Ok(events)
    }
}

fn row_to_event(row: &sqlx::postgres::PgRow) -> Result<Event, EventStoreError> {
    let event_id: Uuid = row.try_get("event_id").map_err(|e| EventStoreError::PermanentBackendError(e.to_string()))?;
    let stream_id: String = row.try_get("stream_id").map_err(|e| EventStoreError::PermanentBackendError(e.to_string()))?;
    let event_type: String = row.try_get("event_type").map_err(|e| EventStoreError::PermanentBackendError(e.to_string()))?;
    let data: serde_json::Value = row.try_get("data").map_err(|e| EventStoreError::PermanentBackendError(e.to_string()))?;
    let version: i64 = row.try_get("version").map_err(|e| EventStoreError::PermanentBackendError(e.to_string()))?;
    let timestamp: DateTime<Utc> = row.try_get("timestamp").map_err(|e| EventStoreError::PermanentBackendError(e.to_string()))?;
    let correlation_id: Option<String> =
        row.try_get("correlation_id").map_err(|e| EventStoreError::PermanentBackendError(e.to_string()))?;

    let version = Version::new(
        u64::try_from(version).map_err(|e| EventStoreError::PermanentBackendError(e.to_string()))?,
    );

    Ok(Event::with_metadata(
        event_id,
        StreamId::new(stream_id),
        event_type,
        data,
        version,
        timestamp,
        correlation_id,
    ))
}

impl StreamWriter for PostgresStorage {
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

            let pool = self.pool()?;
            let mut tx = pool.begin().await.map_err(|e| classify_sqlx_error(&e))?;

            let (high_key, low_key) = stream_lock_keys(stream_id.as_str());
            with_timeout(
                self.query_timeout,
                sqlx::query("SELECT pg_advisory_xact_lock($1, $2)")
                    .bind(high_key)
                    .bind(low_key)
                    .execute(&mut *tx),
            )
            .await?;

            let max_version: Option<i64> = with_timeout(
                self.query_timeout,
                sqlx::query_scalar("SELECT MAX(version) FROM events WHERE stream_id = $1")
                    .bind(stream_id.as_str())
                    .fetch_one(&mut *tx),
            )
            .await?;

            let last_committed = max_version
                .map(|v| u64::try_from(v).map(Version::new))
                .transpose()
                .map_err(|e: std::num::TryFromIntError| EventStoreError::PermanentBackendError(e.to_string()))?;
            let expected = version_manager::next_version(last_committed);

            if let Err(expected) = version_manager::validate(first.version(), last_committed) {
                self.counters.concurrency_conflicts.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("event_store_concurrency_conflicts_total", "backend" => "sql").increment(1);
                return Err(EventStoreError::ConcurrencyConflict {
                    stream_id,
                    expected,
                    actual: first.version(),
                });
            }
            debug_assert_eq!(expected, first.version());

            let mut builder = sqlx::QueryBuilder::new(
                "INSERT INTO events (event_id, stream_id, event_type, data, version, timestamp, correlation_id) ",
            );
            builder.push_values(&events, |mut row, event| {
                let version = i64::try_from(event.version().value()).unwrap_or(i64::MAX);
                row.push_bind(event.event_id())
                    .push_bind(event.stream_id().as_str())
                    .push_bind(event.event_type())
                    .push_bind(event.data())
                    .push_bind(version)
                    .push_bind(event.timestamp())
                    .push_bind(event.correlation_id());
            });
            with_timeout(self.query_timeout, builder.build().execute(&mut *tx)).await?;

            with_timeout(self.query_timeout, tx.commit()).await?;

            let committed_version = events.last().map_or(expected, Event::version);
            self.counters
                .events_committed
                .fetch_add(events.len() as u64, Ordering::Relaxed);
            metrics::counter!("event_store_events_committed_total", "backend" => "sql")
                .increment(events.len() as u64);
            Ok(committed_version)
        })
    }
}

/// Durable, `PostgreSQL`-backed [`EventStoreBackend`].
pub struct PostgresBackend {
    lifecycle: RwLock<LifecycleState>,
    dsn: String,
    pool_min: u32,
    pool_max: u32,
    storage: Arc<PostgresStorage>,
    buffer: Arc<WriteBuffer<PostgresStorage>>,
    flush_interval: Duration,
    shutdown_deadline: Duration,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
}

impl PostgresBackend {
    /// Construct a new Postgres backend from `config`.
    ///
    /// Does not connect to the database or run migrations — call
    /// [`EventStoreBackend::initialize`] for that.
    ///
    /// # Panics
    ///
    /// Panics if `config.dsn` is `None`; the SQL backend requires a
    /// connection string.
    #[must_use]
    #[allow(clippy::expect_used)] // documented precondition, not a recoverable runtime error
    pub fn new(config: &EventStoreConfig) -> Self {
        let dsn = config
            .dsn
            .clone()
            .expect("EventStoreConfig::dsn must be set for the SQL backend");
        let storage = Arc::new(PostgresStorage::new(config.query_timeout));
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
            dsn,
            pool_min: config.pool_min,
            pool_max: config.pool_max,
            storage,
            buffer,
            flush_interval: config.flush_interval,
            shutdown_deadline: config.shutdown_deadline,
            shutdown_tx,
            shutdown_rx,
            worker_handle: Mutex::new(None),
        }
    }

    /// Construct a backend directly from an already-connected pool, skipping
    /// DSN-based connection. Migrations still run during
    /// [`EventStoreBackend::initialize`].
    ///
    /// Used by the `testcontainers`-backed integration tests, which already
    /// hold a connected pool and would otherwise have to round-trip the
    /// container's dynamic port back into a DSN string just to hand it to
    /// [`PostgresBackend::new`].
    #[must_use]
    pub fn from_pool(pool: PgPool, config: &EventStoreConfig) -> Self {
        let backend = Self::new(&EventStoreConfig { dsn: Some(String::new()), ..config.clone() });
        let _ignored = backend.storage.pool.set(pool);
        backend
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

impl EventStoreBackend for PostgresBackend {
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
            self.storage.select_stream(&stream_id, from_version, to_version).await
        })
    }

    fn get_events_by_type(
        &self,
        event_type: String,
        since: Option<DateTime<Utc>>,
    ) -> BoxFuture<'_, Result<Vec<Event>, EventStoreError>> {
        Box::pin(async move {
            self.require_ready().await?;
            let pool = self.storage.pool()?;
            let rows = with_timeout(
                self.storage.query_timeout,
                sqlx::query(
                    r"
                    SELECT event_id, stream_id, event_type, data, version, timestamp, correlation_id
                    FROM events
                    WHERE event_type = $1 AND ($2::timestamptz IS NULL OR timestamp >= $2)
                    ORDER BY timestamp ASC
                    ",
                )
                .bind(&event_type)
                .bind(since)
                .fetch_all(pool),
            )
            .await?;

            let events = rows.iter().map(row_to_event).collect::<Result<Vec<_>, _>>()?;
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
            let pool = self.storage.pool()?;
            let ids: Vec<String> = with_timeout(
                self.storage.query_timeout,
                sqlx::query_scalar("SELECT DISTINCT stream_id FROM events").fetch_all(pool),
            )
            .await?;
            Ok(ids.into_iter().map(StreamId::new).collect())
        })
    }

    #[instrument(skip(self))]
    fn initialize(&self) -> BoxFuture<'_, Result<(), EventStoreError>> {
        Box::pin(async move {
            *self.lifecycle.write().await = LifecycleState::Initializing;

            if self.storage.pool.get().is_none() {
                let pool = PgPoolOptions::new()
                    .min_connections(self.pool_min)
                    .max_connections(self.pool_max)
                    .acquire_timeout(self.storage.query_timeout)
                    .connect(&self.dsn)
                    .await
                    .map_err(|e| EventStoreError::PermanentBackendError(e.to_string()))?;
                self.storage
                    .pool
                    .set(pool)
                    .map_err(|_| EventStoreError::PermanentBackendError("pool already initialized".to_string()))?;
            }

            sqlx::migrate!("./migrations")
                .run(self.storage.pool()?)
                .await
                .map_err(|e| EventStoreError::PermanentBackendError(e.to_string()))?;

            let buffer = self.buffer.clone();
            let flush_interval = self.flush_interval;
            let shutdown_rx = self.shutdown_rx.clone();
            let handle = tokio::spawn(async move {
                buffer.run_flush_worker(flush_interval, shutdown_rx).await;
            });
            *self.worker_handle.lock().await = Some(handle);

            *self.lifecycle.write().await = LifecycleState::Ready;
            info!("postgres backend ready");
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

            if let Some(pool) = self.storage.pool.get() {
                pool.close().await;
            }

            *self.lifecycle.write().await = LifecycleState::Closed;
            info!("postgres backend closed");
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

    #[test]
    fn classify_pool_timeout_as_transient() {
        let error = classify_sqlx_error(&sqlx::Error::PoolTimedOut);
        assert!(error.is_retriable());
    }

    #[test]
    fn classify_row_not_found_as_permanent() {
        let error = classify_sqlx_error(&sqlx::Error::RowNotFound);
        assert!(!error.is_retriable());
    }

    #[test]
    #[should_panic(expected = "dsn")]
    fn new_panics_without_dsn() {
        let _ = PostgresBackend::new(&EventStoreConfig::memory());
    }
}
