//! Event store configuration.
//!
//! A plain data struct, deliberately free of any env/file-loading logic —
//! parsing configuration from the process environment is the hosting
//! process's job, not this crate's.

use std::time::Duration;

/// Which backend implementation a [`EventStoreConfig`] selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Non-durable, single-process, `HashMap`-backed store.
    Memory,
    /// Durable, `PostgreSQL`-backed store.
    Sql,
}

/// Configuration recognized by the backend factory and the write buffer.
///
/// Every field maps directly to an entry in the configuration table the
/// store's external interface documents; there is no implicit default
/// source (no env vars, no config file) — callers construct this directly.
#[derive(Debug, Clone)]
pub struct EventStoreConfig {
    /// Which backend implementation to construct.
    pub backend: BackendKind,
    /// Connection string. Required when `backend` is [`BackendKind::Sql`].
    pub dsn: Option<String>,
    /// Minimum size of the database connection pool.
    pub pool_min: u32,
    /// Maximum size of the database connection pool.
    pub pool_max: u32,
    /// Flush trigger: buffer entry count high-water mark.
    pub buffer_max_entries: usize,
    /// Flush trigger: buffer estimated total byte size high-water mark.
    pub buffer_max_bytes: usize,
    /// Cadence of the timer-driven background flush.
    pub flush_interval: Duration,
    /// How long `append` suspends waiting for buffer space to free up
    /// before failing with `BufferFullError`.
    pub append_timeout: Duration,
    /// Per-statement deadline for backend queries.
    pub query_timeout: Duration,
    /// How long `close()` waits for the buffer to drain before cancelling.
    pub shutdown_deadline: Duration,
}

impl EventStoreConfig {
    /// A configuration for the in-memory backend with reasonable defaults
    /// for tests and local development.
    #[must_use]
    pub const fn memory() -> Self {
        Self {
            backend: BackendKind::Memory,
            dsn: None,
            pool_min: 0,
            pool_max: 0,
            buffer_max_entries: 1_000,
            buffer_max_bytes: 10 * 1024 * 1024,
            flush_interval: Duration::from_millis(100),
            append_timeout: Duration::from_secs(2),
            query_timeout: Duration::from_secs(5),
            shutdown_deadline: Duration::from_secs(5),
        }
    }

    /// A configuration for the SQL backend, given its connection string.
    #[must_use]
    pub const fn sql(dsn: String) -> Self {
        Self {
            backend: BackendKind::Sql,
            dsn: Some(dsn),
            pool_min: 1,
            pool_max: 10,
            buffer_max_entries: 1_000,
            buffer_max_bytes: 10 * 1024 * 1024,
            flush_interval: Duration::from_millis(100),
            append_timeout: Duration::from_secs(3),
            query_timeout: Duration::from_secs(5),
            shutdown_deadline: Duration::from_secs(10),
        }
    }
}
