//! # Event Store Core
//!
//! Core types and traits for a durable, append-only event store with
//! per-stream optimistic concurrency control.
//!
//! ## Core Concepts
//!
//! - [`Event`](event::Event): an immutable fact recorded to a stream.
//! - [`StreamId`](stream::StreamId) / [`Version`](stream::Version): stream
//!   identity and per-stream position.
//! - [`EventStoreBackend`](event_store::EventStoreBackend): the adapter
//!   contract implemented by each storage backend (in-memory, SQL).
//! - [`WriteBuffer`](write_buffer::WriteBuffer): the buffered, batched
//!   append/flush/retry pipeline shared by every backend.
//! - [`Migrator`](migrator::Migrator): moves a backend's full history to
//!   another backend, restartably.
//!
//! ## Architecture Principles
//!
//! - One algorithm, not two: the buffer/flush/retry pipeline is written
//!   once here and reused by every backend via the [`write_buffer::StreamWriter`]
//!   seam, rather than duplicated per backend.
//! - The backend is a dumb adapter: concurrency validation
//!   ([`version_manager`]) and lock-key derivation ([`lock_keys`]) live here,
//!   independent of any one backend's storage mechanics.
//! - Explicit, typed errors: every fallible operation returns
//!   [`event_store::EventStoreError`], classified as retriable or not.
//!
//! ## Example
//!
//! ```
//! use event_store_core::event::Event;
//! use event_store_core::stream::{StreamId, Version};
//! use event_store_core::version_manager;
//! use serde_json::json;
//!
//! let stream_id = StreamId::new("order-123");
//! let next = version_manager::next_version(None);
//! let event = Event::new(
//!     stream_id,
//!     "OrderPlaced".to_string(),
//!     json!({ "total": 42.5 }),
//!     next,
//!     None,
//! );
//! assert_eq!(event.version(), Version::new(0));
//! ```

pub mod config;
pub mod event;
pub mod event_store;
pub mod lock_keys;
pub mod migrator;
pub mod stream;
pub mod version_manager;
pub mod write_buffer;

// Re-export commonly used types for downstream crates.
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
