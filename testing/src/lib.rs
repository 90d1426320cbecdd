//! Reusable test support for event store backends.
//!
//! [`conformance`] holds a backend-agnostic suite of assertions; the
//! in-memory and SQL backends each run it against their own `Arc<dyn
//! EventStoreBackend>` so the two implementations are checked against one
//! contract instead of duplicating test bodies.

pub mod conformance;
