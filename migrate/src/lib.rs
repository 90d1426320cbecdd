//! Backend factory shared by the migration admin binary and its tests.
//!
//! This is the one crate in the workspace that legitimately depends on both
//! concrete backend implementations: everything else either stays
//! backend-agnostic (`core`) or implements exactly one backend (`memory`,
//! `postgres`).

use event_store_core::config::{BackendKind, EventStoreConfig};
use event_store_core::event_store::EventStoreBackend;
use event_store_memory::InMemoryBackend;
use event_store_postgres::PostgresBackend;
use std::sync::Arc;

/// Construct the concrete backend named by `config.backend`, without
/// connecting it. Call [`EventStoreBackend::initialize`] before using it.
///
/// # Panics
///
/// Panics if `config.backend` is [`BackendKind::Sql`] and `config.dsn` is
/// `None` (the same precondition [`PostgresBackend::new`] enforces).
#[must_use]
pub fn build_backend(config: &EventStoreConfig) -> Arc<dyn EventStoreBackend> {
    match config.backend {
        BackendKind::Memory => Arc::new(InMemoryBackend::new(config)),
        BackendKind::Sql => Arc::new(PostgresBackend::new(config)),
    }
}
