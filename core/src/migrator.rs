//! One-shot, restartable migration between two backend implementations.
//!
//! [`Migrator::migrate`] streams every stream's full event sequence from a
//! source backend into a destination backend, skipping events the
//! destination already has and committing each stream's remaining events
//! in a single atomic call. Re-running it after a partial failure resumes
//! exactly where it left off — no stream is ever left half-migrated.

use crate::event::Event;
use crate::event_store::{EventStoreBackend, EventStoreError};
use crate::stream::{StreamId, Version};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// The outcome of migrating one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The destination was already fully caught up; nothing to do.
    AlreadyUpToDate,
    /// `count` new events were committed to the destination.
    Migrated {
        /// Number of events newly committed.
        count: usize,
    },
    /// The source and destination diverged on an already-migrated prefix.
    Failed {
        /// The error describing the divergence or backend failure.
        error: EventStoreError,
    },
}

/// Aggregate report produced by a [`Migrator::migrate`] run.
#[derive(Debug, Clone, Default)]
pub struct MigrationReport {
    /// Streams that had new events committed.
    pub migrated: usize,
    /// Streams that were already fully caught up.
    pub skipped: usize,
    /// Streams that failed, with their stream id and error.
    pub failed: Vec<(StreamId, EventStoreError)>,
}

impl MigrationReport {
    /// Whether every stream in this run succeeded (migrated or skipped).
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Streams every event from `source` into `destination`, stream by stream,
/// idempotently.
pub struct Migrator {
    source: Arc<dyn EventStoreBackend>,
    destination: Arc<dyn EventStoreBackend>,
}

impl Migrator {
    /// Construct a migrator moving events from `source` to `destination`.
    #[must_use]
    pub const fn new(source: Arc<dyn EventStoreBackend>, destination: Arc<dyn EventStoreBackend>) -> Self {
        Self { source, destination }
    }

    /// Run the migration to completion, stream by stream.
    ///
    /// Restartable: streams already fully present in the destination are
    /// reported [`StreamOutcome::AlreadyUpToDate`] and skipped; a prior
    /// partial run's remaining streams pick up from their last committed
    /// destination version.
    ///
    /// # Errors
    ///
    /// Returns an error only if enumerating the source's streams itself
    /// fails; per-stream failures are aggregated into the returned
    /// [`MigrationReport`] instead of aborting the whole run.
    #[instrument(skip(self))]
    pub async fn migrate(&self) -> Result<MigrationReport, EventStoreError> {
        let stream_ids = self.source.list_stream_ids().await?;
        let mut report = MigrationReport::default();

        for stream_id in stream_ids {
            match self.migrate_stream(&stream_id).await {
                StreamOutcome::AlreadyUpToDate => report.skipped += 1,
                StreamOutcome::Migrated { count } => {
                    info!(%stream_id, count, "migrated stream");
                    report.migrated += 1;
                }
                StreamOutcome::Failed { error } => {
                    warn!(%stream_id, %error, "stream migration failed");
                    report.failed.push((stream_id, error));
                }
            }
        }

        Ok(report)
    }

    async fn migrate_stream(&self, stream_id: &StreamId) -> StreamOutcome {
        let source_events = match self.source.get_stream(stream_id.clone(), Version::new(0), None).await {
            Ok(events) => events,
            Err(error) => return StreamOutcome::Failed { error },
        };
        if source_events.is_empty() {
            return StreamOutcome::AlreadyUpToDate;
        }

        let destination_events = match self
            .destination
            .get_stream(stream_id.clone(), Version::new(0), None)
            .await
        {
            Ok(events) => events,
            Err(error) => return StreamOutcome::Failed { error },
        };

        if let Err(error) = verify_prefix_matches(stream_id, &source_events, &destination_events) {
            return StreamOutcome::Failed { error };
        }

        let remaining: Vec<Event> = source_events
            .into_iter()
            .skip(destination_events.len())
            .collect();

        if remaining.is_empty() {
            return StreamOutcome::AlreadyUpToDate;
        }

        let count = remaining.len();
        match self
            .destination
            .write_stream_events(stream_id.clone(), remaining)
            .await
        {
            Ok(_version) => StreamOutcome::Migrated { count },
            Err(error) => StreamOutcome::Failed { error },
        }
    }
}

/// Verify that every event the destination already has for this stream
/// matches the corresponding source event by `event_id`.
fn verify_prefix_matches(
    stream_id: &StreamId,
    source_events: &[Event],
    destination_events: &[Event],
) -> Result<(), EventStoreError> {
    for (source_event, destination_event) in source_events.iter().zip(destination_events.iter()) {
        if source_event.event_id() != destination_event.event_id() {
            return Err(EventStoreError::MigrationConsistencyError {
                stream_id: stream_id.clone(),
                reason: format!(
                    "destination version {} has event_id {} but source has {}",
                    destination_event.version(),
                    destination_event.event_id(),
                    source_event.event_id(),
                ),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event as Ev;
    use crate::event_store::BoxFuture;
    use crate::event_store::BackendMetrics;
    use crate::stream::Version as V;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    struct FakeBackend {
        streams: StdMutex<HashMap<StreamId, Vec<Ev>>>,
    }

    impl FakeBackend {
        fn new() -> Self {
            Self {
                streams: StdMutex::new(HashMap::new()),
            }
        }

        fn seed(&self, stream_id: &str, events: Vec<Ev>) {
            self.streams
                .lock()
                .unwrap()
                .insert(StreamId::new(stream_id), events);
        }
    }

    impl EventStoreBackend for FakeBackend {
        fn append_event(&self, event: Ev) -> BoxFuture<'_, Result<Version, EventStoreError>> {
            Box::pin(async move {
                let version = event.version();
                self.streams
                    .lock()
                    .unwrap()
                    .entry(event.stream_id().clone())
                    .or_default()
                    .push(event);
                Ok(version)
            })
        }

        fn get_stream(
            &self,
            stream_id: StreamId,
            from_version: Version,
            to_version: Option<Version>,
        ) -> BoxFuture<'_, Result<Vec<Ev>, EventStoreError>> {
            Box::pin(async move {
                let streams = self.streams.lock().unwrap();
                let events = streams.get(&stream_id).cloned().unwrap_or_default();
                Ok(events
                    .into_iter()
                    .filter(|e| e.version() >= from_version && to_version.is_none_or(|to| e.version() <= to))
                    .collect())
            })
        }

        fn get_events_by_type(
            &self,
            _event_type: String,
            _since: Option<chrono::DateTime<chrono::Utc>>,
        ) -> BoxFuture<'_, Result<Vec<Ev>, EventStoreError>> {
            Box::pin(async { Ok(Vec::new()) })
        }

        fn write_stream_events(
            &self,
            stream_id: StreamId,
            events: Vec<Ev>,
        ) -> BoxFuture<'_, Result<Version, EventStoreError>> {
            Box::pin(async move {
                let mut streams = self.streams.lock().unwrap();
                let entry = streams.entry(stream_id).or_default();
                let version = events.last().map_or(V::new(0), Ev::version);
                entry.extend(events);
                Ok(version)
            })
        }

        fn list_stream_ids(&self) -> BoxFuture<'_, Result<Vec<StreamId>, EventStoreError>> {
            Box::pin(async move { Ok(self.streams.lock().unwrap().keys().cloned().collect()) })
        }

        fn initialize(&self) -> BoxFuture<'_, Result<(), EventStoreError>> {
            Box::pin(async { Ok(()) })
        }

        fn close(&self) -> BoxFuture<'_, Result<(), EventStoreError>> {
            Box::pin(async { Ok(()) })
        }

        fn metrics(&self) -> BackendMetrics {
            BackendMetrics::default()
        }
    }

    fn make_events(stream: &str, n: u64) -> Vec<Ev> {
        (0..n)
            .map(|i| Ev::new(StreamId::new(stream), "Tagged".to_string(), json!({ "i": i }), V::new(i), None))
            .collect()
    }

    #[tokio::test]
    async fn migrates_a_fresh_stream_fully() {
        let source = Arc::new(FakeBackend::new());
        let destination = Arc::new(FakeBackend::new());
        source.seed("s", make_events("s", 5));

        let migrator = Migrator::new(source.clone(), destination.clone());
        let report = migrator.migrate().await.expect("migrate should succeed");

        assert_eq!(report.migrated, 1);
        assert_eq!(report.skipped, 0);
        assert!(report.is_success());

        let migrated = destination
            .get_stream(StreamId::new("s"), Version::new(0), None)
            .await
            .unwrap();
        assert_eq!(migrated.len(), 5);
    }

    #[tokio::test]
    async fn resumes_a_partially_migrated_stream() {
        let source = Arc::new(FakeBackend::new());
        let destination = Arc::new(FakeBackend::new());
        let all_events = make_events("m", 200);
        source.seed("m", all_events.clone());
        destination.seed("m", all_events[..100].to_vec());

        let migrator = Migrator::new(source.clone(), destination.clone());
        let report = migrator.migrate().await.expect("migrate should succeed");

        assert_eq!(report.migrated, 1);
        let migrated = destination
            .get_stream(StreamId::new("m"), Version::new(0), None)
            .await
            .unwrap();
        assert_eq!(migrated.len(), 200);
    }

    #[tokio::test]
    async fn running_migrate_twice_is_a_no_op_the_second_time() {
        let source = Arc::new(FakeBackend::new());
        let destination = Arc::new(FakeBackend::new());
        source.seed("s", make_events("s", 10));

        let migrator = Migrator::new(source.clone(), destination.clone());
        migrator.migrate().await.unwrap();
        let second = migrator.migrate().await.unwrap();

        assert_eq!(second.migrated, 0);
        assert_eq!(second.skipped, 1);
    }

    #[tokio::test]
    async fn diverging_prefix_fails_with_consistency_error() {
        let source = Arc::new(FakeBackend::new());
        let destination = Arc::new(FakeBackend::new());
        source.seed("s", make_events("s", 5));
        let mut tampered = make_events("s", 1);
        tampered[0] = Ev::new(StreamId::new("s"), "Tagged".to_string(), json!({ "i": 999 }), V::new(0), None);
        destination.seed("s", tampered);

        let migrator = Migrator::new(source, destination);
        let report = migrator.migrate().await.unwrap();

        assert_eq!(report.failed.len(), 1);
        assert!(matches!(
            report.failed[0].1,
            EventStoreError::MigrationConsistencyError { .. }
        ));
    }
}
