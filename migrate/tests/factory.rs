#![allow(clippy::expect_used)]

use event_store_core::config::EventStoreConfig;
use event_store_core::event::Event;
use event_store_core::event_store::EventStoreBackend;
use event_store_core::migrator::Migrator;
use event_store_core::stream::{StreamId, Version};
use event_store_migrate::build_backend;
use serde_json::json;

#[tokio::test]
async fn migrates_between_two_factory_built_memory_backends() {
    let source = build_backend(&EventStoreConfig::memory());
    let destination = build_backend(&EventStoreConfig::memory());
    source.initialize().await.expect("source should initialize");
    destination.initialize().await.expect("destination should initialize");

    for i in 0..3 {
        source
            .append_event(Event::new(
                StreamId::new("order-1"),
                "Tagged".to_string(),
                json!({ "i": i }),
                Version::new(i),
                None,
            ))
            .await
            .expect("append should succeed");
    }

    let migrator = Migrator::new(source.clone(), destination.clone());
    let report = migrator.migrate().await.expect("migrate should succeed");
    assert_eq!(report.migrated, 1);
    assert!(report.is_success());

    let migrated = destination
        .get_stream(StreamId::new("order-1"), Version::new(0), None)
        .await
        .expect("get_stream should succeed");
    assert_eq!(migrated.len(), 3);

    source.close().await.expect("close should succeed");
    destination.close().await.expect("close should succeed");
}
