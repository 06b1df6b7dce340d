//! Metadata scraped from worker stderr.

use std::time::Duration;

use engine_broker::WorkerState;

use crate::fixture::{start_pool, wait_until};

#[tokio::test]
async fn test_banners_populate_metadata() {
    let t = start_pool(&["easy", "hard"]);

    let loaded = wait_until(Duration::from_secs(5), || {
        t.pool
            .metadata("hard")
            .is_some_and(|m| m.model_version.is_some() && m.model_name.is_some())
    })
    .await;
    assert!(loaded, "metadata never appeared");

    let meta = t.pool.metadata("hard").unwrap();
    assert_eq!(meta.engine_version.as_deref(), Some("0.1.0"));
    assert_eq!(meta.backend.as_deref(), Some("Mock"));
    assert_eq!(meta.model_name.as_deref(), Some("hard-b6c96.bin"));
    assert_eq!(meta.model_version, Some(11));

    assert!(t.pool.metadata("nonexistent").is_none());

    t.pool.shutdown_all().await;
}

#[tokio::test]
async fn test_status_serializes_for_reporting() {
    let t = start_pool(&["normal"]);
    assert!(
        wait_until(Duration::from_secs(5), || {
            t.pool.metadata("normal").is_some_and(|m| m.model_name.is_some())
        })
        .await
    );

    let statuses = t.pool.statuses();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].state, WorkerState::Running);

    let value = serde_json::to_value(&statuses[0]).unwrap();
    assert_eq!(value["name"], "normal");
    assert_eq!(value["state"], "Running");
    assert_eq!(value["generation"], 1);
    assert_eq!(value["metadata"]["modelName"], "normal-b6c96.bin");
    assert!(value["pid"].is_u64());
    assert!(value["lastExit"].is_null());

    t.pool.shutdown_all().await;
}
