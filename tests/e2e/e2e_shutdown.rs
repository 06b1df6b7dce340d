use std::sync::Arc;
use std::time::Duration;

use engine_broker::{Error, WorkerState};
use serde_json::json;

use crate::fixture::{start_pool, wait_until, RESPAWN_DELAY};

#[tokio::test]
async fn test_shutdown_rejects_pending_and_stays_down() {
    let t = start_pool(&["easy", "normal"]);

    let pool = Arc::clone(&t.pool);
    let pending = tokio::spawn(async move { pool.ask(Some("easy"), json!({"mockHang": true})).await });
    assert!(wait_until(Duration::from_secs(3), || t.pending("easy") == 1).await);

    t.pool.shutdown_all().await;

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::ShutDown(ref name) if name == "easy"), "got {:?}", err);

    for status in t.pool.statuses() {
        assert_eq!(status.state, WorkerState::ShutDown, "engine {}", status.name);
        assert!(status.pid.is_none());
        assert_eq!(status.requests.pending, 0);
    }

    // No respawn after shutdown.
    tokio::time::sleep(RESPAWN_DELAY * 3).await;
    assert!(t.pid("easy").is_none());
    assert!(t.pid("normal").is_none());

    let err = t.pool.ask(Some("normal"), json!({})).await.unwrap_err();
    assert!(matches!(err, Error::ShutDown(_)));
    assert!(!err.is_retryable());

    let supervisor = t.pool.engine("normal").unwrap().supervisor();
    assert!(matches!(supervisor.start(), Err(Error::ShutDown(_))));
}

#[tokio::test]
async fn test_shutdown_during_respawn_delay() {
    let t = start_pool(&["normal"]);
    let supervisor = t.pool.engine("normal").unwrap().supervisor().clone();

    let _ = t.pool.ask(None, json!({"mockCrash": true})).await;
    assert!(wait_until(Duration::from_secs(2), || supervisor.state() == WorkerState::Crashed).await);

    t.pool.shutdown_all().await;
    tokio::time::sleep(RESPAWN_DELAY * 3).await;

    assert_eq!(supervisor.state(), WorkerState::ShutDown);
    assert!(supervisor.pid().is_none());
}

#[tokio::test]
async fn test_shutdown_twice_is_harmless() {
    let t = start_pool(&["normal"]);
    t.pool.shutdown_all().await;
    t.pool.shutdown_all().await;
    assert_eq!(
        t.pool.engine("normal").unwrap().supervisor().state(),
        WorkerState::ShutDown
    );
}
