//! Worker crashes: pending rejection, respawn, and the crash ceiling.

use std::sync::Arc;
use std::time::Duration;

use engine_broker::{Error, WorkerState};
use serde_json::json;

use crate::fixture::{start_pool, start_pool_with, wait_until, RESPAWN_DELAY};

#[tokio::test]
async fn test_crash_rejects_every_pending_request() {
    let t = start_pool(&["normal"]);
    let old_pid = t.pid("normal").expect("worker pid");

    let mut hung = tokio::task::JoinSet::new();
    for n in 0..3 {
        let pool = Arc::clone(&t.pool);
        hung.spawn(async move { pool.ask(None, json!({"n": n, "mockHang": true})).await });
    }
    assert!(wait_until(Duration::from_secs(3), || t.pending("normal") == 3).await);

    let crash = t.pool.ask(None, json!({"mockCrash": true})).await.unwrap_err();
    assert!(matches!(crash, Error::ProcessCrash { ref status, .. } if status == "code=3 signal=none"));
    assert!(crash.is_retryable());

    while let Some(joined) = hung.join_next().await {
        let err = joined.unwrap().unwrap_err();
        assert!(matches!(err, Error::ProcessCrash { .. }), "got {:?}", err);
    }
    assert_eq!(t.pending("normal"), 0);

    let supervisor = t.pool.engine("normal").unwrap().supervisor().clone();
    let respawned = wait_until(RESPAWN_DELAY * 10, || {
        supervisor.state() == WorkerState::Running && supervisor.pid().is_some_and(|p| p != old_pid)
    })
    .await;
    assert!(respawned, "worker was not respawned");

    let status = supervisor.status();
    assert_eq!(status.restarts, 1);
    assert_eq!(status.generation, 2);
    assert_eq!(status.last_exit.as_deref(), Some("code=3 signal=none"));
    assert_eq!(status.requests.pending, 0);

    let response = t.pool.ask(None, json!({"moves": []})).await.unwrap();
    assert_eq!(response["pid"], json!(supervisor.pid().unwrap()));

    t.pool.shutdown_all().await;
}

#[tokio::test]
async fn test_unavailable_until_respawned() {
    let t = start_pool_with(&["normal"], |config| {
        config.respawn.delay_ms = 1_000;
    });
    let supervisor = t.pool.engine("normal").unwrap().supervisor().clone();

    let _ = t.pool.ask(None, json!({"mockCrash": true})).await;
    assert!(wait_until(Duration::from_secs(2), || supervisor.state() == WorkerState::Crashed).await);

    let err = t.pool.ask(None, json!({"moves": []})).await.unwrap_err();
    assert!(matches!(err, Error::WorkerUnavailable(ref name) if name == "normal"));
    assert_eq!(t.pending("normal"), 0);

    assert!(wait_until(Duration::from_secs(5), || supervisor.state() == WorkerState::Running).await);
    assert!(t.pool.ask(None, json!({"moves": []})).await.is_ok());

    t.pool.shutdown_all().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_external_kill_is_a_crash_not_a_timeout() {
    let t = start_pool(&["hard"]);
    let old_pid = t.pid("hard").expect("worker pid");

    let pool = Arc::clone(&t.pool);
    let pending = tokio::spawn(async move {
        pool.ask_with_timeout(Some("hard"), json!({"mockHang": true}), Duration::from_secs(10))
            .await
    });
    assert!(wait_until(Duration::from_secs(3), || t.pending("hard") == 1).await);

    let rc = unsafe { libc::kill(old_pid as libc::pid_t, libc::SIGKILL) };
    assert_eq!(rc, 0);

    let err = tokio::time::timeout(Duration::from_secs(3), pending)
        .await
        .expect("request should fail promptly")
        .unwrap()
        .unwrap_err();
    match err {
        Error::ProcessCrash { engine, status } => {
            assert_eq!(engine, "hard");
            assert_eq!(status, "code=none signal=SIGKILL");
        }
        other => panic!("expected ProcessCrash, got {:?}", other),
    }

    let supervisor = t.pool.engine("hard").unwrap().supervisor().clone();
    let respawned = wait_until(RESPAWN_DELAY * 10, || {
        supervisor.pid().is_some_and(|p| p != old_pid)
    })
    .await;
    assert!(respawned, "no new worker within the backoff window");

    t.pool.shutdown_all().await;
}

#[tokio::test]
async fn test_crash_ceiling_stops_respawning() {
    let t = start_pool_with(&["normal"], |config| {
        config.respawn.max_consecutive_crashes = Some(1);
    });
    let supervisor = t.pool.engine("normal").unwrap().supervisor().clone();

    let _ = t.pool.ask(None, json!({"mockCrash": true})).await;
    assert!(wait_until(Duration::from_secs(5), || supervisor.status().restarts == 1).await);
    assert_eq!(supervisor.status().consecutive_crashes, 1);

    let _ = t.pool.ask(None, json!({"mockCrash": true})).await;
    assert!(wait_until(Duration::from_secs(2), || supervisor.state() == WorkerState::Failed).await);

    tokio::time::sleep(RESPAWN_DELAY * 2).await;
    assert_eq!(supervisor.state(), WorkerState::Failed);
    assert!(supervisor.pid().is_none());

    // A manual start brings it back with a fresh crash budget.
    supervisor.start().unwrap();
    assert_eq!(supervisor.state(), WorkerState::Running);
    assert_eq!(supervisor.status().consecutive_crashes, 0);
    assert!(t.pool.ask(None, json!({"moves": []})).await.is_ok());

    let restarts = supervisor.status().restarts;
    let manual_pid = supervisor.pid().expect("worker pid");
    let _ = t.pool.ask(None, json!({"mockCrash": true})).await;
    let respawned = wait_until(RESPAWN_DELAY * 10, || {
        supervisor.state() == WorkerState::Running
            && supervisor.pid().is_some_and(|p| p != manual_pid)
    })
    .await;
    assert!(respawned, "first crash after a manual start must respawn");
    assert_eq!(supervisor.status().consecutive_crashes, 1);
    assert_eq!(supervisor.status().restarts, restarts + 1);

    t.pool.shutdown_all().await;
}
