//! Engine name routing and the caller-facing reply shape.

use engine_broker::{AskReply, EnginePool, Error, PoolConfig, WorkerState};
use serde_json::json;

use crate::fixture::{mock_spec, start_pool};

#[tokio::test]
async fn test_requests_reach_the_named_engine() {
    let t = start_pool(&["easy", "normal", "hard"]);

    for name in ["easy", "normal", "hard"] {
        let response = t.pool.ask(Some(name), json!({"moves": []})).await.unwrap();
        assert_eq!(response["pid"], json!(t.pid(name).unwrap()), "engine {}", name);
    }

    let shouted = t.pool.ask(Some(" HARD "), json!({})).await.unwrap();
    assert_eq!(shouted["pid"], json!(t.pid("hard").unwrap()));

    t.pool.shutdown_all().await;
}

#[tokio::test]
async fn test_unknown_engine_falls_back_to_default() {
    let t = start_pool(&["easy", "normal", "hard"]);
    let normal_pid = json!(t.pid("normal").unwrap());

    let unknown = t.pool.ask(Some("impossible"), json!({})).await.unwrap();
    assert_eq!(unknown["pid"], normal_pid);

    let unnamed = t.pool.ask(None, json!({})).await.unwrap();
    assert_eq!(unnamed["pid"], normal_pid);

    t.pool.shutdown_all().await;
}

#[tokio::test]
async fn test_ask_reply_shape() {
    let t = start_pool(&["easy", "normal", "hard"]);

    let reply = t
        .pool
        .ask_reply(Some("bogus"), json!({"moves": [["B", "Q16"]]}))
        .await;
    assert!(reply.ok);
    assert_eq!(reply.status_code(), 200);

    let value = serde_json::to_value(&reply).unwrap();
    assert_eq!(value["engine"], json!("normal"));
    assert_eq!(value["bestMove"], json!("Q16"));
    assert_eq!(value["summary"]["winrate"], json!(0.52));
    assert_eq!(value["summary"]["scoreLead"], json!(1.3));
    assert_eq!(value["summary"]["pv"], json!(["Q16", "D4", "R4"]));
    assert_eq!(value["response"]["turnNumber"], json!(1));

    let failed: AskReply = t
        .pool
        .ask_reply(Some("easy"), json!({"mockError": "bad komi"}))
        .await;
    assert!(!failed.ok);
    assert_eq!(failed.engine, "easy");
    assert!(failed.error.as_deref().unwrap().contains("bad komi"));

    t.pool.shutdown_all().await;
}

#[tokio::test]
async fn test_one_failed_engine_does_not_block_the_others() {
    let dir = tempfile::tempdir().unwrap();
    let mut broken = mock_spec(dir.path(), "hard");
    broken.model = dir.path().join("missing-weights.bin.gz");

    let config = PoolConfig::new(vec![
        mock_spec(dir.path(), "easy"),
        mock_spec(dir.path(), "normal"),
        broken,
    ]);
    let pool = EnginePool::new(config).unwrap();

    let failures = pool.start_all();
    assert_eq!(failures.len(), 1);
    let (name, err) = &failures[0];
    assert_eq!(name, "hard");
    assert!(err.to_string().contains("model not found"), "got {}", err);

    let states: Vec<_> = pool.statuses().iter().map(|s| s.state).collect();
    assert_eq!(
        states,
        vec![WorkerState::Running, WorkerState::Running, WorkerState::Failed]
    );

    assert!(pool.ask(Some("easy"), json!({})).await.is_ok());
    let err = pool.ask(Some("hard"), json!({})).await.unwrap_err();
    assert!(matches!(err, Error::WorkerUnavailable(_)));

    pool.shutdown_all().await;
}
