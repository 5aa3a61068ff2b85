use std::sync::Arc;
use std::time::Duration;

use engine_api::engine_test_util::MockEngine;
use langpong::config::StoreOptions;
use langpong::{ManagerStatus, ManagerStore, StoreError, Task};
use serde_json::json;

fn store(engine: &MockEngine, per_session: usize, global: usize) -> Arc<ManagerStore> {
    let options = StoreOptions {
        max_concurrent_runs_per_manager: per_session,
        max_concurrent_runs_global: global,
        ..StoreOptions::default()
    };
    ManagerStore::new(options, Arc::new(engine.clone()))
}

fn task(id: &str) -> Task {
    Task::plugin("echo", json!({ "id": id }))
}

#[tokio::test]
async fn tasks_of_one_session_run_in_submission_order() {
    let engine = MockEngine::new();
    let store = store(&engine, 1, 10);
    let sid = store.create_session(vec![]).await.unwrap();

    let ids: Vec<String> = (0..6).map(|i| format!("t{i}")).collect();
    let mut handles = Vec::new();
    for id in &ids {
        handles.push(store.enqueue(&sid, task(id)).await.unwrap());
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(engine.started_ids(), ids);
    assert_eq!(engine.max_active(), 1);
}

#[tokio::test]
async fn ceilings_hold_back_second_task_of_saturated_session() {
    let engine = MockEngine::holding_runs();
    let store = store(&engine, 1, 2);
    let a = store.create_session(vec![]).await.unwrap();
    let b = store.create_session(vec![]).await.unwrap();

    let a1 = store.enqueue(&a, task("A1")).await.unwrap();
    let a2 = store.enqueue(&a, task("A2")).await.unwrap();
    let b1 = store.enqueue(&b, task("B1")).await.unwrap();

    engine.wait_started(2).await;
    assert_eq!(engine.started_ids(), vec!["A1", "B1"]);
    assert_eq!(store.global_active_runs().await, 2);
    let info = store.lookup(&a).await.unwrap();
    assert_eq!(info.active_runs_count, 1);
    assert_eq!(info.queue_length, 1);

    // A1 waited on the engine first, so it is the one released
    engine.release_runs(1);
    assert!(a1.await.is_ok());
    engine.wait_started(3).await;
    assert_eq!(engine.started_ids(), vec!["A1", "B1", "A2"]);

    engine.release_runs(2);
    assert!(a2.await.is_ok());
    assert!(b1.await.is_ok());
    assert_eq!(engine.max_active(), 2);
    assert_eq!(store.global_active_runs().await, 0);
}

#[tokio::test]
async fn ceilings_are_never_exceeded_under_load() {
    let engine = MockEngine::holding_runs();
    let store = store(&engine, 2, 3);
    let mut sessions = Vec::new();
    for _ in 0..3 {
        sessions.push(store.create_session(vec![]).await.unwrap());
    }

    let mut handles = Vec::new();
    for (s, sid) in sessions.iter().enumerate() {
        for t in 0..4 {
            handles.push(store.enqueue(sid, task(&format!("{s}-{t}"))).await.unwrap());
        }
    }

    for finished in 1..=12 {
        engine.release_runs(1);
        engine.wait_finished(finished).await;
        assert!(store.global_active_runs().await <= 3);
        for info in store.list_sessions().await {
            assert!(info.active_runs_count <= 2, "{} ran {} tasks", info.session_id, info.active_runs_count);
        }
    }
    for handle in handles {
        assert!(handle.await.is_ok());
    }

    assert!(engine.max_active() <= 3);
    assert_eq!(engine.started_count(), 12);
    for (s, _) in sessions.iter().enumerate() {
        let order: Vec<String> = engine
            .started_ids()
            .into_iter()
            .filter(|id| id.starts_with(&format!("{s}-")))
            .collect();
        let expected: Vec<String> = (0..4).map(|t| format!("{s}-{t}")).collect();
        assert_eq!(order, expected);
    }
}

#[tokio::test]
async fn task_enqueued_while_initializing_runs_once_ready() {
    let engine = MockEngine::new();
    engine.hold_init();
    let store = store(&engine, 3, 10);

    let pending = store.spawn_session(vec![]).await;
    let sid = pending.session_id().to_string();
    let handle = store.enqueue(&sid, task("early")).await.unwrap();

    let info = store.lookup(&sid).await.unwrap();
    assert_eq!(info.status, ManagerStatus::Initializing);
    assert_eq!(info.queue_length, 1);
    assert_eq!(engine.started_count(), 0);

    engine.release_init();
    assert_eq!(pending.ready().await, Ok(sid.clone()));
    let out = handle.await.unwrap();
    assert_eq!(out["params"]["id"], "early");
}

#[tokio::test]
async fn failed_init_removes_session_and_fails_queued_tasks() {
    let engine = MockEngine::new();
    engine.fail_init("bad plugin list");
    engine.hold_init();
    let store = store(&engine, 3, 10);

    let pending = store.spawn_session(vec![]).await;
    let sid = pending.session_id().to_string();
    let first = store.enqueue(&sid, task("1")).await.unwrap();
    let second = store.enqueue(&sid, task("2")).await.unwrap();

    engine.release_init();
    assert!(matches!(pending.ready().await, Err(StoreError::EngineInitFailed(_))));
    assert!(matches!(first.await, Err(StoreError::EngineInitFailed(_))));
    assert!(matches!(second.await, Err(StoreError::EngineInitFailed(_))));

    assert!(store.lookup(&sid).await.is_none());
    assert_eq!(store.session_count().await, 0);
    assert_eq!(engine.started_count(), 0);
}

#[tokio::test]
async fn session_removed_during_init_is_reported_missing() {
    let engine = MockEngine::new();
    engine.hold_init();
    let store = store(&engine, 3, 10);

    let pending = store.spawn_session(vec![]).await;
    let sid = pending.session_id().to_string();
    assert!(store.remove(&sid).await);

    engine.release_init();
    assert_eq!(pending.ready().await, Err(StoreError::SessionNotFound(sid)));
    assert_eq!(store.session_count().await, 0);
}

#[tokio::test]
async fn unknown_session_is_rejected_without_side_effects() {
    let engine = MockEngine::new();
    let store = store(&engine, 3, 10);
    let sid = store.create_session(vec![]).await.unwrap();

    let err = store.enqueue("missing", task("x")).await.unwrap_err();
    assert_eq!(err, StoreError::SessionNotFound("missing".into()));
    let err = store.run_chain("missing", "c", json!(null)).await.unwrap_err();
    assert_eq!(err.kind(), "session_not_found");

    let sessions = store.list_sessions().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].session_id, sid);
    assert_eq!(sessions[0].queue_length, 0);
    assert_eq!(sessions[0].active_runs_count, 0);
    assert_eq!(engine.started_count(), 0);
}

#[tokio::test]
async fn removal_drops_queued_tasks_but_not_running_ones() {
    let engine = MockEngine::holding_runs();
    let store = store(&engine, 1, 10);
    let sid = store.create_session(vec![]).await.unwrap();

    let running = store.enqueue(&sid, task("run")).await.unwrap();
    let queued_a = store.enqueue(&sid, task("qa")).await.unwrap();
    let queued_b = store.enqueue(&sid, task("qb")).await.unwrap();
    engine.wait_started(1).await;

    assert!(store.remove(&sid).await);
    assert!(store.lookup(&sid).await.is_none());
    assert_eq!(queued_a.await, Err(StoreError::TaskAbandoned(sid.clone())));
    assert_eq!(queued_b.await, Err(StoreError::TaskAbandoned(sid.clone())));

    engine.release_runs(1);
    assert!(running.await.is_ok());
    assert_eq!(engine.started_ids(), vec!["run"]);
    assert_eq!(store.global_active_runs().await, 0);
}

#[tokio::test]
async fn shutdown_frees_global_slots_once_inflight_tasks_finish() {
    let engine = MockEngine::holding_runs();
    let store = store(&engine, 1, 1);
    let a = store.create_session(vec![]).await.unwrap();

    let running = store.enqueue(&a, task("a1")).await.unwrap();
    let queued = store.enqueue(&a, task("a2")).await.unwrap();
    engine.wait_started(1).await;

    store.shutdown_all().await;
    assert_eq!(queued.await, Err(StoreError::TaskAbandoned(a)));

    engine.release_runs(1);
    assert!(running.await.is_ok());
    assert_eq!(store.global_active_runs().await, 0);

    // the freed global slot is usable by a new session
    engine.release_runs(1);
    let b = store.create_session(vec![]).await.unwrap();
    assert!(store.run_plugin(&b, "echo", json!({"id": "b1"})).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn idle_sessions_are_evicted_by_the_timer() {
    let engine = MockEngine::new();
    let options = StoreOptions {
        max_idle_time_ms: 1_200,
        max_life_time_ms: 60_000,
        cleanup_interval_ms: 500,
        ..StoreOptions::default()
    };
    let store = ManagerStore::new(options, Arc::new(engine.clone()));
    store.create_session(vec![]).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1_400)).await;
    assert_eq!(store.list_sessions().await.len(), 1, "not idle long enough yet");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(store.list_sessions().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn lifetime_limit_evicts_busy_sessions() {
    let engine = MockEngine::new();
    let options = StoreOptions {
        max_idle_time_ms: 1_000,
        max_life_time_ms: 2_500,
        cleanup_interval_ms: 500,
        ..StoreOptions::default()
    };
    let store = ManagerStore::new(options, Arc::new(engine.clone()));
    let sid = store.create_session(vec![]).await.unwrap();

    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(store.lookup(&sid).await.is_some());
    }

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert!(store.list_sessions().await.is_empty());
}

#[tokio::test]
async fn shared_data_round_trips_exactly() {
    let engine = MockEngine::new();
    let store = store(&engine, 3, 10);
    let sid = store.create_session(vec![]).await.unwrap();

    let value = json!({"nested": {"list": [1, "two", null], "flag": true}});
    store.put_shared(&sid, "ctx", value.clone()).await.unwrap();
    assert_eq!(store.get_shared(&sid, "ctx").await, Ok(Some(value)));

    store.put_shared(&sid, "ctx", json!(2)).await.unwrap();
    assert_eq!(store.get_shared(&sid, "ctx").await, Ok(Some(json!(2))));
    assert_eq!(store.lookup(&sid).await.unwrap().shared_memory_keys, 1);
}

#[tokio::test]
async fn chain_failure_does_not_affect_other_tasks() {
    let engine = MockEngine::new();
    let store = store(&engine, 1, 10);
    let sid = store.create_session(vec![]).await.unwrap();
    store.create_chain(&sid, "summary", langpong::chain::ChainConfig::new("LLM")).await.unwrap();

    let missing = store.enqueue(&sid, Task::chain("other", json!(1))).await.unwrap();
    let chained = store.enqueue(&sid, Task::chain("summary", json!(2))).await.unwrap();
    let plugin = store.enqueue(&sid, task("after")).await.unwrap();

    assert_eq!(missing.await, Err(StoreError::ChainNotFound("other".into())));
    assert_eq!(chained.await.unwrap()["input"], 2);
    assert!(plugin.await.is_ok());
    assert_eq!(
        store.chain_output(&sid, "summary").await.unwrap(),
        Some(json!({"chainType": "LLM", "input": 2}))
    );
}
