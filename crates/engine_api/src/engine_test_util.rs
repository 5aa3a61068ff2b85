//! A scriptable in-process engine for tests.
//!
//! One `MockEngine` acts as the factory for every session of a store, so the
//! counters it keeps span all sessions: `max_active()` is the highest number
//! of `run` calls that were in flight at the same time, across the process.
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{Semaphore, watch};

use crate::engine::{EngineError, EngineFactory, EngineHandle, PluginConfig, PluginDescription};

/// A plugin call as seen by the mock.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRun {
    pub plugin: String,
    pub params: Value,
}

struct MockState {
    init_failure: Mutex<Option<String>>,
    init_open: watch::Sender<bool>,
    runs_held: bool,
    run_permits: Semaphore,
    started: Mutex<Vec<RecordedRun>>,
    started_count: watch::Sender<usize>,
    finished_count: watch::Sender<usize>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    inits: AtomicUsize,
}

#[derive(Clone)]
pub struct MockEngine {
    state: Arc<MockState>,
}

impl MockEngine {
    /// Init succeeds immediately, runs complete immediately.
    pub fn new() -> Self {
        Self::build(false)
    }

    /// Every `run` blocks until released with [`MockEngine::release_runs`].
    pub fn holding_runs() -> Self {
        Self::build(true)
    }

    fn build(runs_held: bool) -> Self {
        let (init_open, _) = watch::channel(true);
        let (started_count, _) = watch::channel(0);
        let (finished_count, _) = watch::channel(0);
        Self {
            state: Arc::new(MockState {
                init_failure: Mutex::new(None),
                init_open,
                runs_held,
                run_permits: Semaphore::new(0),
                started: Mutex::new(vec![]),
                started_count,
                finished_count,
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                inits: AtomicUsize::new(0),
            }),
        }
    }

    /// Make every subsequent `init` fail with `message`.
    pub fn fail_init(&self, message: &str) {
        *self.state.init_failure.lock().unwrap() = Some(message.to_string());
    }

    /// Park every `init` until [`MockEngine::release_init`] is called.
    pub fn hold_init(&self) {
        self.state.init_open.send_replace(false);
    }

    pub fn release_init(&self) {
        self.state.init_open.send_replace(true);
    }

    /// Let `n` held runs finish, in the order they started waiting.
    pub fn release_runs(&self, n: usize) {
        self.state.run_permits.add_permits(n);
    }

    pub fn started(&self) -> Vec<RecordedRun> {
        self.state.started.lock().unwrap().clone()
    }

    /// The `id` field of the params of every started run, in dispatch order.
    pub fn started_ids(&self) -> Vec<String> {
        self.started()
            .into_iter()
            .filter_map(|r| r.params.get("id").and_then(Value::as_str).map(str::to_string))
            .collect()
    }

    pub fn started_count(&self) -> usize {
        *self.state.started_count.borrow()
    }

    pub fn finished_count(&self) -> usize {
        *self.state.finished_count.borrow()
    }

    pub fn active(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.state.max_active.load(Ordering::SeqCst)
    }

    pub fn init_calls(&self) -> usize {
        self.state.inits.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` runs have started.
    pub async fn wait_started(&self, n: usize) {
        let mut rx = self.state.started_count.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }

    /// Wait until at least `n` runs have returned to the caller.
    pub async fn wait_finished(&self, n: usize) {
        let mut rx = self.state.finished_count.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EngineFactory for MockEngine {
    async fn init(&self, _configs: Vec<PluginConfig>) -> Result<Arc<dyn EngineHandle>, EngineError> {
        self.state.inits.fetch_add(1, Ordering::SeqCst);
        let mut open = self.state.init_open.subscribe();
        let _ = open.wait_for(|open| *open).await;

        if let Some(message) = self.state.init_failure.lock().unwrap().clone() {
            return Err(EngineError::InvalidConfig(message));
        }
        Ok(Arc::new(MockHandle { state: Arc::clone(&self.state) }))
    }

    async fn plugins(&self) -> Vec<PluginDescription> {
        ["echo", "fail", "panic"]
            .into_iter()
            .map(|name| PluginDescription {
                name: name.to_string(),
                description: format!("mock `{name}` plugin"),
                params: None,
            })
            .collect()
    }
}

struct MockHandle {
    state: Arc<MockState>,
}

struct ActiveGuard<'a>(&'a MockState);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
        self.0.finished_count.send_modify(|count| *count += 1);
    }
}

#[async_trait]
impl EngineHandle for MockHandle {
    async fn run(&self, name: &str, params: Value) -> Result<Value, EngineError> {
        let state = &self.state;
        let now_active = state.active.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_active.fetch_max(now_active, Ordering::SeqCst);
        let _guard = ActiveGuard(state);

        state.started.lock().unwrap().push(RecordedRun { plugin: name.to_string(), params: params.clone() });
        state.started_count.send_modify(|count| *count += 1);

        if state.runs_held {
            if let Ok(permit) = state.run_permits.acquire().await {
                permit.forget();
            }
        }

        match name {
            "fail" => Err(EngineError::Execution { plugin: name.to_string(), message: "scripted failure".into() }),
            "panic" => panic!("scripted panic in mock engine"),
            _ => Ok(json!({ "plugin": name, "params": params })),
        }
    }
}
