//! ManagerStore: one registry of tenant sessions ("managers"), each wrapping
//! an engine handle, a FIFO task queue, chains and shared memory.
//!
//! All mutable state sits behind a single lock. Admission (both concurrency
//! counters), queue mutation and lifecycle transitions happen only while it
//! is held; engine calls run in spawned tasks outside of it.
pub(crate) mod cleanup;
pub(crate) mod dispatch;
pub mod entry;
pub mod error;
pub(crate) mod limiter;
pub mod task;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use engine_api::{EngineError, EngineFactory, EngineHandle, PluginConfig};
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{Mutex, oneshot};
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chain::{Chain, ChainConfig, build_chain};
use crate::config::StoreOptions;
use crate::logger::TaskMetrics;
use cleanup::CleanupTimer;
use dispatch::DispatchQueue;
use entry::ManagerEntry;
use limiter::ConcurrencyLimiter;
use task::{Continuation, QueuedTask};

pub use entry::{ManagerInfo, ManagerStatus};
pub use error::{ErrorPayload, StoreError};
pub use task::{Task, TaskHandle, TaskResult};

struct StoreState {
    managers: HashMap<String, ManagerEntry>,
    limiter: ConcurrencyLimiter,
    dispatch: DispatchQueue,
    cleanup: CleanupTimer,
    next_seq: u64,
}

impl StoreState {
    /// Queue a dispatch pass for every session, oldest first.
    fn schedule_all(&mut self) {
        let mut ids: Vec<(u64, &str)> = self
            .managers
            .values()
            .map(|entry| (entry.seq, entry.session_id.as_str()))
            .collect();
        ids.sort_unstable();
        self.dispatch.push_all(ids.into_iter().map(|(_, id)| id));
    }
}

/// A task after dispatch: everything needed to run it without the lock.
enum Job {
    Plugin { engine: Arc<dyn EngineHandle>, plugin_name: String, params: Value },
    Chain { chain_id: String, chain: Option<Arc<dyn Chain>>, input: Value },
}

impl Job {
    fn kind(&self) -> &'static str {
        match self {
            Job::Plugin { .. } => "plugin",
            Job::Chain { .. } => "chain",
        }
    }

    fn label(&self) -> &str {
        match self {
            Job::Plugin { plugin_name, .. } => plugin_name,
            Job::Chain { chain_id, .. } => chain_id,
        }
    }

    fn chain_id(&self) -> Option<String> {
        match self {
            Job::Plugin { .. } => None,
            Job::Chain { chain_id, .. } => Some(chain_id.clone()),
        }
    }

    async fn run(self) -> TaskResult {
        match self {
            Job::Plugin { engine, plugin_name, params } => {
                engine.run(&plugin_name, params).await.map_err(StoreError::from)
            }
            Job::Chain { chain: Some(chain), input, .. } => chain.run(input).await,
            Job::Chain { chain: None, chain_id, .. } => Err(StoreError::ChainNotFound(chain_id)),
        }
    }
}

/// A session whose engine is still initialising.
#[derive(Debug)]
pub struct PendingSession {
    session_id: String,
    rx: oneshot::Receiver<Result<String, StoreError>>,
}

impl PendingSession {
    /// Known (and usable for enqueueing) before initialisation settles.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Wait for the engine: the session id once ready, or why it was discarded.
    pub async fn ready(self) -> Result<String, StoreError> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(StoreError::EngineInitFailed(format!(
                "initialisation of {} was interrupted",
                self.session_id
            ))),
        }
    }
}

/// Called with the id of every session that leaves the registry: removal,
/// shutdown, eviction or failed init. Runs under the store lock, so it must
/// be short and must not block.
pub type RemovalHook = Arc<dyn Fn(&str) + Send + Sync>;

pub struct ManagerStore {
    options: StoreOptions,
    factory: Arc<dyn EngineFactory>,
    state: Mutex<StoreState>,
    metrics: TaskMetrics,
    removal_hook: RwLock<Option<RemovalHook>>,
}

impl ManagerStore {
    /// Both ceilings must be at least 1, see [`StoreOptions::validate`].
    pub fn new(options: StoreOptions, factory: Arc<dyn EngineFactory>) -> Arc<Self> {
        let limiter = ConcurrencyLimiter::new(
            options.max_concurrent_runs_per_manager,
            options.max_concurrent_runs_global,
        );
        Arc::new(Self {
            options,
            factory,
            state: Mutex::new(StoreState {
                managers: HashMap::new(),
                limiter,
                dispatch: DispatchQueue::default(),
                cleanup: CleanupTimer::default(),
                next_seq: 0,
            }),
            metrics: TaskMetrics::new(),
            removal_hook: RwLock::new(None),
        })
    }

    /// Install the hook told about every removed session, replacing any previous one.
    pub fn set_removal_hook(&self, hook: RemovalHook) {
        let mut slot = self.removal_hook.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(hook);
    }

    fn notify_removed(&self, session_id: &str) {
        let hook = self
            .removal_hook
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(hook) = hook {
            hook(session_id);
        }
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub fn factory(&self) -> &Arc<dyn EngineFactory> {
        &self.factory
    }

    /// Register a new INITIALIZING session and start its engine in the background.
    #[tracing::instrument(name = "spawn_session", skip(self, configs))]
    pub async fn spawn_session(self: &Arc<Self>, configs: Vec<PluginConfig>) -> PendingSession {
        let session_id = {
            let mut state = self.state.lock().await;
            let session_id = loop {
                let candidate = Uuid::new_v4().to_string();
                if !state.managers.contains_key(&candidate) {
                    break candidate;
                }
            };
            let seq = state.next_seq;
            state.next_seq += 1;
            state
                .managers
                .insert(session_id.clone(), ManagerEntry::new(session_id.clone(), seq));
            self.reschedule_cleanup(&mut state);
            info!("ManagerEntry created (INITIALIZING): {session_id}");
            session_id
        };

        let (tx, rx) = oneshot::channel();
        let store = Arc::clone(self);
        let factory = Arc::clone(&self.factory);
        let id = session_id.clone();
        tokio::spawn(async move {
            let result = AssertUnwindSafe(factory.init(configs))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(EngineError::Other("engine factory panicked".into())));
            let outcome = store.settle_init(&id, result).await;
            let _ = tx.send(outcome);
        });

        PendingSession { session_id, rx }
    }

    /// Create a session and wait until its engine is ready.
    pub async fn create_session(self: &Arc<Self>, configs: Vec<PluginConfig>) -> Result<String, StoreError> {
        self.spawn_session(configs).await.ready().await
    }

    async fn settle_init(
        self: &Arc<Self>,
        session_id: &str,
        result: Result<Arc<dyn EngineHandle>, EngineError>,
    ) -> Result<String, StoreError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        match result {
            Ok(engine) => {
                let Some(entry) = state.managers.get_mut(session_id) else {
                    warn!("Manager {session_id} was removed before its engine became ready");
                    return Err(StoreError::SessionNotFound(session_id.to_string()));
                };
                entry.mark_ready(engine);
                info!("Manager is READY now: {session_id}");
                state.dispatch.push(session_id);
                self.drain_dispatch(state);
                self.reschedule_cleanup(state);
                Ok(session_id.to_string())
            }
            Err(err) => {
                let message = err.to_string();
                error!("Manager init failed: sessionId={session_id}, err={message}");
                if let Some(mut entry) = state.managers.remove(session_id) {
                    let failed = entry.fail_queued(|| StoreError::EngineInitFailed(message.clone()));
                    if failed > 0 {
                        warn!("Failed {failed} task(s) queued on {session_id} during initialisation");
                    }
                    self.notify_removed(session_id);
                }
                Err(StoreError::EngineInitFailed(message))
            }
        }
    }

    /// Snapshot of a session. Counts as a use of the session.
    pub async fn lookup(&self, session_id: &str) -> Option<ManagerInfo> {
        let mut state = self.state.lock().await;
        let entry = state.managers.get_mut(session_id)?;
        entry.touch();
        Some(entry.info())
    }

    /// The engine handle of a READY session. Counts as a use of the session.
    pub async fn engine(&self, session_id: &str) -> Option<Arc<dyn EngineHandle>> {
        let mut state = self.state.lock().await;
        let entry = state.managers.get_mut(session_id)?;
        entry.touch();
        entry.engine()
    }

    /// Remove a session whatever it is doing. Queued tasks are dropped,
    /// running tasks finish but their results only reach their callers.
    #[tracing::instrument(name = "remove_manager", skip(self))]
    pub async fn remove(&self, session_id: &str) -> bool {
        let mut state = self.state.lock().await;
        match state.managers.remove(session_id) {
            Some(entry) => {
                info!(
                    "Manager removed: {session_id} (dropped {} queued task(s), {} still running)",
                    entry.queue_len(),
                    entry.active_runs
                );
                self.notify_removed(session_id);
                true
            }
            None => false,
        }
    }

    pub async fn shutdown_all(&self) {
        let mut state = self.state.lock().await;
        let count = state.managers.len();
        for (session_id, _) in state.managers.drain() {
            self.notify_removed(&session_id);
        }
        state.dispatch.clear();
        state.cleanup.disarm();
        info!("All managers have been shut down ({count} removed).");
    }

    pub async fn list_sessions(&self) -> Vec<ManagerInfo> {
        let state = self.state.lock().await;
        let mut entries: Vec<&ManagerEntry> = state.managers.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries.into_iter().map(ManagerEntry::info).collect()
    }

    /// Whether the session is registered. Does not count as a use.
    pub async fn contains(&self, session_id: &str) -> bool {
        self.state.lock().await.managers.contains_key(session_id)
    }

    pub async fn session_count(&self) -> usize {
        self.state.lock().await.managers.len()
    }

    /// Tasks currently running across all sessions.
    pub async fn global_active_runs(&self) -> usize {
        self.state.lock().await.limiter.global_active()
    }

    /// Append a task to the session's queue and try to dispatch right away.
    /// A session that is still initialising keeps the task queued.
    pub async fn enqueue(self: &Arc<Self>, session_id: &str, task: Task) -> Result<TaskHandle, StoreError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(entry) = state.managers.get_mut(session_id) else {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        };
        entry.touch();
        let (queued, rx) = QueuedTask::new(task);
        entry.push_task(queued);
        debug!("Task queued: sessionId={session_id}, queueLength={}", entry.queue_len());

        state.dispatch.push(session_id);
        self.drain_dispatch(state);
        Ok(TaskHandle::new(session_id, rx))
    }

    #[tracing::instrument(name = "run_plugin", skip(self, params))]
    pub async fn run_plugin(self: &Arc<Self>, session_id: &str, plugin_name: &str, params: Value) -> TaskResult {
        self.enqueue(session_id, Task::plugin(plugin_name, params)).await?.await
    }

    #[tracing::instrument(name = "run_chain", skip(self, input))]
    pub async fn run_chain(self: &Arc<Self>, session_id: &str, chain_id: &str, input: Value) -> TaskResult {
        self.enqueue(session_id, Task::chain(chain_id, input)).await?.await
    }

    fn drain_dispatch(self: &Arc<Self>, state: &mut StoreState) {
        while let Some(session_id) = state.dispatch.pop() {
            if !state.limiter.has_global_headroom() {
                // nothing can be admitted anywhere until a slot frees up
                state.dispatch.clear();
                return;
            }
            self.dispatch_session(state, &session_id);
        }
    }

    /// Admit queued tasks of one session, head first, while it is READY and
    /// both ceilings have headroom.
    fn dispatch_session(self: &Arc<Self>, state: &mut StoreState, session_id: &str) {
        let StoreState { managers, limiter, .. } = state;
        let Some(entry) = managers.get_mut(session_id) else {
            return;
        };
        let Some(engine) = entry.engine() else {
            return;
        };

        while let Some(queued) = entry.admit_next(limiter) {
            entry.touch();
            let (task, reply) = queued.into_parts();
            let job = match task {
                Task::PluginRun { plugin_name, params } => {
                    Job::Plugin { engine: Arc::clone(&engine), plugin_name, params }
                }
                Task::ChainRun { chain_id, input } => {
                    let chain = entry.chains.get(&chain_id).cloned();
                    Job::Chain { chain_id, chain, input }
                }
            };
            debug!(
                "executeTask({}) start: sessionId={session_id}, target={}, active={}",
                job.kind(),
                job.label(),
                entry.active_runs
            );
            self.metrics.tasks_started.add(1, &[]);
            self.spawn_execution(session_id.to_string(), job, reply);
        }
    }

    fn spawn_execution(self: &Arc<Self>, session_id: String, job: Job, reply: Continuation) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let kind = job.kind();
            let label = job.label().to_string();
            let chain_id = job.chain_id();
            let started = Instant::now();

            let result = AssertUnwindSafe(job.run())
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(StoreError::EngineExecution(format!("{kind} `{label}` panicked"))));

            let elapsed = started.elapsed().as_secs_f64() * 1_000.0;
            store.metrics.record_outcome(kind, result.is_ok(), elapsed);
            match &result {
                Ok(_) => info!("executeTask({kind}) success: sessionId={session_id}, target={label}"),
                Err(err) => error!("executeTask({kind}) error: sessionId={session_id}, target={label}, err={err}"),
            }

            store.complete(&session_id, chain_id, result, reply).await;
        });
    }

    /// Release both slots, record chain output, settle the caller, then let
    /// every session try to use the freed capacity.
    async fn complete(
        self: &Arc<Self>,
        session_id: &str,
        chain_id: Option<String>,
        result: TaskResult,
        reply: Continuation,
    ) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        match state.managers.get_mut(session_id) {
            Some(entry) => {
                if let (Some(chain_id), Ok(output)) = (chain_id, &result) {
                    entry.chain_outputs.insert(chain_id, output.clone());
                }
                state.limiter.release(Some(&mut entry.active_runs));
            }
            None => state.limiter.release(None),
        }
        reply.settle(result);

        state.schedule_all();
        self.drain_dispatch(state);
        self.reschedule_cleanup(state);
    }

    /// Register a chain under `chain_id`, replacing any previous one.
    pub async fn create_chain(
        &self,
        session_id: &str,
        chain_id: &str,
        config: ChainConfig,
    ) -> Result<Arc<dyn Chain>, StoreError> {
        let mut state = self.state.lock().await;
        let entry = state
            .managers
            .get_mut(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        let chain = build_chain(config);
        entry.chains.insert(chain_id.to_string(), Arc::clone(&chain));
        info!("Chain created: {chain_id}, for session={session_id}");
        Ok(chain)
    }

    /// Output of the most recent successful run of a chain.
    pub async fn chain_output(&self, session_id: &str, chain_id: &str) -> Result<Option<Value>, StoreError> {
        let state = self.state.lock().await;
        let entry = state
            .managers
            .get(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        Ok(entry.chain_outputs.get(chain_id).cloned())
    }

    pub async fn put_shared(&self, session_id: &str, key: &str, value: Value) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let entry = state
            .managers
            .get_mut(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        entry.shared_memory.insert(key.to_string(), value);
        Ok(())
    }

    pub async fn get_shared(&self, session_id: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let state = self.state.lock().await;
        let entry = state
            .managers
            .get(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        Ok(entry.shared_memory.get(key).cloned())
    }

    /// Replace the outstanding sweep timer with one that fires after the
    /// configured interval.
    fn reschedule_cleanup(self: &Arc<Self>, state: &mut StoreState) {
        let generation = state.cleanup.next_generation();
        let store = Arc::downgrade(self);
        let delay = self.options.cleanup_interval();
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            if let Some(store) = store.upgrade() {
                store.on_cleanup_timer(generation).await;
            }
        });
        state.cleanup.arm(generation, handle);
    }

    async fn on_cleanup_timer(self: &Arc<Self>, generation: u64) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if !state.cleanup.take_fired(generation) {
            return;
        }
        self.sweep_locked(state);
        // keep sweeping while anything is left to expire
        if !state.managers.is_empty() {
            self.reschedule_cleanup(state);
        }
    }

    /// Run one eviction pass now. Returns the ids that were evicted.
    pub async fn sweep(&self) -> Vec<String> {
        let mut state = self.state.lock().await;
        self.sweep_locked(&mut state)
    }

    fn sweep_locked(&self, state: &mut StoreState) -> Vec<String> {
        let now = Instant::now();
        let max_idle = self.options.max_idle_time();
        let max_life = self.options.max_life_time();

        let mut expired: Vec<(u64, String)> = state
            .managers
            .values()
            .filter(|entry| entry.is_expired(now, max_idle, max_life))
            .map(|entry| (entry.seq, entry.session_id.clone()))
            .collect();
        expired.sort_unstable();

        expired
            .into_iter()
            .filter_map(|(_, session_id)| {
                let entry = state.managers.remove(&session_id)?;
                info!(
                    "Manager cleaned up (expired): {session_id}, idleDuration={:?}, lifeDuration={:?}, droppedTasks={}",
                    now.saturating_duration_since(entry.last_used_at()),
                    now.saturating_duration_since(entry.created_at),
                    entry.queue_len()
                );
                self.notify_removed(&session_id);
                Some(session_id)
            })
            .collect()
    }
}
