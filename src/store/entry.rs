use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use engine_api::EngineHandle;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use super::error::StoreError;
use super::limiter::ConcurrencyLimiter;
use super::task::QueuedTask;
use crate::chain::Chain;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManagerStatus {
    Initializing,
    Ready,
}

/// One tenant: its engine, queue, chains and shared memory.
pub(crate) struct ManagerEntry {
    pub(crate) session_id: String,
    /// Creation order, used to walk sessions oldest first.
    pub(crate) seq: u64,
    engine: Option<Arc<dyn EngineHandle>>,
    pub(crate) created_at: Instant,
    last_used_at: Instant,
    pub(crate) active_runs: usize,
    task_queue: VecDeque<QueuedTask>,
    pub(crate) chains: HashMap<String, Arc<dyn Chain>>,
    pub(crate) chain_outputs: HashMap<String, Value>,
    pub(crate) shared_memory: HashMap<String, Value>,
}

impl ManagerEntry {
    pub(crate) fn new(session_id: String, seq: u64) -> Self {
        let now = Instant::now();
        Self {
            session_id,
            seq,
            engine: None,
            created_at: now,
            last_used_at: now,
            active_runs: 0,
            task_queue: VecDeque::new(),
            chains: HashMap::new(),
            chain_outputs: HashMap::new(),
            shared_memory: HashMap::new(),
        }
    }

    pub(crate) fn status(&self) -> ManagerStatus {
        match self.engine {
            Some(_) => ManagerStatus::Ready,
            None => ManagerStatus::Initializing,
        }
    }

    /// The engine handle, only once the session is ready.
    pub(crate) fn engine(&self) -> Option<Arc<dyn EngineHandle>> {
        self.engine.clone()
    }

    pub(crate) fn mark_ready(&mut self, engine: Arc<dyn EngineHandle>) {
        self.engine = Some(engine);
    }

    pub(crate) fn touch(&mut self) {
        self.last_used_at = self.last_used_at.max(Instant::now());
    }

    pub(crate) fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    pub(crate) fn push_task(&mut self, task: QueuedTask) {
        self.task_queue.push_back(task);
    }

    pub(crate) fn queue_len(&self) -> usize {
        self.task_queue.len()
    }

    /// Pop the head of the queue if the limiter grants it a slot.
    /// The head stays in place when there is no headroom.
    pub(crate) fn admit_next(&mut self, limiter: &mut ConcurrencyLimiter) -> Option<QueuedTask> {
        let next = self.task_queue.pop_front()?;
        if limiter.try_acquire(&mut self.active_runs) {
            Some(next)
        } else {
            self.task_queue.push_front(next);
            None
        }
    }

    /// Settle every queued task with an error built by `err`.
    pub(crate) fn fail_queued(&mut self, err: impl Fn() -> StoreError) -> usize {
        let failed = self.task_queue.len();
        for task in self.task_queue.drain(..) {
            task.fail(err());
        }
        failed
    }

    pub(crate) fn is_expired(&self, now: Instant, max_idle: std::time::Duration, max_life: std::time::Duration) -> bool {
        let idle = now.saturating_duration_since(self.last_used_at);
        let life = now.saturating_duration_since(self.created_at);
        idle > max_idle || life > max_life
    }

    pub(crate) fn info(&self) -> ManagerInfo {
        ManagerInfo {
            session_id: self.session_id.clone(),
            status: self.status(),
            created_at: wall_clock(self.created_at),
            last_used_at: wall_clock(self.last_used_at),
            active_runs_count: self.active_runs,
            queue_length: self.task_queue.len(),
            chain_count: self.chains.len(),
            shared_memory_keys: self.shared_memory.len(),
        }
    }
}

impl fmt::Debug for ManagerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerEntry")
            .field("session_id", &self.session_id)
            .field("status", &self.status())
            .field("active_runs", &self.active_runs)
            .field("queue_length", &self.task_queue.len())
            .finish()
    }
}

/// Maps a monotonic instant onto the wall clock, relative to now.
fn wall_clock(instant: Instant) -> DateTime<Utc> {
    let age = Instant::now().saturating_duration_since(instant);
    Utc::now() - chrono::Duration::from_std(age).unwrap_or_default()
}

/// Point in time snapshot of one session, as returned by `list_sessions`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagerInfo {
    pub session_id: String,
    pub status: ManagerStatus,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub active_runs_count: usize,
    pub queue_length: usize,
    pub chain_count: usize,
    pub shared_memory_keys: usize,
}
