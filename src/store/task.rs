use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::oneshot;

use super::error::StoreError;

pub type TaskResult = Result<Value, StoreError>;

/// A request to run something against a session's engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    PluginRun { plugin_name: String, params: Value },
    ChainRun { chain_id: String, input: Value },
}

impl Task {
    pub fn plugin(plugin_name: impl Into<String>, params: Value) -> Self {
        Task::PluginRun { plugin_name: plugin_name.into(), params }
    }

    pub fn chain(chain_id: impl Into<String>, input: Value) -> Self {
        Task::ChainRun { chain_id: chain_id.into(), input }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Task::PluginRun { .. } => "plugin",
            Task::ChainRun { .. } => "chain",
        }
    }
}

/// A task waiting in a session queue together with its continuation.
pub(crate) struct QueuedTask {
    pub(crate) task: Task,
    reply: oneshot::Sender<TaskResult>,
}

impl QueuedTask {
    pub(crate) fn new(task: Task) -> (Self, oneshot::Receiver<TaskResult>) {
        let (reply, rx) = oneshot::channel();
        (Self { task, reply }, rx)
    }

    pub(crate) fn into_parts(self) -> (Task, Continuation) {
        (self.task, Continuation(self.reply))
    }

    /// Settle the task without running it.
    pub(crate) fn fail(self, err: StoreError) {
        Continuation(self.reply).settle(Err(err));
    }
}

/// Fulfilled exactly once: consuming `settle` is the only way to use it.
pub(crate) struct Continuation(oneshot::Sender<TaskResult>);

impl Continuation {
    pub(crate) fn settle(self, result: TaskResult) {
        // the caller may have stopped waiting; nothing to do then
        let _ = self.0.send(result);
    }
}

/// Returned at enqueue time; resolves with the task's result.
///
/// If the session is removed before the task is dispatched the continuation
/// is dropped unsettled and the handle resolves with
/// [`StoreError::TaskAbandoned`].
#[derive(Debug)]
pub struct TaskHandle {
    session_id: String,
    rx: oneshot::Receiver<TaskResult>,
}

impl TaskHandle {
    pub(crate) fn new(session_id: &str, rx: oneshot::Receiver<TaskResult>) -> Self {
        Self { session_id: session_id.to_string(), rx }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Future for TaskHandle {
    type Output = TaskResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(StoreError::TaskAbandoned(self.session_id.clone()))),
            Poll::Pending => Poll::Pending,
        }
    }
}
