use serde::Serialize;
use thiserror::Error;

use engine_api::EngineError;

/// Failures the manager store reports to its callers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// The session id is not (or no longer) in the registry.
    #[error("No manager found for sessionId={0}")]
    SessionNotFound(String),

    /// The engine factory failed while the session was initialising.
    #[error("Manager init failed: {0}")]
    EngineInitFailed(String),

    /// The session exists but has no chain with this id.
    #[error("No chain found: chainId={0}")]
    ChainNotFound(String),

    /// The engine ran the task and failed.
    #[error("Engine execution failed: {0}")]
    EngineExecution(String),

    /// The task was still queued when its session was removed or expired.
    #[error("Task dropped before dispatch: session {0} was removed")]
    TaskAbandoned(String),
}

impl StoreError {
    /// Stable identifier used in failure payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::SessionNotFound(_) => "session_not_found",
            StoreError::EngineInitFailed(_) => "engine_init_failed",
            StoreError::ChainNotFound(_) => "chain_not_found",
            StoreError::EngineExecution(_) => "engine_execution_error",
            StoreError::TaskAbandoned(_) => "task_abandoned",
        }
    }

    pub fn payload(&self) -> ErrorPayload {
        ErrorPayload { kind: self.kind(), message: self.to_string() }
    }
}

impl From<EngineError> for StoreError {
    fn from(err: EngineError) -> Self {
        StoreError::EngineExecution(err.to_string())
    }
}

/// Structured failure: `{ "kind": ..., "message": ... }`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorPayload {
    pub kind: &'static str,
    pub message: String,
}
