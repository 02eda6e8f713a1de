use thiserror::Error;

use crate::store::TaskStatus;

#[derive(Debug, Error, Clone)]
pub enum AgentError {
    #[error("sandbox error: {0}")]
    Sandbox(String),
    #[error("inference error: {0}")]
    Inference(String),
    #[error("grounding error: {0}")]
    Grounding(String),
    #[error("memory error: {0}")]
    Memory(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("other error: {0}")]
    Other(String),
}

impl From<StoreError> for AgentError {
    fn from(e: StoreError) -> Self {
        AgentError::Store(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    NotFound(String),
    #[error("task {0} already exists")]
    AlreadyExists(String),
    #[error("task {task_id} is in \"{status}\" state and cannot be cancelled")]
    NotCancellable { task_id: String, status: TaskStatus },
    #[error("task {task_id}: invalid status transition {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("backend error: {0}")]
    Backend(String),
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
