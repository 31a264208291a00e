use thiserror::Error;

use crate::model::TaskStatus;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt value under {key}: {reason}")]
    Codec { key: String, reason: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TaskError {
    #[error("task not found: {0}")]
    NotFound(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },
}

impl From<StoreError> for TaskError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(reason) => TaskError::StoreUnavailable(reason),
            codec @ StoreError::Codec { .. } => TaskError::StoreUnavailable(codec.to_string()),
        }
    }
}

impl From<TaskError> for tonic::Status {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::NotFound(id) => tonic::Status::not_found(format!("task not found: {id}")),
            TaskError::StoreUnavailable(reason) => {
                tonic::Status::unavailable(format!("store unavailable: {reason}"))
            }
            TaskError::InvalidRequest(reason) => tonic::Status::invalid_argument(reason),
            err @ TaskError::InvalidTransition { .. } => {
                tonic::Status::failed_precondition(err.to_string())
            }
        }
    }
}
