use thiserror::Error;

use conveyor_core::storage::StorageError;
use conveyor_core::{ErrorCode, JobFailure, QueueError};

use crate::invoker::InvokeError;

/// Everything that can interrupt one job attempt. Classification into the
/// public taxonomy (and the retryable/permanent split) happens in
/// `as_failure`/`is_retryable`; raw detail stays in server-side logs.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("transcoder error: {0}")]
    Invoke(#[from] InvokeError),
    #[error("cancellation observed")]
    Cancelled,
    #[error("lease lost")]
    LockLost,
    #[error("scratch dir error: {0}")]
    Scratch(std::io::Error),
    #[error("pre-flight rejection: {0}")]
    Rejected(ErrorCode),
}

impl ProcessError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ProcessError::Queue(_) => ErrorCode::Internal,
            ProcessError::Storage(err) => err.code(),
            ProcessError::Invoke(err) => err.code(),
            ProcessError::Cancelled => ErrorCode::Internal,
            ProcessError::LockLost => ErrorCode::LockLost,
            ProcessError::Scratch(_) => ErrorCode::Internal,
            ProcessError::Rejected(code) => *code,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ProcessError::Queue(err) => err.is_transient(),
            _ => self.code().is_retryable(),
        }
    }

    /// The sanitized object recorded on the job. Paths, argv and subprocess
    /// output never pass through here.
    pub fn as_failure(&self) -> JobFailure {
        JobFailure::from_code(self.code())
    }
}
