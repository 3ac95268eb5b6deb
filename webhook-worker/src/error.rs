use std::time;

use thiserror::Error;

/// Enumeration of errors for a single delivery attempt.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("the delivery target is not an allowed destination")]
    Forbidden,
    #[error("the webhook target url does not parse")]
    ParseUrl,
    #[error("the delivery could not be made but may be retried later: {reason}")]
    Retryable {
        reason: String,
        status: Option<u16>,
        retry_after: Option<time::Duration>,
    },
    #[error("the delivery was rejected and will not be retried (status {status})")]
    Rejected { status: u16 },
}

/// Enumeration of errors that stop the dispatcher loop itself.
#[derive(Error, Debug)]
pub enum DispatcherError {
    #[error("a database error occurred while working the delivery queue")]
    Queue(#[from] conveyor_core::QueueError),
}
