use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Stable machine codes for every failure the fabric can surface. These are
/// part of the public contract: they appear in 4xx response bodies, in the
/// job's terminal error object, and in webhook payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation
    InvalidInput,
    InvalidPath,
    PathOutOfScope,
    InputTooLarge,
    CodecContainerMismatch,
    LimitExceeded,
    InvalidBitrate,
    InvalidOperation,
    WebhookForbidden,
    // Auth / quota
    Unauthorized,
    QuotaExceeded,
    RateLimited,
    // Storage
    StorageUnavailable,
    StorageNotFound,
    StorageConflict,
    // Transcoder
    TranscoderTimeout,
    TranscoderCrash,
    TranscoderInvalidMedia,
    // System
    LockLost,
    Internal,
}

/// Coarse grouping used for propagation policy and log labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Validation,
    Auth,
    Storage,
    Transcoder,
    System,
}

impl ErrorCode {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ErrorCode::InvalidInput
            | ErrorCode::InvalidPath
            | ErrorCode::PathOutOfScope
            | ErrorCode::InputTooLarge
            | ErrorCode::CodecContainerMismatch
            | ErrorCode::LimitExceeded
            | ErrorCode::InvalidBitrate
            | ErrorCode::InvalidOperation
            | ErrorCode::WebhookForbidden => ErrorKind::Validation,
            ErrorCode::Unauthorized | ErrorCode::QuotaExceeded | ErrorCode::RateLimited => {
                ErrorKind::Auth
            }
            ErrorCode::StorageUnavailable
            | ErrorCode::StorageNotFound
            | ErrorCode::StorageConflict => ErrorKind::Storage,
            ErrorCode::TranscoderTimeout
            | ErrorCode::TranscoderCrash
            | ErrorCode::TranscoderInvalidMedia => ErrorKind::Transcoder,
            ErrorCode::LockLost | ErrorCode::Internal => ErrorKind::System,
        }
    }

    /// Whether a running job that failed with this code should be
    /// rescheduled (bounded by the attempt cap) or terminated.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::StorageUnavailable
                | ErrorCode::StorageConflict
                | ErrorCode::TranscoderCrash
                | ErrorCode::LockLost
                | ErrorCode::Internal
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::InvalidPath => "INVALID_PATH",
            ErrorCode::PathOutOfScope => "PATH_OUT_OF_SCOPE",
            ErrorCode::InputTooLarge => "INPUT_TOO_LARGE",
            ErrorCode::CodecContainerMismatch => "CODEC_CONTAINER_MISMATCH",
            ErrorCode::LimitExceeded => "LIMIT_EXCEEDED",
            ErrorCode::InvalidBitrate => "INVALID_BITRATE",
            ErrorCode::InvalidOperation => "INVALID_OPERATION",
            ErrorCode::WebhookForbidden => "WEBHOOK_FORBIDDEN",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::StorageUnavailable => "STORAGE_UNAVAILABLE",
            ErrorCode::StorageNotFound => "STORAGE_NOT_FOUND",
            ErrorCode::StorageConflict => "STORAGE_CONFLICT",
            ErrorCode::TranscoderTimeout => "TRANSCODER_TIMEOUT",
            ErrorCode::TranscoderCrash => "TRANSCODER_CRASH",
            ErrorCode::TranscoderInvalidMedia => "TRANSCODER_INVALID_MEDIA",
            ErrorCode::LockLost => "LOCK_LOST",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::InvalidInput => "the submission could not be parsed",
            ErrorCode::InvalidPath => "a locator contains an invalid path",
            ErrorCode::PathOutOfScope => "a locator resolves outside the configured roots",
            ErrorCode::InputTooLarge => "the input exceeds the configured size ceiling",
            ErrorCode::CodecContainerMismatch => {
                "the requested codec is not allowed in the chosen container"
            }
            ErrorCode::LimitExceeded => "a requested parameter exceeds the plan ceiling",
            ErrorCode::InvalidBitrate => "the requested bitrate could not be parsed",
            ErrorCode::InvalidOperation => "the submission contains an unknown operation",
            ErrorCode::WebhookForbidden => "the webhook target is not an allowed destination",
            ErrorCode::Unauthorized => "a valid API key is required",
            ErrorCode::QuotaExceeded => "the concurrent job quota for this key is exhausted",
            ErrorCode::RateLimited => "too many requests, slow down",
            ErrorCode::StorageUnavailable => "the storage backend is temporarily unavailable",
            ErrorCode::StorageNotFound => "the input object does not exist",
            ErrorCode::StorageConflict => "the output object already exists",
            ErrorCode::TranscoderTimeout => "the transcoder exceeded its time budget",
            ErrorCode::TranscoderCrash => "the transcoder exited unexpectedly",
            ErrorCode::TranscoderInvalidMedia => "the input media could not be processed",
            ErrorCode::LockLost => "the job lease was lost during processing",
            ErrorCode::Internal => "an internal error occurred",
        }
    }

    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            ErrorCode::InputTooLarge => Some("split the input or request a larger plan ceiling"),
            ErrorCode::CodecContainerMismatch => {
                Some("pick a codec from the container's allowed set")
            }
            ErrorCode::QuotaExceeded => Some("wait for running jobs to finish, then resubmit"),
            ErrorCode::RateLimited => Some("honor the Retry-After header"),
            ErrorCode::TranscoderInvalidMedia => {
                Some("verify the input decodes locally before resubmitting")
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The sanitized error object stored on a failed job and sent to clients
/// and webhook targets. File paths, command lines and raw subprocess output
/// must never enter `message`; construct through `from_code`/`with_message`
/// with text that is safe to publish.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl JobFailure {
    pub fn from_code(code: ErrorCode) -> Self {
        JobFailure {
            kind: code.kind(),
            code,
            message: code.default_message().to_owned(),
            suggestion: code.suggestion().map(str::to_owned),
        }
    }

    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        JobFailure {
            kind: code.kind(),
            code,
            message: message.into(),
            suggestion: code.suggestion().map(str::to_owned),
        }
    }
}

/// Errors about the queue and store themselves: postgres failures, lost
/// leases, unknown jobs.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("pg error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("could not serialize jsonb field: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("job {0} not found")]
    JobNotFound(Uuid),
    #[error("lease {lock} is no longer held for job {job}")]
    InvalidLock { lock: Uuid, job: Uuid },
}

impl QueueError {
    /// True when retrying the same call against the store could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            QueueError::Sqlx(err) => common_database::is_transient_error(err),
            _ => false,
        }
    }
}

/// Rejections produced by the admission pipeline. Every variant carries the
/// stable code surfaced in the 400 response.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{code}: {message}")]
pub struct AdmissionError {
    pub code: ErrorCode,
    pub message: String,
}

impl AdmissionError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        AdmissionError {
            code,
            message: message.into(),
        }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        AdmissionError {
            code,
            message: code.default_message().to_owned(),
        }
    }
}

/// The result surface of `JobManager::submit`.
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error(transparent)]
    Rejected(#[from] AdmissionError),
    #[error("concurrent job quota exhausted for owner")]
    QuotaExceeded,
    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialize_to_stable_strings() {
        for (code, expected) in [
            (ErrorCode::PathOutOfScope, "\"PATH_OUT_OF_SCOPE\""),
            (ErrorCode::QuotaExceeded, "\"QUOTA_EXCEEDED\""),
            (ErrorCode::TranscoderInvalidMedia, "\"TRANSCODER_INVALID_MEDIA\""),
            (ErrorCode::LockLost, "\"LOCK_LOST\""),
        ] {
            assert_eq!(serde_json::to_string(&code).unwrap(), expected);
            assert_eq!(format!("\"{code}\""), expected);
        }
    }

    #[test]
    fn retryable_classification() {
        assert!(ErrorCode::StorageUnavailable.is_retryable());
        assert!(ErrorCode::TranscoderCrash.is_retryable());
        assert!(ErrorCode::LockLost.is_retryable());

        assert!(!ErrorCode::StorageNotFound.is_retryable());
        assert!(!ErrorCode::TranscoderTimeout.is_retryable());
        assert!(!ErrorCode::TranscoderInvalidMedia.is_retryable());
        assert!(!ErrorCode::CodecContainerMismatch.is_retryable());
    }

    #[test]
    fn failure_object_carries_kind_and_suggestion() {
        let failure = JobFailure::from_code(ErrorCode::QuotaExceeded);
        assert_eq!(failure.kind, ErrorKind::Auth);
        assert!(failure.suggestion.is_some());

        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["code"], "QUOTA_EXCEEDED");
        assert_eq!(json["kind"], "auth");
    }
}
