mod ops;

// We do this pattern (privately use a module, then re-export parts of it) so
// we can refactor the internals without breaking the public API.

// Types
mod types;
pub use types::ApiKeyRecord;
pub use types::Delivery;
pub use types::DeliveryState;
pub use types::Job;
pub use types::JobInit;
pub use types::JobState;
pub use types::JobStats;
pub use types::NewDelivery;
pub use types::Operation;
pub use types::Priority;
pub use types::ProgressFrame;
pub use types::ProgressUpdate;
pub use types::StreamFormat;
pub use types::Submission;
pub use types::WebhookEvent;
pub use types::WebhookPayload;

// Errors
mod error;
pub use error::AdmissionError;
pub use error::ErrorCode;
pub use error::ErrorKind;
pub use error::JobFailure;
// Errors about the queue itself - lost leases, unknown jobs, postgres errors
pub use error::QueueError;
pub use error::SubmitError;

// Admission
pub mod admission;
pub use admission::AdmissionLimits;

// Manager
mod manager;
pub use manager::CancelOutcome;
pub use manager::JobManager;
pub use manager::ListOrder;
pub use manager::SubmitOutcome;

// Worker
mod worker;
pub use worker::ProgressFlush;
pub use worker::QueueWorker;

// Janitor
mod janitor;
pub use janitor::Janitor;
pub use janitor::JanitorSettings;

// Progress bus
pub mod bus;

// Storage collaborator
pub mod storage;

// Retry & circuit breaking policy objects
mod circuit;
pub use circuit::CircuitBreaker;
pub use circuit::CircuitBreakerConfig;
pub use circuit::CircuitState;
mod retry;
pub use retry::RetryPolicy;
pub use retry::RetryPolicyBuilder;

// Raw delivery-queue operations, used by the webhook dispatcher.
pub mod deliveries {
    pub use crate::ops::webhooks::{
        complete_delivery, count_pending_deliveries, dead_letter_delivery, dequeue_deliveries,
        enqueue_delivery, retry_delivery,
    };
}
