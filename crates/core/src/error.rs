//! Task failure taxonomy.

use thiserror::Error;

/// Result type used by handlers, the dispatcher and the poller.
pub type TaskResult<T> = Result<T, TaskError>;

/// Why a task did not (or could not) reach success.
///
/// Every variant except [`TaskError::Decode`] ends on the same failure path:
/// the queue row is marked failed with the rendered message and the frozen
/// quota is released. The `Display` text is what the owning user sees.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The raw payload could not be decoded. Not retried, no quota action.
    #[error("invalid task payload: {0}")]
    Decode(String),

    /// The task sat in the queue longer than its submission window.
    #[error("task timed out before it could start")]
    SubmissionExpired,

    /// The vendor job did not finish before the pending deadline.
    #[error("task processing timed out")]
    DeadlineExceeded,

    /// The vendor is temporarily unreachable or returned an unreadable status.
    /// Pollers re-arm on this; everywhere else it fails the task.
    #[error("vendor unavailable: {0}")]
    VendorUnavailable(String),

    /// The vendor reported a terminal failure.
    #[error("{0}")]
    VendorFailed(String),

    /// The vendor reported success but returned nothing usable.
    #[error("no resources were generated")]
    EmptyOutput,

    #[error("unknown vendor: {0}")]
    UnknownVendor(String),

    #[error("no handler registered for task type {0}")]
    NoHandler(String),

    /// A handler panicked. Displays the panic message verbatim.
    #[error("{0}")]
    HandlerPanic(String),

    /// Any other handler-level failure.
    #[error("{0}")]
    Handler(String),

    #[error("quota not enough: required {required}, available {available}")]
    QuotaNotEnough { required: i64, available: i64 },

    #[error("task not found")]
    NotFound,

    /// A persistence or ledger collaborator failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl TaskError {
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn vendor_failed(msg: impl Into<String>) -> Self {
        Self::VendorFailed(msg.into())
    }

    pub fn vendor_unavailable(msg: impl Into<String>) -> Self {
        Self::VendorUnavailable(msg.into())
    }

    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Whether a poller should keep waiting instead of failing the task.
    pub fn is_transient(&self) -> bool {
        matches!(self, TaskError::VendorUnavailable(_))
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(value: serde_json::Error) -> Self {
        Self::Decode(value.to_string())
    }
}
