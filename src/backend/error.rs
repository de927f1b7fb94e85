//! Backend error types

use thiserror::Error;

/// Errors reported by a [`DeviceBackend`](super::DeviceBackend)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("backend initialization failed: {0}")]
    InitializationFailed(String),
    #[error("memory allocation failed: {0}")]
    AllocationFailed(String),
    #[error("memory copy failed: {0}")]
    CopyFailed(String),
    #[error("device query failed: {0}")]
    QueryFailed(String),
    #[error("queue error: {0}")]
    QueueError(String),
    #[error("program registration failed: {0}")]
    ProgramRegistrationFailed(String),
    #[error("pointer 0x{0:x} is not a live allocation of this backend")]
    InvalidPointer(usize),
    #[error("device not found")]
    DeviceNotFound,
    #[error("operation not supported by this backend: {0}")]
    Unsupported(String),
    #[error("internal lock poisoned - this indicates a bug: {0}")]
    LockPoisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for BackendError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        BackendError::LockPoisoned(format!("Lock poisoned: {}", err))
    }
}

/// Backend result type
pub type BackendResult<T> = Result<T, BackendError>;

impl BackendError {
    /// Check if this error is recoverable (temporary condition)
    ///
    /// Allocation, copy, query and queue failures can clear up once the
    /// device drains or memory is released. Invalid pointers, missing
    /// devices and poisoned locks never do.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BackendError::AllocationFailed(_)
                | BackendError::CopyFailed(_)
                | BackendError::QueryFailed(_)
                | BackendError::QueueError(_)
        )
    }

    /// Check if this error is permanent (should never retry)
    pub fn is_permanent(&self) -> bool {
        !self.is_recoverable()
    }
}
