//! Unified error handling for forgemem
//!
//! The hot-path memory primitives have no recoverable error channel: a
//! failed allocation or copy is fatal. Everything that *can* be surfaced
//! (configuration, one-time device setup, the `try_*` accessors) goes
//! through [`MemError`], which is categorized so callers can decide what to
//! report to users and what indicates a bug.

use std::fmt;

use crate::backend::BackendError;

/// Unified error type for forgemem
#[derive(Debug, thiserror::Error)]
pub enum MemError {
    // ========== Backend Errors ==========
    /// Error reported by the device backend
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Device setup (`init`) failed
    #[error("device initialization failed: {0}")]
    InitializationFailed(String),

    // ========== Usage Errors ==========
    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Operation not valid for the current synchronization state
    #[error("invalid synchronization state: {0}")]
    InvalidState(String),

    // ========== Internal Errors ==========
    /// Lock poisoned by a panicking holder
    #[error("internal lock poisoned: {0}")]
    LockPoisoned(String),

    /// Catch-all for invariant violations
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type used across forgemem
pub type MemResult<T> = Result<T, MemError>;

/// Coarse classification of a [`MemError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caller supplied something invalid
    User,
    /// Device or driver failure
    Backend,
    /// Bug or corrupted internal state
    Internal,
}

impl MemError {
    /// Category of this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            MemError::Backend(_) | MemError::InitializationFailed(_) => ErrorCategory::Backend,
            MemError::InvalidConfiguration(_) | MemError::InvalidState(_) => ErrorCategory::User,
            MemError::LockPoisoned(_) | MemError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Whether retrying the failed operation could succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            MemError::Backend(err) => err.is_recoverable(),
            _ => false,
        }
    }

    /// Whether this error was caused by the caller
    pub fn is_user_error(&self) -> bool {
        self.category() == ErrorCategory::User
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "user"),
            ErrorCategory::Backend => write!(f, "backend"),
            ErrorCategory::Internal => write!(f, "internal"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for MemError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        MemError::LockPoisoned(err.to_string())
    }
}

/// Abort the current operation on an unrecoverable failure.
///
/// Logs the error and panics. Used by the infallible accessors, where an
/// allocation or copy failure leaves nothing sensible to continue with.
#[track_caller]
pub fn fatal(err: impl Into<MemError>) -> ! {
    let err = err.into();
    tracing::error!(category = %err.category(), "fatal: {}", err);
    panic!("forgemem fatal error: {}", err);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let backend: MemError = BackendError::AllocationFailed("oom".to_string()).into();
        assert_eq!(backend.category(), ErrorCategory::Backend);
        assert_eq!(
            MemError::InvalidConfiguration("x".into()).category(),
            ErrorCategory::User
        );
        assert_eq!(
            MemError::InvalidState("x".into()).category(),
            ErrorCategory::User
        );
        assert_eq!(
            MemError::Internal("x".into()).category(),
            ErrorCategory::Internal
        );
    }

    #[test]
    fn test_is_recoverable_follows_backend() {
        let copy: MemError = BackendError::CopyFailed("busy".to_string()).into();
        assert!(copy.is_recoverable());

        let invalid: MemError = BackendError::InvalidPointer(0x10).into();
        assert!(!invalid.is_recoverable());
        assert!(!MemError::InvalidConfiguration("bad".into()).is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = MemError::InvalidConfiguration("queue_count must be >= 2".into());
        assert_eq!(
            err.to_string(),
            "invalid configuration: queue_count must be >= 2"
        );
        assert_eq!(ErrorCategory::Backend.to_string(), "backend");
    }

    #[test]
    fn test_poison_error_conversion() {
        let lock = std::sync::Arc::new(std::sync::Mutex::new(0));
        let clone = lock.clone();
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison");
        })
        .join();

        let err: MemError = lock.lock().unwrap_err().into();
        assert!(matches!(err, MemError::LockPoisoned(_)));
        assert_eq!(err.category(), ErrorCategory::Internal);
    }

    #[test]
    #[should_panic(expected = "forgemem fatal error")]
    fn test_fatal_panics() {
        fatal(MemError::Internal("boom".into()));
    }
}
