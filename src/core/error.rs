//! Unified error type for the repository core.
//!
//! `RepoError` carries the error *kind* the RPC layer needs to map a
//! failure to the right status code. Storage faults are wrapped with
//! context but keep their kind, so `?` propagation works end to end
//! without per-call-site `.map_err` boilerplate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("not found")]
    NotFound,

    #[error("document version is {actual}, not {expected} as expected")]
    OptimisticLock { expected: i64, actual: i64 },

    #[error("the document is being deleted")]
    DeleteLock,

    #[error("{0} already exists")]
    Exists(String),

    #[error("unauthenticated context")]
    Unauthenticated,

    #[error("permission denied: {0}")]
    Denied(String),

    #[error("invalid request: {0}")]
    BadInput(String),

    /// Retryable I/O failure against the database or object store.
    #[error("transient storage error: {0}")]
    Transient(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Bug or data corruption; not retryable.
    #[error("internal error: {0}")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl RepoError {
    pub fn bad_input(msg: impl Into<String>) -> Self {
        Self::BadInput(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into().into())
    }

    /// Whether a caller may retry the operation unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<sqlx::Error> for RepoError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            // Connection-level failures are worth retrying. Anything
            // else (decode errors, row type mismatches, constraint
            // violations that were not handled at the call site) is a
            // bug or corruption.
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Protocol(_) => RepoError::Transient(Box::new(e)),
            other => RepoError::Internal(Box::new(other)),
        }
    }
}

impl From<serde_json::Error> for RepoError {
    fn from(e: serde_json::Error) -> Self {
        RepoError::Internal(Box::new(e))
    }
}

/// Result type for repository operations
pub type Result<T> = std::result::Result<T, RepoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlx_io_errors_are_transient() {
        let err: RepoError =
            sqlx::Error::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe")).into();
        assert!(err.is_transient());

        let err: RepoError = sqlx::Error::RowNotFound.into();
        assert!(!err.is_transient());
    }
}
