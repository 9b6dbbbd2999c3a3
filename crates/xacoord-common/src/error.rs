//! Error types for xacoord
//!
//! Provides a unified error type hierarchy for the entire system.

use thiserror::Error;

use crate::types::HeuristicOutcome;

/// Result type alias using xacoord's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for xacoord
#[derive(Error, Debug)]
pub enum Error {
    // Transaction Errors
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    // Recovery Log Errors
    #[error("Log error: {0}")]
    Log(#[from] LogError),

    // Configuration Errors
    #[error("Configuration error: {0}")]
    Config(String),

    // IO Errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization Errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal Errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The transaction error carried by this error, if any
    pub fn as_transaction(&self) -> Option<&TransactionError> {
        match self {
            Error::Transaction(e) => Some(e),
            _ => None,
        }
    }

    /// Whether the caller may retry the failed operation later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transaction(TransactionError::ResourceUnavailable(_))
        )
    }
}

/// Transaction-related errors
///
/// Usage errors (`NotSupported`, `IllegalState`) are never retried.
/// `ResourceUnavailable` is the only retryable kind; `Fatal` means recovery
/// correctness can no longer be guaranteed.
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Transaction rolled back: {0}")]
    Rollback(String),

    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("Failed to destroy resource: {0}")]
    DestroyFailed(String),

    #[error("Heuristic outcome: {0}")]
    Heuristic(HeuristicOutcome),

    #[error("Fatal error: {0}")]
    Fatal(String),

    #[error("System error: {0}")]
    System(String),
}

/// Recovery log errors
#[derive(Error, Debug)]
pub enum LogError {
    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Corrupt log: {0}")]
    Corrupt(String),

    #[error("Log closed")]
    Closed,
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
