//! Error types for checklist storage, sync and analysis.

use thiserror::Error;

/// Result type alias using the checklist's `Error` type.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure taxonomy shared by the store, the sync engine and the controller.
#[derive(Error, Debug)]
pub enum Error {
    /// Remote could not be reached (retryable, the action stays queued).
    #[error("Network error: {0}")]
    Network(String),

    /// Remote rejected the payload.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Local durable store I/O failed.
    #[error("Local store error: {0}")]
    LocalStore(String),

    /// The suggestion collaborator failed.
    #[error("Suggestion service error: {0}")]
    Suggestion(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether a queued action that failed with this error should be retried as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Error::Serialization(e.to_string())
        } else if let Some(status) = e.status().filter(|s| s.is_client_error()) {
            Error::Validation(format!("{status}: {e}"))
        } else {
            Error::Network(e.to_string())
        }
    }
}
