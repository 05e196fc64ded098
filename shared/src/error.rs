//! Error types for the assistant bridge Lambda functions.

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the assistant bridge Lambda functions.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or malformed configuration (including credentials)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Streaming exchange with the conversational engine failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Audio could not be persisted
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Inbound event did not carry what we need
    #[error("Validation error: {0}")]
    Validation(String),

    /// AWS SDK error
    #[error("AWS error: {0}")]
    Aws(String),
}

/// Failure of a single streaming dialog turn.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("deadline of {0:?} exceeded")]
    Timeout(Duration),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("internal transport failure: {0}")]
    Internal(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
}

impl TransportError {
    /// Map a gRPC status onto the transport taxonomy.
    ///
    /// `deadline` is reported when the server itself signals `DeadlineExceeded`.
    pub fn from_status(status: &tonic::Status, deadline: Duration) -> Self {
        let message = status.message().to_string();

        match status.code() {
            tonic::Code::DeadlineExceeded => TransportError::Timeout(deadline),
            tonic::Code::Unavailable | tonic::Code::Cancelled => {
                TransportError::Unavailable(message)
            }
            tonic::Code::Unauthenticated | tonic::Code::PermissionDenied => {
                TransportError::Unauthenticated(format!("{:?}: {}", status.code(), message))
            }
            code => TransportError::Internal(format!("gRPC error {:?}: {}", code, message)),
        }
    }

    /// Whether a caller-level retry policy may try the turn again.
    pub fn is_retriable(&self) -> bool {
        matches!(self, TransportError::Unavailable(_))
    }
}

/// Failure while writing, transcoding, or uploading turn audio.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("scratch file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transcoder failed: {0}")]
    Transcode(String),

    #[error("upload failed: {0}")]
    Upload(String),
}

impl From<hound::Error> for PersistenceError {
    fn from(err: hound::Error) -> Self {
        match err {
            hound::Error::IoError(io) => PersistenceError::Io(io),
            other => PersistenceError::Transcode(other.to_string()),
        }
    }
}
