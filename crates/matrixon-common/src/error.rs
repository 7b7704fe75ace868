//! Error types for the Matrixon sliding sync proxy
//!
//! Every failure a sliding sync turn can surface is one of these variants.
//! Client-caused failures are rejected before any connection state is touched,
//! so a client can always retry a turn that failed.

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Matrixon error types
#[derive(Debug, Error)]
pub enum MatrixonError {
    /// Malformed client input (bad ranges, limits over the maximum)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The position token belongs to no known connection
    #[error("Session expired: {0}")]
    ExpiredSession(String),

    /// The connection exists but the token is not the latest one issued
    #[error("Unknown position: {0}")]
    UnknownPosition(String),

    /// A newer request arrived on the same connection before this one committed
    #[error("Superseded: {0}")]
    Superseded(String),

    /// Too many connections for one user
    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),

    /// The op generator produced a script that does not reproduce the list
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// The room store failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for Matrixon operations
pub type Result<T> = std::result::Result<T, MatrixonError>;

/// Body returned to a client whose turn was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub errcode: String,
    pub error: String,
}

impl MatrixonError {
    /// Machine-readable Matrix error code.
    pub fn errcode(&self) -> &'static str {
        match self {
            MatrixonError::BadRequest(_) => "M_INVALID_PARAM",
            // Both tell the client to drop its token and start over.
            MatrixonError::ExpiredSession(_) | MatrixonError::UnknownPosition(_) => {
                "M_UNKNOWN_POS"
            }
            MatrixonError::LimitExceeded(_) => "M_LIMIT_EXCEEDED",
            _ => "M_UNKNOWN",
        }
    }

    /// HTTP status the transport layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            MatrixonError::BadRequest(_)
            | MatrixonError::ExpiredSession(_)
            | MatrixonError::UnknownPosition(_) => 400,
            MatrixonError::Superseded(_) => 409,
            MatrixonError::LimitExceeded(_) => 429,
            _ => 500,
        }
    }

    /// True when the client should restart the connection without a token.
    pub fn is_session_reset(&self) -> bool {
        matches!(
            self,
            MatrixonError::ExpiredSession(_) | MatrixonError::UnknownPosition(_)
        )
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            errcode: self.errcode().to_string(),
            error: self.to_string(),
        }
    }
}

impl From<serde_json::Error> for MatrixonError {
    fn from(err: serde_json::Error) -> Self {
        MatrixonError::Serialization(err.to_string())
    }
}
