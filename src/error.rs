//! Error taxonomy for the two remote collaborators.
//!
//! Source errors abort the whole fetch (and with it the cycle). Destination
//! errors abort only the record operation that hit them.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source rejected credentials (HTTP {status})")]
    Auth { status: u16 },

    #[error("source rate limited the request")]
    RateLimited { retry_after: Option<Duration> },

    #[error("source request timed out: {0}")]
    Timeout(String),

    #[error("malformed source response: {0}")]
    MalformedResponse(String),

    #[error("source request failed: {0}")]
    Network(String),

    #[error("source returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
}

#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("cannot reach destination: {0}")]
    Connect(String),

    #[error("destination rejected credentials (HTTP {status})")]
    Auth { status: u16 },

    #[error("destination request timed out: {0}")]
    Timeout(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("destination returned HTTP {status} for {path}")]
    Http { status: u16, path: String },

    #[error("destination I/O error: {0}")]
    Io(String),
}

impl DestinationError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DestinationError::NotFound(_))
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SourceError::Timeout(e.to_string())
        } else if e.is_decode() {
            SourceError::MalformedResponse(e.to_string())
        } else {
            SourceError::Network(e.to_string())
        }
    }
}

impl From<reqwest::Error> for DestinationError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DestinationError::Timeout(e.to_string())
        } else if e.is_connect() {
            DestinationError::Connect(e.to_string())
        } else {
            DestinationError::Io(e.to_string())
        }
    }
}
