//! Caller-visible error types.

use thiserror::Error;

/// Failure to send a pump command.  Commands are never queued or retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Not connected to MQTT broker")]
    NotConnected,

    #[error("Failed to send pump command: {0}")]
    Publish(String),
}

/// Failure of the advisory service round trip.
#[derive(Error, Debug)]
pub enum AdvisoryError {
    #[error("advisory service is not configured: {0}")]
    NotConfigured(String),

    #[error("advisory request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("advisory service returned {status}: {message}")]
    Service { status: u16, message: String },

    #[error("advisory response could not be decoded: {0}")]
    Decode(String),
}

impl AdvisoryError {
    /// HTTP status, where the failure carries one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Service { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}
