//! Error types for the relay core and the control channel.

use thiserror::Error;

/// Errors that can occur while routing frames or resolving operator replies.
///
/// None of these are fatal: the hub turns every variant into either a dropped
/// frame or a notice for the requester.
#[derive(Error, Debug)]
pub enum RelayError {
    /// No live agent is registered under the id.
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    /// No live session is registered under the id.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The frame could not be decoded or was missing a required field.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// An external lookup needed to finish a wizard step failed.
    #[error("upstream resolution failed: {0}")]
    UpstreamResolution(String),

    /// A reply referenced a prompt token that was already resolved or never issued.
    #[error("stale or unknown prompt token: {0}")]
    StaleToken(String),

    /// The destination connection is gone.
    #[error("connection closed")]
    ConnectionClosed,

    /// The Telegram Bot API answered with `ok: false`.
    #[error("Telegram API error: {0}")]
    Telegram(String),

    /// An HTTP request error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RelayError {
    /// Check if this is a not-found error for either an agent or a session.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::AgentNotFound(_) | Self::SessionNotFound(_) | Self::ConnectionClosed
        )
    }

    /// Check if this error came from the control channel side.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            Self::UpstreamResolution(_) | Self::Telegram(_) | Self::Http(_)
        )
    }
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
