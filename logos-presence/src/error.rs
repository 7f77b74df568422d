//! Caller-facing error types.
//!
//! Stale updates and unknown keys are not errors and never surface here.
//! Broken invariants (duplicate manager registration) panic instead.

use crate::ids::ClientSessionId;

/// Wire encode/decode failures.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Failed to encode signal: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode {message_type} signal: {source}")]
    Decode {
        message_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unknown signal type: {0}")]
    UnknownMessageType(String),
}

/// Errors surfaced by the presence API.
#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("No value recorded for client session {0}")]
    NotFound(ClientSessionId),

    #[error("No value manager registered under key '{0}'")]
    ManagerNotFound(String),

    #[error("Value manager '{key}' is not a {expected}")]
    ManagerTypeMismatch { key: String, expected: &'static str },

    #[error("Invalid workspace address '{0}': expected 'kind:identifier'")]
    InvalidWorkspaceAddress(String),

    #[error("Workspace address '{0}' uses a reserved kind")]
    ReservedWorkspace(String),

    #[error("No connected attendee for client session {0}")]
    AttendeeNotFound(ClientSessionId),

    #[error("Value serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Presence runtime has shut down")]
    RuntimeClosed,
}
