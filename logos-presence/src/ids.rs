//! Participant and workspace identifiers.
//!
//! A participant has two identities:
//!
//! - [`ClientSessionId`] survives reconnects and is the key every replicated
//!   value is stored under.
//! - [`ClientConnectionId`] names one live transport connection. It changes
//!   on reconnect and is only ever used to address signals.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::PresenceError;

/// Stable identity of a participant across reconnects.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientSessionId(String);

impl ClientSessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random session id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientSessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Transient identity of a live transport connection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientConnectionId(String);

impl ClientConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientConnectionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Address of a workspace, always of the form `kind:identifier`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceAddress(String);

impl WorkspaceAddress {
    /// Kind reserved for the built-in attendee workspace.
    pub const SYSTEM_KIND: &'static str = "system";

    /// Parse and validate an application workspace address.
    pub fn parse(address: &str) -> Result<Self, PresenceError> {
        let (kind, identifier) = address
            .split_once(':')
            .ok_or_else(|| PresenceError::InvalidWorkspaceAddress(address.to_string()))?;
        if kind.is_empty() || identifier.is_empty() {
            return Err(PresenceError::InvalidWorkspaceAddress(address.to_string()));
        }
        if kind == Self::SYSTEM_KIND {
            return Err(PresenceError::ReservedWorkspace(address.to_string()));
        }
        Ok(Self(address.to_string()))
    }

    /// Address taken verbatim from the wire. No validation: unknown and
    /// reserved addresses are retained as received.
    pub(crate) fn from_wire(address: &str) -> Self {
        Self(address.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> &str {
        self.0.split_once(':').map_or(self.0.as_str(), |(kind, _)| kind)
    }
}

impl fmt::Display for WorkspaceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
