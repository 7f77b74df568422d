//! Presence signal wire format.
//!
//! Signals are JSON objects handed to the host transport with a type tag:
//!
//! ```text
//! "Pres:DatastoreUpdate"  { sendTimestamp, avgLatency, isComplete?, data, targetClientId? }
//! "Pres:ClientJoin"       { sendTimestamp, avgLatency, updateProviders, data }
//!
//! data = { workspaceAddress: { managerKey: { clientSessionId: ValueDirectoryOrState } } }
//! ```
//!
//! The sender's connection id is supplied by the transport, never embedded in
//! the content. Unknown workspaces, keys and fields are carried verbatim.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::ids::ClientConnectionId;
use crate::state::DatastorePayload;

pub const DATASTORE_UPDATE_MESSAGE_TYPE: &str = "Pres:DatastoreUpdate";
pub const CLIENT_JOIN_MESSAGE_TYPE: &str = "Pres:ClientJoin";

/// State update, partial or complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatastoreUpdate {
    pub send_timestamp: i64,
    pub avg_latency: f64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_complete: bool,
    pub data: DatastorePayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_client_id: Option<ClientConnectionId>,
}

/// Announcement of a newly connected client, carrying its current state and
/// the connections asked to answer with a complete broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientJoin {
    pub send_timestamp: i64,
    pub avg_latency: f64,
    pub update_providers: Vec<ClientConnectionId>,
    pub data: DatastorePayload,
}

/// Decoded presence signal.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalMessage {
    DatastoreUpdate(DatastoreUpdate),
    ClientJoin(ClientJoin),
}

impl SignalMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::DatastoreUpdate(_) => DATASTORE_UPDATE_MESSAGE_TYPE,
            Self::ClientJoin(_) => CLIENT_JOIN_MESSAGE_TYPE,
        }
    }

    pub fn send_timestamp(&self) -> i64 {
        match self {
            Self::DatastoreUpdate(update) => update.send_timestamp,
            Self::ClientJoin(join) => join.send_timestamp,
        }
    }

    /// Encode the content object (the type tag travels separately).
    pub fn encode(&self) -> Result<Value, ProtocolError> {
        match self {
            Self::DatastoreUpdate(update) => serde_json::to_value(update),
            Self::ClientJoin(join) => serde_json::to_value(join),
        }
        .map_err(ProtocolError::Encode)
    }

    /// Decode content received under `message_type`.
    pub fn decode(message_type: &str, content: &Value) -> Result<Self, ProtocolError> {
        let decode_err = |source| ProtocolError::Decode {
            message_type: message_type.to_string(),
            source,
        };
        match message_type {
            DATASTORE_UPDATE_MESSAGE_TYPE => DatastoreUpdate::deserialize(content)
                .map(Self::DatastoreUpdate)
                .map_err(decode_err),
            CLIENT_JOIN_MESSAGE_TYPE => ClientJoin::deserialize(content)
                .map(Self::ClientJoin)
                .map_err(decode_err),
            other => Err(ProtocolError::UnknownMessageType(other.to_string())),
        }
    }

    /// Whether `message_type` names a presence signal at all.
    pub fn is_presence_type(message_type: &str) -> bool {
        matches!(message_type, DATASTORE_UPDATE_MESSAGE_TYPE | CLIENT_JOIN_MESSAGE_TYPE)
    }
}

/// Signal handed to the host transport.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundSignal {
    pub message_type: &'static str,
    pub content: Value,
    /// Unicast target; `None` broadcasts to every connection.
    pub target_client_id: Option<ClientConnectionId>,
}

impl OutboundSignal {
    pub fn new(message: &SignalMessage, target_client_id: Option<ClientConnectionId>) -> Result<Self, ProtocolError> {
        Ok(Self {
            message_type: message.message_type(),
            content: message.encode()?,
            target_client_id,
        })
    }
}

/// Signal delivered by the host transport.
///
/// The sender id is mandatory: the transport always knows who sent a signal.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundSignal {
    pub client_id: ClientConnectionId,
    pub message_type: String,
    pub content: Value,
    pub target_client_id: Option<ClientConnectionId>,
}

impl InboundSignal {
    /// The receive side of `signal`, as sent by `client_id`.
    pub fn from_outbound(client_id: ClientConnectionId, signal: &OutboundSignal) -> Self {
        Self {
            client_id,
            message_type: signal.message_type.to_string(),
            content: signal.content.clone(),
            target_client_id: signal.target_client_id.clone(),
        }
    }
}
