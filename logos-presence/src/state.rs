//! Replicated value shapes.
//!
//! Every replicated `(key, client)` pair holds a [`ValueDirectoryOrState`]:
//! either a single leaf [`ValueState`] or a [`ValueDirectory`] of further
//! leaves and directories.
//!
//! ```text
//! ClientRecord ── session-a ── State { revision: 3, timestamp, value }
//!              └─ session-b ── Directory { revision: 7, items }
//!                                 ├── "x" ── State { revision: 2, .. }
//!                                 └── "y" ── Directory { .. }
//! ```
//!
//! A leaf with no `value` is a tombstone: its metadata still advances so the
//! deletion itself replicates.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ids::ClientSessionId;

// ───────────────────────────────────────────────────────────────────
// Value shapes
// ───────────────────────────────────────────────────────────────────

/// Revision and sender-local timestamp (ms) of a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueMetadata {
    pub revision: u64,
    pub timestamp: i64,
}

/// A single replicated value. `value == None` is a tombstone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueState<T> {
    pub revision: u64,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<T>,
}

impl<T> ValueState<T> {
    pub fn new(revision: u64, timestamp: i64, value: T) -> Self {
        Self { revision, timestamp, value: Some(value) }
    }

    pub fn tombstone(revision: u64, timestamp: i64) -> Self {
        Self { revision, timestamp, value: None }
    }

    pub fn metadata(&self) -> ValueMetadata {
        ValueMetadata { revision: self.revision, timestamp: self.timestamp }
    }
}

/// A nested set of replicated values sharing one directory revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueDirectory<T> {
    pub revision: u64,
    pub items: BTreeMap<String, ValueDirectoryOrState<T>>,
}

impl<T> ValueDirectory<T> {
    pub fn new(revision: u64) -> Self {
        Self { revision, items: BTreeMap::new() }
    }
}

/// Unit of replication for one `(key, client)` pair.
///
/// Untagged on the wire: a directory is recognised by its `items` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueDirectoryOrState<T> {
    Directory(ValueDirectory<T>),
    State(ValueState<T>),
}

impl<T> ValueDirectoryOrState<T> {
    pub fn revision(&self) -> u64 {
        match self {
            Self::Directory(dir) => dir.revision,
            Self::State(state) => state.revision,
        }
    }

    pub fn as_state(&self) -> Option<&ValueState<T>> {
        match self {
            Self::State(state) => Some(state),
            Self::Directory(_) => None,
        }
    }

    pub fn as_directory(&self) -> Option<&ValueDirectory<T>> {
        match self {
            Self::Directory(dir) => Some(dir),
            Self::State(_) => None,
        }
    }
}

impl<T> From<ValueState<T>> for ValueDirectoryOrState<T> {
    fn from(state: ValueState<T>) -> Self {
        Self::State(state)
    }
}

impl<T> From<ValueDirectory<T>> for ValueDirectoryOrState<T> {
    fn from(dir: ValueDirectory<T>) -> Self {
        Self::Directory(dir)
    }
}

// ───────────────────────────────────────────────────────────────────
// Payloads
// ───────────────────────────────────────────────────────────────────

/// All known values for one manager key, across client sessions.
pub type ClientRecord<T> = BTreeMap<ClientSessionId, ValueDirectoryOrState<T>>;

/// Wire/storage shape of a value whose type is only known to its manager.
pub type RawState = ValueDirectoryOrState<serde_json::Value>;

/// Manager key → client record, for one workspace.
pub type WorkspacePayload = BTreeMap<String, ClientRecord<serde_json::Value>>;

/// Workspace address → workspace payload, as carried by every signal.
pub type DatastorePayload = BTreeMap<String, WorkspacePayload>;

/// Write `update` over `base` unconditionally.
///
/// Used for the local client's own entries, which always win. Directory
/// updates replace only the items they carry so a partial update (one changed
/// map item) keeps every other item.
pub fn overlay<T>(base: &mut Option<ValueDirectoryOrState<T>>, update: ValueDirectoryOrState<T>) {
    let update = match update {
        ValueDirectoryOrState::Directory(update) => update,
        state => {
            *base = Some(state);
            return;
        }
    };
    if let Some(ValueDirectoryOrState::Directory(existing)) = base {
        existing.revision = update.revision;
        for (key, item) in update.items {
            let mut slot = existing.items.remove(&key);
            overlay(&mut slot, item);
            if let Some(item) = slot {
                existing.items.insert(key, item);
            }
        }
        return;
    }
    *base = Some(ValueDirectoryOrState::Directory(update));
}

/// Overlay a whole workspace payload into another.
pub fn overlay_workspace(base: &mut WorkspacePayload, update: WorkspacePayload) {
    for (key, record) in update {
        let target = base.entry(key).or_default();
        for (client, value) in record {
            let mut slot = target.remove(&client);
            overlay(&mut slot, value);
            if let Some(value) = slot {
                target.insert(client, value);
            }
        }
    }
}

// ===================================================================
// Tests
// ===================================================================
