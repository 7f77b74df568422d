//! Per-workspace replicated state and the capability handed to managers.
//!
//! A [`Datastore`] maps manager key → [`ClientRecord`] of raw JSON states.
//! It is schema-agnostic: keys with no registered manager are merged and kept
//! exactly like managed ones, so they can be rebroadcast and later adopted.
//!
//! Value managers never see the datastore directly. They receive a
//! [`DatastoreAccess`] capability that only allows writing the local client's
//! entry (which always wins), merging a remote client's entry, and reading.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::config::PresenceConfig;
use crate::ids::{ClientConnectionId, ClientSessionId, WorkspaceAddress};
use crate::merge::merge_into;
use crate::presence::PresenceContext;
use crate::state::{overlay, ClientRecord, RawState, WorkspacePayload};

static EMPTY_RECORD: ClientRecord<Value> = BTreeMap::new();

// ───────────────────────────────────────────────────────────────────
// Options and views
// ───────────────────────────────────────────────────────────────────

/// How a local update is sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// How long the update may wait to be batched with others (ms).
    /// Zero sends immediately.
    pub allowable_latency_ms: u64,
    /// Send only to this connection.
    pub target_client_id: Option<ClientConnectionId>,
}

impl UpdateOptions {
    pub fn with_latency(allowable_latency_ms: u64) -> Self {
        Self { allowable_latency_ms, target_client_id: None }
    }

    pub fn immediate() -> Self {
        Self::default()
    }

    pub fn targeted(target_client_id: ClientConnectionId) -> Self {
        Self { allowable_latency_ms: 0, target_client_id: Some(target_client_id) }
    }
}

/// Every known state for one key, plus which session is the local one.
#[derive(Debug, Clone, Copy)]
pub struct KnownValues<'a> {
    pub self_id: &'a ClientSessionId,
    pub states: &'a ClientRecord<Value>,
}

impl<'a> KnownValues<'a> {
    pub fn self_state(&self) -> Option<&'a RawState> {
        self.states.get(self.self_id)
    }

    /// States of every session except the local one.
    pub fn remote(&self) -> impl Iterator<Item = (&'a ClientSessionId, &'a RawState)> + 'a {
        let self_id = self.self_id;
        self.states.iter().filter(move |(client, _)| *client != self_id)
    }
}

// ───────────────────────────────────────────────────────────────────
// Storage
// ───────────────────────────────────────────────────────────────────

/// Replicated state of one workspace.
#[derive(Debug, Default)]
pub struct Datastore {
    records: WorkspacePayload,
}

impl Datastore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, key: &str) -> Option<&ClientRecord<Value>> {
        self.records.get(key)
    }

    pub fn get(&self, key: &str, client: &ClientSessionId) -> Option<&RawState> {
        self.records.get(key).and_then(|record| record.get(client))
    }

    /// Merge a remote client's state. Returns whether anything changed.
    pub fn update(&mut self, key: &str, client: &ClientSessionId, value: &RawState, time_delta: i64) -> bool {
        let record = self.records.entry(key.to_string()).or_default();
        let mut slot = record.remove(client);
        let changed = merge_into(&mut slot, value, time_delta);
        if let Some(merged) = slot {
            record.insert(client.clone(), merged);
        }
        changed
    }

    /// Write the local client's state without any revision check.
    pub fn local_update(&mut self, key: &str, client: &ClientSessionId, value: RawState) {
        let record = self.records.entry(key.to_string()).or_default();
        let mut slot = record.remove(client);
        overlay(&mut slot, value);
        if let Some(value) = slot {
            record.insert(client.clone(), value);
        }
    }

    /// Forget a session that permanently left. Returns whether it had state.
    pub fn remove_client(&mut self, client: &ClientSessionId) -> bool {
        let mut removed = false;
        for record in self.records.values_mut() {
            removed |= record.remove(client).is_some();
        }
        self.records.retain(|_, record| !record.is_empty());
        removed
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn payload(&self) -> &WorkspacePayload {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Manager capability
// ───────────────────────────────────────────────────────────────────

/// Capability through which value managers reach their workspace's state
/// and the signal path.
pub trait DatastoreAccess {
    fn client_session_id(&self) -> &ClientSessionId;

    /// Local wall-clock time (ms).
    fn now(&self) -> i64;

    fn config(&self) -> &PresenceConfig;

    /// Store `value` as the local client's state for `key` and send it.
    fn local_update(&mut self, key: &str, value: RawState, options: UpdateOptions);

    /// Send `value` without storing it anywhere.
    fn send_transient(&mut self, key: &str, value: RawState, options: UpdateOptions);

    /// Merge a remote client's state for `key`, correcting timestamps by the
    /// skew of the signal being processed. Returns whether anything changed.
    fn update(&mut self, key: &str, client: &ClientSessionId, value: &RawState) -> bool;

    fn known_values(&self, key: &str) -> KnownValues<'_>;

    /// Current connection of a connected attendee.
    fn connection_of(&self, client: &ClientSessionId) -> Option<ClientConnectionId>;
}

/// [`DatastoreAccess`] over one workspace for the duration of one operation.
pub(crate) struct DatastoreHandle<'a> {
    address: &'a WorkspaceAddress,
    datastore: &'a mut Datastore,
    context: &'a mut PresenceContext,
    time_delta: i64,
}

impl<'a> DatastoreHandle<'a> {
    pub(crate) fn new(
        address: &'a WorkspaceAddress,
        datastore: &'a mut Datastore,
        context: &'a mut PresenceContext,
        time_delta: i64,
    ) -> Self {
        Self { address, datastore, context, time_delta }
    }
}

impl DatastoreAccess for DatastoreHandle<'_> {
    fn client_session_id(&self) -> &ClientSessionId {
        self.context.client_session_id()
    }

    fn now(&self) -> i64 {
        self.context.now()
    }

    fn config(&self) -> &PresenceConfig {
        self.context.config()
    }

    fn local_update(&mut self, key: &str, value: RawState, options: UpdateOptions) {
        let client = self.context.client_session_id().clone();
        self.datastore.local_update(key, &client, value.clone());
        self.context.send_local(self.address, key, value, options);
    }

    fn send_transient(&mut self, key: &str, value: RawState, options: UpdateOptions) {
        self.context.send_local(self.address, key, value, options);
    }

    fn update(&mut self, key: &str, client: &ClientSessionId, value: &RawState) -> bool {
        self.datastore.update(key, client, value, self.time_delta)
    }

    fn known_values(&self, key: &str) -> KnownValues<'_> {
        KnownValues {
            self_id: self.context.client_session_id(),
            states: self.datastore.record(key).unwrap_or(&EMPTY_RECORD),
        }
    }

    fn connection_of(&self, client: &ClientSessionId) -> Option<ClientConnectionId> {
        self.context.connection_of(client)
    }
}

// ===================================================================
// Tests
// ===================================================================
