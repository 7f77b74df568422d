//! Per-client map of independently replicated items.
//!
//! The local map is one value directory: every item is a leaf with its own
//! revision, and the directory revision advances on every local change. Only
//! the changed items travel in an update; deletions are tombstones.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use tokio::sync::broadcast;

use super::{decode_state, encode_state, ManagerFactory, ManagerRegistration, PresenceValue, ValueManager};
use crate::datastore::{DatastoreAccess, DatastoreHandle, UpdateOptions};
use crate::error::PresenceError;
use crate::ids::ClientSessionId;
use crate::state::{RawState, ValueDirectory, ValueMetadata, ValueState};

// ───────────────────────────────────────────────────────────────────
// Items and events
// ───────────────────────────────────────────────────────────────────

/// Map keys travel as strings on the wire.
pub trait MapKey: Clone + Ord + fmt::Display + FromStr + Send + 'static {}

impl<K> MapKey for K where K: Clone + Ord + fmt::Display + FromStr + Send + 'static {}

#[derive(Debug, Clone, PartialEq)]
pub struct LatestMapItem<V> {
    pub value: V,
    pub metadata: ValueMetadata,
}

/// One item of an aggregate update. `value == None` means removed.
#[derive(Debug, Clone, PartialEq)]
pub struct LatestMapItemChange<K, V> {
    pub key: K,
    pub value: Option<V>,
    pub metadata: ValueMetadata,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LatestMapEvent<K, V> {
    ItemUpdated { client: ClientSessionId, key: K, item: LatestMapItem<V> },
    ItemRemoved { client: ClientSessionId, key: K, metadata: ValueMetadata },
    /// Every item change carried by one remote update.
    Updated { client: ClientSessionId, changes: Vec<LatestMapItemChange<K, V>> },
    LocalItemUpdated { key: K, value: V },
    LocalItemRemoved { key: K },
}

// ───────────────────────────────────────────────────────────────────
// Factory
// ───────────────────────────────────────────────────────────────────

/// Creates an empty [`LatestMapValueManager`].
pub fn latest_map<K: MapKey, V: PresenceValue>() -> LatestMapFactory<K, V> {
    LatestMapFactory { initial: BTreeMap::new(), allowable_latency_ms: None }
}

pub struct LatestMapFactory<K, V> {
    initial: BTreeMap<K, V>,
    allowable_latency_ms: Option<u64>,
}

impl<K: MapKey, V: PresenceValue> LatestMapFactory<K, V> {
    pub fn with_item(mut self, key: K, value: V) -> Self {
        self.initial.insert(key, value);
        self
    }

    pub fn with_items(mut self, items: impl IntoIterator<Item = (K, V)>) -> Self {
        self.initial.extend(items);
        self
    }

    /// Override the configured broadcast latency budget.
    pub fn with_allowable_latency(mut self, allowable_latency_ms: u64) -> Self {
        self.allowable_latency_ms = Some(allowable_latency_ms);
        self
    }
}

impl<K: MapKey, V: PresenceValue> ManagerFactory for LatestMapFactory<K, V> {
    fn instantiate(self: Box<Self>, key: &str, datastore: &mut dyn DatastoreAccess) -> ManagerRegistration {
        let config = datastore.config();
        let allowable_latency_ms = self.allowable_latency_ms.unwrap_or(config.latest_map_allowable_latency_ms);
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        let mut manager = LatestMapValueManager {
            key: key.to_string(),
            revision: 0,
            items: BTreeMap::new(),
            allowable_latency_ms,
            events,
            _key: PhantomData,
        };

        let existing = datastore.known_values(key).self_state().and_then(RawState::as_directory);
        if let Some(dir) = existing {
            manager.revision = dir.revision;
            for (item_key, item) in &dir.items {
                let Some(state) = item.as_state() else { continue };
                match (item_key.parse::<K>(), decode_state::<V>(state)) {
                    (Ok(parsed), Ok(state)) => {
                        manager.items.insert(parsed, state);
                    }
                    _ => log::warn!("Skipping existing local item '{item_key}' of '{key}': type mismatch"),
                }
            }
            return ManagerRegistration { manager: Box::new(manager), initial_state: None };
        }

        let now = datastore.now();
        let mut dir = ValueDirectory::new(0);
        for (item_key, value) in self.initial {
            let state = ValueState::new(0, now, value);
            match encode_state(&state) {
                Ok(raw) => {
                    dir.items.insert(item_key.to_string(), raw);
                    manager.items.insert(item_key, state);
                }
                Err(err) => log::error!("Failed to encode initial item '{item_key}' of '{key}': {err}"),
            }
        }
        let initial_state = Some((dir.into(), UpdateOptions::with_latency(allowable_latency_ms)));
        ManagerRegistration { manager: Box::new(manager), initial_state }
    }
}

// ───────────────────────────────────────────────────────────────────
// Replicated manager
// ───────────────────────────────────────────────────────────────────

/// Holds the local map of a `LatestMap` key and diffs remote ones.
pub struct LatestMapValueManager<K, V> {
    key: String,
    revision: u64,
    items: BTreeMap<K, ValueState<V>>,
    allowable_latency_ms: u64,
    events: broadcast::Sender<LatestMapEvent<K, V>>,
    _key: PhantomData<fn() -> K>,
}

fn leaf_items(state: Option<&RawState>) -> BTreeMap<String, ValueState<serde_json::Value>> {
    state
        .and_then(RawState::as_directory)
        .map(|dir| {
            dir.items
                .iter()
                .filter_map(|(key, item)| item.as_state().map(|state| (key.clone(), state.clone())))
                .collect()
        })
        .unwrap_or_default()
}

impl<K: MapKey, V: PresenceValue> LatestMapValueManager<K, V> {
    fn diff(
        &self,
        client: &ClientSessionId,
        before: &BTreeMap<String, ValueState<serde_json::Value>>,
        after: BTreeMap<String, ValueState<serde_json::Value>>,
    ) -> Vec<LatestMapItemChange<K, V>> {
        let mut changes = Vec::new();
        for (item_key, state) in after {
            let previous = before.get(&item_key);
            if previous == Some(&state) {
                continue;
            }
            let Ok(parsed) = item_key.parse::<K>() else {
                log::warn!("Skipping item '{item_key}' of '{}' from {client}: unparsable key", self.key);
                continue;
            };
            let metadata = state.metadata();
            match decode_state::<V>(&state) {
                Ok(ValueState { value: Some(value), .. }) => {
                    changes.push(LatestMapItemChange { key: parsed, value: Some(value), metadata });
                }
                Ok(_) if previous.is_some_and(|previous| previous.value.is_some()) => {
                    changes.push(LatestMapItemChange { key: parsed, value: None, metadata });
                }
                Ok(_) => {}
                Err(err) => log::warn!("Item '{item_key}' of '{}' from {client} has the wrong type: {err}", self.key),
            }
        }
        changes
    }
}

impl<K: MapKey, V: PresenceValue> ValueManager for LatestMapValueManager<K, V> {
    fn kind(&self) -> &'static str {
        "LatestMap"
    }

    fn update(&mut self, client: &ClientSessionId, value: &RawState, datastore: &mut dyn DatastoreAccess) {
        if value.as_directory().is_none() {
            log::warn!("Ignoring leaf state for LatestMap '{}' from {client}", self.key);
            return;
        }
        let before = leaf_items(datastore.known_values(&self.key).states.get(client));
        if !datastore.update(&self.key, client, value) {
            log::debug!("Ignoring stale '{}' from {client}", self.key);
            return;
        }
        let after = leaf_items(datastore.known_values(&self.key).states.get(client));

        let changes = self.diff(client, &before, after);
        if changes.is_empty() {
            return;
        }
        for change in &changes {
            let event = match &change.value {
                Some(value) => LatestMapEvent::ItemUpdated {
                    client: client.clone(),
                    key: change.key.clone(),
                    item: LatestMapItem { value: value.clone(), metadata: change.metadata },
                },
                None => LatestMapEvent::ItemRemoved {
                    client: client.clone(),
                    key: change.key.clone(),
                    metadata: change.metadata,
                },
            };
            let _ = self.events.send(event);
        }
        let _ = self.events.send(LatestMapEvent::Updated { client: client.clone(), changes });
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

// ───────────────────────────────────────────────────────────────────
// Application view
// ───────────────────────────────────────────────────────────────────

/// Typed access to a `LatestMap` key of one workspace.
pub struct LatestMap<'a, K, V> {
    manager: &'a mut LatestMapValueManager<K, V>,
    datastore: DatastoreHandle<'a>,
}

impl<'a, K: MapKey, V: PresenceValue> LatestMap<'a, K, V> {
    pub(crate) fn new(manager: &'a mut LatestMapValueManager<K, V>, datastore: DatastoreHandle<'a>) -> Self {
        Self { manager, datastore }
    }

    pub fn key(&self) -> &str {
        &self.manager.key
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.manager.items.get(key).and_then(|state| state.value.as_ref())
    }

    pub fn has(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> Vec<K> {
        self.iter().map(|(key, _)| key.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Present (non-deleted) local items.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.manager
            .items
            .iter()
            .filter_map(|(key, state)| state.value.as_ref().map(|value| (key, value)))
    }

    /// Directory revision of the local map.
    pub fn revision(&self) -> u64 {
        self.manager.revision
    }

    pub fn set(&mut self, key: K, value: V) -> Result<(), PresenceError> {
        let raw = serde_json::to_value(&value)?;
        let now = self.datastore.now();
        let manager = &mut *self.manager;
        let revision = manager.items.get(&key).map_or(0, |state| state.revision + 1);
        manager.revision += 1;

        let mut dir = ValueDirectory::new(manager.revision);
        dir.items.insert(key.to_string(), ValueState::new(revision, now, raw).into());
        self.datastore.local_update(&manager.key, dir.into(), UpdateOptions::with_latency(manager.allowable_latency_ms));

        manager.items.insert(key.clone(), ValueState::new(revision, now, value.clone()));
        let _ = manager.events.send(LatestMapEvent::LocalItemUpdated { key, value });
        Ok(())
    }

    /// Tombstone `key`. Returns whether it was present.
    pub fn delete(&mut self, key: &K) -> bool {
        if !self.has(key) {
            return false;
        }
        self.tombstone(std::slice::from_ref(key));
        true
    }

    /// Tombstone every present item in one update.
    pub fn clear(&mut self) {
        let keys = self.keys();
        if !keys.is_empty() {
            self.tombstone(&keys);
        }
    }

    fn tombstone(&mut self, keys: &[K]) {
        let now = self.datastore.now();
        let manager = &mut *self.manager;
        manager.revision += 1;
        let mut dir = ValueDirectory::new(manager.revision);
        for key in keys {
            let revision = manager.items.get(key).map_or(0, |state| state.revision + 1);
            manager.items.insert(key.clone(), ValueState::tombstone(revision, now));
            dir.items.insert(key.to_string(), ValueState::tombstone(revision, now).into());
        }
        self.datastore.local_update(&manager.key, dir.into(), UpdateOptions::with_latency(manager.allowable_latency_ms));
        for key in keys {
            let _ = manager.events.send(LatestMapEvent::LocalItemRemoved { key: key.clone() });
        }
    }

    /// Present items of `client`, which may be the local session.
    pub fn client_value(&self, client: &ClientSessionId) -> Result<BTreeMap<K, LatestMapItem<V>>, PresenceError> {
        if client == self.datastore.client_session_id() {
            return Ok(self
                .manager
                .items
                .iter()
                .filter_map(|(key, state)| {
                    state.value.clone().map(|value| (key.clone(), LatestMapItem { value, metadata: state.metadata() }))
                })
                .collect());
        }
        let known = self.datastore.known_values(&self.manager.key);
        let dir = known
            .states
            .get(client)
            .and_then(RawState::as_directory)
            .ok_or_else(|| PresenceError::NotFound(client.clone()))?;
        let mut items = BTreeMap::new();
        for (item_key, item) in &dir.items {
            let Some(state) = item.as_state() else { continue };
            let Ok(parsed) = item_key.parse::<K>() else { continue };
            if let ValueState { value: Some(value), revision, timestamp } = decode_state::<V>(state)? {
                items.insert(parsed, LatestMapItem { value, metadata: ValueMetadata { revision, timestamp } });
            }
        }
        Ok(items)
    }

    /// Items of every remote client. Clients with mistyped items are skipped.
    pub fn client_values(&self) -> Vec<(ClientSessionId, BTreeMap<K, LatestMapItem<V>>)> {
        self.clients()
            .into_iter()
            .filter_map(|client| match self.client_value(&client) {
                Ok(items) => Some((client, items)),
                Err(err) => {
                    log::warn!("Skipping '{}' for {client}: {err}", self.manager.key);
                    None
                }
            })
            .collect()
    }

    /// Remote clients with a map under this key.
    pub fn clients(&self) -> Vec<ClientSessionId> {
        self.datastore
            .known_values(&self.manager.key)
            .remote()
            .filter(|(_, state)| state.as_directory().is_some())
            .map(|(client, _)| client.clone())
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LatestMapEvent<K, V>> {
        self.manager.events.subscribe()
    }
}

// ===================================================================
// Tests
// ===================================================================
