//! Last-writer-wins single value per client.

use tokio::sync::broadcast;

use super::{decode_state, ManagerFactory, ManagerRegistration, PresenceValue, ValueManager};
use crate::datastore::{DatastoreAccess, DatastoreHandle, UpdateOptions};
use crate::error::PresenceError;
use crate::ids::ClientSessionId;
use crate::state::{RawState, ValueMetadata, ValueState};

/// One client's value with its metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct LatestClientData<T> {
    pub client: ClientSessionId,
    pub value: T,
    pub metadata: ValueMetadata,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LatestEvent<T> {
    /// A remote client's value changed.
    Updated(LatestClientData<T>),
    /// The local value was set.
    LocalUpdated { value: T },
}

/// Creates a [`LatestValueManager`] starting from `initial`.
pub fn latest<T: PresenceValue>(initial: T) -> LatestFactory<T> {
    LatestFactory { initial, allowable_latency_ms: None }
}

pub struct LatestFactory<T> {
    initial: T,
    allowable_latency_ms: Option<u64>,
}

impl<T> LatestFactory<T> {
    /// Override the configured broadcast latency budget.
    pub fn with_allowable_latency(mut self, allowable_latency_ms: u64) -> Self {
        self.allowable_latency_ms = Some(allowable_latency_ms);
        self
    }
}

impl<T: PresenceValue> ManagerFactory for LatestFactory<T> {
    fn instantiate(self: Box<Self>, key: &str, datastore: &mut dyn DatastoreAccess) -> ManagerRegistration {
        let config = datastore.config();
        let allowable_latency_ms = self.allowable_latency_ms.unwrap_or(config.latest_allowable_latency_ms);
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));

        let existing = datastore
            .known_values(key)
            .self_state()
            .and_then(RawState::as_state)
            .and_then(|state| match decode_state::<T>(state) {
                Ok(ValueState { revision, timestamp, value: Some(value) }) => Some((value, revision, timestamp)),
                Ok(_) => None,
                Err(err) => {
                    log::warn!("Existing local value for '{key}' does not match the Latest value type: {err}");
                    None
                }
            });

        let (manager, initial_state) = match existing {
            Some((value, revision, timestamp)) => (
                LatestValueManager { key: key.to_string(), value, revision, timestamp, allowable_latency_ms, events },
                None,
            ),
            None => {
                let timestamp = datastore.now();
                let initial_state = match serde_json::to_value(&self.initial) {
                    Ok(raw) => Some((ValueState::new(0, timestamp, raw).into(), UpdateOptions::with_latency(allowable_latency_ms))),
                    Err(err) => {
                        log::error!("Failed to encode initial value for '{key}': {err}");
                        None
                    }
                };
                let manager = LatestValueManager {
                    key: key.to_string(),
                    value: self.initial,
                    revision: 0,
                    timestamp,
                    allowable_latency_ms,
                    events,
                };
                (manager, initial_state)
            }
        };

        ManagerRegistration { manager: Box::new(manager), initial_state }
    }
}

/// Holds the local value of a `Latest` key and validates remote ones.
pub struct LatestValueManager<T> {
    key: String,
    value: T,
    revision: u64,
    timestamp: i64,
    allowable_latency_ms: u64,
    events: broadcast::Sender<LatestEvent<T>>,
}

impl<T: PresenceValue> ValueManager for LatestValueManager<T> {
    fn kind(&self) -> &'static str {
        "Latest"
    }

    fn update(&mut self, client: &ClientSessionId, value: &RawState, datastore: &mut dyn DatastoreAccess) {
        let Some(incoming) = value.as_state() else {
            log::warn!("Ignoring directory state for Latest value '{}' from {client}", self.key);
            return;
        };
        let current = datastore.known_values(&self.key).states.get(client).map(RawState::revision);
        if current.is_some_and(|revision| incoming.revision <= revision) {
            log::debug!(
                "Ignoring stale '{}' from {client}: revision {} <= {:?}",
                self.key,
                incoming.revision,
                current
            );
            return;
        }
        if !datastore.update(&self.key, client, value) {
            return;
        }

        let known = datastore.known_values(&self.key);
        let Some(stored) = known.states.get(client).and_then(RawState::as_state) else {
            return;
        };
        match decode_state::<T>(stored) {
            Ok(ValueState { revision, timestamp, value: Some(value) }) => {
                let _ = self.events.send(LatestEvent::Updated(LatestClientData {
                    client: client.clone(),
                    value,
                    metadata: ValueMetadata { revision, timestamp },
                }));
            }
            Ok(_) => {}
            Err(err) => log::warn!("Value of '{}' from {client} does not match the Latest value type: {err}", self.key),
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// Typed access to a `Latest` key of one workspace.
pub struct Latest<'a, T> {
    manager: &'a mut LatestValueManager<T>,
    datastore: DatastoreHandle<'a>,
}

impl<'a, T: PresenceValue> Latest<'a, T> {
    pub(crate) fn new(manager: &'a mut LatestValueManager<T>, datastore: DatastoreHandle<'a>) -> Self {
        Self { manager, datastore }
    }

    pub fn key(&self) -> &str {
        &self.manager.key
    }

    pub fn local(&self) -> &T {
        &self.manager.value
    }

    pub fn local_metadata(&self) -> ValueMetadata {
        ValueMetadata { revision: self.manager.revision, timestamp: self.manager.timestamp }
    }

    /// Replace the local value and broadcast it within the latency budget.
    pub fn set_local(&mut self, value: T) -> Result<(), PresenceError> {
        let raw = serde_json::to_value(&value)?;
        let manager = &mut *self.manager;
        manager.revision += 1;
        manager.timestamp = self.datastore.now();
        let state = ValueState::new(manager.revision, manager.timestamp, raw);
        self.datastore.local_update(
            &manager.key,
            state.into(),
            UpdateOptions::with_latency(manager.allowable_latency_ms),
        );
        manager.value = value.clone();
        let _ = manager.events.send(LatestEvent::LocalUpdated { value });
        Ok(())
    }

    /// Value of `client`, which may be the local session.
    pub fn client_value(&self, client: &ClientSessionId) -> Result<LatestClientData<T>, PresenceError> {
        if client == self.datastore.client_session_id() {
            return Ok(LatestClientData {
                client: client.clone(),
                value: self.manager.value.clone(),
                metadata: self.local_metadata(),
            });
        }
        let known = self.datastore.known_values(&self.manager.key);
        let state = known
            .states
            .get(client)
            .and_then(RawState::as_state)
            .filter(|state| state.value.is_some())
            .ok_or_else(|| PresenceError::NotFound(client.clone()))?;
        let ValueState { revision, timestamp, value } = decode_state::<T>(state)?;
        let value = value.ok_or_else(|| PresenceError::NotFound(client.clone()))?;
        Ok(LatestClientData { client: client.clone(), value, metadata: ValueMetadata { revision, timestamp } })
    }

    /// Values of every remote client. Entries of the wrong type are skipped.
    pub fn client_values(&self) -> Vec<LatestClientData<T>> {
        self.clients()
            .into_iter()
            .filter_map(|client| match self.client_value(&client) {
                Ok(data) => Some(data),
                Err(err) => {
                    log::warn!("Skipping '{}' for {client}: {err}", self.manager.key);
                    None
                }
            })
            .collect()
    }

    /// Remote clients that currently have a value.
    pub fn clients(&self) -> Vec<ClientSessionId> {
        self.datastore
            .known_values(&self.manager.key)
            .remote()
            .filter(|(_, state)| state.as_state().is_some_and(|state| state.value.is_some()))
            .map(|(client, _)| client.clone())
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LatestEvent<T>> {
        self.manager.events.subscribe()
    }
}
