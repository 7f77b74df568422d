//! Fire-and-forget named messages.
//!
//! Notifications travel as ordinary leaf states under the manager's key but
//! are never stored: a receiver dispatches them to listeners and drops them,
//! and the sender does not keep them in its own datastore either.
//!
//! A client without this manager keeps the message raw like any unknown key
//! and repeats it in its complete broadcasts. Receivers therefore remember the
//! last revision dispatched per sender and drop anything not newer.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::broadcast;

use super::{ManagerFactory, ManagerRegistration, ValueManager};
use crate::datastore::{DatastoreAccess, DatastoreHandle, UpdateOptions};
use crate::error::PresenceError;
use crate::ids::ClientSessionId;
use crate::state::{RawState, ValueState};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NotificationMessage {
    name: String,
    #[serde(default)]
    args: Value,
}

/// A received notification.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationEvent {
    pub client: ClientSessionId,
    pub name: String,
    pub args: Value,
}

impl NotificationEvent {
    pub fn args_as<A: DeserializeOwned>(&self) -> Result<A, PresenceError> {
        Ok(A::deserialize(&self.args)?)
    }
}

pub fn notifications() -> NotificationsFactory {
    NotificationsFactory
}

pub struct NotificationsFactory;

impl ManagerFactory for NotificationsFactory {
    fn instantiate(self: Box<Self>, key: &str, datastore: &mut dyn DatastoreAccess) -> ManagerRegistration {
        let capacity = datastore.config().event_channel_capacity.max(1);
        let (unattended, _) = broadcast::channel(capacity);
        let manager = NotificationsManager {
            key: key.to_string(),
            revision: 0,
            capacity,
            delivered: HashMap::new(),
            listeners: HashMap::new(),
            unattended,
        };
        ManagerRegistration { manager: Box::new(manager), initial_state: None }
    }
}

/// Dispatches received notifications by name.
pub struct NotificationsManager {
    key: String,
    revision: u64,
    capacity: usize,
    /// Last revision dispatched per sender
    delivered: HashMap<ClientSessionId, u64>,
    listeners: HashMap<String, broadcast::Sender<NotificationEvent>>,
    unattended: broadcast::Sender<NotificationEvent>,
}

impl NotificationsManager {
    fn dispatch(&self, event: NotificationEvent) {
        match self.listeners.get(&event.name) {
            Some(listener) if listener.receiver_count() > 0 => {
                let _ = listener.send(event);
            }
            _ => {
                log::debug!("Unattended notification '{}' on '{}' from {}", event.name, self.key, event.client);
                let _ = self.unattended.send(event);
            }
        }
    }
}

impl ValueManager for NotificationsManager {
    fn kind(&self) -> &'static str {
        "Notifications"
    }

    fn update(&mut self, client: &ClientSessionId, value: &RawState, _datastore: &mut dyn DatastoreAccess) {
        let Some(state) = value.as_state() else {
            log::warn!("Ignoring notification directory on '{}' from {client}", self.key);
            return;
        };
        if self.delivered.get(client).is_some_and(|&last| state.revision <= last) {
            log::debug!("Dropping repeated notification {} on '{}' from {client}", state.revision, self.key);
            return;
        }
        self.delivered.insert(client.clone(), state.revision);
        let Some(value) = state.value.as_ref() else {
            log::warn!("Ignoring empty notification on '{}' from {client}", self.key);
            return;
        };
        match NotificationMessage::deserialize(value) {
            Ok(NotificationMessage { name, args }) => {
                self.dispatch(NotificationEvent { client: client.clone(), name, args });
            }
            Err(err) => log::warn!("Ignoring malformed notification on '{}' from {client}: {err}", self.key),
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// Typed access to a `Notifications` key of one workspace.
pub struct Notifications<'a> {
    manager: &'a mut NotificationsManager,
    datastore: DatastoreHandle<'a>,
}

impl<'a> Notifications<'a> {
    pub(crate) fn new(manager: &'a mut NotificationsManager, datastore: DatastoreHandle<'a>) -> Self {
        Self { manager, datastore }
    }

    pub fn key(&self) -> &str {
        &self.manager.key
    }

    /// Send `name(args)` to every client.
    pub fn broadcast<A: Serialize>(&mut self, name: &str, args: &A) -> Result<(), PresenceError> {
        let state = self.message(name, args)?;
        self.datastore.send_transient(&self.manager.key, state, UpdateOptions::immediate());
        Ok(())
    }

    /// Send `name(args)` to the current connection of `target`.
    pub fn unicast<A: Serialize>(&mut self, name: &str, args: &A, target: &ClientSessionId) -> Result<(), PresenceError> {
        let Some(connection) = self.datastore.connection_of(target) else {
            log::warn!("Cannot send '{name}' on '{}': {target} is not connected", self.manager.key);
            return Err(PresenceError::AttendeeNotFound(target.clone()));
        };
        let state = self.message(name, args)?;
        self.datastore.send_transient(&self.manager.key, state, UpdateOptions::targeted(connection));
        Ok(())
    }

    fn message<A: Serialize>(&mut self, name: &str, args: &A) -> Result<RawState, PresenceError> {
        let message = NotificationMessage { name: name.to_string(), args: serde_json::to_value(args)? };
        let value = serde_json::to_value(message)?;
        self.manager.revision += 1;
        Ok(ValueState::new(self.manager.revision, self.datastore.now(), value).into())
    }

    /// Listen for notifications called `name`.
    pub fn on(&mut self, name: &str) -> broadcast::Receiver<NotificationEvent> {
        let capacity = self.manager.capacity;
        self.manager
            .listeners
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(capacity).0)
            .subscribe()
    }

    /// Notifications that arrived with no live listener for their name.
    pub fn subscribe_unattended(&self) -> broadcast::Receiver<NotificationEvent> {
        self.manager.unattended.subscribe()
    }
}
