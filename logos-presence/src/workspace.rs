//! Named groups of value managers.
//!
//! A [`Workspace`] pairs one [`Datastore`] with the managers registered on
//! it. Remote states for a registered key go through that key's manager;
//! states for unregistered keys are merged raw and kept, so a manager added
//! later starts from everything already received.

use std::collections::BTreeMap;

use crate::datastore::{Datastore, DatastoreAccess, DatastoreHandle, KnownValues};
use crate::error::PresenceError;
use crate::ids::{ClientSessionId, WorkspaceAddress};
use crate::managers::{
    latest, latest_map, notifications, Latest, LatestMap, LatestMapValueManager, LatestValueManager, ManagerFactory,
    MapKey, Notifications, NotificationsManager, PresenceValue, ValueManager,
};
use crate::presence::PresenceContext;
use crate::state::WorkspacePayload;

pub struct Workspace {
    address: WorkspaceAddress,
    datastore: Datastore,
    managers: BTreeMap<String, Box<dyn ValueManager>>,
}

impl Workspace {
    pub(crate) fn new(address: WorkspaceAddress) -> Self {
        Self { address, datastore: Datastore::new(), managers: BTreeMap::new() }
    }

    pub fn address(&self) -> &WorkspaceAddress {
        &self.address
    }

    pub fn datastore(&self) -> &Datastore {
        &self.datastore
    }

    /// Route one remote workspace payload to managers, or into the datastore
    /// for unregistered keys. Entries for the local session are skipped.
    pub(crate) fn process_update(&mut self, data: WorkspacePayload, time_delta: i64, context: &mut PresenceContext) {
        let self_id = context.client_session_id().clone();
        let Self { address, datastore, managers } = self;
        for (key, record) in data {
            for (client, value) in record {
                if client == self_id {
                    continue;
                }
                let mut handle = DatastoreHandle::new(address, datastore, context, time_delta);
                match managers.get_mut(&key) {
                    Some(manager) => manager.update(&client, &value, &mut handle),
                    None => {
                        handle.update(&key, &client, &value);
                    }
                }
            }
        }
    }

    pub(crate) fn remove_client(&mut self, client: &ClientSessionId) {
        if self.datastore.remove_client(client) {
            log::debug!("Removed {client} from {}", self.address);
        }
    }
}

/// Factories for a set of managers, applied with
/// [`WorkspaceMut::ensure_content`].
#[derive(Default)]
pub struct WorkspaceSchema {
    entries: Vec<(String, Box<dyn ManagerFactory>)>,
}

impl WorkspaceSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, factory: impl ManagerFactory + 'static) -> Self {
        self.entries.push((key.to_string(), Box::new(factory)));
        self
    }

    pub fn with_latest<T: PresenceValue>(self, key: &str, initial: T) -> Self {
        self.with(key, latest(initial))
    }

    pub fn with_latest_map<K: MapKey, V: PresenceValue>(self, key: &str) -> Self {
        self.with(key, latest_map::<K, V>())
    }

    pub fn with_notifications(self, key: &str) -> Self {
        self.with(key, notifications())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }
}

/// A workspace borrowed together with its session, for local operations.
pub struct WorkspaceMut<'a> {
    workspace: &'a mut Workspace,
    context: &'a mut PresenceContext,
}

impl<'a> WorkspaceMut<'a> {
    pub(crate) fn new(workspace: &'a mut Workspace, context: &'a mut PresenceContext) -> Self {
        Self { workspace, context }
    }

    pub fn address(&self) -> &WorkspaceAddress {
        &self.workspace.address
    }

    /// Register a manager under `key` and publish its initial state.
    ///
    /// # Panics
    ///
    /// If `key` already has a manager.
    pub fn add(&mut self, key: &str, factory: impl ManagerFactory + 'static) {
        self.add_boxed(key, Box::new(factory));
    }

    fn add_boxed(&mut self, key: &str, factory: Box<dyn ManagerFactory>) {
        let Workspace { address, datastore, managers } = &mut *self.workspace;
        assert!(
            !managers.contains_key(key),
            "Value manager '{key}' is already registered in workspace {address}"
        );
        let mut handle = DatastoreHandle::new(address, datastore, self.context, 0);
        let registration = factory.instantiate(key, &mut handle);
        if let Some((state, options)) = registration.initial_state {
            handle.local_update(key, state, options);
        }
        log::debug!("Registered {} '{key}' in {address}", registration.manager.kind());
        managers.insert(key.to_string(), registration.manager);
    }

    /// Register every manager of `schema` whose key is not taken yet.
    pub fn ensure_content(&mut self, schema: WorkspaceSchema) {
        for (key, factory) in schema.entries {
            if !self.has(&key) {
                self.add_boxed(&key, factory);
            }
        }
    }

    pub fn has(&self, key: &str) -> bool {
        self.workspace.managers.contains_key(key)
    }

    /// Keys with a registered manager.
    pub fn keys(&self) -> Vec<&str> {
        self.workspace.managers.keys().map(String::as_str).collect()
    }

    /// Raw states of every client for `key`, registered or not.
    pub fn known_values(&self, key: &str) -> Option<KnownValues<'_>> {
        self.workspace.datastore.record(key).map(|states| KnownValues {
            self_id: self.context.client_session_id(),
            states,
        })
    }

    fn manager<M: ValueManager>(self, key: &str, expected: &'static str) -> Result<(&'a mut M, DatastoreHandle<'a>), PresenceError> {
        let Workspace { address, datastore, managers } = self.workspace;
        let manager = managers
            .get_mut(key)
            .ok_or_else(|| PresenceError::ManagerNotFound(key.to_string()))?;
        let manager = manager
            .as_any_mut()
            .downcast_mut::<M>()
            .ok_or_else(|| PresenceError::ManagerTypeMismatch { key: key.to_string(), expected })?;
        Ok((manager, DatastoreHandle::new(address, datastore, self.context, 0)))
    }

    pub fn latest<T: PresenceValue>(self, key: &str) -> Result<Latest<'a, T>, PresenceError> {
        let (manager, datastore) = self.manager::<LatestValueManager<T>>(key, "Latest")?;
        Ok(Latest::new(manager, datastore))
    }

    pub fn latest_map<K: MapKey, V: PresenceValue>(self, key: &str) -> Result<LatestMap<'a, K, V>, PresenceError> {
        let (manager, datastore) = self.manager::<LatestMapValueManager<K, V>>(key, "LatestMap")?;
        Ok(LatestMap::new(manager, datastore))
    }

    pub fn notifications(self, key: &str) -> Result<Notifications<'a>, PresenceError> {
        let (manager, datastore) = self.manager::<NotificationsManager>(key, "Notifications")?;
        Ok(Notifications::new(manager, datastore))
    }
}
