//! Typed value managers.
//!
//! A manager owns one key of a workspace. It validates remote states for that
//! key before they reach the datastore, raises typed events, and offers a
//! typed local API through a short-lived view ([`Latest`], [`LatestMap`],
//! [`Notifications`]) borrowed from the workspace.
//!
//! Managers are created from factories ([`latest`], [`latest_map`],
//! [`notifications`]) when registered with a workspace.

mod latest;
mod latest_map;
mod notifications;

pub use latest::{latest, Latest, LatestClientData, LatestEvent, LatestFactory, LatestValueManager};
pub use latest_map::{
    latest_map, LatestMap, LatestMapEvent, LatestMapFactory, LatestMapItem, LatestMapItemChange,
    LatestMapValueManager, MapKey,
};
pub use notifications::{
    notifications, NotificationEvent, Notifications, NotificationsFactory, NotificationsManager,
};

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;

use crate::datastore::{DatastoreAccess, UpdateOptions};
use crate::ids::ClientSessionId;
use crate::state::{RawState, ValueDirectoryOrState, ValueState};

/// Values a manager can replicate.
pub trait PresenceValue: Serialize + DeserializeOwned + Clone + Send + 'static {}

impl<T> PresenceValue for T where T: Serialize + DeserializeOwned + Clone + Send + 'static {}

/// Receiving side of a value manager, as seen by its workspace.
pub trait ValueManager: Any + Send {
    /// Short type name used in errors.
    fn kind(&self) -> &'static str;

    /// Process a remote client's state for this manager's key.
    fn update(&mut self, client: &ClientSessionId, value: &RawState, datastore: &mut dyn DatastoreAccess);

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A manager together with the local state it wants published on creation.
pub struct ManagerRegistration {
    pub manager: Box<dyn ValueManager>,
    pub initial_state: Option<(RawState, UpdateOptions)>,
}

/// Creates a manager when it is registered under `key`.
pub trait ManagerFactory: Send {
    fn instantiate(self: Box<Self>, key: &str, datastore: &mut dyn DatastoreAccess) -> ManagerRegistration;
}

pub(crate) fn encode_state<T: Serialize>(state: &ValueState<T>) -> Result<RawState, serde_json::Error> {
    Ok(ValueDirectoryOrState::State(ValueState {
        revision: state.revision,
        timestamp: state.timestamp,
        value: state.value.as_ref().map(serde_json::to_value).transpose()?,
    }))
}

pub(crate) fn decode_state<T: DeserializeOwned>(
    state: &ValueState<serde_json::Value>,
) -> Result<ValueState<T>, serde_json::Error> {
    Ok(ValueState {
        revision: state.revision,
        timestamp: state.timestamp,
        value: state.value.as_ref().map(T::deserialize).transpose()?,
    })
}
