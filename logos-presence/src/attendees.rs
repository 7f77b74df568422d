//! Attendee tracking through the reserved `system:presence` workspace.
//!
//! Each client publishes, under [`CLIENT_TO_SESSION_KEY`], a value directory
//! mapping every connection id it has used to its session id. Receivers merge
//! these like any other state and derive one [`Attendee`] per session, using
//! the host's audience to tell which connection is live.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::broadcast;

use crate::datastore::Datastore;
use crate::ids::{ClientConnectionId, ClientSessionId};
use crate::state::{ValueDirectory, ValueState, WorkspacePayload};

pub const SYSTEM_WORKSPACE_ADDRESS: &str = "system:presence";
pub const CLIENT_TO_SESSION_KEY: &str = "clientToSessionId";

// ───────────────────────────────────────────────────────────────────
// Attendees
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendeeStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attendee {
    pub session_id: ClientSessionId,
    /// Most recent known connection.
    pub connection_id: ClientConnectionId,
    pub status: AttendeeStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttendeeEvent {
    Connected(Attendee),
    Disconnected(Attendee),
}

// ───────────────────────────────────────────────────────────────────
// Directory
// ───────────────────────────────────────────────────────────────────

pub(crate) struct AttendeeDirectory {
    self_session: ClientSessionId,
    datastore: Datastore,
    attendees: BTreeMap<ClientSessionId, Attendee>,
    sessions_by_connection: HashMap<ClientConnectionId, ClientSessionId>,
    events: broadcast::Sender<AttendeeEvent>,
}

impl AttendeeDirectory {
    pub(crate) fn new(self_session: ClientSessionId, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            self_session,
            datastore: Datastore::new(),
            attendees: BTreeMap::new(),
            sessions_by_connection: HashMap::new(),
            events,
        }
    }

    /// Record that the local session now uses `connection`.
    pub(crate) fn connect_local(&mut self, connection: ClientConnectionId, now: i64) {
        let revision = self
            .datastore
            .get(CLIENT_TO_SESSION_KEY, &self.self_session)
            .map_or(0, |state| state.revision() + 1);
        let mut dir = ValueDirectory::new(revision);
        dir.items.insert(
            connection.to_string(),
            ValueState::new(0, now, Value::String(self.self_session.to_string())).into(),
        );
        let session = self.self_session.clone();
        self.datastore.local_update(CLIENT_TO_SESSION_KEY, &session, dir.into());
        self.sessions_by_connection.insert(connection.clone(), session.clone());
        self.set_attendee(session, connection, AttendeeStatus::Connected);
    }

    /// Merge a remote system workspace payload.
    pub(crate) fn process_update(&mut self, data: WorkspacePayload, time_delta: i64, members: &[ClientConnectionId]) {
        for (key, record) in data {
            for (session, value) in record {
                if session == self.self_session {
                    continue;
                }
                if self.datastore.update(&key, &session, &value, time_delta) && key == CLIENT_TO_SESSION_KEY {
                    self.refresh(&session, members);
                }
            }
        }
    }

    fn refresh(&mut self, session: &ClientSessionId, members: &[ClientConnectionId]) {
        let Some(dir) = self
            .datastore
            .get(CLIENT_TO_SESSION_KEY, session)
            .and_then(|state| state.as_directory())
        else {
            return;
        };

        // Latest live connection wins, then latest of any.
        let mut current: Option<(bool, i64, ClientConnectionId)> = None;
        for (connection, item) in &dir.items {
            let Some(state) = item.as_state() else { continue };
            if state.value.as_ref().and_then(Value::as_str) != Some(session.as_str()) {
                log::warn!("Ignoring connection {connection} claimed for {session} with a mismatched session");
                continue;
            }
            let connection = ClientConnectionId::new(connection.as_str());
            self.sessions_by_connection.insert(connection.clone(), session.clone());
            let live = members.contains(&connection);
            let candidate = (live, state.timestamp, connection);
            if current.as_ref().map_or(true, |best| (candidate.0, candidate.1) > (best.0, best.1)) {
                current = Some(candidate);
            }
        }

        if let Some((live, _, connection)) = current {
            let status = if live { AttendeeStatus::Connected } else { AttendeeStatus::Disconnected };
            self.set_attendee(session.clone(), connection, status);
        }
    }

    fn set_attendee(&mut self, session: ClientSessionId, connection: ClientConnectionId, status: AttendeeStatus) {
        let attendee = Attendee { session_id: session.clone(), connection_id: connection, status };
        let previous = self.attendees.insert(session, attendee.clone());
        if previous.as_ref() == Some(&attendee) {
            return;
        }
        let was_connected = previous.is_some_and(|previous| previous.status == AttendeeStatus::Connected);
        let event = match status {
            AttendeeStatus::Connected => AttendeeEvent::Connected(attendee),
            AttendeeStatus::Disconnected if was_connected => AttendeeEvent::Disconnected(attendee),
            AttendeeStatus::Disconnected => return,
        };
        log::info!("Attendee {event:?}");
        let _ = self.events.send(event);
    }

    /// The host reports `connection` as joined.
    pub(crate) fn on_connected(&mut self, connection: &ClientConnectionId) {
        if let Some(session) = self.sessions_by_connection.get(connection).cloned() {
            self.set_attendee(session, connection.clone(), AttendeeStatus::Connected);
        }
    }

    /// The host reports `connection` as gone. State is kept.
    pub(crate) fn on_disconnected(&mut self, connection: &ClientConnectionId) {
        let Some(session) = self.sessions_by_connection.get(connection).cloned() else {
            return;
        };
        let is_current = self
            .attendees
            .get(&session)
            .is_some_and(|attendee| &attendee.connection_id == connection);
        if is_current {
            self.set_attendee(session, connection.clone(), AttendeeStatus::Disconnected);
        }
    }

    pub(crate) fn remove_session(&mut self, session: &ClientSessionId) {
        self.datastore.remove_client(session);
        self.attendees.remove(session);
        self.sessions_by_connection.retain(|_, known| known != session);
    }

    pub(crate) fn connection_of(&self, session: &ClientSessionId) -> Option<ClientConnectionId> {
        self.attendees
            .get(session)
            .filter(|attendee| attendee.status == AttendeeStatus::Connected)
            .map(|attendee| attendee.connection_id.clone())
    }

    pub(crate) fn get(&self, session: &ClientSessionId) -> Option<&Attendee> {
        self.attendees.get(session)
    }

    pub(crate) fn all(&self) -> impl Iterator<Item = &Attendee> {
        self.attendees.values()
    }

    pub(crate) fn myself(&self) -> Option<&Attendee> {
        self.attendees.get(&self.self_session)
    }

    pub(crate) fn payload(&self) -> &WorkspacePayload {
        self.datastore.payload()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<AttendeeEvent> {
        self.events.subscribe()
    }
}

// ===================================================================
// Tests
// ===================================================================
