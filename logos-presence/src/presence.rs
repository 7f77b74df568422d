//! Session-level presence coordinator.
//!
//! [`PresenceManager`] is the routing table for one client: it owns every
//! workspace, the attendee directory, the latency tracker, the outbound batch
//! and the join scheduler, and it is the only thing that touches the host
//! transport. Everything is synchronous and single-owner; drive it from one
//! task (see [`crate::runtime`]) or call it directly.
//!
//! ```text
//!  InboundSignal ─► process_signal ─┬─ local echo ──► LatencyTracker
//!                                   ├─ DatastoreUpdate ─► skew ─► workspaces ─► managers
//!                                   └─ ClientJoin ──► merge, then JoinScheduler
//!
//!  manager.set_local ─► OutboundQueue ─► poll / budget 0 ─► SignalTransport
//! ```

use std::collections::BTreeMap;
use tokio::sync::broadcast;

use crate::attendees::{Attendee, AttendeeDirectory, AttendeeEvent, SYSTEM_WORKSPACE_ADDRESS};
use crate::broadcast::{JoinResponse, JoinScheduler, JoinState, OutboundQueue};
use crate::config::PresenceConfig;
use crate::datastore::UpdateOptions;
use crate::error::PresenceError;
use crate::ids::{ClientConnectionId, ClientSessionId, WorkspaceAddress};
use crate::latency::LatencyTracker;
use crate::protocol::{ClientJoin, DatastoreUpdate, InboundSignal, OutboundSignal, SignalMessage};
use crate::state::{ClientRecord, DatastorePayload, RawState, WorkspacePayload};
use crate::transport::{Audience, Clock, SignalTransport};
use crate::workspace::{Workspace, WorkspaceMut, WorkspaceSchema};

// ───────────────────────────────────────────────────────────────────
// Session context
// ───────────────────────────────────────────────────────────────────

/// Everything a workspace needs from the session while handling one
/// operation: identity, time, and the outbound path.
pub(crate) struct PresenceContext {
    config: PresenceConfig,
    client_session_id: ClientSessionId,
    connection_id: Option<ClientConnectionId>,
    transport: Box<dyn SignalTransport>,
    audience: Box<dyn Audience>,
    clock: Box<dyn Clock>,
    latency: LatencyTracker,
    outbound: OutboundQueue,
    join: JoinScheduler,
    attendees: AttendeeDirectory,
}

impl PresenceContext {
    pub(crate) fn client_session_id(&self) -> &ClientSessionId {
        &self.client_session_id
    }

    pub(crate) fn now(&self) -> i64 {
        self.clock.now_ms()
    }

    pub(crate) fn config(&self) -> &PresenceConfig {
        &self.config
    }

    pub(crate) fn connection_of(&self, session: &ClientSessionId) -> Option<ClientConnectionId> {
        self.attendees.connection_of(session)
    }

    /// Send a local state for `key` in `address`, batched or targeted per
    /// `options`. Before joining nothing is sent; the join carries it.
    pub(crate) fn send_local(&mut self, address: &WorkspaceAddress, key: &str, value: RawState, options: UpdateOptions) {
        if self.connection_id.is_none() {
            log::debug!("Not connected, holding '{key}' in {address} for the join");
            return;
        }
        let mut record = ClientRecord::new();
        record.insert(self.client_session_id.clone(), value);
        let mut payload = WorkspacePayload::new();
        payload.insert(key.to_string(), record);

        if let Some(target) = options.target_client_id {
            let mut data = DatastorePayload::new();
            data.insert(address.to_string(), payload);
            self.send_update(data, false, Some(target));
            return;
        }

        let now = self.now();
        self.outbound.enqueue(address.as_str(), payload, now, options.allowable_latency_ms);
        if options.allowable_latency_ms == 0 {
            self.flush_outbound();
        }
    }

    fn flush_outbound(&mut self) {
        if let Some(data) = self.outbound.take() {
            self.send_update(data, false, None);
        }
    }

    fn send_update(&mut self, data: DatastorePayload, is_complete: bool, target: Option<ClientConnectionId>) {
        let message = SignalMessage::DatastoreUpdate(DatastoreUpdate {
            send_timestamp: self.now(),
            avg_latency: self.latency.average_latency(),
            is_complete,
            data,
            target_client_id: target.clone(),
        });
        self.submit(&message, target);
    }

    fn submit(&mut self, message: &SignalMessage, target: Option<ClientConnectionId>) {
        match OutboundSignal::new(message, target) {
            Ok(signal) => self.transport.submit_signal(signal),
            Err(err) => log::error!("Dropping {} signal: {err}", message.message_type()),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Coordinator
// ───────────────────────────────────────────────────────────────────

/// Presence state of one client across all workspaces.
pub struct PresenceManager {
    context: PresenceContext,
    workspaces: BTreeMap<WorkspaceAddress, Workspace>,
}

impl PresenceManager {
    pub fn new(
        client_session_id: ClientSessionId,
        config: PresenceConfig,
        transport: impl SignalTransport + 'static,
        audience: impl Audience + 'static,
        clock: impl Clock + 'static,
    ) -> Self {
        let latency = LatencyTracker::new(config.max_latency_samples);
        let attendees = AttendeeDirectory::new(client_session_id.clone(), config.event_channel_capacity);
        Self {
            context: PresenceContext {
                config,
                client_session_id,
                connection_id: None,
                transport: Box::new(transport),
                audience: Box::new(audience),
                clock: Box::new(clock),
                latency,
                outbound: OutboundQueue::new(),
                join: JoinScheduler::new(),
                attendees,
            },
            workspaces: BTreeMap::new(),
        }
    }

    pub fn client_session_id(&self) -> &ClientSessionId {
        &self.context.client_session_id
    }

    pub fn connection_id(&self) -> Option<&ClientConnectionId> {
        self.context.connection_id.as_ref()
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.context.config
    }

    pub fn latency(&self) -> &LatencyTracker {
        &self.context.latency
    }

    /// Current time on the host clock (ms).
    pub fn now(&self) -> i64 {
        self.context.now()
    }

    /// Workspace at `address`, created empty if unknown.
    pub fn workspace(&mut self, address: &str) -> Result<WorkspaceMut<'_>, PresenceError> {
        let address = WorkspaceAddress::parse(address)?;
        let workspace = self
            .workspaces
            .entry(address.clone())
            .or_insert_with(|| Workspace::new(address));
        Ok(WorkspaceMut::new(workspace, &mut self.context))
    }

    /// Workspace at `address` with every manager in `schema` registered.
    pub fn workspace_with(&mut self, address: &str, schema: WorkspaceSchema) -> Result<WorkspaceMut<'_>, PresenceError> {
        let mut workspace = self.workspace(address)?;
        workspace.ensure_content(schema);
        Ok(workspace)
    }

    pub fn workspace_addresses(&self) -> impl Iterator<Item = &WorkspaceAddress> {
        self.workspaces.keys()
    }

    /// Announce this client on `connection_id` with all known state and ask
    /// the oldest other connections to answer at once.
    pub fn join_session(&mut self, connection_id: ClientConnectionId) {
        let now = self.context.now();
        self.context.connection_id = Some(connection_id.clone());
        self.context.attendees.connect_local(connection_id.clone(), now);

        let update_providers: Vec<_> = self
            .context
            .audience
            .members()
            .into_iter()
            .filter(|member| *member != connection_id)
            .take(self.context.config.max_update_providers)
            .collect();
        self.context.outbound.take();
        let message = SignalMessage::ClientJoin(ClientJoin {
            send_timestamp: now,
            avg_latency: self.context.latency.average_latency(),
            update_providers,
            data: self.full_payload(),
        });
        log::info!("Joining presence session as {} on {connection_id}", self.context.client_session_id);
        self.context.submit(&message, None);
    }

    /// Handle a signal from the transport. `local` marks the echo of one of
    /// our own signals.
    pub fn process_signal(&mut self, signal: InboundSignal, local: bool) {
        if !SignalMessage::is_presence_type(&signal.message_type) {
            return;
        }
        let message = match SignalMessage::decode(&signal.message_type, &signal.content) {
            Ok(message) => message,
            Err(err) => {
                log::warn!("Ignoring signal from {}: {err}", signal.client_id);
                return;
            }
        };
        let received = self.context.now();
        let local = local || self.context.connection_id.as_ref() == Some(&signal.client_id);
        if local {
            self.context.latency.record_round_trip(message.send_timestamp(), received);
            return;
        }

        match message {
            SignalMessage::DatastoreUpdate(update) => {
                if let Some(target) = &update.target_client_id {
                    if self.context.connection_id.as_ref() != Some(target) {
                        log::debug!("Ignoring update from {} targeted at {target}", signal.client_id);
                        return;
                    }
                }
                if update.is_complete && self.context.join.on_complete_broadcast_observed() {
                    log::debug!("Complete broadcast from {} cancelled our pending one", signal.client_id);
                }
                let skew = self
                    .context
                    .latency
                    .clock_skew(received, update.avg_latency, update.send_timestamp);
                self.merge_payload(update.data, skew);
            }
            SignalMessage::ClientJoin(join) => {
                let skew = self
                    .context
                    .latency
                    .clock_skew(received, join.avg_latency, join.send_timestamp);
                self.merge_payload(join.data, skew);
                self.respond_to_join(&signal.client_id, &join.update_providers);
            }
        }
    }

    fn merge_payload(&mut self, data: DatastorePayload, time_delta: i64) {
        for (address, payload) in data {
            if address == SYSTEM_WORKSPACE_ADDRESS {
                let members = self.context.audience.members();
                self.context.attendees.process_update(payload, time_delta, &members);
                continue;
            }
            let address = WorkspaceAddress::from_wire(&address);
            let workspace = self
                .workspaces
                .entry(address.clone())
                .or_insert_with(|| Workspace::new(address));
            workspace.process_update(payload, time_delta, &mut self.context);
        }
    }

    fn respond_to_join(&mut self, joiner: &ClientConnectionId, update_providers: &[ClientConnectionId]) {
        let Some(own) = self.context.connection_id.clone() else {
            return;
        };
        let members = self.context.audience.members();
        let position = members.iter().position(|member| *member == own).unwrap_or(members.len());
        let now = self.context.now();
        let is_provider = update_providers.contains(&own);
        match self.context.join.on_client_join(is_provider, position, now, &self.context.config) {
            JoinResponse::BroadcastNow => {
                log::debug!("Answering join of {joiner} as update provider");
                self.broadcast_all_known_state();
            }
            JoinResponse::Scheduled { deadline } => {
                log::debug!("Join of {joiner}: complete broadcast scheduled for {deadline}");
            }
        }
    }

    /// Send every known state of every workspace in one complete update.
    pub fn broadcast_all_known_state(&mut self) {
        if self.context.connection_id.is_none() {
            return;
        }
        self.context.outbound.take();
        let data = self.full_payload();
        self.context.send_update(data, true, None);
        self.context.join.on_complete_broadcast_sent();
        log::info!("Sent complete presence broadcast");
    }

    fn full_payload(&self) -> DatastorePayload {
        let mut data = DatastorePayload::new();
        let system = self.context.attendees.payload();
        if !system.is_empty() {
            data.insert(SYSTEM_WORKSPACE_ADDRESS.to_string(), system.clone());
        }
        for (address, workspace) in &self.workspaces {
            let payload = workspace.datastore().payload();
            if !payload.is_empty() {
                data.insert(address.to_string(), payload.clone());
            }
        }
        data
    }

    /// Run whatever is due: the outbound batch and the join timer.
    pub fn poll(&mut self) {
        let now = self.context.now();
        if self.context.outbound.is_due(now) {
            self.context.flush_outbound();
        }
        if self.context.join.fire(now) {
            log::debug!("Join timer fired with no complete broadcast seen");
            self.broadcast_all_known_state();
        }
    }

    /// Earliest time `poll` has work to do.
    pub fn next_deadline(&self) -> Option<i64> {
        match (self.context.outbound.deadline(), self.context.join.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn join_state(&self) -> JoinState {
        self.context.join.state()
    }

    /// The host saw `connection` join the audience.
    pub fn on_client_connected(&mut self, connection: &ClientConnectionId) {
        self.context.attendees.on_connected(connection);
    }

    /// The host saw `connection` leave. No state is removed.
    pub fn on_client_disconnected(&mut self, connection: &ClientConnectionId) {
        if self.context.connection_id.as_ref() == Some(connection) {
            log::info!("Local connection {connection} lost");
            self.context.connection_id = None;
        }
        self.context.attendees.on_disconnected(connection);
    }

    /// Forget every state of a session that will not return.
    pub fn remove_client_session(&mut self, session: &ClientSessionId) {
        if session == &self.context.client_session_id {
            log::warn!("Refusing to remove the local session");
            return;
        }
        for workspace in self.workspaces.values_mut() {
            workspace.remove_client(session);
        }
        self.context.attendees.remove_session(session);
        log::info!("Removed client session {session}");
    }

    pub fn get_attendee(&self, session: &ClientSessionId) -> Option<Attendee> {
        self.context.attendees.get(session).cloned()
    }

    pub fn get_attendees(&self) -> Vec<Attendee> {
        self.context.attendees.all().cloned().collect()
    }

    /// The local attendee, once joined.
    pub fn get_myself(&self) -> Option<Attendee> {
        self.context.attendees.myself().cloned()
    }

    pub fn subscribe_attendees(&self) -> broadcast::Receiver<AttendeeEvent> {
        self.context.attendees.subscribe()
    }
}

// ===================================================================
// Tests
// ===================================================================
