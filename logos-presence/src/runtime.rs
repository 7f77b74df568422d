//! Tokio driver for a [`PresenceManager`].
//!
//! The manager is moved into a single task that owns it exclusively. The task
//! applies commands from [`PresenceHandle`]s in arrival order and sleeps until
//! the manager's next deadline to flush batched updates and fire the join
//! timer. Dropping every handle stops the task and returns the manager.

use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::PresenceError;
use crate::ids::{ClientConnectionId, ClientSessionId};
use crate::presence::PresenceManager;
use crate::protocol::InboundSignal;

type Job = Box<dyn FnOnce(&mut PresenceManager) + Send>;

enum PresenceCommand {
    Signal { signal: InboundSignal, local: bool },
    Join(ClientConnectionId),
    ClientConnected(ClientConnectionId),
    ClientDisconnected(ClientConnectionId),
    RemoveSession(ClientSessionId),
    Run(Job),
}

/// Cloneable sender of work to a running presence task.
#[derive(Clone)]
pub struct PresenceHandle {
    commands: mpsc::UnboundedSender<PresenceCommand>,
}

impl PresenceHandle {
    fn send(&self, command: PresenceCommand) -> Result<(), PresenceError> {
        self.commands.send(command).map_err(|_| PresenceError::RuntimeClosed)
    }

    pub fn process_signal(&self, signal: InboundSignal, local: bool) -> Result<(), PresenceError> {
        self.send(PresenceCommand::Signal { signal, local })
    }

    pub fn join_session(&self, connection_id: ClientConnectionId) -> Result<(), PresenceError> {
        self.send(PresenceCommand::Join(connection_id))
    }

    pub fn client_connected(&self, connection_id: ClientConnectionId) -> Result<(), PresenceError> {
        self.send(PresenceCommand::ClientConnected(connection_id))
    }

    pub fn client_disconnected(&self, connection_id: ClientConnectionId) -> Result<(), PresenceError> {
        self.send(PresenceCommand::ClientDisconnected(connection_id))
    }

    pub fn remove_client_session(&self, session: ClientSessionId) -> Result<(), PresenceError> {
        self.send(PresenceCommand::RemoveSession(session))
    }

    /// Run `f` on the task that owns the manager and return its result.
    pub async fn with<R, F>(&self, f: F) -> Result<R, PresenceError>
    where
        R: Send + 'static,
        F: FnOnce(&mut PresenceManager) -> R + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(PresenceCommand::Run(Box::new(move |presence| {
            let _ = reply_tx.send(f(presence));
        })))?;
        reply_rx.await.map_err(|_| PresenceError::RuntimeClosed)
    }
}

/// Move `presence` onto its own task.
pub fn spawn(presence: PresenceManager) -> (PresenceHandle, JoinHandle<PresenceManager>) {
    let (commands, receiver) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(presence, receiver));
    (PresenceHandle { commands }, task)
}

async fn run(mut presence: PresenceManager, mut commands: mpsc::UnboundedReceiver<PresenceCommand>) -> PresenceManager {
    log::debug!("Presence task started for {}", presence.client_session_id());
    loop {
        let wait = presence
            .next_deadline()
            .map(|deadline| Duration::from_millis((deadline - presence.now()).max(0) as u64));

        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                apply(&mut presence, command);
            }
            // Outbound batch or join timer due
            _ = tokio::time::sleep(wait.unwrap_or_default()), if wait.is_some() => {
                presence.poll();
            }
        }
    }
    log::debug!("Presence task stopped for {}", presence.client_session_id());
    presence
}

fn apply(presence: &mut PresenceManager, command: PresenceCommand) {
    match command {
        PresenceCommand::Signal { signal, local } => presence.process_signal(signal, local),
        PresenceCommand::Join(connection_id) => presence.join_session(connection_id),
        PresenceCommand::ClientConnected(connection_id) => presence.on_client_connected(&connection_id),
        PresenceCommand::ClientDisconnected(connection_id) => presence.on_client_disconnected(&connection_id),
        PresenceCommand::RemoveSession(session) => presence.remove_client_session(&session),
        PresenceCommand::Run(job) => job(presence),
    }
    // Zero-budget work is sent inline; anything already due goes now.
    presence.poll();
}
