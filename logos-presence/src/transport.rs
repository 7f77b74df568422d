//! Seams to the host environment.
//!
//! The presence core never talks to a network or reads a clock directly. The
//! host supplies:
//!
//! - a [`SignalTransport`] that broadcasts (or unicasts) outbound signals,
//! - an [`Audience`] listing the currently connected clients, oldest first,
//! - a [`Clock`] returning wall-clock milliseconds.
//!
//! Channel- and lock-backed implementations are provided for hosts that
//! drive presence from a tokio task.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

use crate::ids::ClientConnectionId;
use crate::protocol::OutboundSignal;

/// Best-effort signal submission.
pub trait SignalTransport: Send {
    fn submit_signal(&mut self, signal: OutboundSignal);
}

/// Session membership, ordered by join time.
pub trait Audience: Send {
    fn members(&self) -> Vec<ClientConnectionId>;
}

/// Wall-clock reading in milliseconds.
pub trait Clock: Send {
    fn now_ms(&self) -> i64;
}

/// Milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_millis() as i64)
    }
}

/// Manually advanced clock shared between clones.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self { now: Arc::new(AtomicI64::new(start_ms)) }
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::Relaxed);
    }

    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::Relaxed)
    }
}

/// Forwards outbound signals into an unbounded channel.
///
/// The receiving end is typically a writer task that pushes signals onto
/// the real connection.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    sender: mpsc::UnboundedSender<OutboundSignal>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundSignal>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl SignalTransport for ChannelTransport {
    fn submit_signal(&mut self, signal: OutboundSignal) {
        if self.sender.send(signal).is_err() {
            log::debug!("Dropping outbound presence signal: transport receiver closed");
        }
    }
}

/// Membership list shared with whatever tracks connections.
#[derive(Debug, Clone, Default)]
pub struct SharedAudience {
    members: Arc<RwLock<Vec<ClientConnectionId>>>,
}

impl SharedAudience {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a newly connected client.
    pub fn add(&self, connection: ClientConnectionId) {
        let mut members = self.members.write().unwrap_or_else(PoisonError::into_inner);
        if !members.contains(&connection) {
            members.push(connection);
        }
    }

    pub fn remove(&self, connection: &ClientConnectionId) {
        let mut members = self.members.write().unwrap_or_else(PoisonError::into_inner);
        members.retain(|member| member != connection);
    }
}

impl Audience for SharedAudience {
    fn members(&self) -> Vec<ClientConnectionId> {
        self.members.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
