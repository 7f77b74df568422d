//! Outbound batching and join catch-up scheduling.
//!
//! Both pieces are plain state machines driven by explicit timestamps; the
//! owner decides when to send and polls them when their deadlines pass.
//!
//! ```text
//!  local update ──► OutboundQueue ──(budget 0 / deadline)──► DatastoreUpdate
//!
//!  ClientJoin ──► JoinScheduler
//!                   ├── self is provider ──► complete broadcast now
//!                   └── otherwise ─► Scheduled(deadline)
//!                                     ├── complete broadcast seen ─► flag cleared
//!                                     └── deadline ─► broadcast if flag still set
//! ```
//!
//! The scheduled delay is `base + position * step` (200ms + 20ms per position
//! by default) so simultaneous joins do not make every client answer at once.
//!
//! Reference: Demers et al., "Epidemic Algorithms for Replicated Database
//! Maintenance" (PODC 1987), Section 1.3 on anti-entropy

use crate::config::PresenceConfig;
use crate::state::{overlay_workspace, DatastorePayload, WorkspacePayload};

// ───────────────────────────────────────────────────────────────────
// Outbound batching
// ───────────────────────────────────────────────────────────────────

/// Local updates waiting for their broadcast latency budget to run out.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    pending: Option<PendingBroadcast>,
}

#[derive(Debug)]
struct PendingBroadcast {
    data: DatastorePayload,
    deadline: i64,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `payload` for `address`, due no later than
    /// `now + allowable_latency_ms`. Later updates to the same entries
    /// overwrite earlier ones.
    pub fn enqueue(&mut self, address: &str, payload: WorkspacePayload, now: i64, allowable_latency_ms: u64) {
        let deadline = now + allowable_latency_ms as i64;
        let pending = self.pending.get_or_insert_with(|| PendingBroadcast {
            data: DatastorePayload::new(),
            deadline,
        });
        pending.deadline = pending.deadline.min(deadline);
        overlay_workspace(pending.data.entry(address.to_string()).or_default(), payload);
    }

    pub fn deadline(&self) -> Option<i64> {
        self.pending.as_ref().map(|pending| pending.deadline)
    }

    pub fn is_due(&self, now: i64) -> bool {
        self.deadline().is_some_and(|deadline| deadline <= now)
    }

    /// Remove and return everything queued.
    pub fn take(&mut self) -> Option<DatastorePayload> {
        self.pending.take().map(|pending| pending.data)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_none()
    }
}

// ───────────────────────────────────────────────────────────────────
// Join catch-up
// ───────────────────────────────────────────────────────────────────

/// Observable join-response state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    Idle,
    /// A complete broadcast is due at `deadline` unless someone else sends one.
    Scheduled { deadline: i64 },
    /// A timer is still pending but its broadcast was cancelled.
    Cancelled { deadline: i64 },
}

/// What to do about a client join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinResponse {
    BroadcastNow,
    Scheduled { deadline: i64 },
}

/// Decides when this client answers a join with a complete broadcast.
///
/// Cancellation clears a flag that is checked when the timer fires; the timer
/// itself is never withdrawn.
#[derive(Debug, Default)]
pub struct JoinScheduler {
    refresh_requested: bool,
    deadline: Option<i64>,
}

impl JoinScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// React to a ClientJoin. `position` is this client's index in the
    /// membership list; a stale position only shifts the delay.
    pub fn on_client_join(
        &mut self,
        is_update_provider: bool,
        position: usize,
        now: i64,
        config: &PresenceConfig,
    ) -> JoinResponse {
        if is_update_provider {
            return JoinResponse::BroadcastNow;
        }
        self.refresh_requested = true;
        let deadline = now + config.join_broadcast_delay_ms(position) as i64;
        let deadline = self.deadline.map_or(deadline, |existing| existing.min(deadline));
        self.deadline = Some(deadline);
        JoinResponse::Scheduled { deadline }
    }

    /// Another client sent a complete broadcast. Returns whether a pending
    /// broadcast was cancelled.
    pub fn on_complete_broadcast_observed(&mut self) -> bool {
        std::mem::replace(&mut self.refresh_requested, false)
    }

    /// This client sent a complete broadcast.
    pub fn on_complete_broadcast_sent(&mut self) {
        self.refresh_requested = false;
    }

    pub fn deadline(&self) -> Option<i64> {
        self.deadline
    }

    /// Fire the timer if due. Returns whether a complete broadcast must be
    /// sent now.
    pub fn fire(&mut self, now: i64) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                std::mem::replace(&mut self.refresh_requested, false)
            }
            _ => false,
        }
    }

    pub fn state(&self) -> JoinState {
        match (self.deadline, self.refresh_requested) {
            (Some(deadline), true) => JoinState::Scheduled { deadline },
            (Some(deadline), false) => JoinState::Cancelled { deadline },
            (None, _) => JoinState::Idle,
        }
    }
}

// ===================================================================
// Tests
// ===================================================================
