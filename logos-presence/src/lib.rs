//! # logos-presence — Ephemeral presence state for Logos sessions
//!
//! Replicates short-lived per-participant state (cursors, selections,
//! reactions) between clients over a best-effort signal channel. Nothing is
//! persisted and there is no server: every client holds every other client's
//! latest state and converges through revision-based merging.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────── PresenceManager ───────────────────────────┐
//! │                                                                        │
//! │  Workspace "name:pointers"        Workspace "name:chat"                │
//! │  ┌──────────────────────┐        ┌──────────────────────┐              │
//! │  │ Latest   "cursor"    │        │ Notifications "ping" │   system:    │
//! │  │ LatestMap "selected" │        │                      │   presence   │
//! │  │ Datastore            │        │ Datastore            │   (attendees)│
//! │  └──────────┬───────────┘        └──────────┬───────────┘              │
//! │             └──────────── merge ◄───────────┘                          │
//! │  LatencyTracker   OutboundQueue   JoinScheduler                        │
//! └───────────────┬─────────────────────────────────────▲──────────────────┘
//!                 │ OutboundSignal                      │ InboundSignal
//!                 ▼                                     │
//!           SignalTransport ─────────── host ───────────┘
//! ```
//!
//! ## Modules
//!
//! - [`state`] — Value/directory shapes and the local overlay
//! - [`merge`] — Revision-based merge of remote states
//! - [`latency`] — Delivery latency estimate and clock skew
//! - [`datastore`] — Per-workspace state and the manager capability
//! - [`managers`] — `Latest`, `LatestMap`, `Notifications`
//! - [`workspace`] — Manager registration and remote routing
//! - [`broadcast`] — Outbound batching and join catch-up timer
//! - [`presence`] — Session coordinator
//! - [`runtime`] — Tokio task driving a coordinator
//!
//! ## Example
//!
//! ```no_run
//! use logos_presence::{latest, PresenceConfig, PresenceManager, SharedAudience, SystemClock, ChannelTransport};
//!
//! let (transport, _outbox) = ChannelTransport::new();
//! let mut presence = PresenceManager::new(
//!     logos_presence::ClientSessionId::generate(),
//!     PresenceConfig::default(),
//!     transport,
//!     SharedAudience::new(),
//!     SystemClock,
//! );
//! presence.join_session("conn-1".into());
//!
//! let mut workspace = presence.workspace("name:pointers").unwrap();
//! workspace.add("cursor", latest((0.0_f32, 0.0_f32)));
//! let mut cursor = workspace.latest::<(f32, f32)>("cursor").unwrap();
//! cursor.set_local((12.0, 40.0)).unwrap();
//! ```

pub mod attendees;
pub mod broadcast;
pub mod config;
pub mod datastore;
pub mod error;
pub mod ids;
pub mod latency;
pub mod managers;
pub mod merge;
pub mod presence;
pub mod protocol;
pub mod runtime;
pub mod state;
pub mod transport;
pub mod workspace;

// Re-exports for convenience
pub use attendees::{Attendee, AttendeeEvent, AttendeeStatus, SYSTEM_WORKSPACE_ADDRESS};
pub use broadcast::JoinState;
pub use config::PresenceConfig;
pub use datastore::{DatastoreAccess, KnownValues, UpdateOptions};
pub use error::{PresenceError, ProtocolError};
pub use ids::{ClientConnectionId, ClientSessionId, WorkspaceAddress};
pub use latency::LatencyTracker;
pub use managers::{
    latest, latest_map, notifications, Latest, LatestClientData, LatestEvent, LatestMap, LatestMapEvent,
    LatestMapItem, LatestMapItemChange, ManagerFactory, NotificationEvent, Notifications, PresenceValue, ValueManager,
};
pub use presence::PresenceManager;
pub use protocol::{InboundSignal, OutboundSignal, SignalMessage};
pub use runtime::{spawn, PresenceHandle};
pub use state::{ValueDirectory, ValueDirectoryOrState, ValueMetadata, ValueState};
pub use transport::{Audience, ChannelTransport, Clock, ManualClock, SharedAudience, SignalTransport, SystemClock};
pub use workspace::{WorkspaceMut, WorkspaceSchema};
