//! Presence tuning knobs.

use serde::{Deserialize, Serialize};

use crate::latency::DEFAULT_MAX_SAMPLES;

/// Presence configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Fixed part of the delay before a non-provider answers a join (ms)
    pub join_broadcast_base_delay_ms: u64,
    /// Extra delay per position in the membership list (ms)
    pub join_broadcast_step_ms: u64,
    /// Number of existing clients asked to answer our join immediately
    pub max_update_providers: usize,
    /// Default broadcast latency budget for `Latest` managers (ms)
    pub latest_allowable_latency_ms: u64,
    /// Default broadcast latency budget for `LatestMap` managers (ms)
    pub latest_map_allowable_latency_ms: u64,
    /// Cap on samples in the latency running average
    pub max_latency_samples: u32,
    /// Buffered events per subscriber before lagging receivers drop events
    pub event_channel_capacity: usize,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            join_broadcast_base_delay_ms: 200,
            join_broadcast_step_ms: 20,
            max_update_providers: 3,
            latest_allowable_latency_ms: 60,
            latest_map_allowable_latency_ms: 60,
            max_latency_samples: DEFAULT_MAX_SAMPLES,
            event_channel_capacity: 64,
        }
    }
}

impl PresenceConfig {
    /// Parse from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Delay before a client at `position` in the membership list answers a
    /// join it was not asked to serve.
    pub fn join_broadcast_delay_ms(&self, position: usize) -> u64 {
        self.join_broadcast_base_delay_ms + position as u64 * self.join_broadcast_step_ms
    }
}
