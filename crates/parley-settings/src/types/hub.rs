use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Connection hub and session pump tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HubSettings {
    /// Capacity of each session's outbound buffer.
    pub outbound_buffer: usize,
    /// Keepalive ping period. Must be shorter than the read deadline.
    pub ping_interval_ms: u64,
    /// Inactivity window before the receive loop gives up on a peer.
    pub read_deadline_ms: u64,
    /// Bound on every outbound frame write.
    pub write_deadline_ms: u64,
    /// Largest inbound frame accepted.
    pub max_frame_bytes: usize,
    /// Depth of each of the hub's request queues.
    pub queue_depth: usize,
}

impl HubSettings {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn read_deadline(&self) -> Duration {
        Duration::from_millis(self.read_deadline_ms)
    }

    pub fn write_deadline(&self) -> Duration {
        Duration::from_millis(self.write_deadline_ms)
    }
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            outbound_buffer: 50,
            ping_interval_ms: 54_000,
            read_deadline_ms: 60_000,
            write_deadline_ms: 10_000,
            max_frame_bytes: 4096,
            queue_depth: 256,
        }
    }
}
