//! Settings type definitions.
//!
//! Field names are camelCase on the wire. Every section is `#[serde(default)]`
//! so a settings file only has to name the values it changes.

mod cache;
mod hub;
mod server;

pub use cache::*;
pub use hub::*;
pub use server::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 9000 },
///   "cache": { "redisUrl": "redis://127.0.0.1:6379" }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParleySettings {
    pub server: ServerSettings,
    pub hub: HubSettings,
    pub cache: CacheSettings,
    pub store: StoreSettings,
    pub logging: LoggingSettings,
}

impl ParleySettings {
    /// Reject combinations the runtime cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.hub.outbound_buffer == 0 {
            return Err(SettingsError::InvalidValue(
                "hub.outboundBuffer must be greater than zero".into(),
            ));
        }
        if self.hub.ping_interval_ms >= self.hub.read_deadline_ms {
            return Err(SettingsError::InvalidValue(format!(
                "hub.pingIntervalMs ({}) must be shorter than hub.readDeadlineMs ({})",
                self.hub.ping_interval_ms, self.hub.read_deadline_ms
            )));
        }
        if self.cache.max_entries == 0 {
            return Err(SettingsError::InvalidValue(
                "cache.maxEntries must be greater than zero".into(),
            ));
        }
        if self.cache.backfill_queue == 0 {
            return Err(SettingsError::InvalidValue(
                "cache.backfillQueue must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
