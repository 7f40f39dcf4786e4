//! # parley-settings
//!
//! Layered configuration for the relay. Settings are resolved in priority
//! order:
//! 1. **Compiled defaults** ([`ParleySettings::default()`])
//! 2. **Settings file**, `~/.parley/settings.json` or an explicit path,
//!    deep-merged over the defaults
//! 3. **Environment**, `PARLEY_*` overrides
//!
//! ```no_run
//! let settings = parley_settings::load_settings().unwrap_or_default();
//! println!("listening on {}:{}", settings.server.host, settings.server.port);
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, deep_merge, load_settings, load_settings_from_path, load_with_env,
    settings_path,
};
pub use types::*;
