//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ParleySettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `PARLEY_*` environment overrides (highest priority)
//! 4. Validate the result
//!
//! Objects merge recursively, arrays and primitives are replaced, and nulls
//! in the file leave the default in place.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::ParleySettings;

/// `~/.parley/settings.json`
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".parley").join("settings.json")
}

pub fn load_settings() -> Result<ParleySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from `path` with process env overrides.
///
/// A missing file yields defaults; malformed JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ParleySettings> {
    load_with_env(path, |name| std::env::var(name).ok())
}

/// Same as [`load_settings_from_path`] with an injectable env lookup.
pub fn load_with_env<F>(path: &Path, env: F) -> Result<ParleySettings>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = serde_json::to_value(ParleySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ParleySettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings, env);
    settings.validate()?;
    Ok(settings)
}

pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `PARLEY_*` overrides. Values that fail to parse or fall outside
/// their range are logged and ignored.
pub fn apply_env_overrides<F>(settings: &mut ParleySettings, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    let reader = EnvReader { env };

    // ── server ──────────────────────────────────────────────────────
    if let Some(v) = reader.string("PARLEY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = reader.u16("PARLEY_PORT", 1, 65535) {
        settings.server.port = v;
    }

    // ── hub ─────────────────────────────────────────────────────────
    if let Some(v) = reader.usize("PARLEY_OUTBOUND_BUFFER", 1, 65_536) {
        settings.hub.outbound_buffer = v;
    }
    if let Some(v) = reader.u64("PARLEY_PING_INTERVAL_MS", 100, 3_600_000) {
        settings.hub.ping_interval_ms = v;
    }
    if let Some(v) = reader.u64("PARLEY_READ_DEADLINE_MS", 100, 3_600_000) {
        settings.hub.read_deadline_ms = v;
    }
    if let Some(v) = reader.u64("PARLEY_WRITE_DEADLINE_MS", 100, 600_000) {
        settings.hub.write_deadline_ms = v;
    }
    if let Some(v) = reader.usize("PARLEY_MAX_FRAME_BYTES", 64, 16 * 1024 * 1024) {
        settings.hub.max_frame_bytes = v;
    }

    // ── cache ───────────────────────────────────────────────────────
    if let Some(v) = reader.string("PARLEY_REDIS_URL") {
        settings.cache.redis_url = Some(v);
    }
    if let Some(v) = reader.usize("PARLEY_CACHE_MAX_ENTRIES", 1, 100_000) {
        settings.cache.max_entries = v;
    }
    if let Some(v) = reader.u64("PARLEY_CACHE_TIMEOUT_MS", 10, 600_000) {
        settings.cache.op_timeout_ms = v;
    }
    if let Some(v) = reader.u64("PARLEY_PURGE_INTERVAL_SECS", 0, 604_800) {
        settings.cache.purge_interval_secs = Some(v);
    }

    // ── store / logging ─────────────────────────────────────────────
    if let Some(v) = reader.string("PARLEY_DB") {
        settings.store.db_path = v;
    }
    if let Some(v) = reader.string("PARLEY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = reader.bool("PARLEY_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<F> {
    env: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.env)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, kind: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
        let val = (self.env)(name)?;
        let result = parse(&val);
        if result.is_none() {
            warn!(key = name, value = %val, kind, "invalid env var, ignoring");
        }
        result
    }

    fn bool(&self, name: &str) -> Option<bool> {
        self.parsed(name, "bool", parse_bool)
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.parsed(name, "u16", |v| parse_u16_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, "u64", |v| parse_u64_range(v, min, max))
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        self.parsed(name, "usize", |v| parse_usize_range(v, min, max))
    }
}
