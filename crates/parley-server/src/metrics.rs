//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::errors::ServerError;

/// Install the Prometheus recorder as the global `metrics` recorder.
///
/// Returns the handle that renders `/metrics`. Call once at startup.
pub fn install_recorder() -> Result<PrometheusHandle, ServerError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| ServerError::Telemetry(format!("metrics recorder: {e}")))?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Sessions opened total (counter).
pub const CONNECTIONS_TOTAL: &str = "parley_connections_total";
/// Sessions torn down total (counter, labels: reason).
pub const DISCONNECTIONS_TOTAL: &str = "parley_disconnections_total";
/// Registered sessions (gauge).
pub const SESSIONS_ACTIVE: &str = "parley_sessions_active";
/// Session lifetime seconds (histogram).
pub const SESSION_DURATION_SECONDS: &str = "parley_session_duration_seconds";
/// Sessions evicted by fan-out (counter).
pub const FANOUT_EVICTIONS_TOTAL: &str = "parley_fanout_evictions_total";
/// Targeted sends dropped on a full buffer (counter).
pub const OUTBOUND_DROPS_TOTAL: &str = "parley_outbound_drops_total";
/// History reads served from the cache (counter, labels: scope).
pub const CACHE_HITS_TOTAL: &str = "parley_cache_hits_total";
/// History reads that fell through to the store (counter, labels: scope).
pub const CACHE_MISSES_TOTAL: &str = "parley_cache_misses_total";
/// Cache failures on the delivery path (counter, labels: op).
pub const CACHE_ERRORS_TOTAL: &str = "parley_cache_errors_total";
/// Backfill jobs completed (counter).
pub const BACKFILL_JOBS_TOTAL: &str = "parley_backfill_jobs_total";
/// Backfill jobs dropped on a full queue (counter).
pub const BACKFILL_DROPPED_TOTAL: &str = "parley_backfill_dropped_total";
/// Message writes rejected by the store (counter).
pub const STORE_WRITE_FAILURES_TOTAL: &str = "parley_store_write_failures_total";
/// Keys removed by the janitor (counter).
pub const CACHE_PURGED_KEYS_TOTAL: &str = "parley_cache_purged_keys_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_without_global_install() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = handle.render();
        assert!(output.is_empty() || output.contains('\n'));
    }

    #[test]
    fn metric_names_are_prefixed_snake_case() {
        let names = [
            CONNECTIONS_TOTAL,
            DISCONNECTIONS_TOTAL,
            SESSIONS_ACTIVE,
            SESSION_DURATION_SECONDS,
            FANOUT_EVICTIONS_TOTAL,
            OUTBOUND_DROPS_TOTAL,
            CACHE_HITS_TOTAL,
            CACHE_MISSES_TOTAL,
            CACHE_ERRORS_TOTAL,
            BACKFILL_JOBS_TOTAL,
            BACKFILL_DROPPED_TOTAL,
            STORE_WRITE_FAILURES_TOTAL,
            CACHE_PURGED_KEYS_TOTAL,
        ];
        for name in names {
            assert!(name.starts_with("parley_"), "{name}");
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "{name}"
            );
        }
    }
}
