use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use parley_cache::{ListBackend, MemoryBackend, RedisBackend};
use parley_server::{ParleyServer, ServerDeps};
use parley_settings::ParleySettings;
use parley_store::{Database, SqliteMessageStore};

/// Parley chat relay.
#[derive(Parser, Debug)]
#[command(name = "parley", about = "Real-time chat relay with cached history")]
struct Cli {
    /// Settings file (defaults to ~/.parley/settings.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Path to the `SQLite` database (overrides settings).
    #[arg(long)]
    db: Option<PathBuf>,
}

impl Cli {
    fn apply(&self, settings: &mut ParleySettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(db) = &self.db {
            settings.store.db_path = db.to_string_lossy().into_owned();
        }
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    Ok(())
}

async fn cache_backend(settings: &ParleySettings) -> Result<Arc<dyn ListBackend>> {
    match &settings.cache.redis_url {
        Some(url) => {
            let backend = RedisBackend::connect(url)
                .await
                .with_context(|| format!("Failed to connect to redis at {url}"))?;
            tracing::info!(%url, "redis cache connected");
            Ok(Arc::new(backend))
        }
        None => {
            tracing::warn!("no redis url configured, using in-process cache");
            Ok(Arc::new(MemoryBackend::new()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings_path = args.config.clone().unwrap_or_else(parley_settings::settings_path);
    let mut settings = parley_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    args.apply(&mut settings);

    parley_server::telemetry::init_tracing(&settings.logging)?;
    let metrics = parley_server::metrics::install_recorder()?;

    let db_path = PathBuf::from(&settings.store.db_path);
    if settings.store.db_path != ":memory:" {
        ensure_parent_dir(&db_path)?;
    }
    let db = Database::open(&db_path).context("Failed to open database")?;
    tracing::info!(path = %db_path.display(), "database opened");

    let deps = ServerDeps {
        store: Arc::new(SqliteMessageStore::new(db)),
        backend: cache_backend(&settings).await?,
        rooms: None,
        metrics: Some(metrics),
    };
    let server = Arc::new(ParleyServer::start(settings, deps));
    let listener = server.bind().await.context("Failed to bind listener")?;

    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;
    tracing::info!("shutting down");

    server.shutdown().await;
    serving.await.context("Listener task failed")??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_leave_settings_alone() {
        let cli = Cli::parse_from(["parley"]);
        let mut settings = ParleySettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert!(cli.config.is_none());
    }

    #[test]
    fn cli_flags_override_settings() {
        let cli = Cli::parse_from([
            "parley", "--host", "127.0.0.1", "--port", "0", "--db", "/tmp/p.db", "--config", "/etc/p.json",
        ]);
        let mut settings = ParleySettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 0);
        assert_eq!(settings.store.db_path, "/tmp/p.db");
        assert_eq!(cli.config, Some(PathBuf::from("/etc/p.json")));
    }

    #[test]
    fn parent_dir_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("p.db");
        ensure_parent_dir(&path).unwrap();
        assert!(path.parent().unwrap().is_dir());
        ensure_parent_dir(Path::new("bare.db")).unwrap();
    }
}
