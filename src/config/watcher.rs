//! Route file watcher for hot reload.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};

use crate::config::loader::{load_config, ConfigError};
use crate::config::snapshot::SnapshotStore;
use crate::observability::metrics;
use crate::routing::RuleError;

/// Failure of a single reload attempt.
#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Rules(#[from] RuleError),
}

/// Re-reads the route file into the snapshot store.
///
/// Shared by the file watcher and the SIGHUP handler.
#[derive(Debug, Clone)]
pub struct Reloader {
    path: PathBuf,
    store: Arc<SnapshotStore>,
}

impl Reloader {
    pub fn new(path: &Path, store: Arc<SnapshotStore>) -> Self {
        Self {
            path: path.to_path_buf(),
            store,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load, validate and publish; the current snapshot survives any error.
    pub fn reload(&self) -> Result<u64, ReloadError> {
        let config = load_config(Some(&self.path))?;
        let version = self.store.replace(&config)?;
        metrics::record_reload(true);
        tracing::info!(path = %self.path.display(), version, routes = config.routes.len(), "Configuration reloaded");
        Ok(version)
    }

    /// Reload and log failures instead of returning them.
    pub fn reload_or_keep(&self) {
        if let Err(e) = self.reload() {
            metrics::record_reload(false);
            tracing::error!(
                path = %self.path.display(),
                error = %e,
                version = self.store.version(),
                "Failed to reload config. Keeping current configuration."
            );
        }
    }
}

/// A watcher that monitors the route file for changes.
pub struct ConfigWatcher {
    reloader: Reloader,
}

impl ConfigWatcher {
    pub fn new(reloader: Reloader) -> Self {
        Self { reloader }
    }

    /// Start watching the file; events are handled on notify's thread.
    ///
    /// The returned watcher must be kept alive for as long as reloads are wanted.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let reloader = self.reloader.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        tracing::info!("Config file change detected, reloading...");
                        reloader.reload_or_keep();
                    }
                }
                Err(e) => tracing::error!("Watch error: {:?}", e),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(self.reloader.path(), RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?self.reloader.path(), "Config watcher started");
        Ok(watcher)
    }
}
