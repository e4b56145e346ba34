//! Startup orchestration.
//!
//! # Responsibilities
//! - Compile the validated configuration into the first snapshot
//! - Initialize subsystems in dependency order
//! - Start background tasks (watcher, admin API, signal handling)
//! - Bind the proxy listener and begin accepting traffic
//!
//! # Design Decisions
//! - Fail fast: a bind or rule error is fatal
//! - A watcher that cannot start only disables hot reload
//! - Admin API and signal tasks are aborted once the server has drained

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::admin::{self, AdminState};
use crate::config::{ConfigWatcher, ProxyConfig, Reloader, SnapshotStore};
use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::signals::handle_signals;
use crate::net::{Listener, ListenerError};
use crate::observability::metrics;
use crate::pool::UpstreamPool;
use crate::proxy::{ExitStatus, ProxyContext, ProxyServer};
use crate::routing::RuleError;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid route rules: {0}")]
    Rules(#[from] RuleError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("invalid {field} '{value}'")]
    Address { field: &'static str, value: String },

    #[error("failed to start metrics exporter: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error("failed to bind admin API on {addr}: {source}")]
    Admin {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

fn parse_addr(field: &'static str, value: &str) -> Result<SocketAddr, StartupError> {
    value.parse().map_err(|_| StartupError::Address {
        field,
        value: value.to_string(),
    })
}

/// Run the proxy until shutdown completes.
///
/// `config_path` enables hot reload of the route file.
pub async fn run(config: ProxyConfig, config_path: Option<PathBuf>) -> Result<ExitStatus, StartupError> {
    let store = Arc::new(SnapshotStore::from_config(&config)?);
    let pool = Arc::new(UpstreamPool::new());
    let shutdown = Shutdown::new();
    let ctx = ProxyContext::new(store.clone(), pool, shutdown.clone());

    tracing::info!(
        mode = %config.listener.mode,
        routes = config.routes.len(),
        tunnel_routes = config.tunnel.routes.len(),
        passthrough = config.tunnel.passthrough,
        "Configuration loaded"
    );

    if let Some(addr) = &config.observability.metrics_address {
        let addr = parse_addr("observability.metrics_address", addr)?;
        metrics::init_metrics(addr)?;
    }

    let listener = Listener::bind(&config.listener).await?;

    let reloader = config_path.as_deref().map(|path| Reloader::new(path, store.clone()));
    let _watcher = match &reloader {
        Some(reloader) => match ConfigWatcher::new(reloader.clone()).run() {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                tracing::warn!(error = %e, "Config watcher unavailable, hot reload disabled");
                None
            }
        },
        None => None,
    };

    let admin = match &config.admin.bind_address {
        Some(addr) => {
            let addr = parse_addr("admin.bind_address", addr)?;
            let state = AdminState::new(ctx.clone(), config.admin.api_key.clone());
            let (_, handle) = admin::spawn(addr, state)
                .await
                .map_err(|source| StartupError::Admin { addr, source })?;
            Some(handle)
        }
        None => None,
    };

    let signals = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = handle_signals(shutdown, reloader).await {
                tracing::error!(error = %e, "Failed to install signal handlers");
            }
        }
    });

    let grace = Duration::from_millis(config.timeouts.shutdown_grace_ms);
    let status = ProxyServer::new(listener, ctx, grace).run().await;

    signals.abort();
    if let Some(admin) = admin {
        admin.abort();
    }

    Ok(status)
}
