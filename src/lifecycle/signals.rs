//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT, SIGHUP)
//! - Translate signals to shutdown phases and reloads
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - A second SIGTERM/SIGINT forces shutdown
//! - SIGHUP triggers config reload, not shutdown

use crate::config::Reloader;
use crate::lifecycle::shutdown::{Shutdown, ShutdownPhase};

/// Apply one stop request: the first drains, any later one forces.
pub fn on_stop_signal(shutdown: &Shutdown) {
    if shutdown.phase() == ShutdownPhase::Running {
        tracing::info!("Stop signal received, draining connections");
        shutdown.trigger();
    } else {
        tracing::warn!("Second stop signal received, forcing shutdown");
        shutdown.force();
    }
}

/// Run until the process exits, dispatching signals.
#[cfg(unix)]
pub async fn handle_signals(shutdown: Shutdown, reloader: Option<Reloader>) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut hangup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = terminate.recv() => on_stop_signal(&shutdown),
            _ = interrupt.recv() => on_stop_signal(&shutdown),
            _ = hangup.recv() => match &reloader {
                Some(reloader) => {
                    tracing::info!("SIGHUP received, reloading configuration");
                    let reloader = reloader.clone();
                    let _ = tokio::task::spawn_blocking(move || reloader.reload_or_keep()).await;
                }
                None => tracing::warn!("SIGHUP received but no config file is in use"),
            },
        }
    }
}

#[cfg(not(unix))]
pub async fn handle_signals(shutdown: Shutdown, _reloader: Option<Reloader>) -> std::io::Result<()> {
    loop {
        tokio::signal::ctrl_c().await?;
        on_stop_signal(&shutdown);
    }
}
