//! Accept loop and graceful drain.
//!
//! # Responsibilities
//! - Accept under admission control and spawn one task per connection
//! - Stop accepting once shutdown starts draining
//! - Wait for in-flight connections up to the grace period, then force
//!
//! # Design Decisions
//! - The accept loop never awaits a connection task
//! - Finished tasks are reaped while accepting so the JoinSet stays small
//! - Tasks still running after the unwind window are aborted

use std::net::SocketAddr;
use std::time::Duration;

use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::Instrument;

use crate::lifecycle::state::LifecycleState;
use crate::net::{InboundConnection, Listener, ListenerError};
use crate::observability::metrics;
use crate::proxy::handler::{handle_connection, Disposition};
use crate::proxy::ProxyContext;
use crate::resilience::calculate_backoff;

/// Time relays get to unwind after shutdown is forced.
const UNWIND_WINDOW: Duration = Duration::from_secs(1);

/// How the server stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Every connection finished on its own.
    Clean,
    /// At least one connection was cut short.
    Forced,
}

impl ExitStatus {
    pub fn code(&self) -> u8 {
        match self {
            ExitStatus::Clean => 0,
            ExitStatus::Forced => 2,
        }
    }
}

pub struct ProxyServer {
    listener: Listener,
    ctx: ProxyContext,
    grace: Duration,
}

impl ProxyServer {
    pub fn new(listener: Listener, ctx: ProxyContext, grace: Duration) -> Self {
        Self { listener, ctx, grace }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn context(&self) -> &ProxyContext {
        &self.ctx
    }

    /// Accept until shutdown starts, then drain.
    pub async fn run(self) -> ExitStatus {
        let ProxyServer { listener, ctx, grace } = self;
        let mut shutdown = ctx.shutdown.subscribe();
        let mut tasks: JoinSet<Disposition> = JoinSet::new();
        let mut accept_failures = 0u32;

        ctx.state.advance(LifecycleState::Accepting);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.draining() => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer, permit)) => {
                        accept_failures = 0;
                        let conn = InboundConnection::new(stream, peer);
                        let guard = ctx.tracker.track();
                        metrics::record_accepted();

                        let span = tracing::info_span!("connection", id = %conn.id, peer = %peer);
                        let task_ctx = ctx.clone();
                        tasks.spawn(
                            async move {
                                let _permit = permit;
                                let _guard = guard;
                                handle_connection(conn, task_ctx).await
                            }
                            .instrument(span),
                        );
                    }
                    Err(ListenerError::Closed) => break,
                    Err(e) => {
                        accept_failures = accept_failures.saturating_add(1);
                        let delay = calculate_backoff(accept_failures, 10, 1000);
                        tracing::warn!(error = %e, retry_in = ?delay, "Accept failed");
                        tokio::time::sleep(delay).await;
                    }
                },

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    reap(joined);
                }
            }
        }

        ctx.state.advance(LifecycleState::Draining);
        drop(listener);
        tracing::info!(in_flight = tasks.len(), grace_ms = grace.as_millis() as u64, "Draining connections");

        let mut interrupted = 0usize;
        let drained = drain_until(&mut tasks, Instant::now() + grace, &mut interrupted).await;

        if !drained {
            tracing::warn!(remaining = tasks.len(), "Grace period expired, forcing shutdown");
            ctx.shutdown.force();
            if !drain_until(&mut tasks, Instant::now() + UNWIND_WINDOW, &mut interrupted).await {
                tracing::error!(remaining = tasks.len(), "Aborting connections that did not unwind");
                interrupted += tasks.len();
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
            }
        }

        ctx.state.advance(LifecycleState::Stopped);

        if interrupted > 0 {
            tracing::warn!(interrupted, "Shutdown complete, connections were cut short");
            ExitStatus::Forced
        } else {
            tracing::info!("Shutdown complete");
            ExitStatus::Clean
        }
    }
}

/// Join tasks until none are left (`true`) or `deadline` passes (`false`).
async fn drain_until(tasks: &mut JoinSet<Disposition>, deadline: Instant, interrupted: &mut usize) -> bool {
    loop {
        match tokio::time::timeout_at(deadline, tasks.join_next()).await {
            Ok(Some(joined)) => {
                if reap(joined) == Disposition::Interrupted {
                    *interrupted += 1;
                }
            }
            Ok(None) => return true,
            Err(_) => return false,
        }
    }
}

fn reap(joined: Result<Disposition, JoinError>) -> Disposition {
    match joined {
        Ok(disposition) => disposition,
        Err(e) if e.is_cancelled() => Disposition::Interrupted,
        Err(e) => {
            tracing::error!(error = %e, "Connection task panicked");
            Disposition::Finished
        }
    }
}
