//! Per-connection pipeline: Framer → Router → Pool → Relay.
//!
//! # Responsibilities
//! - Run exactly one exchange per inbound connection
//! - Answer failures before the relay in the client's own framing
//! - Hand the upstream back to the pool only at a clean message boundary
//!
//! # Design Decisions
//! - The snapshot is loaded once; a reload never changes a connection mid-flight
//! - Forced shutdown is observed while framing and while waiting for a lease
//! - A client that closes before sending anything gets no answer
//! - A client that has sent nothing when draining starts is closed at once

use std::io;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::time::Instant;

use crate::error::{ErrorKind, ProxyError, TimeoutKind};
use crate::framer::{self, FramerLimits, FramerMode};
use crate::lifecycle::ShutdownListener;
use crate::net::{ConnectionState, InboundConnection};
use crate::observability::metrics;
use crate::proxy::ProxyContext;
use crate::relay::{self, RelayEnd, RelayRequest};
use crate::routing::{self, UpstreamTarget};

/// How a connection task finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Served, rejected, or closed by one of the peers.
    Finished,
    /// Cut short by forced shutdown.
    Interrupted,
}

/// Serve one accepted connection to completion.
///
/// Expected to run inside the connection's tracing span.
pub async fn handle_connection(mut conn: InboundConnection, ctx: ProxyContext) -> Disposition {
    let snapshot = ctx.store.load();
    let mut shutdown = ctx.shutdown.subscribe();

    let started = Instant::now();
    match first_byte(&conn, snapshot.framer.header_read_timeout, &mut shutdown).await {
        Opening::Data => {}
        Opening::Closed => {
            tracing::debug!("Client closed before sending a request");
            close(&mut conn).await;
            return Disposition::Finished;
        }
        Opening::Draining => {
            tracing::debug!("Closed idle connection on drain");
            close(&mut conn).await;
            return Disposition::Finished;
        }
        Opening::TimedOut => {
            let mode = match snapshot.mode {
                FramerMode::Auto => FramerMode::Http,
                concrete => concrete,
            };
            reject(&mut conn, mode, &ProxyError::Timeout(TimeoutKind::HeaderRead), None, None).await;
            return Disposition::Finished;
        }
    }

    // The wait for the first byte counts against the header deadline.
    let limits = FramerLimits {
        header_read_timeout: snapshot.framer.header_read_timeout.saturating_sub(started.elapsed()),
        ..snapshot.framer
    };
    let framed = tokio::select! {
        res = framer::read_frame(&mut conn.stream, snapshot.mode, &limits) => res,
        _ = shutdown.forced() => {
            tracing::debug!("Forced shutdown while reading the framing head");
            close(&mut conn).await;
            return Disposition::Interrupted;
        }
    };

    let frame = match framed {
        Ok(frame) => frame,
        Err(err) => {
            if let ProxyError::Io(e) = &err.error {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    tracing::debug!("Client closed before sending a request");
                    close(&mut conn).await;
                    return Disposition::Finished;
                }
            }
            reject(&mut conn, err.mode, &err.error, None, None).await;
            return Disposition::Finished;
        }
    };

    let mode = if frame.is_http() {
        FramerMode::Http
    } else {
        FramerMode::Tunnel
    };
    let route_key = frame.key.to_string();

    let target = match routing::resolve(&frame.key, &snapshot) {
        Ok(target) => target,
        Err(e) => {
            reject(&mut conn, mode, &ProxyError::from(e), Some(&route_key), None).await;
            return Disposition::Finished;
        }
    };

    tracing::debug!(
        route_key = %route_key,
        target = %target,
        rule = target.rule.as_deref().unwrap_or("-"),
        snapshot_version = snapshot.version,
        "Route resolved"
    );

    let leased = tokio::select! {
        res = ctx.pool.lease(&target, &snapshot.pool) => res,
        _ = shutdown.forced() => {
            reject(&mut conn, mode, &ProxyError::Shutdown, Some(&route_key), Some(&target)).await;
            return Disposition::Interrupted;
        }
    };
    let mut upstream = match leased {
        Ok(upstream) => upstream,
        Err(e) => {
            reject(&mut conn, mode, &ProxyError::from(e), Some(&route_key), Some(&target)).await;
            return Disposition::Finished;
        }
    };

    transition(&mut conn, ConnectionState::Relaying);
    let outcome = relay::run(
        &mut conn,
        &mut upstream,
        RelayRequest::from(frame),
        &snapshot.relay,
        shutdown,
    )
    .await;

    metrics::record_relay(
        outcome.end.as_str(),
        outcome.bytes_to_upstream,
        outcome.bytes_to_client,
        outcome.duration,
    );
    log_outcome(&route_key, &target, upstream.is_reused(), &outcome);

    upstream.release(outcome.upstream_reusable);
    transition(&mut conn, ConnectionState::Draining);
    close(&mut conn).await;

    if outcome.end == RelayEnd::Shutdown {
        Disposition::Interrupted
    } else {
        Disposition::Finished
    }
}

enum Opening {
    Data,
    Closed,
    Draining,
    TimedOut,
}

/// Wait until the client sends its first byte, closes, or draining begins.
async fn first_byte(conn: &InboundConnection, limit: Duration, shutdown: &mut ShutdownListener) -> Opening {
    let mut byte = [0u8; 1];
    tokio::select! {
        biased;

        peeked = tokio::time::timeout(limit, conn.stream.peek(&mut byte)) => match peeked {
            Ok(Ok(0)) | Ok(Err(_)) => Opening::Closed,
            Ok(Ok(_)) => Opening::Data,
            Err(_) => Opening::TimedOut,
        },
        _ = shutdown.draining() => Opening::Draining,
    }
}

fn log_outcome(route_key: &str, target: &UpstreamTarget, reused: bool, outcome: &relay::RelayOutcome) {
    match outcome.end {
        RelayEnd::Error(kind) => tracing::warn!(
            route_key,
            target = %target,
            end = outcome.end.as_str(),
            io_error = ?kind,
            bytes_to_upstream = outcome.bytes_to_upstream,
            bytes_to_client = outcome.bytes_to_client,
            "Relay failed"
        ),
        _ => tracing::info!(
            route_key,
            target = %target,
            end = outcome.end.as_str(),
            reused_upstream = reused,
            upstream_reusable = outcome.upstream_reusable,
            bytes_to_upstream = outcome.bytes_to_upstream,
            bytes_to_client = outcome.bytes_to_client,
            duration_ms = outcome.duration.as_millis() as u64,
            "Exchange finished"
        ),
    }
}

/// Send the rejection for `error` (if its kind has one) and close.
async fn reject(
    conn: &mut InboundConnection,
    mode: FramerMode,
    error: &ProxyError,
    route_key: Option<&str>,
    target: Option<&UpstreamTarget>,
) {
    let kind = error.kind();
    metrics::record_rejection(kind.as_str());
    tracing::warn!(
        route_key = route_key.unwrap_or("-"),
        target = target.map(ToString::to_string).as_deref().unwrap_or("-"),
        error_kind = kind.as_str(),
        error = %error,
        "Request rejected"
    );

    if let Some(response) = rejection(mode, kind) {
        if let Err(e) = conn.stream.write_all(&response).await {
            tracing::debug!(error = %e, "Failed to write rejection");
        }
    }
    close(conn).await;
}

/// Bytes sent to a client whose request fails with `kind`.
pub fn rejection(mode: FramerMode, kind: ErrorKind) -> Option<Vec<u8>> {
    match mode {
        FramerMode::Tunnel => kind.tunnel_token().map(|token| format!("ERR {}\r\n", token).into_bytes()),
        FramerMode::Http | FramerMode::Auto => kind.http_status().map(|(code, reason)| {
            let body = format!("{} {}\n", code, reason);
            format!(
                "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                code,
                reason,
                body.len(),
                body
            )
            .into_bytes()
        }),
    }
}

fn transition(conn: &mut InboundConnection, next: ConnectionState) {
    if let Err(e) = conn.advance(next) {
        tracing::warn!(error = %e, "Unexpected connection state change");
    }
}

async fn close(conn: &mut InboundConnection) {
    let _ = conn.stream.shutdown().await;
    transition(conn, ConnectionState::Closed);
}
