//! Upstream connect retries.
//!
//! # Responsibilities
//! - Bound every connect attempt with a timeout
//! - Retry a failed connect against the same target after a jittered backoff
//!
//! # Design Decisions
//! - At most one retry by default; the pool surfaces `ConnectError` afterwards
//! - A timed-out attempt is reported as `io::ErrorKind::TimedOut`

use std::io;
use std::time::Duration;

use tokio::net::TcpStream;

use super::backoff::calculate_backoff;

/// How connects are attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 1,
            base_delay_ms: 50,
            max_delay_ms: 500,
        }
    }
}

/// Connect to `host:port`, retrying per `policy`.
pub async fn connect_with_retry(
    host: &str,
    port: u16,
    connect_timeout: Duration,
    policy: &RetryPolicy,
) -> io::Result<TcpStream> {
    let mut attempt = 0;
    loop {
        match connect_once(host, port, connect_timeout).await {
            Ok(stream) => return Ok(stream),
            Err(e) if attempt < policy.retries => {
                attempt += 1;
                let delay = calculate_backoff(attempt, policy.base_delay_ms, policy.max_delay_ms);
                tracing::debug!(host, port, attempt, error = %e, delay_ms = delay.as_millis() as u64, "Upstream connect failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn connect_once(host: &str, port: u16, connect_timeout: Duration) -> io::Result<TcpStream> {
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}
