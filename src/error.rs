//! Per-connection error taxonomy.
//!
//! # Responsibilities
//! - One error type for the Framer → Router → Pool → Relay pipeline
//! - Stable, low-cardinality kind labels for logs and metrics
//! - Map each kind to the rejection sent back to the client
//!
//! # Design Decisions
//! - Every variant is local to one connection; none of them stop the process
//! - Layer errors (`FrameError`, `RouteError`, `PoolError`) convert via `From`

use std::fmt;
use std::io;

use thiserror::Error;

use crate::framer::FrameError;
use crate::pool::PoolError;
use crate::routing::RouteError;

/// Which deadline fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Client did not finish sending the framing head in time.
    HeaderRead,
    /// No bytes moved in either direction within the idle window.
    Idle,
    /// The exchange exceeded the total-duration cap.
    Duration,
}

impl TimeoutKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeoutKind::HeaderRead => "header_read",
            TimeoutKind::Idle => "idle",
            TimeoutKind::Duration => "duration",
        }
    }
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that terminate a single proxied exchange.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("request head exceeds {limit} bytes")]
    HeaderTooLarge { limit: usize },

    #[error("no route for {0}")]
    NoRouteFound(String),

    #[error("upstream {target} unavailable: {source}")]
    ConnectError {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("connection pool for {target} exhausted")]
    PoolExhausted { target: String },

    #[error("{0} timeout")]
    Timeout(TimeoutKind),

    #[error("proxy is shutting down")]
    Shutdown,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Coarse classification of [`ProxyError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MalformedInput,
    HeaderTooLarge,
    NoRouteFound,
    ConnectError,
    PoolExhausted,
    Timeout,
    Shutdown,
    Io,
}

impl ErrorKind {
    /// Label used for the `kind` field of logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MalformedInput => "malformed_input",
            ErrorKind::HeaderTooLarge => "header_too_large",
            ErrorKind::NoRouteFound => "no_route",
            ErrorKind::ConnectError => "connect_error",
            ErrorKind::PoolExhausted => "pool_exhausted",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Shutdown => "shutdown",
            ErrorKind::Io => "io",
        }
    }

    /// Status line sent to an HTTP client, if this kind is answered at all.
    pub fn http_status(&self) -> Option<(u16, &'static str)> {
        match self {
            ErrorKind::MalformedInput => Some((400, "Bad Request")),
            ErrorKind::HeaderTooLarge => Some((431, "Request Header Fields Too Large")),
            ErrorKind::NoRouteFound => Some((404, "Not Found")),
            ErrorKind::ConnectError => Some((502, "Bad Gateway")),
            ErrorKind::PoolExhausted => Some((503, "Service Unavailable")),
            ErrorKind::Timeout => Some((408, "Request Timeout")),
            ErrorKind::Shutdown => Some((503, "Service Unavailable")),
            ErrorKind::Io => None,
        }
    }

    /// Token sent to a tunnel client, if this kind is answered at all.
    pub fn tunnel_token(&self) -> Option<&'static str> {
        match self {
            ErrorKind::MalformedInput => Some("malformed"),
            ErrorKind::HeaderTooLarge => Some("header-too-large"),
            ErrorKind::NoRouteFound => Some("no-route"),
            ErrorKind::ConnectError => Some("upstream-unavailable"),
            ErrorKind::PoolExhausted => Some("pool-exhausted"),
            ErrorKind::Timeout => Some("timeout"),
            ErrorKind::Shutdown => Some("shutting-down"),
            ErrorKind::Io => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ProxyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProxyError::MalformedInput(_) => ErrorKind::MalformedInput,
            ProxyError::HeaderTooLarge { .. } => ErrorKind::HeaderTooLarge,
            ProxyError::NoRouteFound(_) => ErrorKind::NoRouteFound,
            ProxyError::ConnectError { .. } => ErrorKind::ConnectError,
            ProxyError::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            ProxyError::Timeout(_) => ErrorKind::Timeout,
            ProxyError::Shutdown => ErrorKind::Shutdown,
            ProxyError::Io(_) => ErrorKind::Io,
        }
    }
}

impl From<FrameError> for ProxyError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Malformed(reason) => ProxyError::MalformedInput(reason),
            FrameError::HeaderTooLarge { limit } => ProxyError::HeaderTooLarge { limit },
        }
    }
}

impl From<RouteError> for ProxyError {
    fn from(err: RouteError) -> Self {
        match err {
            RouteError::NoRouteFound(key) => ProxyError::NoRouteFound(key),
        }
    }
}

impl From<PoolError> for ProxyError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Connect { target, source } => ProxyError::ConnectError {
                target: target.to_string(),
                source,
            },
            PoolError::Exhausted { target, .. } => ProxyError::PoolExhausted {
                target: target.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_rejections() {
        let err = ProxyError::NoRouteFound("/unknown".into());
        assert_eq!(err.kind(), ErrorKind::NoRouteFound);
        assert_eq!(err.kind().http_status(), Some((404, "Not Found")));
        assert_eq!(err.kind().tunnel_token(), Some("no-route"));

        let io = ProxyError::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert_eq!(io.kind(), ErrorKind::Io);
        assert!(io.kind().http_status().is_none());
    }

    #[test]
    fn frame_errors_convert() {
        let err: ProxyError = FrameError::HeaderTooLarge { limit: 1024 }.into();
        assert!(matches!(err, ProxyError::HeaderTooLarge { limit: 1024 }));
        assert_eq!(err.to_string(), "request head exceeds 1024 bytes");
    }
}
