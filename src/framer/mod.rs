//! Protocol framer subsystem.
//!
//! # Data Flow
//! ```text
//! Accepted TcpStream
//!     → read_frame() buffers bytes until the framing head is complete
//!     → parse() dispatches on FramerMode:
//!         - http.rs   (request line + headers → RouteKey::Http + RequestHead)
//!         - tunnel.rs (host:port line → RouteKey::Tunnel)
//!     → Frame { key, request, buffered } handed to the router
//!
//! During the relay:
//!     body.rs tracks request/response message boundaries
//!     so a pooled upstream is only reused at a clean boundary
//! ```
//!
//! # Design Decisions
//! - Parsing is a pure function of the buffered bytes; `read_frame` owns the I/O
//! - No byte read from the client is discarded; HTTP heads are replayed verbatim
//! - The tunnel framing line is addressed to the proxy and is not forwarded

pub mod body;
pub mod http;
pub mod tunnel;

use std::fmt;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ProxyError, TimeoutKind};

pub use body::{BodyKind, BodyTracker, ResponseTracker};
pub use http::RequestHead;

/// Default cap on the framing head.
pub const DEFAULT_MAX_HEADER_BYTES: usize = 16 * 1024;

/// Default time a client gets to deliver the framing head.
pub const DEFAULT_HEADER_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// How the inbound stream is framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FramerMode {
    /// HTTP/1.x requests only.
    Http,
    /// `host:port` line followed by opaque payload.
    Tunnel,
    /// Decide per connection from the first line.
    #[default]
    Auto,
}

impl fmt::Display for FramerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FramerMode::Http => "http",
            FramerMode::Tunnel => "tunnel",
            FramerMode::Auto => "auto",
        })
    }
}

impl std::str::FromStr for FramerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(FramerMode::Http),
            "tunnel" | "tcp" => Ok(FramerMode::Tunnel),
            "auto" => Ok(FramerMode::Auto),
            other => Err(format!("unknown proxy mode '{}'", other)),
        }
    }
}

/// Limits applied while reading the framing head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramerLimits {
    pub max_header_bytes: usize,
    pub header_read_timeout: Duration,
}

impl Default for FramerLimits {
    fn default() -> Self {
        Self {
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            header_read_timeout: DEFAULT_HEADER_READ_TIMEOUT,
        }
    }
}

/// Addressing fact extracted from the inbound stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteKey {
    /// HTTP request: lower-cased host without port (if any) and the path.
    Http { host: Option<String>, path: String },
    /// Tunnel request: requested destination.
    Tunnel { host: String, port: u16 },
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteKey::Http { host: Some(host), path } => write!(f, "{}{}", host, path),
            RouteKey::Http { host: None, path } => f.write_str(path),
            RouteKey::Tunnel { host, port } if host.contains(':') => {
                write!(f, "tcp://[{}]:{}", host, port)
            }
            RouteKey::Tunnel { host, port } => write!(f, "tcp://{}:{}", host, port),
        }
    }
}

/// Framing failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("malformed input: {0}")]
    Malformed(String),
    #[error("framing head exceeds {limit} bytes")]
    HeaderTooLarge { limit: usize },
}

/// A parsed framing head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHead {
    pub key: RouteKey,
    /// Leading bytes addressed to the proxy itself (never forwarded).
    pub consumed: usize,
    /// Length of the head that is forwarded verbatim (HTTP only).
    pub head_len: usize,
    pub request: Option<RequestHead>,
}

/// Result of one parse attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameStatus {
    Complete(FrameHead),
    NeedMoreData,
}

/// A framed connection ready for routing.
#[derive(Debug, Clone)]
pub struct Frame {
    pub key: RouteKey,
    pub request: Option<RequestHead>,
    /// Length of the HTTP head at the start of `buffered` (0 in tunnel mode).
    pub head_len: usize,
    /// Everything read from the client after the consumed framing bytes.
    pub buffered: Bytes,
}

impl Frame {
    pub fn is_http(&self) -> bool {
        self.request.is_some()
    }
}

/// Parse the bytes buffered so far.
pub fn parse(mode: FramerMode, buf: &[u8], limits: &FramerLimits) -> Result<FrameStatus, FrameError> {
    match mode {
        FramerMode::Http => http::parse_request(buf, limits),
        FramerMode::Tunnel => tunnel::parse_destination(buf, limits),
        FramerMode::Auto => match detect(buf, limits)? {
            Some(FramerMode::Http) => http::parse_request(buf, limits),
            Some(_) => tunnel::parse_destination(buf, limits),
            None => Ok(FrameStatus::NeedMoreData),
        },
    }
}

/// Pick a concrete mode from the first line, once it is complete.
fn detect(buf: &[u8], limits: &FramerLimits) -> Result<Option<FramerMode>, FrameError> {
    match classify(buf) {
        Some(mode) => Ok(Some(mode)),
        None if buf.len() >= limits.max_header_bytes => Err(FrameError::HeaderTooLarge {
            limit: limits.max_header_bytes,
        }),
        None => Ok(None),
    }
}

fn classify(buf: &[u8]) -> Option<FramerMode> {
    let newline = buf.iter().position(|b| *b == b'\n')?;
    let line = &buf[..newline];
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.ends_with(b" HTTP/1.1") || line.ends_with(b" HTTP/1.0") {
        Some(FramerMode::Http)
    } else {
        Some(FramerMode::Tunnel)
    }
}

/// A failed [`read_frame`], with the framing the client appeared to speak.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct FramingError {
    #[source]
    pub error: ProxyError,
    /// `Http` or `Tunnel`; auto mode falls back to `Http` when the first
    /// line never completed.
    pub mode: FramerMode,
}

/// Read from `stream` until a complete framing head is available.
///
/// Fails with `ProxyError::Io(UnexpectedEof)` if the client closes before
/// sending anything, which callers treat as a silent close.
pub async fn read_frame<S>(stream: &mut S, mode: FramerMode, limits: &FramerLimits) -> Result<Frame, FramingError>
where
    S: AsyncRead + Unpin,
{
    let mut seen = match mode {
        FramerMode::Auto => None,
        concrete => Some(concrete),
    };
    let result = tokio::time::timeout(limits.header_read_timeout, read_frame_inner(stream, mode, limits, &mut seen))
        .await
        .unwrap_or(Err(ProxyError::Timeout(TimeoutKind::HeaderRead)));

    result.map_err(|error| FramingError {
        error,
        mode: seen.unwrap_or(FramerMode::Http),
    })
}

async fn read_frame_inner<S>(
    stream: &mut S,
    mode: FramerMode,
    limits: &FramerLimits,
    seen: &mut Option<FramerMode>,
) -> Result<Frame, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096.min(limits.max_header_bytes));

    loop {
        if !buf.is_empty() {
            if seen.is_none() {
                *seen = classify(&buf);
            }
            if let FrameStatus::Complete(head) = parse(mode, &buf, limits)? {
                let mut bytes = buf.freeze();
                let buffered = bytes.split_off(head.consumed);
                return Ok(Frame {
                    key: head.key,
                    request: head.request,
                    head_len: head.head_len,
                    buffered,
                });
            }
        }

        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            if buf.is_empty() {
                return Err(ProxyError::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
            return Err(ProxyError::MalformedInput(
                "connection closed before the framing head was complete".into(),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_mode_detects_http() {
        let limits = FramerLimits::default();
        let buf = b"GET /api/ping HTTP/1.1\r\nHost: example.com\r\n\r\n";
        match parse(FramerMode::Auto, buf, &limits).unwrap() {
            FrameStatus::Complete(head) => {
                assert!(head.request.is_some());
                assert_eq!(head.consumed, 0);
                assert_eq!(head.head_len, buf.len());
            }
            FrameStatus::NeedMoreData => panic!("expected a complete head"),
        }
    }

    #[test]
    fn auto_mode_detects_tunnel() {
        let limits = FramerLimits::default();
        match parse(FramerMode::Auto, b"db.internal:5432\r\nPAYLOAD", &limits).unwrap() {
            FrameStatus::Complete(head) => {
                assert_eq!(
                    head.key,
                    RouteKey::Tunnel {
                        host: "db.internal".into(),
                        port: 5432
                    }
                );
                assert_eq!(head.consumed, 18);
            }
            FrameStatus::NeedMoreData => panic!("expected a complete head"),
        }
    }

    #[test]
    fn auto_mode_waits_for_first_line() {
        let limits = FramerLimits::default();
        assert_eq!(
            parse(FramerMode::Auto, b"GET /api", &limits).unwrap(),
            FrameStatus::NeedMoreData
        );
    }

    #[test]
    fn route_key_display() {
        let key = RouteKey::Http {
            host: Some("example.com".into()),
            path: "/api".into(),
        };
        assert_eq!(key.to_string(), "example.com/api");
        let key = RouteKey::Tunnel {
            host: "::1".into(),
            port: 22,
        };
        assert_eq!(key.to_string(), "tcp://[::1]:22");
    }

    #[tokio::test]
    async fn read_frame_keeps_body_bytes() {
        let input: &[u8] = b"POST /upload HTTP/1.1\r\nHost: a\r\nContent-Length: 4\r\n\r\nbody";
        let mut stream = input;
        let frame = read_frame(&mut stream, FramerMode::Http, &FramerLimits::default())
            .await
            .unwrap();
        assert_eq!(&frame.buffered[..], input);
        assert_eq!(frame.head_len, input.len() - 4);
    }

    #[tokio::test]
    async fn read_frame_strips_tunnel_line() {
        let mut stream: &[u8] = b"backend:9000\nhello";
        let frame = read_frame(&mut stream, FramerMode::Tunnel, &FramerLimits::default())
            .await
            .unwrap();
        assert_eq!(&frame.buffered[..], b"hello");
        assert!(!frame.is_http());
    }

    #[tokio::test]
    async fn read_frame_reports_truncated_head() {
        let mut stream: &[u8] = b"GET / HTTP/1.1\r\nHost: a\r\n";
        let err = read_frame(&mut stream, FramerMode::Http, &FramerLimits::default())
            .await
            .unwrap_err();
        assert!(matches!(err.error, ProxyError::MalformedInput(_)));
        assert_eq!(err.mode, FramerMode::Http);
    }

    #[tokio::test]
    async fn read_frame_reports_tunnel_mode_on_bad_destination() {
        let mut stream: &[u8] = b"not a destination\n";
        let err = read_frame(&mut stream, FramerMode::Auto, &FramerLimits::default())
            .await
            .unwrap_err();
        assert!(matches!(err.error, ProxyError::MalformedInput(_)));
        assert_eq!(err.mode, FramerMode::Tunnel);
    }

    #[tokio::test]
    async fn read_frame_times_out() {
        let (_client, mut server) = tokio::io::duplex(64);
        let limits = FramerLimits {
            header_read_timeout: Duration::from_millis(20),
            ..FramerLimits::default()
        };
        let err = read_frame(&mut server, FramerMode::Http, &limits).await.unwrap_err();
        assert!(matches!(err.error, ProxyError::Timeout(TimeoutKind::HeaderRead)));
    }
}
