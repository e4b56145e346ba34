//! Bidirectional relay between an inbound connection and a leased upstream.
//!
//! # Data Flow
//! ```text
//! client ──read──▶ [buffer A] ──write_all──▶ upstream    (request / raw bytes)
//! client ◀──write_all── [buffer B] ◀──read── upstream    (response / raw bytes)
//!
//! One select loop drives both directions plus:
//!     idle watch (shared activity clock)
//!     total-duration cap
//!     forced shutdown
//! ```
//!
//! # Design Decisions
//! - One fixed buffer per direction; a direction only reads again after its
//!   last chunk was fully written, so a slow reader stalls its producer
//! - HTTP mode forwards exactly one request and one response, measured by
//!   the framer's body trackers, so the upstream can be reused afterwards
//! - Tunnel mode half-closes on EOF and finishes once both sides are done
//! - Timeouts and forced shutdown close both sides without a response

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TimeoutKind;
use crate::framer::{BodyTracker, Frame, RequestHead, ResponseTracker};
use crate::lifecycle::shutdown::ShutdownListener;
use crate::net::{ActivityClock, InboundConnection};
use crate::pool::PooledConnection;

/// Default per-direction buffer size.
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Upper bound for a response head before the tracker gives up on it.
const MAX_RESPONSE_HEAD: usize = 64 * 1024;

/// Timing and buffering for one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayPolicy {
    pub idle_timeout: Duration,
    /// `None` disables the cap.
    pub max_duration: Option<Duration>,
    pub buffer_size: usize,
}

impl Default for RelayPolicy {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            max_duration: Some(Duration::from_secs(3600)),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// What to relay, as produced by the framer.
#[derive(Debug, Clone)]
pub enum RelayRequest {
    /// One HTTP exchange. `buffered` starts with the `head_len` byte head.
    Http {
        head: RequestHead,
        head_len: usize,
        buffered: Bytes,
    },
    /// Opaque stream; `buffered` is payload read after the framing line.
    Tunnel { buffered: Bytes },
}

impl From<Frame> for RelayRequest {
    fn from(frame: Frame) -> Self {
        match frame.request {
            Some(head) => RelayRequest::Http {
                head,
                head_len: frame.head_len,
                buffered: frame.buffered,
            },
            None => RelayRequest::Tunnel {
                buffered: frame.buffered,
            },
        }
    }
}

/// Why an exchange ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// Message boundary reached, or both tunnel sides closed.
    Completed,
    ClientClosed,
    UpstreamClosed,
    Timeout(TimeoutKind),
    /// Forced shutdown interrupted the exchange.
    Shutdown,
    Error(io::ErrorKind),
}

impl RelayEnd {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayEnd::Completed => "completed",
            RelayEnd::ClientClosed => "client_closed",
            RelayEnd::UpstreamClosed => "upstream_closed",
            RelayEnd::Timeout(TimeoutKind::HeaderRead) => "timeout_header_read",
            RelayEnd::Timeout(TimeoutKind::Idle) => "timeout_idle",
            RelayEnd::Timeout(TimeoutKind::Duration) => "timeout_duration",
            RelayEnd::Shutdown => "shutdown",
            RelayEnd::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOutcome {
    pub bytes_to_upstream: u64,
    pub bytes_to_client: u64,
    pub end: RelayEnd,
    /// The upstream connection may serve another exchange.
    pub upstream_reusable: bool,
    pub duration: Duration,
}

/// Relay one exchange between `inbound` and `upstream`.
pub async fn run(
    inbound: &mut InboundConnection,
    upstream: &mut PooledConnection,
    request: RelayRequest,
    policy: &RelayPolicy,
    mut shutdown: ShutdownListener,
) -> RelayOutcome {
    let started = Instant::now();
    let clock = inbound.activity.clone();
    let counters = Counters::default();

    let (client_read, client_write) = inbound.stream.split();
    let (upstream_read, upstream_write) = upstream.stream().split();
    let halves = Halves {
        client_read,
        client_write,
        upstream_read,
        upstream_write,
    };

    let (end, upstream_reusable) = drive(halves, request, policy, &clock, &counters, &mut shutdown).await;

    RelayOutcome {
        bytes_to_upstream: counters.to_upstream.load(Ordering::Relaxed),
        bytes_to_client: counters.to_client.load(Ordering::Relaxed),
        end,
        upstream_reusable,
        duration: started.elapsed(),
    }
}

struct Halves<CR, CW, UR, UW> {
    client_read: CR,
    client_write: CW,
    upstream_read: UR,
    upstream_write: UW,
}

#[derive(Debug, Default)]
struct Counters {
    to_upstream: AtomicU64,
    to_client: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Upstream,
}

/// An I/O failure, attributed to the side it happened on.
#[derive(Debug)]
struct PumpError {
    side: Side,
    source: io::Error,
}

impl PumpError {
    fn end(&self) -> RelayEnd {
        let gone = matches!(
            self.source.kind(),
            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
        );
        match (gone, self.side) {
            (true, Side::Client) => RelayEnd::ClientClosed,
            (true, Side::Upstream) => RelayEnd::UpstreamClosed,
            (false, _) => RelayEnd::Error(self.source.kind()),
        }
    }
}

/// How one direction finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    /// Message boundary reached.
    Complete,
    /// Raw stream reached EOF; the peer's writer was half-closed.
    HalfClosed,
    /// Reader closed before the message ended.
    Eof,
}

/// One direction: where bytes come from, where they go, what they count toward.
struct Leg<'a> {
    from: Side,
    to: Side,
    clock: &'a ActivityClock,
    bytes: &'a AtomicU64,
}

impl Leg<'_> {
    async fn read<R: AsyncRead + Unpin>(&self, reader: &mut R, buf: &mut [u8]) -> Result<usize, PumpError> {
        let n = reader.read(buf).await.map_err(|source| PumpError { side: self.from, source })?;
        if n > 0 {
            self.clock.touch();
        }
        Ok(n)
    }

    async fn write<W: AsyncWrite + Unpin>(&self, writer: &mut W, data: &[u8]) -> Result<(), PumpError> {
        if data.is_empty() {
            return Ok(());
        }
        writer
            .write_all(data)
            .await
            .map_err(|source| PumpError { side: self.to, source })?;
        self.bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
        self.clock.touch();
        Ok(())
    }

    async fn copy_raw<R, W>(&self, reader: &mut R, writer: &mut W, buf: &mut [u8]) -> Result<Flow, PumpError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            let n = self.read(reader, buf).await?;
            if n == 0 {
                let _ = writer.shutdown().await;
                return Ok(Flow::HalfClosed);
            }
            self.write(writer, &buf[..n]).await?;
        }
    }

    /// Client → upstream: the buffered preamble, then the request body.
    async fn forward_request<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        request: &RelayRequest,
        buf: &mut [u8],
    ) -> Result<Flow, PumpError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (head, head_len, buffered) = match request {
            RelayRequest::Tunnel { buffered } => {
                self.write(writer, buffered).await?;
                return self.copy_raw(reader, writer, buf).await;
            }
            RelayRequest::Http { head, buffered, .. } if head.upgrade => {
                self.write(writer, buffered).await?;
                return self.copy_raw(reader, writer, buf).await;
            }
            RelayRequest::Http {
                head,
                head_len,
                buffered,
            } => (head, *head_len, buffered),
        };

        let mut body = BodyTracker::new(head.body);
        let (head_bytes, early_body) = buffered.split_at(head_len.min(buffered.len()));
        let take = body.feed(early_body);
        self.write(writer, head_bytes).await?;
        self.write(writer, &early_body[..take]).await?;

        while !body.is_complete() {
            let n = self.read(reader, buf).await?;
            if n == 0 {
                return Ok(Flow::Eof);
            }
            let take = body.feed(&buf[..n]);
            self.write(writer, &buf[..take]).await?;
        }
        Ok(Flow::Complete)
    }

    /// Upstream → client: one response, or raw bytes once switched.
    async fn forward_response<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        tracker: Option<&mut ResponseTracker>,
        buf: &mut [u8],
    ) -> Result<Flow, PumpError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let Some(tracker) = tracker else {
            return self.copy_raw(reader, writer, buf).await;
        };

        loop {
            let n = self.read(reader, buf).await?;
            if n == 0 {
                if tracker.is_switched() {
                    let _ = writer.shutdown().await;
                    return Ok(Flow::HalfClosed);
                }
                if tracker.is_until_close() {
                    return Ok(Flow::Complete);
                }
                return Ok(Flow::Eof);
            }
            let take = tracker.feed(&buf[..n]);
            self.write(writer, &buf[..take]).await?;
            if tracker.is_complete() {
                return Ok(Flow::Complete);
            }
        }
    }
}

async fn idle_elapsed(clock: &ActivityClock, idle_timeout: Duration) {
    loop {
        let idle_for = clock.idle_for();
        if idle_for >= idle_timeout {
            return;
        }
        tokio::time::sleep(idle_timeout - idle_for).await;
    }
}

async fn duration_cap(max: Option<Duration>) {
    match max {
        Some(max) => tokio::time::sleep(max).await,
        None => std::future::pending().await,
    }
}

async fn drive<CR, CW, UR, UW>(
    halves: Halves<CR, CW, UR, UW>,
    request: RelayRequest,
    policy: &RelayPolicy,
    clock: &ActivityClock,
    counters: &Counters,
    shutdown: &mut ShutdownListener,
) -> (RelayEnd, bool)
where
    CR: AsyncRead + Unpin,
    CW: AsyncWrite + Unpin,
    UR: AsyncRead + Unpin,
    UW: AsyncWrite + Unpin,
{
    let Halves {
        mut client_read,
        mut client_write,
        mut upstream_read,
        mut upstream_write,
    } = halves;

    let http = match &request {
        RelayRequest::Http { head, .. } => Some(head.clone()),
        RelayRequest::Tunnel { .. } => None,
    };
    let mut response = http
        .as_ref()
        .map(|head| ResponseTracker::new(head.is_head(), MAX_RESPONSE_HEAD));

    let outbound = Leg {
        from: Side::Client,
        to: Side::Upstream,
        clock,
        bytes: &counters.to_upstream,
    };
    let inbound = Leg {
        from: Side::Upstream,
        to: Side::Client,
        clock,
        bytes: &counters.to_client,
    };
    let mut outbound_buf = vec![0u8; policy.buffer_size];
    let mut inbound_buf = vec![0u8; policy.buffer_size];

    clock.touch();
    let mut request_complete = false;

    let end = {
        let to_upstream = outbound.forward_request(&mut client_read, &mut upstream_write, &request, &mut outbound_buf);
        let to_client = inbound.forward_response(&mut upstream_read, &mut client_write, response.as_mut(), &mut inbound_buf);
        let idle = idle_elapsed(clock, policy.idle_timeout);
        let cap = duration_cap(policy.max_duration);
        let forced = shutdown.forced();
        tokio::pin!(to_upstream, to_client, idle, cap, forced);

        let mut client_done = false;
        let mut upstream_done = false;

        loop {
            tokio::select! {
                flow = &mut to_upstream, if !client_done => match flow {
                    Ok(Flow::Complete) => {
                        client_done = true;
                        request_complete = true;
                    }
                    Ok(Flow::HalfClosed) => {
                        client_done = true;
                        if upstream_done {
                            break RelayEnd::Completed;
                        }
                    }
                    Ok(Flow::Eof) => break RelayEnd::ClientClosed,
                    Err(e) => break e.end(),
                },
                flow = &mut to_client, if !upstream_done => match flow {
                    Ok(Flow::Complete) => break RelayEnd::Completed,
                    Ok(Flow::HalfClosed) => {
                        upstream_done = true;
                        if client_done {
                            break RelayEnd::Completed;
                        }
                    }
                    Ok(Flow::Eof) => break RelayEnd::UpstreamClosed,
                    Err(e) => break e.end(),
                },
                _ = &mut idle => break RelayEnd::Timeout(TimeoutKind::Idle),
                _ = &mut cap => break RelayEnd::Timeout(TimeoutKind::Duration),
                _ = &mut forced => break RelayEnd::Shutdown,
            }
        }
    };

    let reusable = match (&http, &response) {
        (Some(head), Some(response)) => {
            end == RelayEnd::Completed
                && request_complete
                && head.keep_alive
                && !head.upgrade
                && response.is_reusable()
        }
        _ => false,
    };

    (end, reusable)
}
