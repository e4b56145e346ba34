//! Incremental HTTP message boundary tracking.
//!
//! # Responsibilities
//! - Count request/response body bytes without buffering them
//! - Decode chunked framing (sizes, extensions, trailers) as a state machine
//! - Parse the response head to learn status, keep-alive and body framing
//!
//! # Design Decisions
//! - `feed` returns how many bytes of the input belong to the message;
//!   anything past that is not forwarded
//! - A framing violation marks the tracker broken: forwarding continues,
//!   but the upstream connection is never reused

/// How a message body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Empty,
    Length(u64),
    Chunked,
    /// Delimited by the sender closing the connection.
    UntilClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunk {
    Size { size: u64, digits: usize, ext: bool },
    SizeLf { size: u64, digits: usize },
    Data(u64),
    DataCr,
    DataLf,
    TrailerStart,
    TrailerLine,
    TrailerLf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyState {
    Length(u64),
    Chunked(Chunk),
    UntilClose,
    Done,
    Broken,
}

/// Tracks the end of a message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyTracker {
    state: BodyState,
}

impl BodyTracker {
    pub fn new(kind: BodyKind) -> Self {
        let state = match kind {
            BodyKind::Empty | BodyKind::Length(0) => BodyState::Done,
            BodyKind::Length(n) => BodyState::Length(n),
            BodyKind::Chunked => BodyState::Chunked(Chunk::Size {
                size: 0,
                digits: 0,
                ext: false,
            }),
            BodyKind::UntilClose => BodyState::UntilClose,
        };
        Self { state }
    }

    pub fn is_complete(&self) -> bool {
        self.state == BodyState::Done
    }

    pub fn is_broken(&self) -> bool {
        self.state == BodyState::Broken
    }

    /// Delimited only by connection close; never completes on its own.
    pub fn is_until_close(&self) -> bool {
        self.state == BodyState::UntilClose
    }

    /// Consume body bytes; returns how many belong to this body.
    pub fn feed(&mut self, data: &[u8]) -> usize {
        match self.state {
            BodyState::Done => 0,
            BodyState::UntilClose | BodyState::Broken => data.len(),
            BodyState::Length(remaining) => {
                let take = remaining.min(data.len() as u64);
                let left = remaining - take;
                self.state = if left == 0 {
                    BodyState::Done
                } else {
                    BodyState::Length(left)
                };
                take as usize
            }
            BodyState::Chunked(_) => self.feed_chunked(data),
        }
    }

    fn feed_chunked(&mut self, data: &[u8]) -> usize {
        let mut i = 0;
        while i < data.len() {
            let BodyState::Chunked(chunk) = self.state else {
                break;
            };

            if let Chunk::Data(remaining) = chunk {
                let take = remaining.min((data.len() - i) as u64);
                i += take as usize;
                let left = remaining - take;
                self.state = BodyState::Chunked(if left == 0 { Chunk::DataCr } else { Chunk::Data(left) });
                continue;
            }

            let byte = data[i];
            i += 1;
            match step_chunk(chunk, byte) {
                Some(ChunkStep::Next(next)) => self.state = BodyState::Chunked(next),
                Some(ChunkStep::Done) => self.state = BodyState::Done,
                None => {
                    self.state = BodyState::Broken;
                    return data.len();
                }
            }
        }
        i
    }
}

enum ChunkStep {
    Next(Chunk),
    Done,
}

fn end_of_size_line(size: u64, digits: usize) -> Option<ChunkStep> {
    if digits == 0 {
        return None;
    }
    Some(ChunkStep::Next(if size == 0 {
        Chunk::TrailerStart
    } else {
        Chunk::Data(size)
    }))
}

fn step_chunk(chunk: Chunk, byte: u8) -> Option<ChunkStep> {
    match chunk {
        Chunk::Size { size, digits, ext } => match byte {
            b'\r' => Some(ChunkStep::Next(Chunk::SizeLf { size, digits })),
            b'\n' => end_of_size_line(size, digits),
            _ if ext => Some(ChunkStep::Next(chunk)),
            b';' => Some(ChunkStep::Next(Chunk::Size { size, digits, ext: true })),
            b' ' | b'\t' => Some(ChunkStep::Next(chunk)),
            _ => {
                let digit = (byte as char).to_digit(16)? as u64;
                let size = size.checked_mul(16)?.checked_add(digit)?;
                Some(ChunkStep::Next(Chunk::Size {
                    size,
                    digits: digits + 1,
                    ext,
                }))
            }
        },
        Chunk::SizeLf { size, digits } => match byte {
            b'\n' => end_of_size_line(size, digits),
            _ => None,
        },
        Chunk::Data(_) => Some(ChunkStep::Next(chunk)),
        Chunk::DataCr => match byte {
            b'\r' => Some(ChunkStep::Next(Chunk::DataLf)),
            b'\n' => Some(ChunkStep::Next(Chunk::Size { size: 0, digits: 0, ext: false })),
            _ => None,
        },
        Chunk::DataLf => match byte {
            b'\n' => Some(ChunkStep::Next(Chunk::Size { size: 0, digits: 0, ext: false })),
            _ => None,
        },
        Chunk::TrailerStart => match byte {
            b'\r' => Some(ChunkStep::Next(Chunk::TrailerLf)),
            b'\n' => Some(ChunkStep::Done),
            _ => Some(ChunkStep::Next(Chunk::TrailerLine)),
        },
        Chunk::TrailerLine => match byte {
            b'\n' => Some(ChunkStep::Next(Chunk::TrailerStart)),
            _ => Some(ChunkStep::Next(Chunk::TrailerLine)),
        },
        Chunk::TrailerLf => match byte {
            b'\n' => Some(ChunkStep::Done),
            _ => None,
        },
    }
}

#[derive(Debug)]
enum ResponseState {
    Head(Vec<u8>),
    Body(BodyTracker),
    /// `101 Switching Protocols`: everything afterwards is opaque.
    Switched,
    Complete,
    Broken,
}

/// Tracks one response on the upstream → client direction.
#[derive(Debug)]
pub struct ResponseTracker {
    state: ResponseState,
    head_request: bool,
    max_head: usize,
    status: Option<u16>,
    keep_alive: bool,
}

impl ResponseTracker {
    pub fn new(head_request: bool, max_head: usize) -> Self {
        Self {
            state: ResponseState::Head(Vec::new()),
            head_request,
            max_head,
            status: None,
            keep_alive: false,
        }
    }

    /// Final status code, once the head has been seen.
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, ResponseState::Complete)
    }

    pub fn is_switched(&self) -> bool {
        matches!(self.state, ResponseState::Switched)
    }

    /// Body runs until the upstream closes.
    pub fn is_until_close(&self) -> bool {
        matches!(&self.state, ResponseState::Body(body) if body.is_until_close())
    }

    /// Complete, well-framed and persistent.
    pub fn is_reusable(&self) -> bool {
        self.is_complete() && self.keep_alive
    }

    /// Consume response bytes; returns how many belong to this response.
    pub fn feed(&mut self, data: &[u8]) -> usize {
        let mut offset = 0;
        while offset < data.len() {
            match &mut self.state {
                ResponseState::Head(head) => {
                    let before = head.len();
                    head.extend_from_slice(&data[offset..]);
                    match self.parse_head() {
                        HeadStatus::Partial => {
                            if self.head_len() > self.max_head {
                                self.state = ResponseState::Broken;
                            }
                            offset = data.len();
                        }
                        HeadStatus::Interim(len) => {
                            offset += len.saturating_sub(before);
                            self.state = ResponseState::Head(Vec::new());
                        }
                        HeadStatus::Final(len, next) => {
                            offset += len.saturating_sub(before);
                            self.state = next;
                        }
                        HeadStatus::Invalid => {
                            self.state = ResponseState::Broken;
                            offset = data.len();
                        }
                    }
                }
                ResponseState::Body(body) => {
                    offset += body.feed(&data[offset..]);
                    if body.is_complete() {
                        self.state = ResponseState::Complete;
                    } else if body.is_broken() {
                        self.state = ResponseState::Broken;
                    }
                }
                ResponseState::Switched | ResponseState::Broken => offset = data.len(),
                ResponseState::Complete => break,
            }
        }
        offset
    }

    fn head_len(&self) -> usize {
        match &self.state {
            ResponseState::Head(head) => head.len(),
            _ => 0,
        }
    }

    fn parse_head(&mut self) -> HeadStatus {
        let ResponseState::Head(buf) = &self.state else {
            return HeadStatus::Invalid;
        };

        let mut headers = [httparse::EMPTY_HEADER; super::http::MAX_HEADERS];
        let mut resp = httparse::Response::new(&mut headers);
        let len = match resp.parse(buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => return HeadStatus::Partial,
            Err(_) => return HeadStatus::Invalid,
        };

        let Some(code) = resp.code else {
            return HeadStatus::Invalid;
        };
        let version = resp.version.unwrap_or(1);

        if code == 101 {
            self.status = Some(code);
            return HeadStatus::Final(len, ResponseState::Switched);
        }
        if (100..200).contains(&code) {
            return HeadStatus::Interim(len);
        }

        self.status = Some(code);
        let connection = super::http::Connection::from_headers(resp.headers);
        self.keep_alive = connection.keep_alive(version);

        let kind = if self.head_request || code == 204 || code == 304 {
            BodyKind::Empty
        } else {
            let length = match super::http::content_length(resp.headers) {
                Ok(length) => length,
                Err(_) => return HeadStatus::Invalid,
            };
            match (super::http::chunked_encoding(resp.headers), length) {
                (Some(true), _) => BodyKind::Chunked,
                (Some(false), _) => BodyKind::UntilClose,
                (None, Some(n)) => BodyKind::Length(n),
                (None, None) => BodyKind::UntilClose,
            }
        };
        if kind == BodyKind::UntilClose {
            self.keep_alive = false;
        }

        let tracker = BodyTracker::new(kind);
        let next = if tracker.is_complete() {
            ResponseState::Complete
        } else {
            ResponseState::Body(tracker)
        };
        HeadStatus::Final(len, next)
    }
}

enum HeadStatus {
    Partial,
    Interim(usize),
    Final(usize, ResponseState),
    Invalid,
}
