//! HTTP/1.x request head parsing.
//!
//! # Responsibilities
//! - Parse the request line and header block with `httparse`
//! - Extract the routing host (Host header or absolute-form target) and path
//! - Derive keep-alive, upgrade and body framing for the relay
//!
//! # Design Decisions
//! - `Transfer-Encoding` together with `Content-Length` is rejected (smuggling)
//! - Conflicting `Content-Length` values are rejected
//! - Hosts are lower-cased with the port stripped; paths keep their case

use super::body::BodyKind;
use super::{FrameError, FrameHead, FrameStatus, FramerLimits, RouteKey};

/// Maximum number of request headers.
pub const MAX_HEADERS: usize = 64;

/// Facts about the request the relay needs after routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    pub version: u8,
    pub keep_alive: bool,
    pub upgrade: bool,
    pub body: BodyKind,
}

impl RequestHead {
    pub fn is_head(&self) -> bool {
        self.method.eq_ignore_ascii_case("HEAD")
    }
}

/// Parse an HTTP request head from `buf`.
pub fn parse_request(buf: &[u8], limits: &FramerLimits) -> Result<FrameStatus, FrameError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let head_len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => {
            if buf.len() >= limits.max_header_bytes {
                return Err(FrameError::HeaderTooLarge {
                    limit: limits.max_header_bytes,
                });
            }
            return Ok(FrameStatus::NeedMoreData);
        }
        Err(httparse::Error::TooManyHeaders) => {
            return Err(FrameError::HeaderTooLarge {
                limit: limits.max_header_bytes,
            })
        }
        Err(e) => return Err(FrameError::Malformed(e.to_string())),
    };

    if head_len > limits.max_header_bytes {
        return Err(FrameError::HeaderTooLarge {
            limit: limits.max_header_bytes,
        });
    }

    let method = req
        .method
        .ok_or_else(|| FrameError::Malformed("missing method".into()))?;
    let target = req
        .path
        .ok_or_else(|| FrameError::Malformed("missing request target".into()))?;
    let version = req
        .version
        .ok_or_else(|| FrameError::Malformed("missing version".into()))?;

    if method.eq_ignore_ascii_case("CONNECT") {
        return Err(FrameError::Malformed(
            "CONNECT is not accepted in http mode".into(),
        ));
    }

    let (target_host, path) = split_target(target)?;
    let header_host = match header_value(req.headers, "host") {
        Some(value) => Some(normalize_host(value)?),
        None => None,
    };
    let host = target_host.or(header_host);

    let connection = Connection::from_headers(req.headers);
    let keep_alive = connection.keep_alive(version);
    let upgrade = connection.upgrade && header_value(req.headers, "upgrade").is_some();
    let body = request_body(req.headers)?;

    Ok(FrameStatus::Complete(FrameHead {
        key: RouteKey::Http { host, path },
        consumed: 0,
        head_len,
        request: Some(RequestHead {
            method: method.to_string(),
            version,
            keep_alive,
            upgrade,
            body,
        }),
    }))
}

/// Split a request target into (host, path) and drop the query string.
fn split_target(target: &str) -> Result<(Option<String>, String), FrameError> {
    if target.starts_with('/') {
        let path = target.split(['?', '#']).next().unwrap_or(target);
        return Ok((None, path.to_string()));
    }

    let lower = target.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        let url = url::Url::parse(target)
            .map_err(|e| FrameError::Malformed(format!("invalid absolute target: {}", e)))?;
        let host = url
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_ascii_lowercase());
        return Ok((host, url.path().to_string()));
    }

    Err(FrameError::Malformed(format!(
        "unsupported request target '{}'",
        target
    )))
}

/// Lower-case a Host header value and strip its port.
fn normalize_host(value: &[u8]) -> Result<String, FrameError> {
    let value = std::str::from_utf8(value)
        .map_err(|_| FrameError::Malformed("Host header is not valid UTF-8".into()))?
        .trim();
    if value.is_empty() {
        return Err(FrameError::Malformed("empty Host header".into()));
    }

    let host = if let Some(rest) = value.strip_prefix('[') {
        rest.split(']').next().unwrap_or(rest)
    } else {
        value.split(':').next().unwrap_or(value)
    };
    Ok(host.to_ascii_lowercase())
}

pub(crate) fn header_value<'a>(headers: &'a [httparse::Header<'_>], name: &str) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value)
}

/// Comma-separated tokens of every header named `name`, lower-cased.
pub(crate) fn header_tokens(headers: &[httparse::Header<'_>], name: &str) -> Vec<String> {
    headers
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case(name))
        .filter_map(|h| std::str::from_utf8(h.value).ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// `Connection` header tokens that matter to the proxy.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Connection {
    pub close: bool,
    pub keep_alive: bool,
    pub upgrade: bool,
}

impl Connection {
    pub fn from_headers(headers: &[httparse::Header<'_>]) -> Self {
        let mut conn = Connection::default();
        for token in header_tokens(headers, "connection") {
            match token.as_str() {
                "close" => conn.close = true,
                "keep-alive" => conn.keep_alive = true,
                "upgrade" => conn.upgrade = true,
                _ => {}
            }
        }
        conn
    }

    /// HTTP/1.1 defaults to persistent, HTTP/1.0 needs an explicit opt-in.
    pub fn keep_alive(&self, version: u8) -> bool {
        if self.close {
            return false;
        }
        version >= 1 || self.keep_alive
    }
}

/// Parse all `Content-Length` headers; differing values are an error.
pub(crate) fn content_length(headers: &[httparse::Header<'_>]) -> Result<Option<u64>, FrameError> {
    let mut length = None;
    for value in header_tokens(headers, "content-length") {
        let parsed: u64 = value
            .parse()
            .map_err(|_| FrameError::Malformed(format!("invalid Content-Length '{}'", value)))?;
        match length {
            Some(existing) if existing != parsed => {
                return Err(FrameError::Malformed("conflicting Content-Length values".into()))
            }
            _ => length = Some(parsed),
        }
    }
    Ok(length)
}

/// Whether the final transfer coding is `chunked`, if the header is present.
pub(crate) fn chunked_encoding(headers: &[httparse::Header<'_>]) -> Option<bool> {
    let codings = header_tokens(headers, "transfer-encoding");
    if codings.is_empty() {
        return None;
    }
    Some(codings.last().map(|c| c == "chunked").unwrap_or(false))
}

fn request_body(headers: &[httparse::Header<'_>]) -> Result<BodyKind, FrameError> {
    let length = content_length(headers)?;
    match (chunked_encoding(headers), length) {
        (Some(_), Some(_)) => Err(FrameError::Malformed(
            "both Transfer-Encoding and Content-Length present".into(),
        )),
        (Some(true), None) => Ok(BodyKind::Chunked),
        (Some(false), None) => Err(FrameError::Malformed(
            "request transfer coding does not end in chunked".into(),
        )),
        (None, Some(0)) | (None, None) => Ok(BodyKind::Empty),
        (None, Some(n)) => Ok(BodyKind::Length(n)),
    }
}
