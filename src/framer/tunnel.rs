//! Tunnel framing: a single `host:port` line, then opaque payload.

use super::{FrameError, FrameHead, FrameStatus, FramerLimits, RouteKey};

/// Parse the destination line at the start of `buf`.
pub fn parse_destination(buf: &[u8], limits: &FramerLimits) -> Result<FrameStatus, FrameError> {
    let Some(newline) = buf.iter().position(|b| *b == b'\n') else {
        if buf.len() >= limits.max_header_bytes {
            return Err(FrameError::HeaderTooLarge {
                limit: limits.max_header_bytes,
            });
        }
        return Ok(FrameStatus::NeedMoreData);
    };

    if newline >= limits.max_header_bytes {
        return Err(FrameError::HeaderTooLarge {
            limit: limits.max_header_bytes,
        });
    }

    let line = &buf[..newline];
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let line = std::str::from_utf8(line)
        .map_err(|_| FrameError::Malformed("destination line is not valid UTF-8".into()))?;

    let (host, port) = split_host_port(line.trim())
        .ok_or_else(|| FrameError::Malformed(format!("invalid tunnel destination '{}'", line)))?;

    Ok(FrameStatus::Complete(FrameHead {
        key: RouteKey::Tunnel { host, port },
        consumed: newline + 1,
        head_len: 0,
        request: None,
    }))
}

/// Split `host:port` or `[v6]:port`; the host is lower-cased.
pub fn split_host_port(s: &str) -> Option<(String, u16)> {
    let (host, port) = if let Some(rest) = s.strip_prefix('[') {
        let (host, rest) = rest.split_once(']')?;
        (host, rest.strip_prefix(':')?)
    } else {
        let (host, port) = s.rsplit_once(':')?;
        if host.contains(':') {
            return None;
        }
        (host, port)
    };

    if host.is_empty() || host.chars().any(char::is_whitespace) {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    if port == 0 {
        return None;
    }
    Some((host.to_ascii_lowercase(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_destination_line() {
        let limits = FramerLimits::default();
        let status = parse_destination(b"Cache.Internal:6379\r\n*1\r\n", &limits).unwrap();
        let FrameStatus::Complete(head) = status else {
            panic!("expected complete");
        };
        assert_eq!(
            head.key,
            RouteKey::Tunnel {
                host: "cache.internal".into(),
                port: 6379
            }
        );
        assert_eq!(head.consumed, 21);
    }

    #[test]
    fn split_host_port_variants() {
        assert_eq!(split_host_port("a:1"), Some(("a".into(), 1)));
        assert_eq!(split_host_port("[::1]:8080"), Some(("::1".into(), 8080)));
        assert_eq!(split_host_port("::1:8080"), None);
        assert_eq!(split_host_port("host"), None);
        assert_eq!(split_host_port("host:0"), None);
        assert_eq!(split_host_port(":80"), None);
        assert_eq!(split_host_port("host:http"), None);
    }

    #[test]
    fn rejects_garbage_and_long_lines() {
        let limits = FramerLimits {
            max_header_bytes: 16,
            ..FramerLimits::default()
        };
        assert!(matches!(
            parse_destination(b"no port here\n", &limits),
            Err(FrameError::Malformed(_))
        ));
        assert_eq!(
            parse_destination(b"a-very-long-hostname:80", &limits),
            Err(FrameError::HeaderTooLarge { limit: 16 })
        );
        assert_eq!(
            parse_destination(b"host:8", &limits).unwrap(),
            FrameStatus::NeedMoreData
        );
    }
}
