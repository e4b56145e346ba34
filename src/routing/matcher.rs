//! Route matching logic.
//!
//! # Responsibilities
//! - Match host (exact match, case-insensitive, port ignored)
//! - Match path prefix (case-sensitive)
//! - Combine conditions with AND semantics
//! - Report specificity so the router can prefer the longest match
//!
//! # Design Decisions
//! - Host matching is case-insensitive
//! - Path matching is case-sensitive
//! - Missing host condition = any host (wildcard)
//! - No regex to guarantee O(n) matching

use super::RuleError;

/// Trait for matching HTTP route keys against conditions.
pub trait Matcher: Send + Sync + std::fmt::Debug {
    /// Returns true if the (host, path) pair matches this condition.
    fn matches(&self, host: Option<&str>, path: &str) -> bool;
}

/// Matches the request host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostMatcher {
    expected_host: String,
}

impl HostMatcher {
    /// Create a new host matcher.
    /// The host is normalized to lowercase for case-insensitive matching.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            expected_host: host.into().to_lowercase(),
        }
    }

    pub fn host(&self) -> &str {
        &self.expected_host
    }
}

impl Matcher for HostMatcher {
    fn matches(&self, host: Option<&str>, _path: &str) -> bool {
        host.map(|h| h.eq_ignore_ascii_case(&self.expected_host))
            .unwrap_or(false)
    }
}

/// Matches the request path prefix.
///
/// A prefix ending in `/` also matches the bare directory, so `/api/`
/// matches both `/api/ping` and `/api`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPrefixMatcher {
    prefix: String,
}

impl PathPrefixMatcher {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Matcher for PathPrefixMatcher {
    fn matches(&self, _host: Option<&str>, path: &str) -> bool {
        if path.starts_with(&self.prefix) {
            return true;
        }
        match self.prefix.strip_suffix('/') {
            Some(dir) if !dir.is_empty() => path == dir,
            _ => false,
        }
    }
}

/// A compiled `[host]/path-prefix[*]` pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    source: String,
    host: Option<HostMatcher>,
    path: PathPrefixMatcher,
}

impl RoutePattern {
    /// Parse a pattern such as `/api/*`, `example.com/static/`, or `*`.
    pub fn parse(pattern: &str) -> Result<Self, RuleError> {
        let source = pattern.trim();
        let invalid = |reason: &str| RuleError::Pattern {
            pattern: source.to_string(),
            reason: reason.to_string(),
        };

        if source.is_empty() {
            return Err(invalid("empty pattern"));
        }
        if source == "*" {
            return Ok(Self {
                source: source.to_string(),
                host: None,
                path: PathPrefixMatcher::new("/"),
            });
        }

        let (host, path) = match source.find('/') {
            Some(idx) => (&source[..idx], &source[idx..]),
            None => (source, "/"),
        };

        let host = match host {
            "" | "*" => None,
            h if h.contains('*') => return Err(invalid("wildcards are only allowed at the end of the path")),
            h if h.chars().any(char::is_whitespace) => return Err(invalid("host contains whitespace")),
            h => Some(HostMatcher::new(h.split(':').next().unwrap_or(h))),
        };

        let path = path.strip_suffix('*').unwrap_or(path);
        if path.contains('*') {
            return Err(invalid("wildcards are only allowed at the end of the path"));
        }

        Ok(Self {
            source: source.to_string(),
            host,
            path: PathPrefixMatcher::new(path),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_ref().map(HostMatcher::host)
    }

    pub fn path_prefix(&self) -> &str {
        self.path.prefix()
    }

    /// Ordering key: longer prefix first, then host-qualified first.
    pub fn specificity(&self) -> (usize, bool) {
        (self.path.prefix().len(), self.host.is_some())
    }
}

impl Matcher for RoutePattern {
    fn matches(&self, host: Option<&str>, path: &str) -> bool {
        // All conditions must pass (AND)
        self.host.as_ref().map(|m| m.matches(host, path)).unwrap_or(true)
            && self.path.matches(host, path)
    }
}
