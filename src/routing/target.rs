//! Upstream destinations.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::Serialize;

use super::RuleError;
use crate::framer::tunnel::split_host_port;

/// A `host:port` pair as written in the route table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TargetAddr {
    pub host: String,
    pub port: u16,
}

impl TargetAddr {
    pub fn parse(s: &str) -> Result<Self, RuleError> {
        let s = s.trim();
        let s = s.strip_prefix("tcp://").unwrap_or(s);
        split_host_port(s)
            .map(|(host, port)| Self { host, port })
            .ok_or_else(|| RuleError::Target(s.to_string()))
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// What kind of traffic a target carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetProtocol {
    /// HTTP/1.x exchanges; connections may be reused.
    Http,
    /// Opaque stream; connections are never reused.
    Tunnel,
}

/// A resolved destination. Also the key of the upstream pool.
///
/// Equality and hashing cover address and protocol only; two rules that
/// point at the same backend share its pool.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    pub addr: TargetAddr,
    pub protocol: TargetProtocol,
    /// Name of the rule that produced this target, if any.
    pub rule: Option<String>,
}

impl UpstreamTarget {
    pub fn new(addr: TargetAddr, protocol: TargetProtocol) -> Self {
        Self {
            addr,
            protocol,
            rule: None,
        }
    }

    pub fn with_rule(mut self, rule: impl Into<String>) -> Self {
        self.rule = Some(rule.into());
        self
    }

    pub fn host(&self) -> &str {
        &self.addr.host
    }

    pub fn port(&self) -> u16 {
        self.addr.port
    }

    pub fn is_reusable(&self) -> bool {
        self.protocol == TargetProtocol::Http
    }
}

impl PartialEq for UpstreamTarget {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr && self.protocol == other.protocol
    }
}

impl Eq for UpstreamTarget {}

impl Hash for UpstreamTarget {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
        self.protocol.hash(state);
    }
}

impl fmt::Display for UpstreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.addr.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let addr = TargetAddr::parse("Backend-1:8080").unwrap();
        assert_eq!(addr.host, "backend-1");
        assert_eq!(addr.to_string(), "backend-1:8080");

        let addr = TargetAddr::parse("tcp://[fd00::2]:5432").unwrap();
        assert_eq!(addr.to_string(), "[fd00::2]:5432");

        assert!(TargetAddr::parse("backend-1").is_err());
    }

    #[test]
    fn pool_key_ignores_rule_name() {
        let addr = TargetAddr::parse("backend-1:8080").unwrap();
        let a = UpstreamTarget::new(addr.clone(), TargetProtocol::Http).with_rule("api");
        let b = UpstreamTarget::new(addr.clone(), TargetProtocol::Http).with_rule("static");
        assert_eq!(a, b);
        assert_ne!(a, UpstreamTarget::new(addr, TargetProtocol::Tunnel));
    }
}
