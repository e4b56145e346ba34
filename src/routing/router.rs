//! Route lookup.
//!
//! # Responsibilities
//! - Store compiled HTTP and tunnel rules
//! - Look up the matching rule for a RouteKey
//! - Return a resolved target or explicit NoRouteFound
//!
//! # Design Decisions
//! - Immutable after construction (shared via the snapshot, no locks)
//! - O(n) scan over rules (acceptable for typical route counts)
//! - Longest prefix wins; host-qualified beats host-less; then first declared
//! - Explicit NoRouteFound rather than a silent default

use serde::Serialize;

use super::matcher::{Matcher, RoutePattern};
use super::target::{TargetAddr, TargetProtocol, UpstreamTarget};
use super::{RouteError, RuleError};
use crate::config::snapshot::ConfigSnapshot;
use crate::config::{RouteConfig, TunnelRouteConfig};
use crate::framer::RouteKey;

/// A compiled HTTP rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    pub name: String,
    pub pattern: RoutePattern,
    pub target: TargetAddr,
}

/// A compiled tunnel rule: exact destination → target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelRule {
    pub destination: TargetAddr,
    pub target: TargetAddr,
}

/// Ordered HTTP rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
}

impl RouteTable {
    /// Compile rules in declaration order.
    pub fn compile(routes: &[RouteConfig]) -> Result<Self, RuleError> {
        let rules = routes
            .iter()
            .enumerate()
            .map(|(idx, route)| {
                Ok(RouteRule {
                    name: route.name.clone().unwrap_or_else(|| format!("route-{}", idx)),
                    pattern: RoutePattern::parse(&route.pattern)?,
                    target: TargetAddr::parse(&route.target)?,
                })
            })
            .collect::<Result<Vec<_>, RuleError>>()?;
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Most specific matching rule; the first declared wins ties.
    pub fn best_match(&self, host: Option<&str>, path: &str) -> Option<&RouteRule> {
        let mut best: Option<&RouteRule> = None;
        for rule in self.rules.iter().filter(|r| r.pattern.matches(host, path)) {
            match best {
                Some(current) if rule.pattern.specificity() <= current.pattern.specificity() => {}
                _ => best = Some(rule),
            }
        }
        best
    }
}

/// Tunnel destinations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelTable {
    pub passthrough: bool,
    rules: Vec<TunnelRule>,
}

impl TunnelTable {
    pub fn compile(passthrough: bool, routes: &[TunnelRouteConfig]) -> Result<Self, RuleError> {
        let rules = routes
            .iter()
            .map(|route| {
                Ok(TunnelRule {
                    destination: TargetAddr::parse(&route.destination)?,
                    target: TargetAddr::parse(&route.target)?,
                })
            })
            .collect::<Result<Vec<_>, RuleError>>()?;
        Ok(Self { passthrough, rules })
    }

    pub fn rules(&self) -> &[TunnelRule] {
        &self.rules
    }

    pub fn lookup(&self, host: &str, port: u16) -> Option<TargetAddr> {
        if let Some(rule) = self
            .rules
            .iter()
            .find(|r| r.destination.port == port && r.destination.host.eq_ignore_ascii_case(host))
        {
            return Some(rule.target.clone());
        }
        self.passthrough.then(|| TargetAddr {
            host: host.to_ascii_lowercase(),
            port,
        })
    }
}

/// Resolve a route key against one consistent snapshot.
pub fn resolve(key: &RouteKey, snapshot: &ConfigSnapshot) -> Result<UpstreamTarget, RouteError> {
    match key {
        RouteKey::Http { host, path } => snapshot
            .routes
            .best_match(host.as_deref(), path)
            .map(|rule| UpstreamTarget::new(rule.target.clone(), TargetProtocol::Http).with_rule(&rule.name))
            .ok_or_else(|| RouteError::NoRouteFound(key.to_string())),
        RouteKey::Tunnel { host, port } => snapshot
            .tunnel
            .lookup(host, *port)
            .map(|addr| UpstreamTarget::new(addr, TargetProtocol::Tunnel))
            .ok_or_else(|| RouteError::NoRouteFound(key.to_string())),
    }
}
