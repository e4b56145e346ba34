//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! RouteKey (host, path) or (tunnel destination)
//!     → router.rs (resolve against one ConfigSnapshot)
//!     → matcher.rs (evaluate host + path prefix conditions)
//!     → Return: UpstreamTarget or NoRouteFound
//!
//! Route Compilation (at load / reload):
//!     RouteConfig[]
//!     → Parse patterns and targets
//!     → Freeze as immutable RouteTable inside the snapshot
//! ```
//!
//! # Design Decisions
//! - Routes compiled once per snapshot, immutable at runtime
//! - No regex in hot path (prefix matching only)
//! - Deterministic: longest prefix wins, declaration order breaks ties
//! - Resolution performs no I/O

pub mod matcher;
pub mod router;
pub mod target;

use thiserror::Error;

pub use matcher::RoutePattern;
pub use router::{resolve, RouteRule, RouteTable, TunnelRule, TunnelTable};
pub use target::{TargetAddr, TargetProtocol, UpstreamTarget};

/// Routing failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("no route for {0}")]
    NoRouteFound(String),
}

/// Rule compilation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("invalid route pattern '{pattern}': {reason}")]
    Pattern { pattern: String, reason: String },
    #[error("invalid upstream target '{0}', expected host:port")]
    Target(String),
}
