//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from the route file.

use serde::{Deserialize, Serialize};

use crate::framer::FramerMode;
use crate::pool::ExhaustedPolicy;

/// Root configuration for the proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, admission cap, mode).
    pub listener: ListenerConfig,

    /// HTTP route rules, in declaration order.
    pub routes: Vec<RouteConfig>,

    /// Tunnel destinations.
    pub tunnel: TunnelConfig,

    /// Upstream pool limits.
    pub pool: PoolConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    pub framer: FramerConfig,

    pub relay: RelayConfig,

    pub admin: AdminConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Interface to bind (e.g., "0.0.0.0").
    pub bind_address: String,

    pub port: u16,

    /// Permit ports below 1024.
    pub allow_privileged_port: bool,

    /// Maximum concurrent connections (admission control).
    pub max_connections: usize,

    /// How inbound streams are framed.
    pub mode: FramerMode,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 3000,
            allow_privileged_port: false,
            max_connections: 1024,
            mode: FramerMode::Auto,
        }
    }
}

/// HTTP route rule: `[host]/path-prefix[*]` → `host:port`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RouteConfig {
    /// Rule identifier for logging and the admin API.
    #[serde(default)]
    pub name: Option<String>,

    pub pattern: String,

    /// Upstream address (e.g., "backend-1:8080").
    pub target: String,
}

/// Tunnel routing.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct TunnelConfig {
    /// Forward unknown destinations as requested.
    pub passthrough: bool,

    pub routes: Vec<TunnelRouteConfig>,
}

/// Exact tunnel destination → upstream address.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct TunnelRouteConfig {
    pub destination: String,
    pub target: String,
}

/// Upstream pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle + leased connections allowed per target.
    pub max_conn_per_target: usize,

    pub exhausted_policy: ExhaustedPolicy,

    /// How long `wait` blocks for a free slot.
    pub lease_wait_ms: u64,

    /// Idle connections older than this are evicted at lease time.
    pub idle_ttl_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_conn_per_target: 32,
            exhausted_policy: ExhaustedPolicy::Wait,
            lease_wait_ms: 5_000,
            idle_ttl_ms: 90_000,
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upstream connection establishment timeout.
    pub connect_ms: u64,

    /// Time a client gets to send the framing head.
    pub header_read_ms: u64,

    /// Relay idle timeout.
    pub idle_ms: u64,

    /// Relay total-duration cap; 0 disables it.
    pub max_duration_ms: u64,

    /// Drain deadline on shutdown.
    pub shutdown_grace_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 2_000,
            header_read_ms: 10_000,
            idle_ms: 60_000,
            max_duration_ms: 3_600_000,
            shutdown_grace_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct FramerConfig {
    pub max_header_bytes: usize,
}

impl Default for FramerConfig {
    fn default() -> Self {
        Self {
            max_header_bytes: crate::framer::DEFAULT_MAX_HEADER_BYTES,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
    /// Per-direction buffer size in bytes.
    pub buffer_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_size: crate::relay::DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct AdminConfig {
    /// Admin API bind address; unset disables the admin server.
    pub bind_address: Option<String>,

    /// Bearer token required on `/admin/*` when set.
    pub api_key: Option<String>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level or filter directive (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Prometheus exporter bind address; unset disables metrics export.
    pub metrics_address: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_address: None,
        }
    }
}
