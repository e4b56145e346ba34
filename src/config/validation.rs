//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check that every pattern and target compiles
//! - Validate value ranges (limits > 0, ports valid, buffer bounds)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;

use crate::config::schema::ProxyConfig;
use crate::routing::{RoutePattern, TargetAddr};

/// Smallest accepted relay buffer.
pub const MIN_BUFFER_SIZE: usize = 512;
/// Largest accepted relay buffer.
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// A single semantic problem, located by its config path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Ports below 1024, except 0 which asks the OS for an ephemeral port.
pub fn is_privileged(port: u16) -> bool {
    port != 0 && port < 1024
}

pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let listener = &config.listener;
    if is_privileged(listener.port) && !listener.allow_privileged_port {
        errors.push(ValidationError::new(
            "listener.port",
            format!("port {} is privileged; set allow_privileged_port to use it", listener.port),
        ));
    }
    if listener.bind_address.parse::<std::net::IpAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not an IP address", listener.bind_address),
        ));
    }
    if listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be greater than 0"));
    }

    for (idx, route) in config.routes.iter().enumerate() {
        if let Err(e) = RoutePattern::parse(&route.pattern) {
            errors.push(ValidationError::new(format!("routes[{}].pattern", idx), e.to_string()));
        }
        if let Err(e) = TargetAddr::parse(&route.target) {
            errors.push(ValidationError::new(format!("routes[{}].target", idx), e.to_string()));
        }
    }

    for (idx, route) in config.tunnel.routes.iter().enumerate() {
        if let Err(e) = TargetAddr::parse(&route.destination) {
            errors.push(ValidationError::new(
                format!("tunnel.routes[{}].destination", idx),
                e.to_string(),
            ));
        }
        if let Err(e) = TargetAddr::parse(&route.target) {
            errors.push(ValidationError::new(format!("tunnel.routes[{}].target", idx), e.to_string()));
        }
    }

    if config.pool.max_conn_per_target == 0 {
        errors.push(ValidationError::new("pool.max_conn_per_target", "must be greater than 0"));
    }

    let timeouts = &config.timeouts;
    for (field, value) in [
        ("timeouts.connect_ms", timeouts.connect_ms),
        ("timeouts.header_read_ms", timeouts.header_read_ms),
        ("timeouts.idle_ms", timeouts.idle_ms),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than 0"));
        }
    }

    if config.framer.max_header_bytes < 64 {
        errors.push(ValidationError::new("framer.max_header_bytes", "must be at least 64"));
    }

    let buffer = config.relay.buffer_size;
    if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&buffer) {
        errors.push(ValidationError::new(
            "relay.buffer_size",
            format!("must be between {} and {}", MIN_BUFFER_SIZE, MAX_BUFFER_SIZE),
        ));
    }

    for (field, addr) in [
        ("admin.bind_address", &config.admin.bind_address),
        ("observability.metrics_address", &config.observability.metrics_address),
    ] {
        if let Some(addr) = addr {
            if addr.parse::<std::net::SocketAddr>().is_err() {
                errors.push(ValidationError::new(field, format!("'{}' is not a socket address", addr)));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::RouteConfig;

    #[test]
    fn defaults_are_valid() {
        assert!(validate_config(&ProxyConfig::default()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut config = ProxyConfig::default();
        config.listener.port = 80;
        config.pool.max_conn_per_target = 0;
        config.relay.buffer_size = 1;
        config.routes.push(RouteConfig {
            name: None,
            pattern: "/a/*/b".into(),
            target: "no-port".into(),
        });

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "listener.port",
                "routes[0].pattern",
                "routes[0].target",
                "pool.max_conn_per_target",
                "relay.buffer_size",
            ]
        );
    }

    #[test]
    fn privileged_port_allowed_when_permitted() {
        let mut config = ProxyConfig::default();
        config.listener.port = 80;
        config.listener.allow_privileged_port = true;
        assert!(validate_config(&config).is_ok());
    }
}
