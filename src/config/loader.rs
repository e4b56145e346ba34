//! Configuration loading: defaults, then the TOML route file, then env.

use std::fs;
use std::path::Path;
use std::str::FromStr;

use thiserror::Error;

use crate::config::schema::{ProxyConfig, RouteConfig, TunnelRouteConfig};
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {var}: {message}")]
    Env { var: &'static str, message: String },

    #[error("validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// Load, override from the process environment, and validate.
pub fn load_config(path: Option<&Path>) -> Result<ProxyConfig, ConfigError> {
    load_config_with(path, |var| std::env::var(var).ok())
}

/// Same as [`load_config`] with an explicit environment lookup.
pub fn load_config_with<F>(path: Option<&Path>, lookup: F) -> Result<ProxyConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match path {
        Some(path) => load_file(path)?,
        None => ProxyConfig::default(),
    };
    apply_env_overrides(&mut config, lookup)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Parse a TOML file without validating it.
pub fn load_file(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(toml::from_str(&content)?)
}

/// Apply environment variables on top of `config`; set variables win.
pub fn apply_env_overrides<F>(config: &mut ProxyConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |var: &'static str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    if let Some(v) = get("LISTEN_PORT") {
        config.listener.port = parse_var("LISTEN_PORT", &v)?;
    }
    if let Some(v) = get("BIND_ADDRESS") {
        config.listener.bind_address = v;
    }
    if let Some(v) = get("ALLOW_PRIVILEGED_PORT") {
        config.listener.allow_privileged_port = parse_bool("ALLOW_PRIVILEGED_PORT", &v)?;
    }
    if let Some(v) = get("MAX_CONNECTIONS") {
        config.listener.max_connections = parse_var("MAX_CONNECTIONS", &v)?;
    }
    if let Some(v) = get("PROXY_MODE") {
        config.listener.mode = parse_var("PROXY_MODE", &v)?;
    }
    if let Some(v) = get("UPSTREAM_MAP") {
        let (routes, tunnel_routes) = parse_upstream_map(&v)?;
        config.routes = routes;
        config.tunnel.routes = tunnel_routes;
    }
    if let Some(v) = get("TUNNEL_PASSTHROUGH") {
        config.tunnel.passthrough = parse_bool("TUNNEL_PASSTHROUGH", &v)?;
    }
    if let Some(v) = get("MAX_CONN_PER_TARGET") {
        config.pool.max_conn_per_target = parse_var("MAX_CONN_PER_TARGET", &v)?;
    }
    if let Some(v) = get("POOL_EXHAUSTED_POLICY") {
        config.pool.exhausted_policy = parse_var("POOL_EXHAUSTED_POLICY", &v)?;
    }
    if let Some(v) = get("POOL_IDLE_TTL_MS") {
        config.pool.idle_ttl_ms = parse_var("POOL_IDLE_TTL_MS", &v)?;
    }
    if let Some(v) = get("IDLE_TIMEOUT_MS") {
        config.timeouts.idle_ms = parse_var("IDLE_TIMEOUT_MS", &v)?;
    }
    if let Some(v) = get("MAX_DURATION_MS") {
        config.timeouts.max_duration_ms = parse_var("MAX_DURATION_MS", &v)?;
    }
    if let Some(v) = get("CONNECT_TIMEOUT_MS") {
        config.timeouts.connect_ms = parse_var("CONNECT_TIMEOUT_MS", &v)?;
    }
    if let Some(v) = get("SHUTDOWN_GRACE_MS") {
        config.timeouts.shutdown_grace_ms = parse_var("SHUTDOWN_GRACE_MS", &v)?;
    }
    if let Some(v) = get("ADMIN_ADDRESS") {
        config.admin.bind_address = Some(v);
    }
    if let Some(v) = get("ADMIN_API_KEY") {
        config.admin.api_key = Some(v);
    }
    if let Some(v) = get("METRICS_ADDRESS") {
        config.observability.metrics_address = Some(v);
    }
    if let Some(v) = get("LOG_LEVEL") {
        config.observability.log_level = v;
    }
    if let Some(v) = get("LOG_FORMAT") {
        config.observability.log_format = match v.to_ascii_lowercase().as_str() {
            "pretty" | "text" => crate::config::schema::LogFormat::Pretty,
            "json" => crate::config::schema::LogFormat::Json,
            other => {
                return Err(ConfigError::Env {
                    var: "LOG_FORMAT",
                    message: format!("expected pretty or json, got '{}'", other),
                })
            }
        };
    }

    Ok(())
}

/// Parse `pattern=host:port,...`; a `tcp://` pattern is a tunnel rule.
fn parse_upstream_map(value: &str) -> Result<(Vec<RouteConfig>, Vec<TunnelRouteConfig>), ConfigError> {
    let mut routes = Vec::new();
    let mut tunnel = Vec::new();

    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((pattern, target)) = entry.split_once('=') else {
            return Err(ConfigError::Env {
                var: "UPSTREAM_MAP",
                message: format!("entry '{}' is not pattern=host:port", entry),
            });
        };
        let (pattern, target) = (pattern.trim(), target.trim().to_string());
        match pattern.strip_prefix("tcp://") {
            Some(destination) => tunnel.push(TunnelRouteConfig {
                destination: destination.to_string(),
                target,
            }),
            None => routes.push(RouteConfig {
                name: None,
                pattern: pattern.to_string(),
                target,
            }),
        }
    }

    Ok((routes, tunnel))
}

fn parse_var<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::Env {
        var,
        message: e.to_string(),
    })
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::Env {
            var,
            message: format!("expected a boolean, got '{}'", other),
        }),
    }
}
