//! Versioned, atomically swapped runtime configuration.
//!
//! Readers call [`SnapshotStore::load`] once per decision and keep using
//! that `Arc` for the rest of the exchange, so a reload never changes the
//! rules under an in-flight connection.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::config::schema::ProxyConfig;
use crate::framer::{FramerLimits, FramerMode};
use crate::pool::PoolLimits;
use crate::relay::RelayPolicy;
use crate::routing::{RouteTable, RuleError, TunnelTable};

/// Everything a connection needs, compiled from one [`ProxyConfig`].
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub mode: FramerMode,
    pub routes: RouteTable,
    pub tunnel: TunnelTable,
    pub pool: PoolLimits,
    pub relay: RelayPolicy,
    pub framer: FramerLimits,
}

impl ConfigSnapshot {
    pub fn compile(config: &ProxyConfig, version: u64) -> Result<Self, RuleError> {
        let timeouts = &config.timeouts;
        Ok(Self {
            version,
            mode: config.listener.mode,
            routes: RouteTable::compile(&config.routes)?,
            tunnel: TunnelTable::compile(config.tunnel.passthrough, &config.tunnel.routes)?,
            pool: PoolLimits {
                max_conn_per_target: config.pool.max_conn_per_target,
                exhausted_policy: config.pool.exhausted_policy,
                lease_wait: Duration::from_millis(config.pool.lease_wait_ms),
                idle_ttl: Duration::from_millis(config.pool.idle_ttl_ms),
                connect_timeout: Duration::from_millis(timeouts.connect_ms),
            },
            relay: RelayPolicy {
                idle_timeout: Duration::from_millis(timeouts.idle_ms),
                max_duration: (timeouts.max_duration_ms > 0)
                    .then(|| Duration::from_millis(timeouts.max_duration_ms)),
                buffer_size: config.relay.buffer_size,
            },
            framer: FramerLimits {
                max_header_bytes: config.framer.max_header_bytes,
                header_read_timeout: Duration::from_millis(timeouts.header_read_ms),
            },
        })
    }
}

/// Holder of the current snapshot.
#[derive(Debug)]
pub struct SnapshotStore {
    current: ArcSwap<ConfigSnapshot>,
    // Serializes replacements so versions never go backwards.
    reload: Mutex<()>,
}

impl SnapshotStore {
    pub fn new(snapshot: ConfigSnapshot) -> Self {
        Self {
            current: ArcSwap::from_pointee(snapshot),
            reload: Mutex::new(()),
        }
    }

    /// Compile `config` as version 1.
    pub fn from_config(config: &ProxyConfig) -> Result<Self, RuleError> {
        Ok(Self::new(ConfigSnapshot::compile(config, 1)?))
    }

    pub fn load(&self) -> Arc<ConfigSnapshot> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    /// Compile and publish `config` as the next version.
    ///
    /// On error the current snapshot stays in place.
    pub fn replace(&self, config: &ProxyConfig) -> Result<u64, RuleError> {
        let _guard = self.reload.lock().unwrap_or_else(PoisonError::into_inner);
        let version = self.current.load().version + 1;
        let snapshot = ConfigSnapshot::compile(config, version)?;
        self.current.store(Arc::new(snapshot));
        Ok(version)
    }
}
