//! Proxy core: accept loop and per-connection pipeline.
//!
//! # Data Flow
//! ```text
//! ProxyServer::run (server.rs)
//!     permit → accept → JoinSet::spawn(handle_connection)
//!
//! handle_connection (handler.rs)
//!     read_frame → resolve → lease → relay::run → release → close
//!     any failure before the relay → rejection in the client's framing
//! ```

pub mod handler;
pub mod server;

use std::sync::Arc;
use std::time::Instant;

use crate::config::{ProxyConfig, SnapshotStore};
use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::state::LifecycleCell;
use crate::net::ConnectionTracker;
use crate::pool::UpstreamPool;
use crate::routing::RuleError;

pub use handler::{handle_connection, Disposition};
pub use server::{ExitStatus, ProxyServer};

/// State shared by the accept loop, every connection task and the admin API.
#[derive(Debug, Clone)]
pub struct ProxyContext {
    pub store: Arc<SnapshotStore>,
    pub pool: Arc<UpstreamPool>,
    pub tracker: ConnectionTracker,
    pub state: Arc<LifecycleCell>,
    pub shutdown: Shutdown,
    pub started_at: Instant,
}

impl ProxyContext {
    pub fn new(store: Arc<SnapshotStore>, pool: Arc<UpstreamPool>, shutdown: Shutdown) -> Self {
        Self {
            store,
            pool,
            tracker: ConnectionTracker::new(),
            state: Arc::new(LifecycleCell::new()),
            shutdown,
            started_at: Instant::now(),
        }
    }

    /// Compile `config` into a fresh store with an empty pool.
    pub fn from_config(config: &ProxyConfig) -> Result<Self, RuleError> {
        let store = Arc::new(SnapshotStore::from_config(config)?);
        Ok(Self::new(store, Arc::new(UpstreamPool::new()), Shutdown::new()))
    }
}
