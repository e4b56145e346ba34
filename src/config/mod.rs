//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! defaults
//!     → loader.rs (TOML route file, then environment overrides)
//!     → validation.rs (semantic checks, all errors at once)
//!     → snapshot.rs (compile into a versioned ConfigSnapshot)
//!     → shared via ArcSwap to every connection
//!
//! On reload (file change or SIGHUP):
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → atomic swap of Arc<ConfigSnapshot>, version + 1
//! ```
//!
//! # Design Decisions
//! - Snapshots are immutable once published; changes require a full reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Listener settings (port, admission cap, grace) are read once at startup

pub mod loader;
pub mod schema;
pub mod snapshot;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::{ListenerConfig, LogFormat, ProxyConfig, RouteConfig, TunnelRouteConfig};
pub use snapshot::{ConfigSnapshot, SnapshotStore};
pub use watcher::{ConfigWatcher, Reloader};
