//! myproxy: a TCP/HTTP reverse proxy library.

pub mod admin;
pub mod config;
pub mod error;
pub mod framer;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod pool;
pub mod proxy;
pub mod relay;
pub mod resilience;
pub mod routing;

pub use config::schema::ProxyConfig;
pub use error::ProxyError;
pub use lifecycle::Shutdown;
pub use proxy::{ExitStatus, ProxyContext, ProxyServer};
