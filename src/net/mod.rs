//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (admission permit, then accept)
//!     → connection.rs (id, activity clock, state machine)
//!     → Hand off to the proxy handler
//!
//! Connection States:
//!     Reading → Relaying → Draining → Closed
//! ```
//!
//! # Design Decisions
//! - The permit is taken before `accept`, so a full server pauses instead of dropping
//! - Each connection tracked for graceful shutdown and the admin API
//! - States only move forward

pub mod connection;
pub mod listener;

pub use connection::{ActivityClock, ConnectionId, ConnectionState, ConnectionTracker, InboundConnection};
pub use listener::{ConnectionPermit, Listener, ListenerError};
