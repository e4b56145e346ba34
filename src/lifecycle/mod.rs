//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Snapshot → Pool → Metrics → Listener → Watcher → Admin → Signals → Accept
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Drain connections → Force → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → drain, a second one forces
//!     SIGHUP → reload the route file
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then core, then listeners
//! - Ordered shutdown: stop accept, drain, force, close
//! - Shutdown has a deadline: forced after the grace period

pub mod shutdown;
pub mod signals;
pub mod startup;
pub mod state;

pub use shutdown::{Shutdown, ShutdownListener, ShutdownPhase};
pub use startup::{run, StartupError};
pub use state::{LifecycleCell, LifecycleState};
