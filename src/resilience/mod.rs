//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! New upstream connection:
//!     → retries.rs (connect with timeout, retry once on failure)
//!     → backoff.rs (jittered delay between attempts)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every connect has a deadline
//! - Only connection establishment is retried; bytes already forwarded never are
//! - Jittered backoff prevents thundering herd against a recovering target

pub mod backoff;
pub mod retries;

pub use backoff::calculate_backoff;
pub use retries::{connect_with_retry, RetryPolicy};
