//! Process lifecycle state: `Starting → Accepting → Draining → Stopped`.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Starting = 0,
    Accepting = 1,
    Draining = 2,
    Stopped = 3,
}

impl From<u8> for LifecycleState {
    fn from(val: u8) -> Self {
        match val {
            0 => LifecycleState::Starting,
            1 => LifecycleState::Accepting,
            2 => LifecycleState::Draining,
            _ => LifecycleState::Stopped,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleState::Starting => "starting",
            LifecycleState::Accepting => "accepting",
            LifecycleState::Draining => "draining",
            LifecycleState::Stopped => "stopped",
        })
    }
}

/// Shared, forward-only lifecycle state.
#[derive(Debug, Default)]
pub struct LifecycleCell(AtomicU8);

impl LifecycleCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> LifecycleState {
        self.0.load(Ordering::Acquire).into()
    }

    /// Move to `next` if it is later than the current state.
    pub fn advance(&self, next: LifecycleState) -> bool {
        let prev = self.0.fetch_max(next as u8, Ordering::AcqRel);
        let moved = prev < next as u8;
        if moved {
            tracing::info!(from = %LifecycleState::from(prev), to = %next, "Lifecycle state changed");
        }
        moved
    }
}
