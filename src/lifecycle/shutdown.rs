//! Shutdown coordination for the proxy.
//!
//! One coordinator is the only source of cancellation. Phases only move
//! forward: `Running → Draining → Forced`.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownPhase {
    Running,
    /// Stop accepting; in-flight connections finish on their own.
    Draining,
    /// In-flight relays must unwind now.
    Forced,
}

/// Coordinator for graceful shutdown.
///
/// Provides a watch channel that all long-running tasks can subscribe to.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<ShutdownPhase>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ShutdownPhase::Running);
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener { rx: self.tx.subscribe() }
    }

    /// Begin draining. No effect once draining or forced.
    pub fn trigger(&self) {
        self.advance(ShutdownPhase::Draining);
    }

    /// Force in-flight connections to stop.
    pub fn force(&self) {
        self.advance(ShutdownPhase::Forced);
    }

    pub fn phase(&self) -> ShutdownPhase {
        *self.tx.borrow()
    }

    /// Get the number of active subscribers.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn advance(&self, to: ShutdownPhase) {
        let changed = self.tx.send_if_modified(|phase| {
            if *phase < to {
                *phase = to;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::info!(phase = ?to, "Shutdown phase changed");
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-task view of the shutdown phase.
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<ShutdownPhase>,
}

impl ShutdownListener {
    pub fn phase(&self) -> ShutdownPhase {
        *self.rx.borrow()
    }

    /// Resolves once draining (or forced) has begun.
    pub async fn draining(&mut self) {
        self.wait_for(ShutdownPhase::Draining).await
    }

    /// Resolves once shutdown is forced.
    pub async fn forced(&mut self) {
        self.wait_for(ShutdownPhase::Forced).await
    }

    async fn wait_for(&mut self, phase: ShutdownPhase) {
        let closed = self.rx.wait_for(|current| *current >= phase).await.is_err();
        if closed {
            // Coordinator gone without reaching the phase: never resolves.
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn phases_move_forward() {
        let shutdown = Shutdown::new();
        let mut listener = shutdown.subscribe();
        assert_eq!(listener.phase(), ShutdownPhase::Running);

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), listener.draining()).await.unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(20), listener.forced()).await.is_err());

        shutdown.force();
        tokio::time::timeout(Duration::from_secs(1), listener.forced()).await.unwrap();

        shutdown.trigger();
        assert_eq!(shutdown.phase(), ShutdownPhase::Forced);
    }

    #[tokio::test]
    async fn dropped_coordinator_never_fires() {
        let shutdown = Shutdown::new();
        let mut listener = shutdown.subscribe();
        drop(shutdown);
        assert!(tokio::time::timeout(Duration::from_millis(20), listener.draining()).await.is_err());
    }
}
