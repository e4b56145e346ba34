//! Upstream connection pool.
//!
//! # Responsibilities
//! - Hand out at most `max_conn_per_target` connections (idle + leased) per target
//! - Reuse healthy idle connections (LIFO), evicting expired or stale ones lazily
//! - Queue or reject lease requests when a target is at its cap
//! - Expose per-target counters for the admin API
//!
//! # Design Decisions
//! - One `Mutex` per target guards its counters; targets live in a `DashMap`
//! - A slot is reserved before connecting, so the cap holds during connects
//! - Waiters are woken one at a time through `Notify` (FIFO)
//! - A lease dropped without `release` is discarded and its slot freed
//! - A target with no idle, leased or pending connections is dropped from the map

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::observability::metrics;
use crate::resilience::{connect_with_retry, RetryPolicy};
use crate::routing::{TargetProtocol, UpstreamTarget};

/// What `lease` does when a target is at its cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedPolicy {
    /// Wait up to `lease_wait` for a release.
    #[default]
    Wait,
    /// Return `PoolExhausted` immediately.
    FailFast,
}

impl std::str::FromStr for ExhaustedPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wait" => Ok(ExhaustedPolicy::Wait),
            "fail_fast" | "fail-fast" => Ok(ExhaustedPolicy::FailFast),
            other => Err(format!("unknown pool policy '{}', expected wait or fail_fast", other)),
        }
    }
}

/// Limits for one lease, taken from the current snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    pub max_conn_per_target: usize,
    pub exhausted_policy: ExhaustedPolicy,
    pub lease_wait: Duration,
    pub idle_ttl: Duration,
    pub connect_timeout: Duration,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            max_conn_per_target: 32,
            exhausted_policy: ExhaustedPolicy::Wait,
            lease_wait: Duration::from_secs(5),
            idle_ttl: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("connect to {target} failed: {source}")]
    Connect {
        target: UpstreamTarget,
        #[source]
        source: io::Error,
    },

    #[error("pool for {target} exhausted after {waited:?}")]
    Exhausted { target: UpstreamTarget, waited: Duration },
}

/// Counters for one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetStats {
    pub target: String,
    pub protocol: TargetProtocol,
    pub idle: usize,
    pub leased: usize,
    pub live: usize,
    pub max: usize,
}

#[derive(Debug)]
struct IdleEntry {
    stream: TcpStream,
    id: u64,
    created_at: Instant,
    parked_at: Instant,
}

impl IdleEntry {
    /// A parked connection must have nothing to read: data or EOF means
    /// the upstream moved on without us.
    fn is_stale(&self) -> bool {
        let mut byte = [0u8; 1];
        match self.stream.try_read(&mut byte) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
            _ => true,
        }
    }
}

#[derive(Debug, Default)]
struct TargetState {
    idle: Vec<IdleEntry>,
    /// Leased connections plus slots reserved for connects in flight.
    leased: usize,
    /// `lease` calls that hold this target but have not claimed a slot yet.
    pending: usize,
    max: usize,
}

impl TargetState {
    fn is_unused(&self) -> bool {
        self.idle.is_empty() && self.leased == 0 && self.pending == 0
    }
}

type Targets = DashMap<UpstreamTarget, Arc<TargetPool>>;

/// Remove `pool` from `targets` if nothing references its counters anymore.
///
/// Runs under the map shard lock, so `UpstreamPool::target_pool` cannot hand
/// the entry out while it is being removed.
fn forget_if_unused(targets: &Targets, pool: &Arc<TargetPool>) {
    let removed = targets.remove_if(&pool.target, |_, current| {
        Arc::ptr_eq(current, pool) && current.lock().is_unused()
    });
    if removed.is_some() {
        tracing::trace!(target = %pool.target, "Forgot unused upstream target");
    }
}

enum Claim {
    Idle(IdleEntry),
    Slot,
    Full,
}

#[derive(Debug)]
struct TargetPool {
    target: UpstreamTarget,
    state: Mutex<TargetState>,
    released: Notify,
}

impl TargetPool {
    fn new(target: UpstreamTarget) -> Self {
        Self {
            target,
            state: Mutex::new(TargetState::default()),
            released: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TargetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_claim(&self, limits: &PoolLimits) -> Claim {
        let mut state = self.lock();
        state.max = limits.max_conn_per_target;

        let now = Instant::now();
        let before = state.idle.len();
        state.idle.retain(|e| now.duration_since(e.parked_at) < limits.idle_ttl);
        let expired = before - state.idle.len();
        if expired > 0 {
            tracing::debug!(target = %self.target, expired, "Evicted expired idle connections");
        }

        while let Some(entry) = state.idle.pop() {
            if entry.is_stale() {
                tracing::debug!(target = %self.target, conn = entry.id, "Discarded stale idle connection");
                continue;
            }
            state.leased += 1;
            return Claim::Idle(entry);
        }

        if state.leased < limits.max_conn_per_target {
            state.leased += 1;
            Claim::Slot
        } else {
            Claim::Full
        }
    }

    fn stats(&self) -> TargetStats {
        let state = self.lock();
        TargetStats {
            target: self.target.to_string(),
            protocol: self.target.protocol,
            idle: state.idle.len(),
            leased: state.leased,
            live: state.idle.len() + state.leased,
            max: state.max,
        }
    }
}

/// Holds one counted slot of a target; frees it on drop unless parked.
#[derive(Debug)]
struct Slot {
    pool: Arc<TargetPool>,
    targets: Arc<Targets>,
    held: bool,
}

impl Slot {
    fn new(pool: Arc<TargetPool>, targets: Arc<Targets>) -> Self {
        Self {
            pool,
            targets,
            held: true,
        }
    }

    /// Move the connection to the idle list; returns false if it was discarded.
    fn park(mut self, entry: IdleEntry) -> bool {
        self.held = false;
        let parked = {
            let mut state = self.pool.lock();
            state.leased = state.leased.saturating_sub(1);
            if state.idle.len() + state.leased < state.max {
                state.idle.push(entry);
                true
            } else {
                false
            }
        };
        self.pool.released.notify_one();
        if !parked {
            forget_if_unused(&self.targets, &self.pool);
        }
        parked
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if self.held {
            {
                let mut state = self.pool.lock();
                state.leased = state.leased.saturating_sub(1);
            }
            self.pool.released.notify_one();
            forget_if_unused(&self.targets, &self.pool);
        }
    }
}

/// Counts one `lease` call against its target until it returns.
struct Pending<'a> {
    pool: &'a Arc<TargetPool>,
    targets: &'a Targets,
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        {
            let mut state = self.pool.lock();
            state.pending = state.pending.saturating_sub(1);
        }
        forget_if_unused(self.targets, self.pool);
    }
}

/// A connection leased to exactly one relay.
#[derive(Debug)]
pub struct PooledConnection {
    stream: TcpStream,
    slot: Slot,
    id: u64,
    created_at: Instant,
    reused: bool,
}

impl PooledConnection {
    pub fn stream(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn target(&self) -> &UpstreamTarget {
        &self.slot.pool.target
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// True if this connection served an earlier exchange.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Return the connection. Unhealthy or tunnel connections are closed.
    pub fn release(self, healthy: bool) {
        let PooledConnection {
            stream,
            slot,
            id,
            created_at,
            ..
        } = self;
        let target = slot.pool.target.clone();

        if !(healthy && target.is_reusable()) {
            drop(slot);
            tracing::trace!(target = %target, conn = id, "Upstream connection discarded");
            return;
        }

        let parked = slot.park(IdleEntry {
            stream,
            id,
            created_at,
            parked_at: Instant::now(),
        });
        tracing::trace!(target = %target, conn = id, parked, "Upstream connection released");
    }
}

/// Per-target pools of upstream connections.
#[derive(Debug, Default)]
pub struct UpstreamPool {
    targets: Arc<Targets>,
    retry: RetryPolicy,
    next_id: AtomicU64,
}

impl UpstreamPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(retry: RetryPolicy) -> Self {
        Self {
            retry,
            ..Self::default()
        }
    }

    /// The pool for `target`, registered as pending so it is not forgotten
    /// before the caller claims a slot.
    fn target_pool(&self, target: &UpstreamTarget) -> Arc<TargetPool> {
        let entry = self
            .targets
            .entry(target.clone())
            .or_insert_with(|| Arc::new(TargetPool::new(target.clone())));
        entry.lock().pending += 1;
        entry.clone()
    }

    /// Lease a connection to `target`, reusing an idle one when possible.
    pub async fn lease(&self, target: &UpstreamTarget, limits: &PoolLimits) -> Result<PooledConnection, PoolError> {
        let pool = self.target_pool(target);
        let _pending = Pending {
            pool: &pool,
            targets: &self.targets,
        };
        let deadline = tokio::time::Instant::now() + limits.lease_wait;

        loop {
            // Register interest before checking, so a release in between is not missed.
            let notified = pool.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match pool.try_claim(limits) {
                Claim::Idle(entry) => {
                    metrics::record_pool_lease("reused");
                    return Ok(PooledConnection {
                        stream: entry.stream,
                        slot: Slot::new(pool.clone(), self.targets.clone()),
                        id: entry.id,
                        created_at: entry.created_at,
                        reused: true,
                    });
                }
                Claim::Slot => break,
                Claim::Full => {}
            }

            let waited = match limits.exhausted_policy {
                ExhaustedPolicy::FailFast => Some(Duration::ZERO),
                ExhaustedPolicy::Wait => tokio::time::timeout_at(deadline, notified)
                    .await
                    .err()
                    .map(|_| limits.lease_wait),
            };
            if let Some(waited) = waited {
                metrics::record_pool_lease("exhausted");
                tracing::debug!(target = %target, ?waited, "Upstream pool exhausted");
                return Err(PoolError::Exhausted {
                    target: target.clone(),
                    waited,
                });
            }
        }

        // The slot is ours; it is released again if the connect fails.
        let slot = Slot::new(pool.clone(), self.targets.clone());
        let stream = match connect_with_retry(target.host(), target.port(), limits.connect_timeout, &self.retry).await {
            Ok(stream) => stream,
            Err(source) => {
                metrics::record_pool_lease("connect_error");
                return Err(PoolError::Connect {
                    target: target.clone(),
                    source,
                });
            }
        };

        metrics::record_pool_lease("new");
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(target = %target, conn = id, "Opened upstream connection");
        Ok(PooledConnection {
            stream,
            slot,
            id,
            created_at: Instant::now(),
            reused: false,
        })
    }

    /// Counters for every target currently in use or holding idle connections.
    pub fn stats(&self) -> Vec<TargetStats> {
        let mut stats: Vec<_> = self.targets.iter().map(|entry| entry.value().stats()).collect();
        stats.sort_by(|a, b| a.target.cmp(&b.target));
        stats
    }

    /// Counters for one target, if it is currently tracked.
    pub fn target_stats(&self, target: &UpstreamTarget) -> Option<TargetStats> {
        self.targets.get(target).map(|entry| entry.value().stats())
    }
}

impl fmt::Display for ExhaustedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExhaustedPolicy::Wait => "wait",
            ExhaustedPolicy::FailFast => "fail_fast",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::TargetAddr;
    use tokio::net::TcpListener;

    /// Accepts connections and keeps them open.
    async fn holding_backend() -> (u16, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        (port, handle)
    }

    fn target(port: u16) -> UpstreamTarget {
        UpstreamTarget::new(
            TargetAddr {
                host: "127.0.0.1".into(),
                port,
            },
            TargetProtocol::Http,
        )
    }

    fn limits(max: usize, policy: ExhaustedPolicy) -> PoolLimits {
        PoolLimits {
            max_conn_per_target: max,
            exhausted_policy: policy,
            lease_wait: Duration::from_millis(100),
            ..PoolLimits::default()
        }
    }

    #[tokio::test]
    async fn healthy_release_is_reused() {
        let (port, _backend) = holding_backend().await;
        let pool = UpstreamPool::new();
        let target = target(port);
        let limits = limits(2, ExhaustedPolicy::Wait);

        let conn = pool.lease(&target, &limits).await.unwrap();
        assert!(!conn.is_reused());
        let id = conn.id();
        conn.release(true);

        let stats = pool.target_stats(&target).unwrap();
        assert_eq!((stats.idle, stats.leased), (1, 0));

        let conn = pool.lease(&target, &limits).await.unwrap();
        assert!(conn.is_reused());
        assert_eq!(conn.id(), id);
    }

    #[tokio::test]
    async fn unhealthy_release_is_discarded() {
        let (port, _backend) = holding_backend().await;
        let pool = UpstreamPool::new();
        let target = target(port);
        let limits = limits(2, ExhaustedPolicy::Wait);

        let conn = pool.lease(&target, &limits).await.unwrap();
        conn.release(false);
        assert!(pool.target_stats(&target).is_none());

        let conn = pool.lease(&target, &limits).await.unwrap();
        assert!(!conn.is_reused());
    }

    #[tokio::test]
    async fn fail_fast_at_cap() {
        let (port, _backend) = holding_backend().await;
        let pool = UpstreamPool::new();
        let target = target(port);
        let limits = limits(1, ExhaustedPolicy::FailFast);

        let _held = pool.lease(&target, &limits).await.unwrap();
        let err = pool.lease(&target, &limits).await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { waited, .. } if waited == Duration::ZERO));
    }

    #[tokio::test]
    async fn wait_times_out_at_cap() {
        let (port, _backend) = holding_backend().await;
        let pool = UpstreamPool::new();
        let target = target(port);
        let limits = limits(1, ExhaustedPolicy::Wait);

        let _held = pool.lease(&target, &limits).await.unwrap();
        let started = Instant::now();
        let err = pool.lease(&target, &limits).await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { .. }));
        assert!(started.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn waiter_gets_released_connection() {
        let (port, _backend) = holding_backend().await;
        let pool = Arc::new(UpstreamPool::new());
        let target = target(port);
        let mut limits = limits(1, ExhaustedPolicy::Wait);
        limits.lease_wait = Duration::from_secs(2);

        let first = pool.lease(&target, &limits).await.unwrap();
        let first_id = first.id();

        let waiter = {
            let pool = pool.clone();
            let target = target.clone();
            tokio::spawn(async move { pool.lease(&target, &limits).await.map(|c| c.id()) })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        first.release(true);

        assert_eq!(waiter.await.unwrap().unwrap(), first_id);
    }

    #[tokio::test]
    async fn dropped_lease_frees_slot() {
        let (port, _backend) = holding_backend().await;
        let pool = UpstreamPool::new();
        let target = target(port);
        let limits = limits(1, ExhaustedPolicy::FailFast);

        drop(pool.lease(&target, &limits).await.unwrap());
        let conn = pool.lease(&target, &limits).await.unwrap();
        assert!(!conn.is_reused());
        assert_eq!(pool.target_stats(&target).unwrap().leased, 1);
    }

    #[tokio::test]
    async fn expired_idle_is_evicted() {
        let (port, _backend) = holding_backend().await;
        let pool = UpstreamPool::new();
        let target = target(port);
        let mut limits = limits(2, ExhaustedPolicy::Wait);
        limits.idle_ttl = Duration::from_millis(20);

        pool.lease(&target, &limits).await.unwrap().release(true);
        tokio::time::sleep(Duration::from_millis(40)).await;

        let conn = pool.lease(&target, &limits).await.unwrap();
        assert!(!conn.is_reused());
        assert_eq!(pool.target_stats(&target).unwrap().idle, 0);
    }

    #[tokio::test]
    async fn closed_idle_is_discarded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            // First connection is closed right away, later ones are held.
            let mut held = Vec::new();
            let mut first = true;
            while let Ok((stream, _)) = listener.accept().await {
                if first {
                    first = false;
                    drop(stream);
                } else {
                    held.push(stream);
                }
            }
        });

        let pool = UpstreamPool::new();
        let target = target(port);
        let limits = limits(2, ExhaustedPolicy::Wait);

        pool.lease(&target, &limits).await.unwrap().release(true);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let conn = pool.lease(&target, &limits).await.unwrap();
        assert!(!conn.is_reused());
    }

    #[tokio::test]
    async fn connect_error_frees_slot() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let pool = UpstreamPool::with_retry(RetryPolicy {
            retries: 1,
            base_delay_ms: 1,
            max_delay_ms: 2,
        });
        let target = target(port);
        let limits = limits(1, ExhaustedPolicy::FailFast);

        let err = pool.lease(&target, &limits).await.unwrap_err();
        assert!(matches!(err, PoolError::Connect { .. }));
        assert!(pool.target_stats(&target).is_none());
    }

    #[tokio::test]
    async fn tunnel_connections_are_never_parked() {
        let (port, _backend) = holding_backend().await;
        let pool = UpstreamPool::new();
        let mut target = target(port);
        target.protocol = TargetProtocol::Tunnel;
        let limits = limits(2, ExhaustedPolicy::Wait);

        pool.lease(&target, &limits).await.unwrap().release(true);
        assert!(pool.target_stats(&target).is_none());
    }

    #[tokio::test]
    async fn unused_targets_are_forgotten() {
        let pool = UpstreamPool::new();
        let limits = limits(2, ExhaustedPolicy::Wait);

        let mut backends = Vec::new();
        for _ in 0..50 {
            let (port, backend) = holding_backend().await;
            backends.push(backend);
            let mut tunnel = target(port);
            tunnel.protocol = TargetProtocol::Tunnel;
            pool.lease(&tunnel, &limits).await.unwrap().release(true);
            pool.lease(&target(port), &limits).await.unwrap().release(false);
        }
        assert!(pool.stats().is_empty());

        // An idle connection keeps its target.
        let (port, _backend) = holding_backend().await;
        let kept = target(port);
        pool.lease(&kept, &limits).await.unwrap().release(true);
        assert_eq!(pool.stats().len(), 1);
        assert_eq!(pool.target_stats(&kept).unwrap().idle, 1);
    }

    #[tokio::test]
    async fn waiting_lease_keeps_target_registered() {
        let (port, _backend) = holding_backend().await;
        let pool = Arc::new(UpstreamPool::new());
        let target = target(port);
        let mut limits = limits(1, ExhaustedPolicy::Wait);
        limits.lease_wait = Duration::from_secs(2);

        let first = pool.lease(&target, &limits).await.unwrap();
        let waiter = {
            let pool = pool.clone();
            let target = target.clone();
            tokio::spawn(async move { pool.lease(&target, &limits).await.map(|c| c.id()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.target_stats(&target).unwrap().leased, 1);

        // Dropping the only lease must not forget a target someone waits on.
        drop(first);
        assert!(waiter.await.unwrap().is_ok());
        assert!(pool.target_stats(&target).is_none());
    }
}
