use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use stowage_types::{Result, StowageError};

use crate::client::LedgerClient;
use crate::retry::{retry, RetryPolicy};

/// Factory that mints a fresh client handle on demand, up to the pool max.
pub type HandleFactory = Arc<dyn Fn() -> Arc<dyn LedgerClient> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Read,
    Write,
}

impl PoolKind {
    fn label(self) -> &'static str {
        match self {
            PoolKind::Read => "read",
            PoolKind::Write => "write",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub read_max: usize,
    pub write_max: usize,
    /// Handles idle longer than this are evicted by the health loop.
    pub idle_timeout: Duration,
    /// Health loop tick interval.
    pub health_interval: Duration,
    /// Default deadline for `acquire` when the caller has no tighter one.
    pub acquire_timeout: Duration,
    /// Fallback block rate when the timing probe fails.
    pub blocks_per_day: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            read_max: 8,
            write_max: 4,
            idle_timeout: Duration::from_millis(300_000),
            health_interval: Duration::from_millis(30_000),
            acquire_timeout: Duration::from_millis(5_000),
            blocks_per_day: 2880,
        }
    }
}

struct IdleHandle {
    client: Arc<dyn LedgerClient>,
    since: Instant,
}

/// Per-kind pool state. Occupancy invariant: `in_use + idle.len() <= max`.
struct Shard {
    idle: Vec<IdleHandle>,
    in_use: usize,
    waiters: VecDeque<oneshot::Sender<Arc<dyn LedgerClient>>>,
    max: usize,
}

impl Shard {
    fn new(max: usize) -> Self {
        Self {
            idle: Vec::new(),
            in_use: 0,
            waiters: VecDeque::new(),
            max,
        }
    }
}

/// Snapshot of one pool's occupancy, surfaced by `/health`.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
    pub waiting: usize,
    pub max: usize,
}

struct PoolState {
    read: Mutex<Shard>,
    write: Mutex<Shard>,
    factory: HandleFactory,
    shutdown: AtomicBool,
    /// Cached seconds-per-block from the ledger timing probe.
    block_seconds: RwLock<f64>,
    config: PoolConfig,
}

impl PoolState {
    fn shard(&self, kind: PoolKind) -> &Mutex<Shard> {
        match kind {
            PoolKind::Read => &self.read,
            PoolKind::Write => &self.write,
        }
    }

    fn lock_shard(&self, kind: PoolKind) -> MutexGuard<'_, Shard> {
        match self.shard(kind).lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn release(&self, kind: PoolKind, client: Arc<dyn LedgerClient>) {
        let mut shard = self.lock_shard(kind);

        if self.shutdown.load(Relaxed) {
            shard.in_use = shard.in_use.saturating_sub(1);
            return;
        }

        // Hand the handle to the oldest live waiter; occupancy is unchanged
        // because the lease transfers.
        let mut client = client;
        while let Some(waiter) = shard.waiters.pop_front() {
            match waiter.send(client) {
                Ok(()) => return,
                // Waiter timed out and dropped its receiver.
                Err(returned) => client = returned,
            }
        }

        shard.in_use = shard.in_use.saturating_sub(1);
        shard.idle.push(IdleHandle {
            client,
            since: Instant::now(),
        });
    }
}

/// A leased handle. Dropping it returns the handle to the pool, so every
/// exit path of an operation releases.
pub struct Lease {
    client: Option<Arc<dyn LedgerClient>>,
    state: Arc<PoolState>,
    kind: PoolKind,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("client", &self.client.is_some())
            .field("kind", &self.kind)
            .finish()
    }
}

impl Lease {
    pub fn client(&self) -> &Arc<dyn LedgerClient> {
        self.client.as_ref().expect("lease not yet released")
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.state.release(self.kind, client);
        }
    }
}

/// Bounded pools of read and write ledger handles with FIFO waiters, idle
/// eviction, and a cached block-timing probe.
pub struct LedgerPool {
    state: Arc<PoolState>,
}

impl LedgerPool {
    /// Build the pool and probe block timing once. The probe failing is not
    /// fatal: the configured `blocks_per_day` fallback is used until the
    /// health loop refreshes it.
    pub async fn new(config: PoolConfig, factory: HandleFactory) -> Arc<Self> {
        let fallback = 86_400.0 / config.blocks_per_day as f64;
        let state = Arc::new(PoolState {
            read: Mutex::new(Shard::new(config.read_max.max(1))),
            write: Mutex::new(Shard::new(config.write_max.max(1))),
            factory,
            shutdown: AtomicBool::new(false),
            block_seconds: RwLock::new(fallback),
            config,
        });

        let pool = Arc::new(Self { state });
        pool.refresh_block_timing().await;
        pool.clone().spawn_health_loop();
        pool
    }

    /// Acquire a handle, waiting FIFO behind other acquirers when the pool
    /// is at capacity. `deadline` elapsing while waiting yields `TIMEOUT`.
    pub async fn acquire(&self, kind: PoolKind, deadline: Duration) -> Result<Lease> {
        let rx = {
            let mut shard = self.state.lock_shard(kind);

            if self.state.shutdown.load(Relaxed) {
                return Err(StowageError::ShuttingDown);
            }

            if let Some(idle) = shard.idle.pop() {
                shard.in_use += 1;
                return Ok(self.lease(kind, idle.client));
            }

            if shard.in_use + shard.idle.len() < shard.max {
                let client = (self.state.factory)();
                if kind == PoolKind::Write && !client.has_write_credentials() {
                    return Err(StowageError::Config(
                        "write pool requires a credentialed ledger client".into(),
                    ));
                }
                shard.in_use += 1;
                return Ok(self.lease(kind, client));
            }

            let (tx, rx) = oneshot::channel();
            shard.waiters.push_back(tx);
            rx
        };

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(client)) => Ok(self.lease(kind, client)),
            // Sender dropped: shutdown drained the waiter queue.
            Ok(Err(_)) => Err(StowageError::ShuttingDown),
            Err(_) => Err(StowageError::Timeout(format!(
                "waiting for a {} ledger handle",
                kind.label()
            ))),
        }
    }

    fn lease(&self, kind: PoolKind, client: Arc<dyn LedgerClient>) -> Lease {
        Lease {
            client: Some(client),
            state: self.state.clone(),
            kind,
        }
    }

    /// Acquire a read handle and run `op` under the single-call retry policy.
    pub async fn with_read<T, F, Fut>(&self, op_name: &'static str, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn LedgerClient>) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.with_retries(PoolKind::Read, op_name, RetryPolicy::single(), op)
            .await
    }

    /// Acquire a write handle and run `op` under the given retry policy.
    pub async fn with_write<T, F, Fut>(
        &self,
        op_name: &'static str,
        policy: RetryPolicy,
        op: F,
    ) -> Result<T>
    where
        F: Fn(Arc<dyn LedgerClient>) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.with_retries(PoolKind::Write, op_name, policy, op).await
    }

    async fn with_retries<T, F, Fut>(
        &self,
        kind: PoolKind,
        op_name: &'static str,
        policy: RetryPolicy,
        op: F,
    ) -> Result<T>
    where
        F: Fn(Arc<dyn LedgerClient>) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let lease = self.acquire(kind, self.state.config.acquire_timeout).await?;
        let result = retry(policy, op_name, || op(lease.client().clone())).await;
        drop(lease);
        result
    }

    /// Current chain head via a pooled read handle.
    pub async fn current_block(&self) -> Result<u64> {
        self.with_read("current_block", |c| async move { c.current_block().await })
            .await
    }

    /// Target block for an expiry `btl_days` out, using the cached
    /// seconds-per-block.
    pub async fn expiration_block(&self, btl_days: u32) -> Result<u64> {
        let current = self.current_block().await?;
        let secs = self.cached_block_seconds();
        let blocks = (f64::from(btl_days) * 86_400.0 / secs).floor() as u64;
        Ok(current + blocks.max(1))
    }

    pub fn cached_block_seconds(&self) -> f64 {
        match self.state.block_seconds.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Probe the ledger for its block duration and cache it.
    pub async fn refresh_block_timing(&self) {
        let probed = self
            .with_read("block_seconds", |c| async move { c.block_seconds().await })
            .await;
        match probed {
            Ok(secs) if secs.is_finite() && secs > 0.0 => {
                if let Ok(mut guard) = self.state.block_seconds.write() {
                    *guard = secs;
                }
                debug!(block_seconds = secs, "refreshed ledger block timing");
            }
            Ok(secs) => warn!(block_seconds = secs, "ignoring nonsense block timing probe"),
            Err(e) => warn!("block timing probe failed, keeping cached value: {e}"),
        }
    }

    /// Liveness of the read path, used by `/health`.
    pub async fn ping(&self) -> Result<()> {
        self.with_read("ping", |c| async move { c.ping().await }).await
    }

    pub fn stats(&self, kind: PoolKind) -> PoolStats {
        let shard = self.state.lock_shard(kind);
        PoolStats {
            idle: shard.idle.len(),
            in_use: shard.in_use,
            waiting: shard.waiters.len(),
            max: shard.max,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.shutdown.load(Relaxed)
    }

    /// Refuse new acquisitions and wake every waiter with the shutdown
    /// sentinel. In-flight leases finish normally.
    pub fn shutdown(&self) {
        self.state.shutdown.store(true, Relaxed);
        for kind in [PoolKind::Read, PoolKind::Write] {
            let mut shard = self.state.lock_shard(kind);
            // Dropping the senders resolves every receiver with RecvError.
            shard.waiters.clear();
            shard.idle.clear();
        }
        debug!("ledger pool shut down");
    }

    fn spawn_health_loop(self: Arc<Self>) {
        let pool = Arc::downgrade(&self);
        let interval = self.state.config.health_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else { return };
                if pool.is_shutting_down() {
                    return;
                }
                pool.evict_idle();
                pool.refresh_block_timing().await;
            }
        });
    }

    /// Drop handles idle beyond the configured timeout. New ones are created
    /// on demand by `acquire`, so shrinking is safe.
    fn evict_idle(&self) {
        let timeout = self.state.config.idle_timeout;
        for kind in [PoolKind::Read, PoolKind::Write] {
            let mut shard = self.state.lock_shard(kind);
            let before = shard.idle.len();
            shard.idle.retain(|h| h.since.elapsed() < timeout);
            let evicted = before - shard.idle.len();
            if evicted > 0 {
                debug!(pool = kind.label(), evicted, "evicted idle ledger handles");
            }
        }
    }
}
