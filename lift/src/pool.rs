//! Bounded resource pooling
//!
//! Pools reuse expensive resources (connections, clients) across warm
//! invocations. A single mutex guards the free list and active count;
//! waiter hand-off goes through a notify primitive; statistics are atomic.
//! Resources expire by age and idle time, are health-checked on demand, and
//! are destroyed rather than returned once broken.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::context::Context;
use crate::error::{ErrorCode, LiftError, Result};

/// A pooled resource
#[async_trait]
pub trait PoolResource: Send + Sync + 'static {
    /// Whether the resource is still usable; failing resources are
    /// destroyed, never returned to the pool
    async fn health_check(&self) -> bool {
        true
    }
}

/// Creates pool resources
#[async_trait]
pub trait ResourceFactory: Send + Sync + 'static {
    /// Resource type produced
    type Resource: PoolResource;

    /// Create a fresh resource
    async fn create(&self) -> Result<Self::Resource>;
}

/// Configuration for [`Pool`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Idle resources kept ready by [`Pool::warm`]
    #[serde(default)]
    pub min_idle: usize,
    /// Idle resources retained on return; excess is destroyed
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,
    /// Concurrent in-use resources
    #[serde(default = "default_max_active")]
    pub max_active: usize,
    /// Seconds a resource may sit idle before expiring (0 = no limit)
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Seconds a resource may live overall (0 = no limit)
    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: u64,
    /// Suggested interval for host-driven health sweeps
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    /// Whether [`Pool::warm`] runs at startup
    #[serde(default)]
    pub pre_warm: bool,
}

fn default_max_idle() -> usize {
    10
}
fn default_max_active() -> usize {
    20
}
fn default_idle_timeout_secs() -> u64 {
    300
}
fn default_max_lifetime_secs() -> u64 {
    3_600
}
fn default_health_check_interval_secs() -> u64 {
    30
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_idle: 0,
            max_idle: default_max_idle(),
            max_active: default_max_active(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_lifetime_secs: default_max_lifetime_secs(),
            health_check_interval_secs: default_health_check_interval_secs(),
            pre_warm: false,
        }
    }
}

impl PoolConfig {
    /// Default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the in-use bound
    pub fn with_max_active(mut self, max: usize) -> Self {
        self.max_active = max.max(1);
        self
    }

    /// Set the idle retention bound
    pub fn with_max_idle(mut self, max: usize) -> Self {
        self.max_idle = max;
        self
    }

    /// Set the warm target
    pub fn with_min_idle(mut self, min: usize) -> Self {
        self.min_idle = min;
        self
    }

    /// Set the idle expiry
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_secs = timeout.as_secs();
        self
    }

    /// Set the lifetime expiry
    pub fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime_secs = lifetime.as_secs();
        self
    }

    /// Warm the pool at startup
    pub fn with_pre_warm(mut self, pre_warm: bool) -> Self {
        self.pre_warm = pre_warm;
        self
    }
}

/// Point-in-time pool statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    /// Resources currently in use
    pub active: usize,
    /// Resources currently idle
    pub idle: usize,
    /// Total resources ever created
    pub created: u64,
    /// Total resources ever destroyed
    pub destroyed: u64,
    /// Total milliseconds spent waiting in `get`
    pub wait_time_total_ms: u64,
    /// Creation failures observed
    pub errors: u64,
}

struct IdleEntry<R> {
    resource: R,
    created_at: Instant,
    idle_since: Instant,
}

struct PoolState<R> {
    idle: VecDeque<IdleEntry<R>>,
    active: usize,
}

struct PoolInner<F: ResourceFactory> {
    config: PoolConfig,
    factory: F,
    state: Mutex<PoolState<F::Resource>>,
    returned: Notify,
    closed: AtomicBool,
    created: AtomicU64,
    destroyed: AtomicU64,
    errors: AtomicU64,
    wait_micros: AtomicU64,
}

impl<F: ResourceFactory> PoolInner<F> {
    fn expired(&self, entry: &IdleEntry<F::Resource>) -> bool {
        let lifetime = self.config.max_lifetime_secs;
        if lifetime > 0 && entry.created_at.elapsed() >= Duration::from_secs(lifetime) {
            return true;
        }
        let idle = self.config.idle_timeout_secs;
        idle > 0 && entry.idle_since.elapsed() >= Duration::from_secs(idle)
    }

    fn destroy(&self, entry: IdleEntry<F::Resource>) {
        drop(entry);
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Acquisitions that cannot use the platform deadline still unblock
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Bounded pool of reusable resources
pub struct Pool<F: ResourceFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ResourceFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<F: ResourceFactory> Pool<F> {
    /// Pool over a factory
    pub fn new(config: PoolConfig, factory: F) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                factory,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    active: 0,
                }),
                returned: Notify::new(),
                closed: AtomicBool::new(false),
                created: AtomicU64::new(0),
                destroyed: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                wait_micros: AtomicU64::new(0),
            }),
        }
    }

    /// Acquire a resource
    ///
    /// Returns an idle resource when a valid one exists, creates a fresh one
    /// while under `max_active`, and otherwise waits for a return, bounded
    /// by the invocation deadline. An expired wait fails with
    /// `RESOURCE_TIMEOUT`.
    pub async fn get(&self, ctx: &Context) -> Result<PoolGuard<F>> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(LiftError::internal("pool is closed"));
        }

        let wait_started = Instant::now();
        let deadline = ctx
            .deadline()
            .unwrap_or_else(|| Instant::now() + DEFAULT_ACQUIRE_TIMEOUT);

        loop {
            let mut create_slot = false;
            {
                let mut state = inner.state.lock().expect("pool lock");
                while let Some(entry) = state.idle.pop_front() {
                    if inner.expired(&entry) {
                        inner.destroy(entry);
                        continue;
                    }
                    state.active += 1;
                    drop(state);
                    inner
                        .wait_micros
                        .fetch_add(wait_started.elapsed().as_micros() as u64, Ordering::Relaxed);
                    return Ok(PoolGuard {
                        inner: inner.clone(),
                        entry: Some(entry),
                        discard: false,
                    });
                }
                if state.active < inner.config.max_active {
                    state.active += 1;
                    create_slot = true;
                }
            }

            if create_slot {
                match inner.factory.create().await {
                    Ok(resource) => {
                        inner.created.fetch_add(1, Ordering::Relaxed);
                        inner
                            .wait_micros
                            .fetch_add(wait_started.elapsed().as_micros() as u64, Ordering::Relaxed);
                        return Ok(PoolGuard {
                            inner: inner.clone(),
                            entry: Some(IdleEntry {
                                resource,
                                created_at: Instant::now(),
                                idle_since: Instant::now(),
                            }),
                            discard: false,
                        });
                    }
                    Err(e) => {
                        inner.errors.fetch_add(1, Ordering::Relaxed);
                        let mut state = inner.state.lock().expect("pool lock");
                        state.active -= 1;
                        drop(state);
                        inner.returned.notify_one();
                        return Err(e);
                    }
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(LiftError::new(
                    ErrorCode::ResourceTimeout,
                    "timed out waiting for a pooled resource",
                ));
            }
            if tokio::time::timeout(remaining, inner.returned.notified())
                .await
                .is_err()
            {
                return Err(LiftError::new(
                    ErrorCode::ResourceTimeout,
                    "timed out waiting for a pooled resource",
                ));
            }
        }
    }

    /// Create idle resources until `min_idle` is met
    ///
    /// Called at startup when `pre_warm` is set; safe to call again later.
    pub async fn warm(&self) -> Result<()> {
        let inner = &self.inner;
        loop {
            {
                let mut state = inner.state.lock().expect("pool lock");
                let total = state.active + state.idle.len();
                if state.idle.len() >= inner.config.min_idle
                    || state.idle.len() >= inner.config.max_idle
                    || total >= inner.config.max_active + inner.config.max_idle
                {
                    return Ok(());
                }
                state.active += 1;
            }

            match inner.factory.create().await {
                Ok(resource) => {
                    inner.created.fetch_add(1, Ordering::Relaxed);
                    let mut state = inner.state.lock().expect("pool lock");
                    state.active -= 1;
                    state.idle.push_back(IdleEntry {
                        resource,
                        created_at: Instant::now(),
                        idle_since: Instant::now(),
                    });
                }
                Err(e) => {
                    inner.errors.fetch_add(1, Ordering::Relaxed);
                    let mut state = inner.state.lock().expect("pool lock");
                    state.active -= 1;
                    return Err(e);
                }
            }
        }
    }

    /// Run the resource health hook over the currently idle resources
    ///
    /// Broken resources are destroyed; healthy ones return to the idle list.
    pub async fn health_check(&self) -> PoolStats {
        let inner = &self.inner;
        let mut candidates = Vec::new();
        {
            let mut state = inner.state.lock().expect("pool lock");
            while let Some(entry) = state.idle.pop_front() {
                candidates.push(entry);
            }
        }

        for entry in candidates {
            if inner.expired(&entry) || !entry.resource.health_check().await {
                inner.destroy(entry);
                continue;
            }
            let mut state = inner.state.lock().expect("pool lock");
            state.idle.push_back(entry);
        }

        self.stats()
    }

    /// Block new acquisitions, destroy idle resources, and wait (bounded)
    /// for in-use resources to come back
    pub async fn close(&self, grace: Duration) {
        let inner = &self.inner;
        inner.closed.store(true, Ordering::Release);

        {
            let mut state = inner.state.lock().expect("pool lock");
            while let Some(entry) = state.idle.pop_front() {
                inner.destroy(entry);
            }
        }

        let deadline = Instant::now() + grace;
        loop {
            {
                let state = inner.state.lock().expect("pool lock");
                if state.active == 0 {
                    return;
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let state = inner.state.lock().expect("pool lock");
                tracing::warn!(
                    outstanding = state.active,
                    "pool closed with resources still in use"
                );
                return;
            }
            let _ = tokio::time::timeout(remaining, inner.returned.notified()).await;
        }
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Current statistics
    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        let (active, idle) = {
            let state = inner.state.lock().expect("pool lock");
            (state.active, state.idle.len())
        };
        PoolStats {
            active,
            idle,
            created: inner.created.load(Ordering::Relaxed),
            destroyed: inner.destroyed.load(Ordering::Relaxed),
            wait_time_total_ms: inner.wait_micros.load(Ordering::Relaxed) / 1_000,
            errors: inner.errors.load(Ordering::Relaxed),
        }
    }
}

/// In-use resource; returns to its pool on drop
///
/// Call [`PoolGuard::discard`] instead of dropping when the resource is
/// known broken.
pub struct PoolGuard<F: ResourceFactory> {
    inner: Arc<PoolInner<F>>,
    entry: Option<IdleEntry<F::Resource>>,
    discard: bool,
}

impl<F: ResourceFactory> PoolGuard<F> {
    /// Destroy the resource on return instead of pooling it
    pub fn discard(mut self) {
        self.discard = true;
    }
}

impl<F: ResourceFactory> std::fmt::Debug for PoolGuard<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGuard")
            .field("discard", &self.discard)
            .finish()
    }
}

impl<F: ResourceFactory> Deref for PoolGuard<F> {
    type Target = F::Resource;

    fn deref(&self) -> &Self::Target {
        &self.entry.as_ref().expect("guard resource").resource
    }
}

impl<F: ResourceFactory> DerefMut for PoolGuard<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.entry.as_mut().expect("guard resource").resource
    }
}

impl<F: ResourceFactory> Drop for PoolGuard<F> {
    fn drop(&mut self) {
        let Some(mut entry) = self.entry.take() else {
            return;
        };
        entry.idle_since = Instant::now();

        let closed = self.inner.closed.load(Ordering::Acquire);
        let mut state = self.inner.state.lock().expect("pool lock");
        state.active -= 1;

        if self.discard || closed || self.inner.expired(&entry) {
            drop(state);
            self.inner.destroy(entry);
        } else if state.idle.len() < self.inner.config.max_idle {
            state.idle.push_back(entry);
            drop(state);
        } else {
            drop(state);
            self.inner.destroy(entry);
        }
        self.inner.returned.notify_one();
    }
}

/// Plugs a pool into the health aggregator
///
/// Reports degraded at full utilization and surfaces the pool counters as
/// structured detail. The underlying resource health hook runs as part of
/// the check, so broken idle resources are culled on each probe.
pub struct PoolHealthChecker<F: ResourceFactory> {
    pool: Pool<F>,
}

impl<F: ResourceFactory> PoolHealthChecker<F> {
    /// Checker over a pool handle
    pub fn new(pool: Pool<F>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl<F: ResourceFactory> crate::health::HealthChecker for PoolHealthChecker<F> {
    async fn check(&self) -> crate::health::HealthStatus {
        let stats = self.pool.health_check().await;
        let max_active = self.pool.config().max_active;
        let utilization = if max_active > 0 {
            (stats.active as f64 / max_active as f64 * 100.0).min(100.0)
        } else {
            0.0
        };

        let status = if stats.active >= max_active {
            crate::health::HealthStatus::degraded("pool at capacity")
        } else {
            crate::health::HealthStatus::healthy("pool available")
        };

        status
            .with_detail("active", stats.active)
            .with_detail("idle", stats.idle)
            .with_detail("created", stats.created)
            .with_detail("destroyed", stats.destroyed)
            .with_detail("errors", stats.errors)
            .with_detail("utilizationPercent", (utilization * 10.0).round() / 10.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Request, TriggerType};
    use std::sync::atomic::AtomicU32;

    struct Conn {
        id: u32,
        healthy: AtomicBool,
    }

    #[async_trait]
    impl PoolResource for Conn {
        async fn health_check(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    struct ConnFactory {
        counter: AtomicU32,
        fail: AtomicBool,
    }

    impl ConnFactory {
        fn new() -> Self {
            Self {
                counter: AtomicU32::new(0),
                fail: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl ResourceFactory for ConnFactory {
        type Resource = Conn;

        async fn create(&self) -> Result<Conn> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(LiftError::internal("backend down"));
            }
            Ok(Conn {
                id: self.counter.fetch_add(1, Ordering::SeqCst),
                healthy: AtomicBool::new(true),
            })
        }
    }

    fn ctx_with_deadline(deadline: Duration) -> Context {
        Context::new(
            Request::new("GET", "/x", TriggerType::HttpV2),
            Some(Instant::now() + deadline),
        )
    }

    fn ctx() -> Context {
        Context::new(Request::new("GET", "/x", TriggerType::HttpV2), None)
    }

    #[tokio::test]
    async fn test_reuses_idle_resource() {
        let pool = Pool::new(PoolConfig::new(), ConnFactory::new());
        let first_id = {
            let guard = pool.get(&ctx()).await.unwrap();
            guard.id
        };
        let guard = pool.get(&ctx()).await.unwrap();
        assert_eq!(guard.id, first_id);
        assert_eq!(pool.stats().created, 1);
    }

    #[tokio::test]
    async fn test_exhaustion_waits_then_acquires() {
        let pool = Pool::new(PoolConfig::new().with_max_active(2), ConnFactory::new());
        let g1 = pool.get(&ctx()).await.unwrap();
        let g2 = pool.get(&ctx()).await.unwrap();

        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move {
            pool2.get(&ctx_with_deadline(Duration::from_secs(2))).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.stats().active, 2);

        drop(g1);
        let g3 = waiter.await.unwrap().unwrap();
        drop(g2);
        drop(g3);
        assert_eq!(pool.stats().created, 2);
    }

    #[tokio::test]
    async fn test_exhaustion_times_out_with_resource_timeout() {
        let pool = Pool::new(PoolConfig::new().with_max_active(1), ConnFactory::new());
        let _held = pool.get(&ctx()).await.unwrap();

        let err = pool
            .get(&ctx_with_deadline(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert_eq!(err.code.as_str(), "RESOURCE_TIMEOUT");
        assert_eq!(err.status.as_u16(), 504);
    }

    #[tokio::test]
    async fn test_active_never_exceeds_max() {
        let pool = Pool::new(
            PoolConfig::new().with_max_active(3).with_max_idle(3),
            ConnFactory::new(),
        );

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                let guard = pool.get(&ctx_with_deadline(Duration::from_secs(5))).await?;
                let stats = pool.stats();
                assert!(stats.active <= 3, "active {} exceeded bound", stats.active);
                tokio::time::sleep(Duration::from_millis(2)).await;
                drop(guard);
                Ok::<(), LiftError>(())
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        let stats = pool.stats();
        assert!(stats.idle <= 3);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn test_discard_destroys() {
        let pool = Pool::new(PoolConfig::new(), ConnFactory::new());
        let guard = pool.get(&ctx()).await.unwrap();
        guard.discard();

        let stats = pool.stats();
        assert_eq!(stats.destroyed, 1);
        assert_eq!(stats.idle, 0);

        // Next acquisition creates a fresh resource
        let guard = pool.get(&ctx()).await.unwrap();
        assert_eq!(guard.id, 1);
    }

    #[tokio::test]
    async fn test_idle_expiry() {
        let pool = Pool::new(
            PoolConfig {
                idle_timeout_secs: 0,
                max_lifetime_secs: 0,
                ..PoolConfig::default()
            },
            ConnFactory::new(),
        );
        drop(pool.get(&ctx()).await.unwrap());
        assert_eq!(pool.stats().idle, 1, "zeroed timeouts disable expiry");

        let pool = Pool::new(
            PoolConfig::new()
                .with_idle_timeout(Duration::from_secs(1))
                .with_max_lifetime(Duration::ZERO),
            ConnFactory::new(),
        );
        drop(pool.get(&ctx()).await.unwrap());
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        let guard = pool.get(&ctx()).await.unwrap();
        assert_eq!(guard.id, 1, "expired idle resource must be replaced");
        assert_eq!(pool.stats().destroyed, 1);
    }

    #[tokio::test]
    async fn test_factory_failure_frees_slot() {
        let factory = ConnFactory::new();
        factory.fail.store(true, Ordering::SeqCst);
        let pool = Pool::new(PoolConfig::new().with_max_active(1), factory);

        assert!(pool.get(&ctx()).await.is_err());
        assert_eq!(pool.stats().errors, 1);
        assert_eq!(pool.stats().active, 0, "failed create must release its slot");
    }

    #[tokio::test]
    async fn test_health_check_destroys_broken() {
        let pool = Pool::new(PoolConfig::new(), ConnFactory::new());
        {
            let guard = pool.get(&ctx()).await.unwrap();
            guard.healthy.store(false, Ordering::SeqCst);
        }
        assert_eq!(pool.stats().idle, 1);

        let stats = pool.health_check().await;
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.destroyed, 1);
    }

    #[tokio::test]
    async fn test_warm_fills_min_idle() {
        let pool = Pool::new(
            PoolConfig::new().with_min_idle(3).with_pre_warm(true),
            ConnFactory::new(),
        );
        pool.warm().await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.idle, 3);
        assert_eq!(stats.created, 3);
    }

    #[tokio::test]
    async fn test_health_checker_surface() {
        use crate::health::{Health, HealthChecker};

        let pool = Pool::new(PoolConfig::new().with_max_active(2), ConnFactory::new());
        drop(pool.get(&ctx()).await.unwrap());

        let checker = PoolHealthChecker::new(pool.clone());
        let status = checker.check().await;
        assert_eq!(status.status, Health::Healthy);
        assert_eq!(status.details["idle"], 1);
        assert_eq!(status.details["active"], 0);

        let _g1 = pool.get(&ctx()).await.unwrap();
        let _g2 = pool.get(&ctx()).await.unwrap();
        let status = checker.check().await;
        assert_eq!(status.status, Health::Degraded);
    }

    #[tokio::test]
    async fn test_close_blocks_new_acquisitions() {
        let pool = Pool::new(PoolConfig::new(), ConnFactory::new());
        drop(pool.get(&ctx()).await.unwrap());

        pool.close(Duration::from_millis(100)).await;
        assert!(pool.get(&ctx()).await.is_err());
        assert_eq!(pool.stats().idle, 0);
    }
}
