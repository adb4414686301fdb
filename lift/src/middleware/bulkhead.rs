//! Bulkhead middleware
//!
//! Semaphore-gated concurrency, globally or partitioned per tenant or per
//! operation. A request that cannot acquire a permit within the configured
//! wait fails with `BULKHEAD_FULL`. High-priority requests (per the
//! configured extractor) may draw from a reserved headroom pool when the
//! main one is exhausted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::context::Context;
use crate::error::{LiftError, Result};
use crate::middleware::{Middleware, Next, PriorityExtractor};

/// How concurrency is partitioned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkheadScope {
    /// One pool of permits for the whole application
    Global,
    /// Separate pools per tenant
    PerTenant,
    /// Separate pools per method + path
    PerOperation,
}

/// Configuration for [`Bulkhead`]
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadConfig {
    /// Permits in the main pool
    pub max_concurrent: usize,
    /// How long a request may wait for a permit, in milliseconds
    pub max_wait_ms: u64,
    /// Partitioning
    pub scope: BulkheadScope,
    /// Per-tenant permit overrides (PerTenant scope)
    pub per_tenant_limits: HashMap<String, usize>,
    /// Per-operation permit overrides (PerOperation scope)
    pub per_operation_limits: HashMap<String, usize>,
    /// Extracts a request priority (wired in code, not configuration)
    #[serde(skip)]
    pub priority_extractor: Option<PriorityExtractor>,
    /// Priorities at or above this may use the reserved headroom
    pub high_priority_threshold: u8,
    /// Reserved permits for high-priority requests
    pub high_priority_reserve: usize,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 100,
            max_wait_ms: 500,
            scope: BulkheadScope::Global,
            per_tenant_limits: HashMap::new(),
            per_operation_limits: HashMap::new(),
            priority_extractor: None,
            high_priority_threshold: 8,
            high_priority_reserve: 0,
        }
    }
}

impl BulkheadConfig {
    /// Default configuration (100 concurrent, 500ms wait)
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the main permit count
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    /// Set the acquisition wait bound
    pub fn with_max_wait(mut self, wait: Duration) -> Self {
        self.max_wait_ms = wait.as_millis() as u64;
        self
    }

    /// Partition permits
    pub fn with_scope(mut self, scope: BulkheadScope) -> Self {
        self.scope = scope;
        self
    }

    /// Override the permit count for one tenant
    pub fn with_tenant_limit(mut self, tenant: impl Into<String>, limit: usize) -> Self {
        self.per_tenant_limits.insert(tenant.into(), limit.max(1));
        self
    }

    /// Override the permit count for one operation (`"METHOD /path"`)
    pub fn with_operation_limit(mut self, operation: impl Into<String>, limit: usize) -> Self {
        self.per_operation_limits.insert(operation.into(), limit.max(1));
        self
    }

    /// Reserve headroom for high-priority requests
    pub fn with_priority(
        mut self,
        extractor: PriorityExtractor,
        threshold: u8,
        reserve: usize,
    ) -> Self {
        self.priority_extractor = Some(extractor);
        self.high_priority_threshold = threshold;
        self.high_priority_reserve = reserve;
        self
    }
}

struct Partition {
    main: Arc<Semaphore>,
    reserve: Option<Arc<Semaphore>>,
}

/// Bulkhead middleware
pub struct Bulkhead {
    config: BulkheadConfig,
    partitions: DashMap<String, Arc<Partition>>,
}

impl Bulkhead {
    /// Bulkhead with the given configuration
    pub fn new(config: BulkheadConfig) -> Self {
        Self {
            config,
            partitions: DashMap::new(),
        }
    }

    fn key(&self, ctx: &Context) -> String {
        match self.config.scope {
            BulkheadScope::Global => "global".to_string(),
            BulkheadScope::PerTenant => {
                ctx.tenant_id().unwrap_or_else(|| "untenanted".to_string())
            }
            BulkheadScope::PerOperation => format!("{} {}", ctx.method(), ctx.path()),
        }
    }

    fn limit_for(&self, key: &str) -> usize {
        match self.config.scope {
            BulkheadScope::Global => self.config.max_concurrent,
            BulkheadScope::PerTenant => self
                .config
                .per_tenant_limits
                .get(key)
                .copied()
                .unwrap_or(self.config.max_concurrent),
            BulkheadScope::PerOperation => self
                .config
                .per_operation_limits
                .get(key)
                .copied()
                .unwrap_or(self.config.max_concurrent),
        }
    }

    fn partition(&self, key: &str) -> Arc<Partition> {
        self.partitions
            .entry(key.to_string())
            .or_insert_with(|| {
                let reserve = (self.config.high_priority_reserve > 0)
                    .then(|| Arc::new(Semaphore::new(self.config.high_priority_reserve)));
                Arc::new(Partition {
                    main: Arc::new(Semaphore::new(self.limit_for(key))),
                    reserve,
                })
            })
            .clone()
    }

    fn is_high_priority(&self, ctx: &Context) -> bool {
        self.config
            .priority_extractor
            .as_ref()
            .map(|extract| extract(ctx) >= self.config.high_priority_threshold)
            .unwrap_or(false)
    }
}

#[async_trait]
impl Middleware for Bulkhead {
    async fn handle(&self, ctx: Context, next: Next<'_>) -> Result<()> {
        let key = self.key(&ctx);
        let partition = self.partition(&key);

        let max_wait = Duration::from_millis(self.config.max_wait_ms);
        let wait = match ctx.remaining() {
            Some(remaining) => max_wait.min(remaining),
            None => max_wait,
        };

        let permit =
            match tokio::time::timeout(wait, partition.main.clone().acquire_owned()).await {
                Ok(Ok(permit)) => Some(permit),
                Ok(Err(_)) => None,
                Err(_) => None,
            };

        // High-priority requests fall back to the reserved headroom
        let permit = match permit {
            Some(p) => p,
            None => {
                let reserved = if self.is_high_priority(&ctx) {
                    partition
                        .reserve
                        .as_ref()
                        .and_then(|r| r.clone().try_acquire_owned().ok())
                } else {
                    None
                };
                match reserved {
                    Some(p) => p,
                    None => {
                        return Err(LiftError::new(
                            crate::error::ErrorCode::BulkheadFull,
                            format!("no capacity in bulkhead {key}"),
                        ));
                    }
                }
            }
        };

        let result = next.run(ctx).await;
        drop(permit);
        result
    }

    fn name(&self) -> &'static str {
        "bulkhead"
    }
}
