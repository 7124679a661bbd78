//! holdfast, the persistence layer for the operations agent.
//!
//! One crate fronting three stores: PostgreSQL for transactional
//! entities (primary plus optional read replicas), redis for the
//! cache, sessions, tags, and queues, and pgvector collections for
//! similarity search. Between the callers and the stores sit the
//! pieces that keep it honest under load: health-checked connection
//! pools, per-dependency circuit breakers, cache-aside with
//! write-then-invalidate ordering, read/write query routing, and a
//! partitioned, append-only audit log.
//!
//! [`Storage::connect`] wires the graph once at startup and hands out
//! the typed surfaces:
//!
//! ```no_run
//! # async fn run() -> holdfast::Result<()> {
//! let config = holdfast::StorageConfig::from_env()
//!     .map_err(|e| holdfast::DataError::Validation(e.to_string()))?;
//! let storage = holdfast::Storage::connect(config).await?;
//!
//! let user = storage.repo().get_user(uuid::Uuid::new_v4()).await?;
//! println!("{}", user.email);
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod breaker;
pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod repo;
pub mod router;
pub mod vector;

use std::sync::Arc;

pub use crate::audit::{AuditPartitionManager, Clock, Partition, PartitionState, SystemClock};
pub use crate::breaker::{Breakers, CircuitBreaker, CircuitState};
pub use crate::cache::{CacheAside, KvStore, MemoryKv, RedisKv};
pub use crate::config::StorageConfig;
pub use crate::error::{DataError, Result};
pub use crate::metrics::MetricsSnapshot;
pub use crate::pool::{BackendHealth, BackendKind, PoolManager};
pub use crate::repo::Repository;
pub use crate::router::{OpKind, QueryRouter};
pub use crate::vector::{
    CollectionSpec, DistanceMetric, SearchHit, VectorGateway, default_collections,
};

use crate::metrics::CacheMetrics;

/// The assembled storage layer. Owns the pools, breakers, cache,
/// router, repositories, audit partitions, and vector gateway; built
/// once at startup and shared behind an `Arc` by the rest of the
/// agent.
pub struct Storage {
    pools: Arc<PoolManager>,
    breakers: Arc<Breakers>,
    cache: Arc<CacheAside>,
    cache_metrics: Arc<CacheMetrics>,
    repo: Repository,
    audit: Arc<AuditPartitionManager>,
    vector: VectorGateway,
}

impl Storage {
    /// Connect to every backend and wire the component graph.
    ///
    /// Fails fast if the relational primary is unreachable. The
    /// primary pool is warmed to its configured minimum, audit
    /// partitions for the configured horizon are provisioned, and the
    /// default vector collections are created when a dimension is
    /// configured, all before this returns, so the first operation
    /// never races setup.
    pub async fn connect(config: StorageConfig) -> Result<Self> {
        Self::connect_with_clock(config, Arc::new(SystemClock)).await
    }

    /// [`Storage::connect`] with an injected clock, for deterministic
    /// audit lifecycle testing.
    pub async fn connect_with_clock(
        config: StorageConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let pools = Arc::new(PoolManager::new(&config).await?);
        pools.warm_up().await?;
        let breakers = Arc::new(Breakers::new(&config.breaker, pools.replica_count()));
        let router = Arc::new(QueryRouter::new(pools.clone(), breakers.clone()));

        let kv: Arc<dyn KvStore> = Arc::new(RedisKv::new(pools.clone(), breakers.kv()));
        let cache_metrics = Arc::new(CacheMetrics::default());
        let cache = Arc::new(CacheAside::new(
            kv,
            config.cache.default_ttl(),
            cache_metrics.clone(),
        ));

        let audit = Arc::new(AuditPartitionManager::new(
            router.clone(),
            clock,
            &config.audit,
        ));
        audit.ensure_ahead().await?;

        let vector = VectorGateway::new(pools.clone(), breakers.vector());
        vector.load().await?;
        if let Some(dimension) = config.vector.default_dimension {
            for spec in vector::default_collections(dimension) {
                vector.provision(spec).await?;
            }
        }

        let repo = Repository::new(router, cache.clone(), audit.clone());

        Ok(Self {
            pools,
            breakers,
            cache,
            cache_metrics,
            repo,
            audit,
            vector,
        })
    }

    /// Typed entity operations.
    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    /// The cache-aside coordinator, including queue access through
    /// its store.
    pub fn cache(&self) -> &CacheAside {
        &self.cache
    }

    /// Audit partition lifecycle: provisioning ahead and reaping.
    pub fn audit(&self) -> &AuditPartitionManager {
        &self.audit
    }

    /// Vector collections and similarity queries.
    pub fn vector(&self) -> &VectorGateway {
        &self.vector
    }

    /// Ping every backend once.
    pub async fn health(&self) -> Vec<BackendHealth> {
        self.pools.health().await
    }

    /// Everything the monitoring pipeline scrapes.
    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            pools: self.pools.status(),
            cache: self.cache_metrics.snapshot(),
            breakers: self.breakers.snapshot(),
            partitions: self.audit.counts(),
        }
    }

    /// Graceful teardown: close the pools and let outstanding handles
    /// drain as they drop.
    pub fn shutdown(&self) {
        self.pools.close();
    }
}
