//! Connection pool manager for the storage backends.
//!
//! Owns every backend connection: the relational primary, its
//! replicas, the key-value store, and the vector store. Callers
//! borrow a handle per operation and give it back by dropping it;
//! nothing outside this module keeps a connection across calls.
//!
//! Relational handles are health-probed before they are handed out.
//! A handle that fails the probe is detached from the pool and
//! dropped, and acquisition retries a bounded number of times before
//! reporting the pool exhausted. Key-value handles are verified by
//! the pool's ping-on-recycle instead.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use deadpool::managed;
use deadpool_postgres::Pool as PgPool;
use deadpool_redis::Pool as RedisPool;
use futures::future::{self, BoxFuture};
use tokio_postgres::NoTls;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::error::{DataError, Result};

/// How many unhealthy handles are discarded before acquisition gives up.
const HEALTH_RETRIES: u32 = 3;

/// Pooled relational connection.
pub type PgConn = deadpool_postgres::Object;

/// Pooled key-value connection.
pub type KvConn = deadpool_redis::Connection;

/// The backend a pool or an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    RelationalPrimary,
    RelationalReplica,
    KeyValue,
    Vector,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendKind::RelationalPrimary => "relational-primary",
            BackendKind::RelationalReplica => "relational-replica",
            BackendKind::KeyValue => "key-value",
            BackendKind::Vector => "vector",
        };
        f.write_str(s)
    }
}

/// Point-in-time utilization of one pool, for scraping.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStatus {
    pub name: String,
    pub backend: BackendKind,
    pub size: usize,
    pub available: usize,
    pub max_size: usize,
    pub waiting: usize,
}

/// Outcome of pinging one backend.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BackendHealth {
    pub name: String,
    pub backend: BackendKind,
    pub healthy: bool,
    pub detail: Option<String>,
}

/// A connection that can answer a cheap liveness probe.
#[async_trait]
pub(crate) trait ProbeConnection: Send {
    async fn probe(&mut self) -> bool;
}

#[async_trait]
impl ProbeConnection for deadpool_postgres::Object {
    async fn probe(&mut self) -> bool {
        self.simple_query("SELECT 1").await.is_ok()
    }
}

/// Acquire a handle, probing it before handout.
///
/// Unhealthy handles are detached and dropped so the pool replaces
/// them; after [`HEALTH_RETRIES`] discards the pool is reported
/// exhausted. A wait past the configured timeout surfaces as
/// [`DataError::PoolTimeout`] with no handle left checked out.
async fn acquire_probed<M>(
    pool: &managed::Pool<M>,
    backend: BackendKind,
    wait: Duration,
) -> Result<managed::Object<M>>
where
    M: managed::Manager,
    M::Error: fmt::Display,
    managed::Object<M>: ProbeConnection,
{
    for attempt in 1..=HEALTH_RETRIES {
        let mut conn = match pool.get().await {
            Ok(conn) => conn,
            Err(managed::PoolError::Timeout(_)) => {
                return Err(DataError::PoolTimeout {
                    backend,
                    waited: wait,
                });
            }
            Err(e) => return Err(DataError::Backend(e.to_string())),
        };
        if conn.probe().await {
            return Ok(conn);
        }
        warn!(backend = %backend, attempt, "discarding unhealthy connection");
        drop(managed::Object::take(conn));
    }
    Err(DataError::PoolExhausted { backend })
}

/// Owns the connection pools for every backend.
pub struct PoolManager {
    primary: PgPool,
    replicas: Vec<PgPool>,
    kv: RedisPool,
    vector: PgPool,
    pg_wait: Duration,
    kv_wait: Duration,
    idle_timeout: Duration,
    max_lifetime: Duration,
    min_size: usize,
}

impl PoolManager {
    /// Build the pools and verify the primary is reachable.
    pub async fn new(config: &StorageConfig) -> Result<Self> {
        let rel = &config.relational;
        info!(
            max_size = rel.pool.max_size,
            replicas = rel.replica_urls.len(),
            "creating storage pools"
        );

        let primary = pg_pool(rel.primary_url(), rel.pool.max_size, rel.pool.acquire_timeout())?;
        let replicas = (0..rel.replica_urls.len())
            .map(|i| {
                // replica_url(i) is always Some within this range
                let url = rel.replica_url(i).unwrap_or_default();
                pg_pool(url, rel.pool.max_size, rel.pool.acquire_timeout())
            })
            .collect::<Result<Vec<_>>>()?;

        let vector_url = config.vector.url().unwrap_or_else(|| rel.primary_url());
        let vector = pg_pool(vector_url, config.vector.pool_size, rel.pool.acquire_timeout())?;

        let kv = redis_pool(
            config.kv.url(),
            config.kv.pool_size,
            config.kv.acquire_timeout(),
        )?;

        let manager = Self {
            primary,
            replicas,
            kv,
            vector,
            pg_wait: rel.pool.acquire_timeout(),
            kv_wait: config.kv.acquire_timeout(),
            idle_timeout: rel.pool.idle_timeout(),
            max_lifetime: rel.pool.max_lifetime(),
            min_size: rel.pool.min_size,
        };

        // Fail fast on an unreachable primary, like a bad URL or a
        // database that is not up yet.
        let _ = manager.primary().await?;
        info!("storage pools ready");
        Ok(manager)
    }

    /// Acquire a health-checked handle to the relational primary.
    pub async fn primary(&self) -> Result<PgConn> {
        self.prune();
        acquire_probed(&self.primary, BackendKind::RelationalPrimary, self.pg_wait).await
    }

    /// Acquire a health-checked handle to one relational replica.
    pub async fn replica(&self, index: usize) -> Result<PgConn> {
        let pool = self.replicas.get(index).ok_or_else(|| {
            DataError::Backend(format!("replica {index} is not configured"))
        })?;
        self.prune();
        acquire_probed(pool, BackendKind::RelationalReplica, self.pg_wait).await
    }

    /// Acquire a health-checked handle to the vector store.
    pub async fn vector(&self) -> Result<PgConn> {
        self.prune();
        acquire_probed(&self.vector, BackendKind::Vector, self.pg_wait).await
    }

    /// Acquire a key-value handle. Liveness is enforced by the pool's
    /// ping-on-recycle rather than an extra round trip here.
    pub async fn kv(&self) -> Result<KvConn> {
        match self.kv.get().await {
            Ok(conn) => Ok(conn),
            Err(managed::PoolError::Timeout(_)) => Err(DataError::PoolTimeout {
                backend: BackendKind::KeyValue,
                waited: self.kv_wait,
            }),
            Err(e) => Err(DataError::Backend(e.to_string())),
        }
    }

    /// Number of configured relational replicas.
    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    /// Pre-create the configured minimum of relational connections.
    pub async fn warm_up(&self) -> Result<()> {
        let mut held = Vec::with_capacity(self.min_size);
        for _ in 0..self.min_size {
            held.push(self.primary().await?);
        }
        drop(held);
        debug!(min_size = self.min_size, "primary pool warmed");
        Ok(())
    }

    /// Drop idle handles past their idle timeout or maximum lifetime.
    ///
    /// Runs lazily at acquisition time; the pool recreates handles on
    /// demand afterwards.
    pub fn prune(&self) {
        let idle = self.idle_timeout;
        let lifetime = self.max_lifetime;
        for pool in std::iter::once(&self.primary)
            .chain(self.replicas.iter())
            .chain(std::iter::once(&self.vector))
        {
            pool.retain(|_, metrics| {
                metrics.age() < lifetime && metrics.last_used() < idle
            });
        }
        self.kv
            .retain(|_, metrics| metrics.age() < lifetime && metrics.last_used() < idle);
    }

    /// Utilization of every pool.
    pub fn status(&self) -> Vec<PoolStatus> {
        let mut out = Vec::with_capacity(self.replicas.len() + 3);
        out.push(pool_status(
            "relational-primary",
            BackendKind::RelationalPrimary,
            self.primary.status(),
        ));
        for (i, pool) in self.replicas.iter().enumerate() {
            out.push(pool_status(
                &format!("relational-replica-{i}"),
                BackendKind::RelationalReplica,
                pool.status(),
            ));
        }
        out.push(pool_status("vector", BackendKind::Vector, self.vector.status()));
        out.push(pool_status("key-value", BackendKind::KeyValue, self.kv.status()));
        out
    }

    /// Ping every backend once, concurrently, and report the outcomes.
    pub async fn health(&self) -> Vec<BackendHealth> {
        let mut checks: Vec<BoxFuture<'_, BackendHealth>> =
            Vec::with_capacity(self.replicas.len() + 3);
        checks.push(Box::pin(async {
            health_of(
                "relational-primary",
                BackendKind::RelationalPrimary,
                self.primary().await.map(|_| ()),
            )
        }));
        for i in 0..self.replicas.len() {
            checks.push(Box::pin(async move {
                health_of(
                    &format!("relational-replica-{i}"),
                    BackendKind::RelationalReplica,
                    self.replica(i).await.map(|_| ()),
                )
            }));
        }
        checks.push(Box::pin(async {
            health_of("vector", BackendKind::Vector, self.vector().await.map(|_| ()))
        }));
        checks.push(Box::pin(async {
            health_of("key-value", BackendKind::KeyValue, self.ping_kv().await)
        }));
        future::join_all(checks).await
    }

    async fn ping_kv(&self) -> Result<()> {
        let mut conn = self.kv().await?;
        deadpool_redis::redis::cmd("PING")
            .query_async::<()>(&mut conn)
            .await
            .map_err(DataError::from)
    }

    /// Close every pool; outstanding handles drop normally.
    pub fn close(&self) {
        self.primary.close();
        for pool in &self.replicas {
            pool.close();
        }
        self.vector.close();
        self.kv.close();
        info!("storage pools closed");
    }
}

fn pg_pool(url: &str, max_size: usize, wait: Duration) -> Result<PgPool> {
    let mut cfg = deadpool_postgres::Config::new();
    cfg.url = Some(url.to_string());
    cfg.manager = Some(deadpool_postgres::ManagerConfig {
        // The probe in acquire_probed is the verification step.
        recycling_method: deadpool_postgres::RecyclingMethod::Fast,
    });
    cfg.pool = Some(deadpool_postgres::PoolConfig {
        max_size,
        timeouts: deadpool_postgres::Timeouts {
            wait: Some(wait),
            ..Default::default()
        },
        ..Default::default()
    });
    cfg.create_pool(Some(deadpool_postgres::Runtime::Tokio1), NoTls)
        .map_err(|e| DataError::Backend(e.to_string()))
}

fn redis_pool(url: &str, max_size: usize, wait: Duration) -> Result<RedisPool> {
    let mut cfg = deadpool_redis::Config::from_url(url);
    cfg.pool = Some(deadpool_redis::PoolConfig {
        max_size,
        timeouts: managed::Timeouts {
            wait: Some(wait),
            ..Default::default()
        },
        ..Default::default()
    });
    cfg.create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .map_err(|e| DataError::Backend(e.to_string()))
}

fn pool_status(name: &str, backend: BackendKind, status: managed::Status) -> PoolStatus {
    PoolStatus {
        name: name.to_string(),
        backend,
        size: status.size,
        available: status.available,
        max_size: status.max_size,
        waiting: status.waiting,
    }
}

fn health_of(name: &str, backend: BackendKind, outcome: Result<()>) -> BackendHealth {
    match outcome {
        Ok(()) => BackendHealth {
            name: name.to_string(),
            backend,
            healthy: true,
            detail: None,
        },
        Err(e) => BackendHealth {
            name: name.to_string(),
            backend,
            healthy: false,
            detail: Some(e.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use deadpool::managed::{Metrics, RecycleResult};

    struct MockConn {
        healthy: bool,
    }

    /// Creates connections in order; the first `unhealthy_first` fail
    /// their probe.
    struct MockManager {
        created: AtomicUsize,
        unhealthy_first: usize,
    }

    impl MockManager {
        fn new(unhealthy_first: usize) -> Self {
            Self {
                created: AtomicUsize::new(0),
                unhealthy_first,
            }
        }
    }

    impl managed::Manager for MockManager {
        type Type = MockConn;
        type Error = Infallible;

        async fn create(&self) -> std::result::Result<MockConn, Infallible> {
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(MockConn {
                healthy: n >= self.unhealthy_first,
            })
        }

        async fn recycle(
            &self,
            _conn: &mut MockConn,
            _metrics: &Metrics,
        ) -> RecycleResult<Infallible> {
            Ok(())
        }
    }

    #[async_trait]
    impl ProbeConnection for managed::Object<MockManager> {
        async fn probe(&mut self) -> bool {
            self.healthy
        }
    }

    fn mock_pool(max: usize, unhealthy_first: usize, wait: Option<Duration>) -> managed::Pool<MockManager> {
        let mut builder =
            managed::Pool::builder(MockManager::new(unhealthy_first)).max_size(max);
        if wait.is_some() {
            builder = builder
                .wait_timeout(wait)
                .runtime(deadpool::Runtime::Tokio1);
        }
        builder.build().expect("mock pool builds")
    }

    #[tokio::test]
    async fn max_one_blocks_second_caller_until_release() {
        let pool = mock_pool(1, 0, None);
        let held = acquire_probed(&pool, BackendKind::RelationalPrimary, Duration::ZERO)
            .await
            .expect("first acquire succeeds");

        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move {
            acquire_probed(&pool2, BackendKind::RelationalPrimary, Duration::ZERO).await
        });

        // The second caller must still be waiting while the handle is out.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let second = waiter.await.expect("task completes");
        assert!(second.is_ok());
        assert_eq!(pool.status().size, 1);
    }

    #[tokio::test]
    async fn acquire_timeout_surfaces_pool_timeout() {
        let wait = Duration::from_millis(50);
        let pool = mock_pool(1, 0, Some(wait));
        let _held = acquire_probed(&pool, BackendKind::RelationalPrimary, wait)
            .await
            .expect("first acquire succeeds");

        let err = acquire_probed(&pool, BackendKind::RelationalPrimary, wait)
            .await
            .expect_err("second acquire times out");
        assert!(matches!(err, DataError::PoolTimeout { .. }));
    }

    #[tokio::test]
    async fn unhealthy_handles_are_discarded_and_replaced() {
        // First two created connections fail their probe; the third passes.
        let pool = mock_pool(1, 2, None);
        let conn = acquire_probed(&pool, BackendKind::RelationalReplica, Duration::ZERO)
            .await
            .expect("third connection is healthy");
        assert!(conn.healthy);
        assert_eq!(pool.manager().created.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_after_bounded_probe_retries() {
        let pool = mock_pool(1, usize::MAX, None);
        let err = acquire_probed(&pool, BackendKind::Vector, Duration::ZERO)
            .await
            .expect_err("every probe fails");
        assert!(matches!(err, DataError::PoolExhausted { .. }));
        assert_eq!(
            pool.manager().created.load(Ordering::SeqCst),
            HEALTH_RETRIES as usize
        );
    }

    #[tokio::test]
    async fn concurrent_callers_never_exceed_max() {
        let pool = Arc::new(mock_pool(2, 0, None));
        let peak = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let peak = peak.clone();
            let active = active.clone();
            tasks.push(tokio::spawn(async move {
                let conn = acquire_probed(&pool, BackendKind::RelationalPrimary, Duration::ZERO)
                    .await
                    .expect("acquire succeeds");
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                drop(conn);
            }));
        }
        for task in tasks {
            task.await.expect("task completes");
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
