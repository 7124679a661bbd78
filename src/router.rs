//! Read/write routing between the relational primary and replicas.
//!
//! Writes always land on the primary. Reads go to a replica when one
//! is configured and its breaker admits calls, round-robin across the
//! healthy set, falling back to the primary when none is usable.
//! Replication lag means a replica read is not a primary read;
//! callers that need strong consistency ask for
//! [`QueryRouter::read_primary`] explicitly, and a replica that fails
//! mid-query surfaces the error rather than silently retrying
//! elsewhere.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio_postgres::Row;
use tokio_postgres::types::ToSql;
use tracing::debug;

use crate::breaker::{Admission, Breakers, CircuitBreaker};
use crate::error::{DataError, Result};
use crate::pool::{PgConn, PoolManager};

/// Whether an operation mutates state. Writes must see the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
}

/// Where a routed connection points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnRole {
    Primary,
    Replica(usize),
}

/// A pooled connection plus the breaker that admitted it. Query
/// outcomes feed back into the breaker: a connection-level failure
/// counts against the dependency, a database error (bad statement,
/// constraint violation) does not, since the server answered.
pub struct RoutedConn {
    conn: PgConn,
    breaker: Arc<CircuitBreaker>,
    admission: Admission,
    role: ConnRole,
}

impl RoutedConn {
    pub fn role(&self) -> ConnRole {
        self.role
    }

    fn observe<T>(&self, outcome: &std::result::Result<T, tokio_postgres::Error>) {
        let healthy = match outcome {
            Ok(_) => true,
            Err(e) => e.as_db_error().is_some(),
        };
        self.breaker.record(self.admission, healthy);
    }

    pub async fn query(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>> {
        let outcome = self.conn.query(sql, params).await;
        self.observe(&outcome);
        outcome.map_err(DataError::from)
    }

    pub async fn query_opt(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<Row>> {
        let outcome = self.conn.query_opt(sql, params).await;
        self.observe(&outcome);
        outcome.map_err(DataError::from)
    }

    pub async fn query_one(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Row> {
        let outcome = self.conn.query_one(sql, params).await;
        self.observe(&outcome);
        outcome.map_err(DataError::from)
    }

    pub async fn execute(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64> {
        let outcome = self.conn.execute(sql, params).await;
        self.observe(&outcome);
        outcome.map_err(DataError::from)
    }

    pub async fn batch_execute(&self, sql: &str) -> Result<()> {
        let outcome = self.conn.batch_execute(sql).await;
        self.observe(&outcome);
        outcome.map_err(DataError::from)
    }
}

/// Routes relational operations to the right backend.
pub struct QueryRouter {
    pools: Arc<PoolManager>,
    breakers: Arc<Breakers>,
    next_replica: AtomicUsize,
}

impl QueryRouter {
    pub fn new(pools: Arc<PoolManager>, breakers: Arc<Breakers>) -> Self {
        Self {
            pools,
            breakers,
            next_replica: AtomicUsize::new(0),
        }
    }

    /// Route by operation kind, the generic entry point.
    pub async fn route(&self, op: OpKind) -> Result<RoutedConn> {
        match op {
            OpKind::Read => self.read().await,
            OpKind::Write => self.write().await,
        }
    }

    /// A connection for a mutating statement: always the primary.
    pub async fn write(&self) -> Result<RoutedConn> {
        self.primary_conn().await
    }

    /// A primary connection for reads that must not see replication
    /// lag.
    pub async fn read_primary(&self) -> Result<RoutedConn> {
        self.primary_conn().await
    }

    /// A connection for a read: a healthy replica when available,
    /// otherwise the primary. A replica whose acquisition fails is
    /// skipped (no query has been issued yet, so falling through is
    /// safe) and its breaker learns about the failure.
    pub async fn read(&self) -> Result<RoutedConn> {
        let count = self.pools.replica_count();
        if count > 0 {
            let start = self.next_replica.fetch_add(1, Ordering::Relaxed);
            for index in rotation(start, count) {
                let Some(breaker) = self.breakers.replica(index) else {
                    continue;
                };
                let Ok(admission) = breaker.try_admit() else {
                    continue;
                };
                match self.pools.replica(index).await {
                    Ok(conn) => {
                        return Ok(RoutedConn {
                            conn,
                            breaker,
                            admission,
                            role: ConnRole::Replica(index),
                        });
                    }
                    Err(e) => {
                        breaker.record(admission, !e.is_backend_failure());
                        debug!(replica = index, error = %e, "replica unavailable, trying next");
                    }
                }
            }
            debug!("no replica usable, reading from primary");
        }
        self.primary_conn().await
    }

    async fn primary_conn(&self) -> Result<RoutedConn> {
        let breaker = self.breakers.primary();
        let admission = breaker.try_admit()?;
        match self.pools.primary().await {
            Ok(conn) => Ok(RoutedConn {
                conn,
                breaker,
                admission,
                role: ConnRole::Primary,
            }),
            Err(e) => {
                breaker.record(admission, !e.is_backend_failure());
                Err(e)
            }
        }
    }
}

/// Round-robin visit order over `n` replicas starting at `start`.
fn rotation(start: usize, n: usize) -> impl Iterator<Item = usize> {
    (0..n).map(move |offset| (start + offset) % n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_visits_every_replica_once() {
        let order: Vec<_> = rotation(4, 3).collect();
        assert_eq!(order, vec![1, 2, 0]);

        let order: Vec<_> = rotation(0, 1).collect();
        assert_eq!(order, vec![0]);
    }

    #[test]
    fn rotation_is_deterministic_for_a_cursor() {
        assert_eq!(
            rotation(7, 4).collect::<Vec<_>>(),
            rotation(7, 4).collect::<Vec<_>>()
        );
    }
}
