//! Circuit breakers guarding calls to external backends.
//!
//! One breaker per dependency (primary, each replica, key-value,
//! vector). A closed breaker passes calls through and counts
//! consecutive failures; at the threshold it opens and short-circuits
//! everything with [`DataError::CircuitOpen`] until the open timeout
//! elapses, after which exactly one caller is admitted as a probe.
//! The probe's outcome decides between closing again and re-opening
//! with a fresh timer.
//!
//! Outcome reports are stamped with the generation of the state they
//! were admitted under, so a slow call that raced a transition can
//! never flip the state a second time.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::BreakerSettings;
use crate::error::{DataError, Result};

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

enum Inner {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen,
}

struct Shared {
    inner: Inner,
    generation: u64,
}

impl Shared {
    fn transition(&mut self, next: Inner) {
        self.generation += 1;
        self.inner = next;
    }
}

/// Ticket handed out when a call is admitted. Carries the generation
/// it was admitted under; reports with a stale generation are ignored.
#[derive(Debug, Clone, Copy)]
pub struct Admission {
    generation: u64,
}

/// Snapshot of one breaker, for scraping.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BreakerSnapshot {
    pub dependency: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

/// Per-dependency circuit breaker.
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    open_timeout: Duration,
    shared: Mutex<Shared>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: &BreakerSettings) -> Self {
        Self {
            name: name.into(),
            threshold: settings.failure_threshold.max(1),
            open_timeout: settings.open_timeout(),
            shared: Mutex::new(Shared {
                inner: Inner::Closed { failures: 0 },
                generation: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask to make a call. Open circuits reject immediately; an open
    /// circuit whose timeout has elapsed admits the caller as the
    /// half-open probe, and everyone else is rejected until the probe
    /// reports back.
    pub fn try_admit(&self) -> Result<Admission> {
        let mut shared = self.lock();
        match shared.inner {
            Inner::Closed { .. } => Ok(Admission {
                generation: shared.generation,
            }),
            Inner::Open { since } => {
                let elapsed = since.elapsed();
                if elapsed >= self.open_timeout {
                    shared.transition(Inner::HalfOpen);
                    info!(breaker = %self.name, "admitting half-open probe");
                    Ok(Admission {
                        generation: shared.generation,
                    })
                } else {
                    Err(DataError::CircuitOpen {
                        dependency: self.name.clone(),
                        retry_after: self.open_timeout - elapsed,
                    })
                }
            }
            // A probe is in flight; reject everyone else.
            Inner::HalfOpen => Err(DataError::CircuitOpen {
                dependency: self.name.clone(),
                retry_after: Duration::ZERO,
            }),
        }
    }

    /// Report the outcome of an admitted call. `healthy` means the
    /// dependency responded, even if the response was an application
    /// error like a missing row.
    pub fn record(&self, admission: Admission, healthy: bool) {
        let mut shared = self.lock();
        if admission.generation != shared.generation {
            return;
        }
        let next = match (&mut shared.inner, healthy) {
            (Inner::Closed { failures }, true) => {
                *failures = 0;
                None
            }
            (Inner::Closed { failures }, false) => {
                *failures += 1;
                if *failures >= self.threshold {
                    warn!(breaker = %self.name, failures = *failures, "circuit opened");
                    Some(Inner::Open {
                        since: Instant::now(),
                    })
                } else {
                    None
                }
            }
            (Inner::HalfOpen, true) => {
                info!(breaker = %self.name, "probe succeeded, circuit closed");
                Some(Inner::Closed { failures: 0 })
            }
            (Inner::HalfOpen, false) => {
                warn!(breaker = %self.name, "probe failed, circuit re-opened");
                Some(Inner::Open {
                    since: Instant::now(),
                })
            }
            (Inner::Open { .. }, _) => None,
        };
        if let Some(inner) = next {
            shared.transition(inner);
        }
    }

    /// Wrap one backend call. The operation runs only if admitted, and
    /// its outcome feeds the failure counter. Backend errors are
    /// re-surfaced unchanged; no retry happens here.
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let admission = self.try_admit()?;
        let result = op().await;
        let healthy = match &result {
            Ok(_) => true,
            Err(e) => !e.is_backend_failure(),
        };
        self.record(admission, healthy);
        result
    }

    /// Current state, as last observed by a call. An open circuit
    /// whose timeout has elapsed still reads `Open` until the next
    /// caller is admitted as the probe.
    pub fn state(&self) -> CircuitState {
        match self.lock().inner {
            Inner::Closed { .. } => CircuitState::Closed,
            Inner::Open { .. } => CircuitState::Open,
            Inner::HalfOpen => CircuitState::HalfOpen,
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let shared = self.lock();
        let (state, failures) = match shared.inner {
            Inner::Closed { failures } => (CircuitState::Closed, failures),
            Inner::Open { .. } => (CircuitState::Open, self.threshold),
            Inner::HalfOpen => (CircuitState::HalfOpen, self.threshold),
        };
        BreakerSnapshot {
            dependency: self.name.clone(),
            state,
            consecutive_failures: failures,
        }
    }
}

/// The process-wide set of breakers, one per configured dependency.
/// Built once at startup and passed explicitly to the components that
/// consult it.
pub struct Breakers {
    primary: Arc<CircuitBreaker>,
    replicas: Vec<Arc<CircuitBreaker>>,
    kv: Arc<CircuitBreaker>,
    vector: Arc<CircuitBreaker>,
}

impl Breakers {
    pub fn new(settings: &BreakerSettings, replica_count: usize) -> Self {
        Self {
            primary: Arc::new(CircuitBreaker::new("relational-primary", settings)),
            replicas: (0..replica_count)
                .map(|i| Arc::new(CircuitBreaker::new(format!("relational-replica-{i}"), settings)))
                .collect(),
            kv: Arc::new(CircuitBreaker::new("key-value", settings)),
            vector: Arc::new(CircuitBreaker::new("vector", settings)),
        }
    }

    pub fn primary(&self) -> Arc<CircuitBreaker> {
        self.primary.clone()
    }

    pub fn replica(&self, index: usize) -> Option<Arc<CircuitBreaker>> {
        self.replicas.get(index).cloned()
    }

    pub fn kv(&self) -> Arc<CircuitBreaker> {
        self.kv.clone()
    }

    pub fn vector(&self) -> Arc<CircuitBreaker> {
        self.vector.clone()
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut out = Vec::with_capacity(self.replicas.len() + 3);
        out.push(self.primary.snapshot());
        for replica in &self.replicas {
            out.push(replica.snapshot());
        }
        out.push(self.kv.snapshot());
        out.push(self.vector.snapshot());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn settings(threshold: u32, open_timeout_ms: u64) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: threshold,
            open_timeout_ms,
        }
    }

    fn backend_err() -> DataError {
        DataError::Backend("connection refused".into())
    }

    #[tokio::test]
    async fn trips_open_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new("pg", &settings(5, 30_000));
        let calls = AtomicU32::new(0);

        for _ in 0..5 {
            let result: Result<()> = breaker
                .execute(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(backend_err())
                })
                .await;
            assert!(result.is_err());
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        // The next call is rejected without touching the backend.
        let result: Result<()> = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(DataError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn success_resets_the_failure_count() {
        let breaker = CircuitBreaker::new("pg", &settings(3, 30_000));
        for _ in 0..2 {
            let _: Result<()> = breaker.execute(|| async { Err(backend_err()) }).await;
        }
        let _: Result<()> = breaker.execute(|| async { Ok(()) }).await;
        for _ in 0..2 {
            let _: Result<()> = breaker.execute(|| async { Err(backend_err()) }).await;
        }
        // 2 failures, reset, 2 failures: still below the threshold.
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn non_backend_errors_do_not_count() {
        let breaker = CircuitBreaker::new("pg", &settings(2, 30_000));
        for _ in 0..5 {
            let _: Result<()> = breaker
                .execute(|| async { Err(DataError::not_found("user", "42")) })
                .await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn admits_exactly_one_probe_after_timeout() {
        let breaker = CircuitBreaker::new("pg", &settings(1, 50));
        let _: Result<()> = breaker.execute(|| async { Err(backend_err()) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        assert!(breaker.try_admit().is_err());
        tokio::time::sleep(Duration::from_millis(60)).await;

        let probe = breaker.try_admit().expect("probe admitted");
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // Concurrent caller while the probe is in flight.
        assert!(breaker.try_admit().is_err());

        breaker.record(probe, true);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn failed_probe_reopens_and_resets_the_timer() {
        let breaker = CircuitBreaker::new("pg", &settings(1, 50));
        let _: Result<()> = breaker.execute(|| async { Err(backend_err()) }).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let result: Result<()> = breaker.execute(|| async { Err(backend_err()) }).await;
        assert!(result.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);

        // Timer was reset by the failed probe; still rejecting.
        assert!(breaker.try_admit().is_err());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(breaker.try_admit().is_ok());
    }

    #[tokio::test]
    async fn stale_outcome_cannot_flip_state_twice() {
        let breaker = CircuitBreaker::new("pg", &settings(1, 50));
        let stale = breaker.try_admit().expect("closed admits");

        // The circuit opens while the stale call is still in flight.
        let _: Result<()> = breaker.execute(|| async { Err(backend_err()) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        // The stale call reporting success must not close the circuit.
        breaker.record(stale, true);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn registry_builds_one_breaker_per_dependency() {
        let breakers = Breakers::new(&settings(5, 1000), 2);
        let snapshot = breakers.snapshot();
        let names: Vec<_> = snapshot.iter().map(|s| s.dependency.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "relational-primary",
                "relational-replica-0",
                "relational-replica-1",
                "key-value",
                "vector",
            ]
        );
        assert!(snapshot.iter().all(|s| s.state == CircuitState::Closed));
        assert!(breakers.replica(5).is_none());
    }
}
