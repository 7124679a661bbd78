//! Audit partition lifecycle.
//!
//! The audit log is a time-partitioned table. Each partition walks a
//! one-way state machine, `planned → active → sealed → expired`:
//! planned ahead of its window, active while the window is open,
//! sealed once it ends (no further writes, ever), and expired once it
//! falls out of retention and may be dropped.
//!
//! The window math lives in a pure [`PartitionSet`] driven by an
//! injected [`Clock`], so tests advance time deterministically
//! instead of scattering date arithmetic across callers.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration as TimeDelta, Utc};
use tracing::{info, warn};

use crate::config::AuditSettings;
use crate::error::{DataError, Result};
use crate::router::QueryRouter;

/// Source of "now". Production uses [`SystemClock`]; tests substitute
/// a manual one.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Lifecycle state of one partition. Ordered: a partition only ever
/// moves forward through these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionState {
    Planned,
    Active,
    Sealed,
    Expired,
}

/// One time-bounded segment of the audit log.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Partition {
    pub name: String,
    pub start: DateTime<Utc>,
    /// Exclusive.
    pub end: DateTime<Utc>,
    pub state: PartitionState,
}

/// Per-state partition tallies, for scraping.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct PartitionCounts {
    pub planned: usize,
    pub active: usize,
    pub sealed: usize,
    pub expired: usize,
}

/// The partition state machine. Windows are fixed-length and aligned
/// to the Unix epoch, so index, bounds, and name are all derivable
/// from a timestamp alone.
pub(crate) struct PartitionSet {
    window_secs: i64,
    retention: TimeDelta,
    partitions: BTreeMap<i64, Partition>,
}

impl PartitionSet {
    pub(crate) fn new(settings: &AuditSettings) -> Self {
        Self {
            window_secs: settings.partition_days.max(1) * 86_400,
            retention: TimeDelta::days(settings.retention_days.max(0)),
            partitions: BTreeMap::new(),
        }
    }

    fn window_index(&self, ts: DateTime<Utc>) -> i64 {
        ts.timestamp().div_euclid(self.window_secs)
    }

    fn bounds(&self, index: i64) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let start = DateTime::from_timestamp(index * self.window_secs, 0);
        let end = DateTime::from_timestamp((index + 1) * self.window_secs, 0);
        match (start, end) {
            (Some(start), Some(end)) => Ok((start, end)),
            _ => Err(DataError::validation("audit timestamp out of range")),
        }
    }

    /// Create any partitions missing between now and `now + horizon`.
    /// Returns the newly created ones so the caller can provision the
    /// backing tables.
    pub(crate) fn ensure_ahead(
        &mut self,
        now: DateTime<Utc>,
        horizon: TimeDelta,
    ) -> Result<Vec<Partition>> {
        let first = self.window_index(now);
        let last = self.window_index(now + horizon);
        let mut created = Vec::new();
        for index in first..=last {
            if self.partitions.contains_key(&index) {
                continue;
            }
            let (start, end) = self.bounds(index)?;
            let partition = Partition {
                name: format!("audit_log_p{}", start.format("%Y%m%d")),
                start,
                end,
                state: PartitionState::Planned,
            };
            created.push(partition.clone());
            self.partitions.insert(index, partition);
        }
        self.refresh(now);
        Ok(created)
    }

    /// Advance every partition to the state its window implies.
    /// Transitions are monotonic: a clock that jumps backwards never
    /// reverts a partition.
    pub(crate) fn refresh(&mut self, now: DateTime<Utc>) {
        let retention = self.retention;
        for partition in self.partitions.values_mut() {
            let target = if now >= partition.end {
                if now - partition.end >= retention {
                    PartitionState::Expired
                } else {
                    PartitionState::Sealed
                }
            } else if now >= partition.start {
                PartitionState::Active
            } else {
                PartitionState::Planned
            };
            if target > partition.state {
                partition.state = target;
            }
        }
    }

    pub(crate) fn partition_for(&self, ts: DateTime<Utc>) -> Option<&Partition> {
        self.partitions.get(&self.window_index(ts))
    }

    /// Check that a write with this timestamp may proceed.
    pub(crate) fn writable(&self, ts: DateTime<Utc>) -> Result<&Partition> {
        let partition = self.partition_for(ts).ok_or_else(|| {
            DataError::validation(format!("no audit partition provisioned for {ts}"))
        })?;
        match partition.state {
            PartitionState::Active => Ok(partition),
            PartitionState::Planned => Err(DataError::validation(format!(
                "audit partition {} has not opened yet",
                partition.name
            ))),
            PartitionState::Sealed | PartitionState::Expired => Err(DataError::PartitionSealed {
                partition: partition.name.clone(),
            }),
        }
    }

    pub(crate) fn expired(&self) -> Vec<Partition> {
        self.partitions
            .values()
            .filter(|p| p.state == PartitionState::Expired)
            .cloned()
            .collect()
    }

    pub(crate) fn remove(&mut self, name: &str) {
        self.partitions.retain(|_, p| p.name != name);
    }

    pub(crate) fn counts(&self) -> PartitionCounts {
        let mut counts = PartitionCounts::default();
        for partition in self.partitions.values() {
            match partition.state {
                PartitionState::Planned => counts.planned += 1,
                PartitionState::Active => counts.active += 1,
                PartitionState::Sealed => counts.sealed += 1,
                PartitionState::Expired => counts.expired += 1,
            }
        }
        counts
    }
}

/// Creates and retires audit partitions on the relational primary.
pub struct AuditPartitionManager {
    set: Mutex<PartitionSet>,
    router: Arc<QueryRouter>,
    clock: Arc<dyn Clock>,
    horizon: TimeDelta,
}

impl AuditPartitionManager {
    pub fn new(router: Arc<QueryRouter>, clock: Arc<dyn Clock>, settings: &AuditSettings) -> Self {
        Self {
            set: Mutex::new(PartitionSet::new(settings)),
            router,
            clock,
            horizon: TimeDelta::days(settings.horizon_days.max(settings.partition_days.max(1))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PartitionSet> {
        self.set.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The manager's notion of now; audit entries are stamped with
    /// this so partition checks and inserts agree on the clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Provision partitions covering now through the configured
    /// horizon. Idempotent; call at startup and then periodically.
    pub async fn ensure_ahead(&self) -> Result<usize> {
        let now = self.clock.now();
        let created = self.lock().ensure_ahead(now, self.horizon)?;

        for partition in &created {
            let ddl = format!(
                "CREATE TABLE IF NOT EXISTS {} PARTITION OF audit_log \
                 FOR VALUES FROM ('{}') TO ('{}')",
                partition.name,
                partition.start.to_rfc3339(),
                partition.end.to_rfc3339(),
            );
            let conn = self.router.write().await?;
            if let Err(e) = conn.batch_execute(&ddl).await {
                warn!(partition = %partition.name, error = %e, "partition provisioning failed");
                self.lock().remove(&partition.name);
                return Err(e);
            }
            info!(partition = %partition.name, "audit partition provisioned");
        }
        Ok(created.len())
    }

    /// The partition a timestamp falls into.
    pub fn partition_for(&self, ts: DateTime<Utc>) -> Result<Partition> {
        let mut set = self.lock();
        set.refresh(self.clock.now());
        set.partition_for(ts)
            .cloned()
            .ok_or_else(|| DataError::not_found("audit partition", ts))
    }

    /// Check that an entry with this timestamp may be written, and
    /// return the partition name it will land in.
    pub fn check_writable(&self, ts: DateTime<Utc>) -> Result<String> {
        let mut set = self.lock();
        set.refresh(self.clock.now());
        set.writable(ts).map(|p| p.name.clone())
    }

    /// Drop partitions past retention. Sealed partitions inside the
    /// retention window are never touched.
    pub async fn reap_expired(&self) -> Result<Vec<String>> {
        let expired = {
            let mut set = self.lock();
            set.refresh(self.clock.now());
            set.expired()
        };

        let mut dropped = Vec::with_capacity(expired.len());
        for partition in expired {
            let conn = self.router.write().await?;
            conn.batch_execute(&format!("DROP TABLE IF EXISTS {}", partition.name))
                .await?;
            self.lock().remove(&partition.name);
            info!(partition = %partition.name, "expired audit partition dropped");
            dropped.push(partition.name);
        }
        Ok(dropped)
    }

    /// Per-state partition tallies.
    pub fn counts(&self) -> PartitionCounts {
        let mut set = self.lock();
        set.refresh(self.clock.now());
        set.counts()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn settings() -> AuditSettings {
        AuditSettings {
            partition_days: 7,
            horizon_days: 14,
            retention_days: 30,
        }
    }

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).single().expect("valid date")
    }

    #[test]
    fn ensure_ahead_covers_the_horizon() {
        let mut set = PartitionSet::new(&settings());
        let now = at(2026, 8, 5);
        let created = set.ensure_ahead(now, TimeDelta::days(14)).unwrap();

        // 14 days of horizon over 7-day windows: current plus two ahead.
        assert_eq!(created.len(), 3);
        let current = set.partition_for(now).expect("current window exists");
        assert_eq!(current.state, PartitionState::Active);
        assert!(current.start <= now && now < current.end);

        // Idempotent.
        let again = set.ensure_ahead(now, TimeDelta::days(14)).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn future_windows_stay_planned_until_they_open() {
        let mut set = PartitionSet::new(&settings());
        let now = at(2026, 8, 5);
        set.ensure_ahead(now, TimeDelta::days(14)).unwrap();

        let future = now + TimeDelta::days(10);
        let partition = set.partition_for(future).expect("planned window exists");
        assert_eq!(partition.state, PartitionState::Planned);

        let err = set.writable(future).expect_err("planned window rejects writes");
        assert!(matches!(err, DataError::Validation(_)));
    }

    #[test]
    fn sealed_partitions_reject_writes() {
        let mut set = PartitionSet::new(&settings());
        let opened = at(2026, 8, 5);
        set.ensure_ahead(opened, TimeDelta::days(7)).unwrap();

        // Two windows later the original window has sealed.
        set.refresh(opened + TimeDelta::days(14));
        let err = set.writable(opened).expect_err("sealed window rejects writes");
        assert!(matches!(err, DataError::PartitionSealed { .. }));
    }

    #[test]
    fn partitions_expire_only_past_retention() {
        let mut set = PartitionSet::new(&settings());
        let opened = at(2026, 8, 5);
        set.ensure_ahead(opened, TimeDelta::days(7)).unwrap();

        // Sealed but within retention: not reapable.
        set.refresh(opened + TimeDelta::days(20));
        assert!(set.expired().is_empty());
        let counts = set.counts();
        assert!(counts.sealed >= 1);

        // Well past retention: the original window is reapable.
        set.refresh(opened + TimeDelta::days(60));
        let expired = set.expired();
        assert!(!expired.is_empty());
        assert!(expired.iter().any(|p| p.start <= opened && opened < p.end));

        let err = set.writable(opened).expect_err("expired window rejects writes");
        assert!(matches!(err, DataError::PartitionSealed { .. }));
    }

    #[test]
    fn transitions_never_revert_when_the_clock_rewinds() {
        let mut set = PartitionSet::new(&settings());
        let opened = at(2026, 8, 5);
        set.ensure_ahead(opened, TimeDelta::days(7)).unwrap();

        set.refresh(opened + TimeDelta::days(14));
        let sealed = set.partition_for(opened).unwrap().state;
        assert_eq!(sealed, PartitionState::Sealed);

        // Clock skew backwards must not re-open the window.
        set.refresh(opened);
        assert_eq!(set.partition_for(opened).unwrap().state, PartitionState::Sealed);
    }

    #[test]
    fn unprovisioned_timestamps_fail_validation() {
        let set = PartitionSet::new(&settings());
        let err = set.writable(at(2026, 8, 5)).expect_err("nothing provisioned");
        assert!(matches!(err, DataError::Validation(_)));
    }

    #[test]
    fn window_names_are_date_stamped() {
        let mut set = PartitionSet::new(&settings());
        let now = at(2026, 8, 5);
        let created = set.ensure_ahead(now, TimeDelta::days(0)).unwrap();
        assert_eq!(created.len(), 1);
        assert!(created[0].name.starts_with("audit_log_p"));
        assert_eq!(created[0].name.len(), "audit_log_p".len() + 8);
    }
}
