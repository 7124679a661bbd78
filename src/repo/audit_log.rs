//! Audit log operations.
//!
//! Append-only by construction: the repository offers no update or
//! delete for audit records, and every append is checked against the
//! partition lifecycle first, so a write can never land in a sealed
//! or expired window.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;

use super::records::{AuditLogEntry, NewAuditEntry};
use super::{ListParams, Repository, require};

impl Repository {
    /// Append one audit record, stamped with the partition manager's
    /// clock.
    pub async fn append_audit(&self, new: NewAuditEntry) -> Result<AuditLogEntry> {
        require("actor", &new.actor)?;
        require("action", &new.action)?;
        require("entity_kind", &new.entity_kind)?;

        let recorded_at = self.audit.now();
        self.audit.check_writable(recorded_at)?;

        let conn = self.router.write().await?;
        let row = conn
            .query_one(
                r#"
                INSERT INTO audit_log (id, actor, action, entity_kind, entity_id, detail, recorded_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                RETURNING *
                "#,
                &[
                    &Uuid::new_v4(),
                    &new.actor,
                    &new.action,
                    &new.entity_kind,
                    &new.entity_id,
                    &new.detail,
                    &recorded_at,
                ],
            )
            .await?;
        Ok(AuditLogEntry::from_row(&row))
    }

    /// Audit records for one entity, newest first.
    pub async fn list_audit_for_entity(
        &self,
        entity_kind: &str,
        entity_id: &str,
        params: ListParams,
    ) -> Result<Vec<AuditLogEntry>> {
        require("entity_kind", entity_kind)?;
        require("entity_id", entity_id)?;
        let (limit, offset) = params.checked()?;

        let conn = self.router.read().await?;
        let rows = conn
            .query(
                r#"
                SELECT * FROM audit_log
                WHERE entity_kind = $1 AND entity_id = $2
                ORDER BY recorded_at DESC
                LIMIT $3 OFFSET $4
                "#,
                &[&entity_kind, &entity_id, &limit, &offset],
            )
            .await?;
        Ok(rows.iter().map(AuditLogEntry::from_row).collect())
    }

    /// Audit records in a time range, oldest first. The range prunes
    /// straight to the matching partitions.
    pub async fn list_audit_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        params: ListParams,
    ) -> Result<Vec<AuditLogEntry>> {
        let (limit, offset) = params.checked()?;
        let conn = self.router.read().await?;
        let rows = conn
            .query(
                r#"
                SELECT * FROM audit_log
                WHERE recorded_at >= $1 AND recorded_at < $2
                ORDER BY recorded_at ASC
                LIMIT $3 OFFSET $4
                "#,
                &[&from, &to, &limit, &offset],
            )
            .await?;
        Ok(rows.iter().map(AuditLogEntry::from_row).collect())
    }
}
