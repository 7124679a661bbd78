//! Incident and runbook operations.
//!
//! Runbooks are read on every incident the agent works, so lookups go
//! through the cache; incidents mutate constantly and do not.

use uuid::Uuid;

use crate::error::{DataError, Result};

use super::records::{
    Incident, IncidentStatus, NewIncident, NewRunbook, Runbook, RunbookUpdate,
};
use super::{ListParams, Repository, require};

fn runbook_key(id: Uuid) -> String {
    format!("runbook:{id}")
}

const RUNBOOKS_TAG: &str = "runbooks";

impl Repository {
    // ==================== Incidents ====================

    /// Open an incident.
    pub async fn create_incident(&self, new: NewIncident) -> Result<Incident> {
        require("title", &new.title)?;

        let conn = self.router.write().await?;
        let row = conn
            .query_one(
                r#"
                INSERT INTO incidents (id, title, severity, status, source, runbook_id, metadata)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                RETURNING *
                "#,
                &[
                    &Uuid::new_v4(),
                    &new.title,
                    &new.severity.as_str(),
                    &IncidentStatus::Open.as_str(),
                    &new.source,
                    &new.runbook_id,
                    &new.metadata,
                ],
            )
            .await?;
        Ok(Incident::from_row(&row))
    }

    pub async fn get_incident(&self, id: Uuid) -> Result<Incident> {
        let conn = self.router.read().await?;
        let row = conn
            .query_opt("SELECT * FROM incidents WHERE id = $1", &[&id])
            .await?;
        row.map(|r| Incident::from_row(&r))
            .ok_or_else(|| DataError::not_found("incident", id))
    }

    /// Incidents in a given state, newest first.
    pub async fn list_incidents_by_status(
        &self,
        status: IncidentStatus,
        params: ListParams,
    ) -> Result<Vec<Incident>> {
        let (limit, offset) = params.checked()?;
        let conn = self.router.read().await?;
        let rows = conn
            .query(
                r#"
                SELECT * FROM incidents
                WHERE status = $1
                ORDER BY opened_at DESC
                LIMIT $2 OFFSET $3
                "#,
                &[&status.as_str(), &limit, &offset],
            )
            .await?;
        Ok(rows.iter().map(Incident::from_row).collect())
    }

    /// Mark an open incident as being worked.
    pub async fn acknowledge_incident(&self, id: Uuid) -> Result<Incident> {
        let conn = self.router.write().await?;
        let row = conn
            .query_opt(
                r#"
                UPDATE incidents SET status = $2
                WHERE id = $1 AND status = $3
                RETURNING *
                "#,
                &[
                    &id,
                    &IncidentStatus::Acknowledged.as_str(),
                    &IncidentStatus::Open.as_str(),
                ],
            )
            .await?;
        row.map(|r| Incident::from_row(&r))
            .ok_or_else(|| DataError::not_found("open incident", id))
    }

    /// Resolve an incident.
    pub async fn resolve_incident(&self, id: Uuid) -> Result<Incident> {
        let conn = self.router.write().await?;
        let row = conn
            .query_opt(
                r#"
                UPDATE incidents SET status = $2, resolved_at = now()
                WHERE id = $1 AND status <> $2
                RETURNING *
                "#,
                &[&id, &IncidentStatus::Resolved.as_str()],
            )
            .await?;
        row.map(|r| Incident::from_row(&r))
            .ok_or_else(|| DataError::not_found("unresolved incident", id))
    }

    /// Point an incident at the runbook being used to work it.
    pub async fn attach_runbook(&self, incident_id: Uuid, runbook_id: Uuid) -> Result<Incident> {
        let conn = self.router.write().await?;
        let row = conn
            .query_opt(
                "UPDATE incidents SET runbook_id = $2 WHERE id = $1 RETURNING *",
                &[&incident_id, &runbook_id],
            )
            .await?;
        row.map(|r| Incident::from_row(&r))
            .ok_or_else(|| DataError::not_found("incident", incident_id))
    }

    // ==================== Runbooks ====================

    /// Create a runbook.
    pub async fn create_runbook(&self, new: NewRunbook) -> Result<Runbook> {
        require("name", &new.name)?;
        if !new.steps.is_array() {
            return Err(DataError::validation("steps must be a JSON array"));
        }

        let conn = self.router.write().await?;
        let row = conn
            .query_one(
                r#"
                INSERT INTO runbooks (id, name, description, steps, tags, enabled)
                VALUES ($1, $2, $3, $4, $5, true)
                RETURNING *
                "#,
                &[
                    &Uuid::new_v4(),
                    &new.name,
                    &new.description,
                    &new.steps,
                    &new.tags,
                ],
            )
            .await?;
        Ok(Runbook::from_row(&row))
    }

    /// Get a runbook by id, through the cache.
    pub async fn get_runbook(&self, id: Uuid) -> Result<Runbook> {
        let key = runbook_key(id);
        self.cache
            .read_through(&key, &[RUNBOOKS_TAG], || async {
                let conn = self.router.read().await?;
                let row = conn
                    .query_opt(
                        "SELECT * FROM runbooks WHERE id = $1 AND deleted_at IS NULL",
                        &[&id],
                    )
                    .await?;
                row.map(|r| Runbook::from_row(&r))
                    .ok_or_else(|| DataError::not_found("runbook", id))
            })
            .await
    }

    pub async fn list_runbooks(&self, params: ListParams) -> Result<Vec<Runbook>> {
        let (limit, offset) = params.checked()?;
        let conn = self.router.read().await?;
        let rows = conn
            .query(
                r#"
                SELECT * FROM runbooks
                WHERE deleted_at IS NULL
                ORDER BY name ASC
                LIMIT $1 OFFSET $2
                "#,
                &[&limit, &offset],
            )
            .await?;
        Ok(rows.iter().map(Runbook::from_row).collect())
    }

    /// Enabled runbooks carrying a tag, for matching against an
    /// incident's signals.
    pub async fn list_runbooks_by_tag(
        &self,
        tag: &str,
        params: ListParams,
    ) -> Result<Vec<Runbook>> {
        require("tag", tag)?;
        let (limit, offset) = params.checked()?;
        let conn = self.router.read().await?;
        let rows = conn
            .query(
                r#"
                SELECT * FROM runbooks
                WHERE enabled AND deleted_at IS NULL AND $1 = ANY(tags)
                ORDER BY name ASC
                LIMIT $2 OFFSET $3
                "#,
                &[&tag, &limit, &offset],
            )
            .await?;
        Ok(rows.iter().map(Runbook::from_row).collect())
    }

    /// Apply a partial update and return the stored record.
    pub async fn update_runbook(&self, id: Uuid, update: RunbookUpdate) -> Result<Runbook> {
        if update.description.is_none()
            && update.steps.is_none()
            && update.tags.is_none()
            && update.enabled.is_none()
        {
            return Err(DataError::validation("nothing to update"));
        }
        if let Some(steps) = &update.steps {
            if !steps.is_array() {
                return Err(DataError::validation("steps must be a JSON array"));
            }
        }

        let key = runbook_key(id);
        self.cache
            .write_and_invalidate(&[&key], &[], || async {
                let conn = self.router.write().await?;
                let row = conn
                    .query_opt(
                        r#"
                        UPDATE runbooks SET
                            description = COALESCE($2, description),
                            steps = COALESCE($3, steps),
                            tags = COALESCE($4, tags),
                            enabled = COALESCE($5, enabled),
                            updated_at = now()
                        WHERE id = $1 AND deleted_at IS NULL
                        RETURNING *
                        "#,
                        &[
                            &id,
                            &update.description,
                            &update.steps,
                            &update.tags,
                            &update.enabled,
                        ],
                    )
                    .await?;
                row.map(|r| Runbook::from_row(&r))
                    .ok_or_else(|| DataError::not_found("runbook", id))
            })
            .await
    }

    /// Soft-delete a runbook and drop every cached copy.
    pub async fn soft_delete_runbook(&self, id: Uuid) -> Result<()> {
        let key = runbook_key(id);
        self.cache
            .write_and_invalidate(&[&key], &[RUNBOOKS_TAG], || async {
                let conn = self.router.write().await?;
                let touched = conn
                    .execute(
                        "UPDATE runbooks SET deleted_at = now() \
                         WHERE id = $1 AND deleted_at IS NULL",
                        &[&id],
                    )
                    .await?;
                if touched == 0 {
                    return Err(DataError::not_found("runbook", id));
                }
                Ok(())
            })
            .await
    }
}
