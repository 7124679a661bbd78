//! Workflow, execution, and step operations.

use uuid::Uuid;

use crate::error::{DataError, Result};

use super::records::{
    NewWorkflow, RunStatus, StepExecution, Workflow, WorkflowExecution, WorkflowStatus,
};
use super::{ListParams, Repository, require};

impl Repository {
    // ==================== Workflows ====================

    /// Create a workflow in draft state.
    pub async fn create_workflow(&self, new: NewWorkflow) -> Result<Workflow> {
        require("name", &new.name)?;
        if !new.definition.is_object() {
            return Err(DataError::validation("definition must be a JSON object"));
        }

        let conn = self.router.write().await?;
        let row = conn
            .query_one(
                r#"
                INSERT INTO workflows (id, name, description, definition, status, metadata)
                VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING *
                "#,
                &[
                    &Uuid::new_v4(),
                    &new.name,
                    &new.description,
                    &new.definition,
                    &WorkflowStatus::Draft.as_str(),
                    &new.metadata,
                ],
            )
            .await?;
        Ok(Workflow::from_row(&row))
    }

    pub async fn get_workflow(&self, id: Uuid) -> Result<Workflow> {
        let conn = self.router.read().await?;
        let row = conn
            .query_opt(
                "SELECT * FROM workflows WHERE id = $1 AND deleted_at IS NULL",
                &[&id],
            )
            .await?;
        row.map(|r| Workflow::from_row(&r))
            .ok_or_else(|| DataError::not_found("workflow", id))
    }

    pub async fn get_workflow_by_name(&self, name: &str) -> Result<Workflow> {
        require("name", name)?;
        let conn = self.router.read().await?;
        let row = conn
            .query_opt(
                "SELECT * FROM workflows WHERE name = $1 AND deleted_at IS NULL",
                &[&name],
            )
            .await?;
        row.map(|r| Workflow::from_row(&r))
            .ok_or_else(|| DataError::not_found("workflow", name.to_string()))
    }

    pub async fn list_workflows(&self, params: ListParams) -> Result<Vec<Workflow>> {
        let (limit, offset) = params.checked()?;
        let conn = self.router.read().await?;
        let rows = conn
            .query(
                r#"
                SELECT * FROM workflows
                WHERE deleted_at IS NULL
                ORDER BY created_at DESC
                LIMIT $1 OFFSET $2
                "#,
                &[&limit, &offset],
            )
            .await?;
        Ok(rows.iter().map(Workflow::from_row).collect())
    }

    pub async fn list_workflows_by_status(
        &self,
        status: WorkflowStatus,
        params: ListParams,
    ) -> Result<Vec<Workflow>> {
        let (limit, offset) = params.checked()?;
        let conn = self.router.read().await?;
        let rows = conn
            .query(
                r#"
                SELECT * FROM workflows
                WHERE status = $1 AND deleted_at IS NULL
                ORDER BY created_at DESC
                LIMIT $2 OFFSET $3
                "#,
                &[&status.as_str(), &limit, &offset],
            )
            .await?;
        Ok(rows.iter().map(Workflow::from_row).collect())
    }

    pub async fn update_workflow_status(&self, id: Uuid, status: WorkflowStatus) -> Result<Workflow> {
        let conn = self.router.write().await?;
        let row = conn
            .query_opt(
                r#"
                UPDATE workflows SET status = $2, updated_at = now()
                WHERE id = $1 AND deleted_at IS NULL
                RETURNING *
                "#,
                &[&id, &status.as_str()],
            )
            .await?;
        row.map(|r| Workflow::from_row(&r))
            .ok_or_else(|| DataError::not_found("workflow", id))
    }

    pub async fn update_workflow_definition(
        &self,
        id: Uuid,
        definition: serde_json::Value,
    ) -> Result<Workflow> {
        if !definition.is_object() {
            return Err(DataError::validation("definition must be a JSON object"));
        }
        let conn = self.router.write().await?;
        let row = conn
            .query_opt(
                r#"
                UPDATE workflows SET definition = $2, updated_at = now()
                WHERE id = $1 AND deleted_at IS NULL
                RETURNING *
                "#,
                &[&id, &definition],
            )
            .await?;
        row.map(|r| Workflow::from_row(&r))
            .ok_or_else(|| DataError::not_found("workflow", id))
    }

    pub async fn soft_delete_workflow(&self, id: Uuid) -> Result<()> {
        let conn = self.router.write().await?;
        let touched = conn
            .execute(
                "UPDATE workflows SET deleted_at = now() WHERE id = $1 AND deleted_at IS NULL",
                &[&id],
            )
            .await?;
        if touched == 0 {
            return Err(DataError::not_found("workflow", id));
        }
        Ok(())
    }

    // ==================== Executions ====================

    /// Start a run of a workflow.
    pub async fn start_execution(
        &self,
        workflow_id: Uuid,
        triggered_by: Option<String>,
    ) -> Result<WorkflowExecution> {
        let conn = self.router.write().await?;
        let row = conn
            .query_one(
                r#"
                INSERT INTO workflow_executions (id, workflow_id, status, triggered_by)
                VALUES ($1, $2, $3, $4)
                RETURNING *
                "#,
                &[
                    &Uuid::new_v4(),
                    &workflow_id,
                    &RunStatus::Running.as_str(),
                    &triggered_by,
                ],
            )
            .await?;
        Ok(WorkflowExecution::from_row(&row))
    }

    pub async fn get_execution(&self, id: Uuid) -> Result<WorkflowExecution> {
        let conn = self.router.read().await?;
        let row = conn
            .query_opt("SELECT * FROM workflow_executions WHERE id = $1", &[&id])
            .await?;
        row.map(|r| WorkflowExecution::from_row(&r))
            .ok_or_else(|| DataError::not_found("workflow execution", id))
    }

    /// A workflow's runs, newest first.
    pub async fn list_executions(
        &self,
        workflow_id: Uuid,
        params: ListParams,
    ) -> Result<Vec<WorkflowExecution>> {
        let (limit, offset) = params.checked()?;
        let conn = self.router.read().await?;
        let rows = conn
            .query(
                r#"
                SELECT * FROM workflow_executions
                WHERE workflow_id = $1
                ORDER BY started_at DESC
                LIMIT $2 OFFSET $3
                "#,
                &[&workflow_id, &limit, &offset],
            )
            .await?;
        Ok(rows.iter().map(WorkflowExecution::from_row).collect())
    }

    /// Finish a run. `outcome` must be terminal; a run can only be
    /// completed once.
    pub async fn complete_execution(
        &self,
        id: Uuid,
        outcome: RunStatus,
        error: Option<String>,
    ) -> Result<WorkflowExecution> {
        if !outcome.is_terminal() {
            return Err(DataError::validation(format!(
                "{} is not a terminal status",
                outcome.as_str()
            )));
        }
        let conn = self.router.write().await?;
        let row = conn
            .query_opt(
                r#"
                UPDATE workflow_executions
                SET status = $2, error = $3, completed_at = now()
                WHERE id = $1 AND completed_at IS NULL
                RETURNING *
                "#,
                &[&id, &outcome.as_str(), &error],
            )
            .await?;
        row.map(|r| WorkflowExecution::from_row(&r))
            .ok_or_else(|| DataError::not_found("running workflow execution", id))
    }

    // ==================== Steps ====================

    /// Record the start of one step inside a run.
    pub async fn start_step(
        &self,
        execution_id: Uuid,
        step_name: &str,
        seq: i32,
        input: serde_json::Value,
    ) -> Result<StepExecution> {
        require("step_name", step_name)?;
        if seq < 0 {
            return Err(DataError::validation("seq must not be negative"));
        }

        let conn = self.router.write().await?;
        let row = conn
            .query_one(
                r#"
                INSERT INTO step_executions (id, execution_id, step_name, seq, status, input)
                VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING *
                "#,
                &[
                    &Uuid::new_v4(),
                    &execution_id,
                    &step_name,
                    &seq,
                    &RunStatus::Running.as_str(),
                    &input,
                ],
            )
            .await?;
        Ok(StepExecution::from_row(&row))
    }

    /// Finish one step.
    pub async fn complete_step(
        &self,
        id: Uuid,
        outcome: RunStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<StepExecution> {
        if !outcome.is_terminal() {
            return Err(DataError::validation(format!(
                "{} is not a terminal status",
                outcome.as_str()
            )));
        }
        let conn = self.router.write().await?;
        let row = conn
            .query_opt(
                r#"
                UPDATE step_executions
                SET status = $2, output = $3, error = $4, completed_at = now()
                WHERE id = $1 AND completed_at IS NULL
                RETURNING *
                "#,
                &[&id, &outcome.as_str(), &output, &error],
            )
            .await?;
        row.map(|r| StepExecution::from_row(&r))
            .ok_or_else(|| DataError::not_found("running step execution", id))
    }

    /// A run's steps in execution order.
    pub async fn list_steps(&self, execution_id: Uuid) -> Result<Vec<StepExecution>> {
        let conn = self.router.read().await?;
        let rows = conn
            .query(
                "SELECT * FROM step_executions WHERE execution_id = $1 ORDER BY seq ASC",
                &[&execution_id],
            )
            .await?;
        Ok(rows.iter().map(StepExecution::from_row).collect())
    }
}
