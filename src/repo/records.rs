//! Entity records for the operations agent.
//!
//! Rows map to these structs one-to-one. Everything derives serde so
//! cacheable records serialize straight into the key-value store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_postgres::Row;
use uuid::Uuid;

/// An operator or service account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    pub role: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl User {
    pub(crate) fn from_row(row: &Row) -> Self {
        Self {
            id: row.get("id"),
            email: row.get("email"),
            display_name: row.get("display_name"),
            role: row.get("role"),
            metadata: row.get("metadata"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            deleted_at: row.get("deleted_at"),
        }
    }
}

/// Fields for creating a user.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub display_name: Option<String>,
    pub role: String,
    pub metadata: serde_json::Value,
}

/// Partial update for a user; `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub display_name: Option<String>,
    pub role: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// An authenticated session. Expired or revoked sessions are never
/// returned by lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub channel: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Session {
    pub(crate) fn from_row(row: &Row) -> Self {
        Self {
            id: row.get("id"),
            user_id: row.get("user_id"),
            channel: row.get("channel"),
            metadata: row.get("metadata"),
            created_at: row.get("created_at"),
            expires_at: row.get("expires_at"),
            revoked_at: row.get("revoked_at"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewSession {
    pub user_id: Uuid,
    pub channel: String,
    pub metadata: serde_json::Value,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A conversation between a user and the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub session_id: Option<Uuid>,
    pub user_id: Uuid,
    pub title: Option<String>,
    pub metadata: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl Conversation {
    pub(crate) fn from_row(row: &Row) -> Self {
        Self {
            id: row.get("id"),
            session_id: row.get("session_id"),
            user_id: row.get("user_id"),
            title: row.get("title"),
            metadata: row.get("metadata"),
            started_at: row.get("started_at"),
            last_activity: row.get("last_activity"),
            archived_at: row.get("archived_at"),
        }
    }
}

/// One message in a conversation. Messages are append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: String,
    pub content: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub(crate) fn from_row(row: &Row) -> Self {
        Self {
            id: row.get("id"),
            conversation_id: row.get("conversation_id"),
            role: row.get("role"),
            content: row.get("content"),
            metadata: row.get("metadata"),
            created_at: row.get("created_at"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub role: String,
    pub content: String,
    pub metadata: serde_json::Value,
}

/// Lifecycle of a workflow definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Draft,
    Active,
    Disabled,
}

impl WorkflowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Draft => "draft",
            WorkflowStatus::Active => "active",
            WorkflowStatus::Disabled => "disabled",
        }
    }

    pub(crate) fn parse(s: &str) -> Self {
        match s {
            "active" => WorkflowStatus::Active,
            "disabled" => WorkflowStatus::Disabled,
            _ => WorkflowStatus::Draft,
        }
    }
}

/// An automation definition the agent can run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub definition: serde_json::Value,
    pub status: WorkflowStatus,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Workflow {
    pub(crate) fn from_row(row: &Row) -> Self {
        let status: String = row.get("status");
        Self {
            id: row.get("id"),
            name: row.get("name"),
            description: row.get("description"),
            definition: row.get("definition"),
            status: WorkflowStatus::parse(&status),
            metadata: row.get("metadata"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            deleted_at: row.get("deleted_at"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewWorkflow {
    pub name: String,
    pub description: Option<String>,
    pub definition: serde_json::Value,
    pub metadata: serde_json::Value,
}

/// Lifecycle of one run, shared by executions and their steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub(crate) fn parse(s: &str) -> Self {
        match s {
            "running" => RunStatus::Running,
            "succeeded" => RunStatus::Succeeded,
            "failed" => RunStatus::Failed,
            "cancelled" => RunStatus::Cancelled,
            _ => RunStatus::Pending,
        }
    }
}

/// One run of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub status: RunStatus,
    pub triggered_by: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    pub(crate) fn from_row(row: &Row) -> Self {
        let status: String = row.get("status");
        Self {
            id: row.get("id"),
            workflow_id: row.get("workflow_id"),
            status: RunStatus::parse(&status),
            triggered_by: row.get("triggered_by"),
            error: row.get("error"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
        }
    }
}

/// One step inside a workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub step_name: String,
    pub seq: i32,
    pub status: RunStatus,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepExecution {
    pub(crate) fn from_row(row: &Row) -> Self {
        let status: String = row.get("status");
        Self {
            id: row.get("id"),
            execution_id: row.get("execution_id"),
            step_name: row.get("step_name"),
            seq: row.get("seq"),
            status: RunStatus::parse(&status),
            input: row.get("input"),
            output: row.get("output"),
            error: row.get("error"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl IncidentSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            IncidentSeverity::Low => "low",
            IncidentSeverity::Medium => "medium",
            IncidentSeverity::High => "high",
            IncidentSeverity::Critical => "critical",
        }
    }

    pub(crate) fn parse(s: &str) -> Self {
        match s {
            "medium" => IncidentSeverity::Medium,
            "high" => IncidentSeverity::High,
            "critical" => IncidentSeverity::Critical,
            _ => IncidentSeverity::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Open,
    Acknowledged,
    Resolved,
}

impl IncidentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IncidentStatus::Open => "open",
            IncidentStatus::Acknowledged => "acknowledged",
            IncidentStatus::Resolved => "resolved",
        }
    }

    pub(crate) fn parse(s: &str) -> Self {
        match s {
            "acknowledged" => IncidentStatus::Acknowledged,
            "resolved" => IncidentStatus::Resolved,
            _ => IncidentStatus::Open,
        }
    }
}

/// An operational incident the agent is tracking or working.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub title: String,
    pub severity: IncidentSeverity,
    pub status: IncidentStatus,
    pub source: Option<String>,
    pub runbook_id: Option<Uuid>,
    pub metadata: serde_json::Value,
    pub opened_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Incident {
    pub(crate) fn from_row(row: &Row) -> Self {
        let severity: String = row.get("severity");
        let status: String = row.get("status");
        Self {
            id: row.get("id"),
            title: row.get("title"),
            severity: IncidentSeverity::parse(&severity),
            status: IncidentStatus::parse(&status),
            source: row.get("source"),
            runbook_id: row.get("runbook_id"),
            metadata: row.get("metadata"),
            opened_at: row.get("opened_at"),
            resolved_at: row.get("resolved_at"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewIncident {
    pub title: String,
    pub severity: IncidentSeverity,
    pub source: Option<String>,
    pub runbook_id: Option<Uuid>,
    pub metadata: serde_json::Value,
}

/// A remediation procedure the agent can follow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runbook {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub steps: serde_json::Value,
    pub tags: Vec<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Runbook {
    pub(crate) fn from_row(row: &Row) -> Self {
        Self {
            id: row.get("id"),
            name: row.get("name"),
            description: row.get("description"),
            steps: row.get("steps"),
            tags: row.get("tags"),
            enabled: row.get("enabled"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            deleted_at: row.get("deleted_at"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewRunbook {
    pub name: String,
    pub description: Option<String>,
    pub steps: serde_json::Value,
    pub tags: Vec<String>,
}

/// Partial update for a runbook; `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct RunbookUpdate {
    pub description: Option<String>,
    pub steps: Option<serde_json::Value>,
    pub tags: Option<Vec<String>>,
    pub enabled: Option<bool>,
}

/// One immutable audit record. There is deliberately no update or
/// delete for these anywhere in the crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub actor: String,
    pub action: String,
    pub entity_kind: String,
    pub entity_id: Option<String>,
    pub detail: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl AuditLogEntry {
    pub(crate) fn from_row(row: &Row) -> Self {
        Self {
            id: row.get("id"),
            actor: row.get("actor"),
            action: row.get("action"),
            entity_kind: row.get("entity_kind"),
            entity_id: row.get("entity_id"),
            detail: row.get("detail"),
            recorded_at: row.get("recorded_at"),
        }
    }
}

/// Fields for appending an audit record. The timestamp is stamped by
/// the partition manager's clock at insert time.
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub actor: String,
    pub action: String,
    pub entity_kind: String,
    pub entity_id: Option<String>,
    pub detail: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_round_trip_their_wire_form() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Succeeded,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), status);
        }
        for status in [
            IncidentStatus::Open,
            IncidentStatus::Acknowledged,
            IncidentStatus::Resolved,
        ] {
            assert_eq!(IncidentStatus::parse(status.as_str()), status);
        }
        for severity in [
            IncidentSeverity::Low,
            IncidentSeverity::Medium,
            IncidentSeverity::High,
            IncidentSeverity::Critical,
        ] {
            assert_eq!(IncidentSeverity::parse(severity.as_str()), severity);
        }
    }

    #[test]
    fn terminal_run_states() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn unknown_wire_values_fall_back_conservatively() {
        assert_eq!(RunStatus::parse("???"), RunStatus::Pending);
        assert_eq!(WorkflowStatus::parse("???"), WorkflowStatus::Draft);
        assert_eq!(IncidentStatus::parse("???"), IncidentStatus::Open);
    }
}
