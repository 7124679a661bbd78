//! Typed repositories over the relational store.
//!
//! One `Repository` handles every entity. Each operation validates
//! its input before any backend work, routes reads and writes through
//! the query router (and so through the circuit breakers), and uses
//! the cache-aside coordinator for the read-mostly entities: users,
//! sessions, runbooks. Audit entries additionally pass the partition
//! manager's writability check before they are inserted.

mod accounts;
mod audit_log;
mod conversations;
mod incidents;
mod records;
mod workflows;

use std::sync::Arc;

pub use records::*;

use crate::audit::AuditPartitionManager;
use crate::cache::CacheAside;
use crate::error::{DataError, Result};
use crate::router::QueryRouter;

/// Limit/offset pagination with bounds checking.
#[derive(Debug, Clone, Copy)]
pub struct ListParams {
    pub limit: i64,
    pub offset: i64,
}

impl Default for ListParams {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl ListParams {
    pub fn new(limit: i64, offset: i64) -> Self {
        Self { limit, offset }
    }

    pub(crate) fn checked(&self) -> Result<(i64, i64)> {
        if !(1..=500).contains(&self.limit) {
            return Err(DataError::validation("limit must be within 1..=500"));
        }
        if self.offset < 0 {
            return Err(DataError::validation("offset must not be negative"));
        }
        Ok((self.limit, self.offset))
    }
}

/// Typed access to every entity of the operations agent.
pub struct Repository {
    pub(crate) router: Arc<QueryRouter>,
    pub(crate) cache: Arc<CacheAside>,
    pub(crate) audit: Arc<AuditPartitionManager>,
}

impl Repository {
    pub fn new(
        router: Arc<QueryRouter>,
        cache: Arc<CacheAside>,
        audit: Arc<AuditPartitionManager>,
    ) -> Self {
        Self {
            router,
            cache,
            audit,
        }
    }
}

/// Reject empty or whitespace-only required fields.
pub(crate) fn require(field: &'static str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(DataError::validation(format!("{field} must not be empty")));
    }
    Ok(())
}

/// Minimal shape check; full address validation belongs to the caller.
pub(crate) fn require_email(value: &str) -> Result<()> {
    require("email", value)?;
    if !value.contains('@') {
        return Err(DataError::validation("email must contain '@'"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_params_are_bounded() {
        assert!(ListParams::default().checked().is_ok());
        assert!(ListParams::new(500, 0).checked().is_ok());
        assert!(ListParams::new(0, 0).checked().is_err());
        assert!(ListParams::new(501, 0).checked().is_err());
        assert!(ListParams::new(10, -1).checked().is_err());
    }

    #[test]
    fn required_fields_reject_blank_input() {
        assert!(require("role", "operator").is_ok());
        assert!(require("role", "").is_err());
        assert!(require("role", "   ").is_err());
    }

    #[test]
    fn email_needs_an_at_sign() {
        assert!(require_email("ops@example.com").is_ok());
        assert!(require_email("").is_err());
        assert!(require_email("not-an-email").is_err());
    }
}
