//! User and session operations.

use uuid::Uuid;

use crate::error::{DataError, Result};

use super::records::{NewSession, NewUser, Session, User, UserUpdate};
use super::{ListParams, Repository, require, require_email};

fn user_key(id: Uuid) -> String {
    format!("user:{id}")
}

fn session_key(id: Uuid) -> String {
    format!("session:{id}")
}

fn user_sessions_tag(user_id: Uuid) -> String {
    format!("user-sessions:{user_id}")
}

impl Repository {
    // ==================== Users ====================

    /// Create a user.
    pub async fn create_user(&self, new: NewUser) -> Result<User> {
        require_email(&new.email)?;
        require("role", &new.role)?;

        let conn = self.router.write().await?;
        let row = conn
            .query_one(
                r#"
                INSERT INTO users (id, email, display_name, role, metadata)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING *
                "#,
                &[
                    &Uuid::new_v4(),
                    &new.email,
                    &new.display_name,
                    &new.role,
                    &new.metadata,
                ],
            )
            .await?;
        Ok(User::from_row(&row))
    }

    /// Get a user by id, through the cache.
    pub async fn get_user(&self, id: Uuid) -> Result<User> {
        let key = user_key(id);
        self.cache
            .read_through(&key, &[], || async {
                let conn = self.router.read().await?;
                let row = conn
                    .query_opt(
                        "SELECT * FROM users WHERE id = $1 AND deleted_at IS NULL",
                        &[&id],
                    )
                    .await?;
                row.map(|r| User::from_row(&r))
                    .ok_or_else(|| DataError::not_found("user", id))
            })
            .await
    }

    /// Get a user from the primary, bypassing both the cache and the
    /// replicas. For callers that must not see replication lag.
    pub async fn get_user_fresh(&self, id: Uuid) -> Result<User> {
        let conn = self.router.read_primary().await?;
        let row = conn
            .query_opt(
                "SELECT * FROM users WHERE id = $1 AND deleted_at IS NULL",
                &[&id],
            )
            .await?;
        row.map(|r| User::from_row(&r))
            .ok_or_else(|| DataError::not_found("user", id))
    }

    /// List users, newest first.
    pub async fn list_users(&self, params: ListParams) -> Result<Vec<User>> {
        let (limit, offset) = params.checked()?;
        let conn = self.router.read().await?;
        let rows = conn
            .query(
                r#"
                SELECT * FROM users
                WHERE deleted_at IS NULL
                ORDER BY created_at DESC
                LIMIT $1 OFFSET $2
                "#,
                &[&limit, &offset],
            )
            .await?;
        Ok(rows.iter().map(User::from_row).collect())
    }

    /// Apply a partial update and return the stored record.
    pub async fn update_user(&self, id: Uuid, update: UserUpdate) -> Result<User> {
        if update.display_name.is_none() && update.role.is_none() && update.metadata.is_none() {
            return Err(DataError::validation("nothing to update"));
        }
        if let Some(role) = &update.role {
            require("role", role)?;
        }

        let key = user_key(id);
        self.cache
            .write_and_invalidate(&[&key], &[], || async {
                let conn = self.router.write().await?;
                let row = conn
                    .query_opt(
                        r#"
                        UPDATE users SET
                            display_name = COALESCE($2, display_name),
                            role = COALESCE($3, role),
                            metadata = COALESCE($4, metadata),
                            updated_at = now()
                        WHERE id = $1 AND deleted_at IS NULL
                        RETURNING *
                        "#,
                        &[&id, &update.display_name, &update.role, &update.metadata],
                    )
                    .await?;
                row.map(|r| User::from_row(&r))
                    .ok_or_else(|| DataError::not_found("user", id))
            })
            .await
    }

    /// Soft-delete a user. Lookups stop returning it; the row stays
    /// for referential integrity.
    pub async fn soft_delete_user(&self, id: Uuid) -> Result<()> {
        let key = user_key(id);
        self.cache
            .write_and_invalidate(&[&key], &[], || async {
                let conn = self.router.write().await?;
                let touched = conn
                    .execute(
                        "UPDATE users SET deleted_at = now() WHERE id = $1 AND deleted_at IS NULL",
                        &[&id],
                    )
                    .await?;
                if touched == 0 {
                    return Err(DataError::not_found("user", id));
                }
                Ok(())
            })
            .await
    }

    // ==================== Sessions ====================

    /// Create a session for a user.
    pub async fn create_session(&self, new: NewSession) -> Result<Session> {
        require("channel", &new.channel)?;

        let conn = self.router.write().await?;
        let row = conn
            .query_one(
                r#"
                INSERT INTO sessions (id, user_id, channel, metadata, expires_at)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING *
                "#,
                &[
                    &Uuid::new_v4(),
                    &new.user_id,
                    &new.channel,
                    &new.metadata,
                    &new.expires_at,
                ],
            )
            .await?;
        Ok(Session::from_row(&row))
    }

    /// Get a live session by id, through the cache. Cached entries
    /// are tagged by owning user so a bulk revoke can drop them all.
    pub async fn get_session(&self, id: Uuid) -> Result<Session> {
        let key = session_key(id);
        self.cache
            .read_through_with_tags(
                &key,
                || async {
                    let conn = self.router.read().await?;
                    let row = conn
                        .query_opt(
                            r#"
                            SELECT * FROM sessions
                            WHERE id = $1
                              AND revoked_at IS NULL
                              AND (expires_at IS NULL OR expires_at > now())
                            "#,
                            &[&id],
                        )
                        .await?;
                    row.map(|r| Session::from_row(&r))
                        .ok_or_else(|| DataError::not_found("session", id))
                },
                |session: &Session| vec![user_sessions_tag(session.user_id)],
            )
            .await
    }

    /// List a user's live sessions, newest first.
    pub async fn list_sessions_for_user(
        &self,
        user_id: Uuid,
        params: ListParams,
    ) -> Result<Vec<Session>> {
        let (limit, offset) = params.checked()?;
        let conn = self.router.read().await?;
        let rows = conn
            .query(
                r#"
                SELECT * FROM sessions
                WHERE user_id = $1
                  AND revoked_at IS NULL
                  AND (expires_at IS NULL OR expires_at > now())
                ORDER BY created_at DESC
                LIMIT $2 OFFSET $3
                "#,
                &[&user_id, &limit, &offset],
            )
            .await?;
        Ok(rows.iter().map(Session::from_row).collect())
    }

    /// Replace a session's metadata.
    pub async fn update_session_metadata(
        &self,
        id: Uuid,
        metadata: serde_json::Value,
    ) -> Result<Session> {
        let key = session_key(id);
        self.cache
            .write_and_invalidate(&[&key], &[], || async {
                let conn = self.router.write().await?;
                let row = conn
                    .query_opt(
                        r#"
                        UPDATE sessions SET metadata = $2
                        WHERE id = $1 AND revoked_at IS NULL
                        RETURNING *
                        "#,
                        &[&id, &metadata],
                    )
                    .await?;
                row.map(|r| Session::from_row(&r))
                    .ok_or_else(|| DataError::not_found("session", id))
            })
            .await
    }

    /// Revoke one session.
    pub async fn revoke_session(&self, id: Uuid) -> Result<()> {
        let key = session_key(id);
        self.cache
            .write_and_invalidate(&[&key], &[], || async {
                let conn = self.router.write().await?;
                let touched = conn
                    .execute(
                        "UPDATE sessions SET revoked_at = now() \
                         WHERE id = $1 AND revoked_at IS NULL",
                        &[&id],
                    )
                    .await?;
                if touched == 0 {
                    return Err(DataError::not_found("session", id));
                }
                Ok(())
            })
            .await
    }

    /// Revoke every live session of a user. One logical change; the
    /// shared tag invalidates every cached session without
    /// enumerating keys.
    pub async fn revoke_sessions_for_user(&self, user_id: Uuid) -> Result<u64> {
        let tag = user_sessions_tag(user_id);
        self.cache
            .write_and_invalidate(&[], &[&tag], || async {
                let conn = self.router.write().await?;
                conn.execute(
                    "UPDATE sessions SET revoked_at = now() \
                     WHERE user_id = $1 AND revoked_at IS NULL",
                    &[&user_id],
                )
                .await
            })
            .await
    }

    /// Hard-delete sessions whose expiry has passed. Returns how many
    /// rows went; run this from a periodic job.
    pub async fn delete_expired_sessions(&self) -> Result<u64> {
        let conn = self.router.write().await?;
        conn.execute(
            "DELETE FROM sessions WHERE expires_at IS NOT NULL AND expires_at < now()",
            &[],
        )
        .await
    }
}
