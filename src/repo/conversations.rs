//! Conversation and message operations.
//!
//! Messages are an append-only transcript: there is no update or
//! delete for them, matching how the agent replays history.

use uuid::Uuid;

use crate::error::{DataError, Result};

use super::records::{Conversation, Message, NewMessage};
use super::{ListParams, Repository, require};

impl Repository {
    // ==================== Conversations ====================

    /// Start a conversation.
    pub async fn create_conversation(
        &self,
        user_id: Uuid,
        session_id: Option<Uuid>,
        title: Option<String>,
        metadata: serde_json::Value,
    ) -> Result<Conversation> {
        if let Some(title) = &title {
            require("title", title)?;
        }

        let conn = self.router.write().await?;
        let row = conn
            .query_one(
                r#"
                INSERT INTO conversations (id, user_id, session_id, title, metadata)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING *
                "#,
                &[&Uuid::new_v4(), &user_id, &session_id, &title, &metadata],
            )
            .await?;
        Ok(Conversation::from_row(&row))
    }

    pub async fn get_conversation(&self, id: Uuid) -> Result<Conversation> {
        let conn = self.router.read().await?;
        let row = conn
            .query_opt(
                "SELECT * FROM conversations WHERE id = $1 AND archived_at IS NULL",
                &[&id],
            )
            .await?;
        row.map(|r| Conversation::from_row(&r))
            .ok_or_else(|| DataError::not_found("conversation", id))
    }

    /// List a user's conversations, most recently active first.
    pub async fn list_conversations_for_user(
        &self,
        user_id: Uuid,
        params: ListParams,
    ) -> Result<Vec<Conversation>> {
        let (limit, offset) = params.checked()?;
        let conn = self.router.read().await?;
        let rows = conn
            .query(
                r#"
                SELECT * FROM conversations
                WHERE user_id = $1 AND archived_at IS NULL
                ORDER BY last_activity DESC
                LIMIT $2 OFFSET $3
                "#,
                &[&user_id, &limit, &offset],
            )
            .await?;
        Ok(rows.iter().map(Conversation::from_row).collect())
    }

    pub async fn update_conversation_title(&self, id: Uuid, title: &str) -> Result<()> {
        require("title", title)?;
        let conn = self.router.write().await?;
        let touched = conn
            .execute(
                "UPDATE conversations SET title = $2 WHERE id = $1 AND archived_at IS NULL",
                &[&id, &title],
            )
            .await?;
        if touched == 0 {
            return Err(DataError::not_found("conversation", id));
        }
        Ok(())
    }

    pub async fn update_conversation_metadata(
        &self,
        id: Uuid,
        metadata: serde_json::Value,
    ) -> Result<()> {
        let conn = self.router.write().await?;
        let touched = conn
            .execute(
                "UPDATE conversations SET metadata = $2 WHERE id = $1 AND archived_at IS NULL",
                &[&id, &metadata],
            )
            .await?;
        if touched == 0 {
            return Err(DataError::not_found("conversation", id));
        }
        Ok(())
    }

    /// Bump a conversation's activity timestamp.
    pub async fn touch_conversation(&self, id: Uuid) -> Result<()> {
        let conn = self.router.write().await?;
        conn.execute(
            "UPDATE conversations SET last_activity = now() WHERE id = $1",
            &[&id],
        )
        .await?;
        Ok(())
    }

    /// Soft-delete a conversation; its messages stay for audit.
    pub async fn archive_conversation(&self, id: Uuid) -> Result<()> {
        let conn = self.router.write().await?;
        let touched = conn
            .execute(
                "UPDATE conversations SET archived_at = now() \
                 WHERE id = $1 AND archived_at IS NULL",
                &[&id],
            )
            .await?;
        if touched == 0 {
            return Err(DataError::not_found("conversation", id));
        }
        Ok(())
    }

    // ==================== Messages ====================

    /// Append a message and bump the conversation's activity.
    pub async fn create_message(&self, new: NewMessage) -> Result<Message> {
        require("role", &new.role)?;
        require("content", &new.content)?;

        let conn = self.router.write().await?;
        let row = conn
            .query_one(
                r#"
                INSERT INTO messages (id, conversation_id, role, content, metadata)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING *
                "#,
                &[
                    &Uuid::new_v4(),
                    &new.conversation_id,
                    &new.role,
                    &new.content,
                    &new.metadata,
                ],
            )
            .await?;
        conn.execute(
            "UPDATE conversations SET last_activity = now() WHERE id = $1",
            &[&new.conversation_id],
        )
        .await?;
        Ok(Message::from_row(&row))
    }

    pub async fn get_message(&self, id: Uuid) -> Result<Message> {
        let conn = self.router.read().await?;
        let row = conn
            .query_opt("SELECT * FROM messages WHERE id = $1", &[&id])
            .await?;
        row.map(|r| Message::from_row(&r))
            .ok_or_else(|| DataError::not_found("message", id))
    }

    /// A conversation's messages in chronological order.
    pub async fn list_messages(
        &self,
        conversation_id: Uuid,
        params: ListParams,
    ) -> Result<Vec<Message>> {
        let (limit, offset) = params.checked()?;
        let conn = self.router.read().await?;
        let rows = conn
            .query(
                r#"
                SELECT * FROM messages
                WHERE conversation_id = $1
                ORDER BY created_at ASC
                LIMIT $2 OFFSET $3
                "#,
                &[&conversation_id, &limit, &offset],
            )
            .await?;
        Ok(rows.iter().map(Message::from_row).collect())
    }

    pub async fn count_messages(&self, conversation_id: Uuid) -> Result<i64> {
        let conn = self.router.read().await?;
        let row = conn
            .query_one(
                "SELECT COUNT(*) AS n FROM messages WHERE conversation_id = $1",
                &[&conversation_id],
            )
            .await?;
        Ok(row.get("n"))
    }
}
