//! Chat persistence core (§4.6): conversations, messages, reactions,
//! mentions, threads, pinning, history, DM blocking. Multi-step writes are
//! transactional at the storage layer; bus/audit publication is post-commit
//! and never rolls back the message on failure, matching the audit engine's
//! own persistence-before-publish ordering in [`crate::audit`].

use crate::audit::{AuditEngine, AuditEventDraft};
use crate::cache::MessageHistoryCache;
use crate::error::{AppError, AppResult};
use crate::models::{
    validate_message_content, AuditCategory, AuditSeverity, Conversation, ConversationType, MemberRole,
    Message, MessageReaction, MessageView, ReactionGroup,
};
use chrono::Utc;
use redis::aio::ConnectionManager;
use regex::Regex;
use serde_json::json;
use sqlx::{Pool, Postgres, Row};
use std::sync::{Arc, OnceLock};

#[derive(Debug, Clone, serde::Serialize)]
pub struct ConversationStats {
    pub message_count: i64,
    pub pinned_count: i64,
    pub thread_message_count: i64,
    pub reaction_count: i64,
}

fn mention_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"@([A-Za-z0-9_-]{3,50})").unwrap())
}

/// Extracts candidate usernames from `@token` occurrences (§4.6, §9 resolution
/// #4: this is the single extraction site; nothing else scans for mentions).
pub fn extract_mention_candidates(content: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    mention_regex()
        .captures_iter(content)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

pub struct ChatService {
    db: Pool<Postgres>,
    cache: ConnectionManager,
    history_cache: MessageHistoryCache,
    audit: Arc<AuditEngine>,
}

impl ChatService {
    pub fn new(db: Pool<Postgres>, cache: ConnectionManager, audit: Arc<AuditEngine>) -> Self {
        Self {
            db,
            cache,
            history_cache: MessageHistoryCache::new(std::time::Duration::from_secs(5)),
            audit,
        }
    }

    // ------------------------------------------------------------
    // Conversations & membership
    // ------------------------------------------------------------

    pub async fn get_or_create_dm(&self, user_a: i64, user_b: i64) -> AppResult<i64> {
        if user_a == user_b {
            return Err(AppError::Validation("cannot open a DM with yourself".into()));
        }
        let (u1, u2) = if user_a < user_b { (user_a, user_b) } else { (user_b, user_a) };

        if let Some(row) = sqlx::query("SELECT id FROM conversations WHERE dm_user1_id = $1 AND dm_user2_id = $2")
            .bind(u1)
            .bind(u2)
            .fetch_optional(&self.db)
            .await
            .map_err(|e| AppError::Internal(e.into()))?
        {
            return Ok(row.get::<i64, _>("id"));
        }

        let mut tx = self.db.begin().await.map_err(|e| AppError::Internal(e.into()))?;
        let id: i64 = sqlx::query_scalar(
            r#"INSERT INTO conversations (conversation_type, dm_user1_id, dm_user2_id, member_count)
               VALUES ('direct_message', $1, $2, 2)
               ON CONFLICT (dm_user1_id, dm_user2_id) WHERE conversation_type = 'direct_message' DO NOTHING
               RETURNING id"#,
        )
        .bind(u1)
        .bind(u2)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::Internal(e.into()))?
        .unwrap_or(0);

        let id = if id == 0 {
            sqlx::query_scalar("SELECT id FROM conversations WHERE dm_user1_id = $1 AND dm_user2_id = $2")
                .bind(u1)
                .bind(u2)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| AppError::Internal(e.into()))?
        } else {
            for (user_id, role) in [(u1, MemberRole::Member), (u2, MemberRole::Member)] {
                sqlx::query(
                    "INSERT INTO conversation_members (conversation_id, user_id, role) VALUES ($1, $2, $3)
                     ON CONFLICT DO NOTHING",
                )
                .bind(id)
                .bind(user_id)
                .bind(role.as_str())
                .execute(&mut *tx)
                .await
                .map_err(|e| AppError::Internal(e.into()))?;
            }
            id
        };

        tx.commit().await.map_err(|e| AppError::Internal(e.into()))?;
        Ok(id)
    }

    pub async fn create_conversation(
        &self,
        owner_id: i64,
        name: &str,
        conv_type: ConversationType,
        is_public: bool,
        max_members: i32,
    ) -> AppResult<i64> {
        if matches!(conv_type, ConversationType::DirectMessage) {
            return Err(AppError::Validation("use get_or_create_dm for direct messages".into()));
        }
        let mut tx = self.db.begin().await.map_err(|e| AppError::Internal(e.into()))?;
        let id: i64 = sqlx::query_scalar(
            r#"INSERT INTO conversations (conversation_type, name, owner_id, is_public, max_members, member_count)
               VALUES ($1, $2, $3, $4, $5, 1) RETURNING id"#,
        )
        .bind(conv_type.as_str())
        .bind(name)
        .bind(owner_id)
        .bind(is_public)
        .bind(max_members)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::Internal(e.into()))?;

        sqlx::query("INSERT INTO conversation_members (conversation_id, user_id, role) VALUES ($1, $2, $3)")
            .bind(id)
            .bind(owner_id)
            .bind(MemberRole::Owner.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::Internal(e.into()))?;

        tx.commit().await.map_err(|e| AppError::Internal(e.into()))?;
        Ok(id)
    }

    pub async fn add_member(&self, conversation_id: i64, user_id: i64, role: MemberRole) -> AppResult<()> {
        let max_members: i32 = sqlx::query_scalar("SELECT max_members FROM conversations WHERE id = $1")
            .bind(conversation_id)
            .fetch_optional(&self.db)
            .await
            .map_err(|e| AppError::Internal(e.into()))?
            .ok_or_else(|| AppError::NotFound("conversation not found".into()))?;

        if max_members > 0 {
            let current: i32 = sqlx::query_scalar("SELECT member_count FROM conversations WHERE id = $1")
                .bind(conversation_id)
                .fetch_one(&self.db)
                .await
                .map_err(|e| AppError::Internal(e.into()))?;
            if current >= max_members {
                return Err(AppError::Conflict("conversation is at capacity".into()));
            }
        }

        let mut tx = self.db.begin().await.map_err(|e| AppError::Internal(e.into()))?;
        let inserted = sqlx::query(
            "INSERT INTO conversation_members (conversation_id, user_id, role) VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(role.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::Internal(e.into()))?;

        if inserted.rows_affected() > 0 {
            sqlx::query("UPDATE conversations SET member_count = member_count + 1 WHERE id = $1")
                .bind(conversation_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| AppError::Internal(e.into()))?;
        }
        tx.commit().await.map_err(|e| AppError::Internal(e.into()))?;
        Ok(())
    }

    pub async fn get_conversation(&self, conversation_id: i64, viewer_id: i64) -> AppResult<Conversation> {
        self.member_role(conversation_id, viewer_id).await?;
        sqlx::query_as::<_, Conversation>("SELECT * FROM conversations WHERE id = $1")
            .bind(conversation_id)
            .fetch_optional(&self.db)
            .await
            .map_err(|e| AppError::Internal(e.into()))?
            .ok_or_else(|| AppError::NotFound("conversation not found".into()))
    }

    /// Non-DM conversations `user_id` belongs to, newest activity first.
    pub async fn list_rooms(&self, user_id: i64) -> AppResult<Vec<Conversation>> {
        sqlx::query_as::<_, Conversation>(
            r#"SELECT c.* FROM conversations c
               JOIN conversation_members m ON m.conversation_id = c.id
               WHERE m.user_id = $1 AND c.conversation_type != 'direct_message'
               ORDER BY c.last_message_at DESC NULLS LAST, c.created_at DESC"#,
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await
        .map_err(|e| AppError::Internal(e.into()))
    }

    pub async fn list_dms(&self, user_id: i64) -> AppResult<Vec<Conversation>> {
        sqlx::query_as::<_, Conversation>(
            r#"SELECT * FROM conversations WHERE conversation_type = 'direct_message'
               AND (dm_user1_id = $1 OR dm_user2_id = $1)
               ORDER BY last_message_at DESC NULLS LAST, created_at DESC"#,
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await
        .map_err(|e| AppError::Internal(e.into()))
    }

    pub async fn rename_room(&self, conversation_id: i64, actor_id: i64, name: &str) -> AppResult<()> {
        let role = self.member_role(conversation_id, actor_id).await?;
        if !role.can_moderate() {
            return Err(AppError::Permission);
        }
        sqlx::query("UPDATE conversations SET name = $2 WHERE id = $1 AND conversation_type != 'direct_message'")
            .bind(conversation_id)
            .bind(name)
            .execute(&self.db)
            .await
            .map_err(|e| AppError::Internal(e.into()))?;
        Ok(())
    }

    pub async fn archive_room(&self, conversation_id: i64, actor_id: i64) -> AppResult<()> {
        let role = self.member_role(conversation_id, actor_id).await?;
        if !role.can_moderate() {
            return Err(AppError::Permission);
        }
        sqlx::query("UPDATE conversations SET is_archived = TRUE WHERE id = $1")
            .bind(conversation_id)
            .execute(&self.db)
            .await
            .map_err(|e| AppError::Internal(e.into()))?;

        self.publish_audit(conversation_id, Some(actor_id), "room_archived", json!({}), AuditSeverity::Warning).await;
        Ok(())
    }

    async fn member_role(&self, conversation_id: i64, user_id: i64) -> AppResult<MemberRole> {
        let role: Option<String> = sqlx::query_scalar(
            "SELECT role FROM conversation_members WHERE conversation_id = $1 AND user_id = $2",
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&self.db)
        .await
        .map_err(|e| AppError::Internal(e.into()))?;
        role.map(|r| MemberRole::from_str_loose(&r)).ok_or(AppError::Permission)
    }

    // ------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------

    async fn dm_blocked(&self, conversation_id: i64) -> AppResult<bool> {
        let blocked: Option<bool> = sqlx::query_scalar(
            "SELECT dm_is_blocked FROM conversations WHERE id = $1 AND conversation_type = 'direct_message'",
        )
        .bind(conversation_id)
        .fetch_optional(&self.db)
        .await
        .map_err(|e| AppError::Internal(e.into()))?;
        Ok(blocked.unwrap_or(false))
    }

    pub async fn send_message(
        &self,
        conversation_id: i64,
        author_id: i64,
        content: &str,
        parent_message_id: Option<i64>,
        metadata: Option<serde_json::Value>,
    ) -> AppResult<Message> {
        self.member_role(conversation_id, author_id).await?;
        if self.dm_blocked(conversation_id).await? {
            return Err(AppError::Permission);
        }
        let content = validate_message_content(content).map_err(AppError::Validation)?;

        let mut tx = self.db.begin().await.map_err(|e| AppError::Internal(e.into()))?;

        let message = sqlx::query_as::<_, Message>(
            r#"INSERT INTO messages (conversation_id, author_id, content, parent_message_id, metadata)
               VALUES ($1, $2, $3, $4, $5)
               RETURNING id, uuid, conversation_id, author_id, content, content_type, parent_message_id,
                         thread_count, status, is_pinned, is_edited, edit_count, metadata,
                         created_at, updated_at, edited_at"#,
        )
        .bind(conversation_id)
        .bind(author_id)
        .bind(&content)
        .bind(parent_message_id)
        .bind(metadata.unwrap_or_else(|| json!({})))
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::Internal(e.into()))?;

        if let Some(parent_id) = parent_message_id {
            sqlx::query("UPDATE messages SET thread_count = thread_count + 1 WHERE id = $1")
                .bind(parent_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| AppError::Internal(e.into()))?;
        }

        sqlx::query(
            "UPDATE conversations SET message_count = message_count + 1, last_message_at = $2 WHERE id = $1",
        )
        .bind(conversation_id)
        .bind(message.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::Internal(e.into()))?;

        for username in extract_mention_candidates(&content) {
            let mentioned: Option<(i64,)> = sqlx::query_as(
                "SELECT id FROM users WHERE username = $1 AND is_active = TRUE",
            )
            .bind(&username)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| AppError::Internal(e.into()))?;
            if let Some((mentioned_id,)) = mentioned {
                if mentioned_id != author_id {
                    sqlx::query(
                        "INSERT INTO message_mentions (message_id, mentioned_user_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
                    )
                    .bind(message.id)
                    .bind(mentioned_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| AppError::Internal(e.into()))?;
                }
            }
        }

        tx.commit().await.map_err(|e| AppError::Internal(e.into()))?;
        self.history_cache.invalidate(&self.cache, conversation_id).await;

        self.publish_audit(
            conversation_id,
            Some(author_id),
            "message_created",
            json!({"message_id": message.id, "content_hash": message.content_hash()}),
            AuditSeverity::Info,
        )
        .await;

        Ok(message)
    }

    pub async fn edit_message(&self, message_id: i64, author_id: i64, new_content: &str, reason: Option<&str>) -> AppResult<Message> {
        let existing = self.get_message(message_id).await?;
        if existing.author_id != author_id {
            return Err(AppError::Permission);
        }
        if existing.status() == crate::models::MessageStatus::Deleted {
            return Err(AppError::Conflict("cannot edit a deleted message".into()));
        }
        if self.dm_blocked(existing.conversation_id).await? {
            return Err(AppError::Permission);
        }
        let new_content = validate_message_content(new_content).map_err(AppError::Validation)?;

        let mut tx = self.db.begin().await.map_err(|e| AppError::Internal(e.into()))?;
        sqlx::query(
            "INSERT INTO message_history (message_id, previous_content, edited_by, reason) VALUES ($1, $2, $3, $4)",
        )
        .bind(message_id)
        .bind(&existing.content)
        .bind(author_id)
        .bind(reason)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::Internal(e.into()))?;

        let updated = sqlx::query_as::<_, Message>(
            r#"UPDATE messages SET content = $2, is_edited = TRUE, edit_count = edit_count + 1,
                                    edited_at = NOW(), updated_at = NOW()
               WHERE id = $1
               RETURNING id, uuid, conversation_id, author_id, content, content_type, parent_message_id,
                         thread_count, status, is_pinned, is_edited, edit_count, metadata,
                         created_at, updated_at, edited_at"#,
        )
        .bind(message_id)
        .bind(&new_content)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::Internal(e.into()))?;

        tx.commit().await.map_err(|e| AppError::Internal(e.into()))?;
        self.history_cache.invalidate(&self.cache, updated.conversation_id).await;

        self.publish_audit(
            updated.conversation_id,
            Some(author_id),
            "message_edited",
            json!({"message_id": message_id, "reason": reason}),
            AuditSeverity::Info,
        )
        .await;

        Ok(updated)
    }

    pub async fn delete_message(&self, message_id: i64, actor_id: i64) -> AppResult<()> {
        let existing = self.get_message(message_id).await?;
        if existing.status() == crate::models::MessageStatus::Deleted {
            return Ok(());
        }
        if existing.author_id != actor_id {
            let role = self.member_role(existing.conversation_id, actor_id).await?;
            if !role.can_moderate() {
                return Err(AppError::Permission);
            }
        }

        let mut tx = self.db.begin().await.map_err(|e| AppError::Internal(e.into()))?;
        sqlx::query("UPDATE messages SET status = 'deleted', updated_at = NOW() WHERE id = $1")
            .bind(message_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::Internal(e.into()))?;

        sqlx::query("UPDATE conversations SET message_count = message_count - 1 WHERE id = $1 AND message_count > 0")
            .bind(existing.conversation_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::Internal(e.into()))?;

        if let Some(parent_id) = existing.parent_message_id {
            sqlx::query("UPDATE messages SET thread_count = thread_count - 1 WHERE id = $1 AND thread_count > 0")
                .bind(parent_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| AppError::Internal(e.into()))?;
        }

        tx.commit().await.map_err(|e| AppError::Internal(e.into()))?;
        self.history_cache.invalidate(&self.cache, existing.conversation_id).await;

        self.publish_audit(
            existing.conversation_id,
            Some(actor_id),
            "message_deleted",
            json!({"message_id": message_id}),
            AuditSeverity::Warning,
        )
        .await;

        Ok(())
    }

    pub async fn pin_message(&self, conversation_id: i64, message_id: i64, actor_id: i64, pinned: bool) -> AppResult<()> {
        self.member_role(conversation_id, actor_id).await?;
        sqlx::query("UPDATE messages SET is_pinned = $2, updated_at = NOW() WHERE id = $1 AND conversation_id = $3")
            .bind(message_id)
            .bind(pinned)
            .bind(conversation_id)
            .execute(&self.db)
            .await
            .map_err(|e| AppError::Internal(e.into()))?;

        self.publish_audit(
            conversation_id,
            Some(actor_id),
            if pinned { "message_pinned" } else { "message_unpinned" },
            json!({"message_id": message_id}),
            AuditSeverity::Info,
        )
        .await;
        Ok(())
    }

    /// Resolves the owning conversation for `message_id` before delegating
    /// to [`Self::pin_message`], for callers (HTTP handlers) that only have
    /// the message id on hand.
    pub async fn pin(&self, message_id: i64, actor_id: i64, pinned: bool) -> AppResult<()> {
        let message = self.get_message(message_id).await?;
        self.pin_message(message.conversation_id, message_id, actor_id, pinned).await
    }

    async fn get_message(&self, message_id: i64) -> AppResult<Message> {
        sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE id = $1")
            .bind(message_id)
            .fetch_optional(&self.db)
            .await
            .map_err(|e| AppError::Internal(e.into()))?
            .ok_or_else(|| AppError::NotFound("message not found".into()))
    }

    // ------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------

    pub async fn fetch_history(
        &self,
        conversation_id: i64,
        viewer_id: i64,
        limit: i64,
        before_id: Option<i64>,
    ) -> AppResult<Vec<MessageView>> {
        self.member_role(conversation_id, viewer_id).await?;
        let limit = limit.clamp(1, 200);

        // Only the first page of the default size is cacheable: it's the
        // hot path (most recently active conversations, repeated polling)
        // and the only one with a stable cache key.
        let cacheable = before_id.is_none() && limit == 50;
        if cacheable {
            if let Some(cached) = self.history_cache.get_l1(conversation_id) {
                if let Ok(views) = serde_json::from_value::<Vec<MessageView>>(cached) {
                    return Ok(views);
                }
            }
            if let Some(cached) = self.history_cache.get_l2(&self.cache, conversation_id).await {
                if let Ok(views) = serde_json::from_value::<Vec<MessageView>>(cached.clone()) {
                    self.history_cache.put_l1(conversation_id, cached);
                    return Ok(views);
                }
            }
        }

        let rows = if let Some(before_id) = before_id {
            sqlx::query_as::<_, Message>(
                r#"SELECT * FROM messages WHERE conversation_id = $1 AND status != 'deleted' AND id < $2
                   ORDER BY created_at DESC, id DESC LIMIT $3"#,
            )
            .bind(conversation_id)
            .bind(before_id)
            .bind(limit)
            .fetch_all(&self.db)
            .await
        } else {
            sqlx::query_as::<_, Message>(
                r#"SELECT * FROM messages WHERE conversation_id = $1 AND status != 'deleted'
                   ORDER BY created_at DESC, id DESC LIMIT $2"#,
            )
            .bind(conversation_id)
            .bind(limit)
            .fetch_all(&self.db)
            .await
        }
        .map_err(|e| AppError::Internal(e.into()))?;

        let mut views = Vec::with_capacity(rows.len());
        for message in rows {
            views.push(self.to_view(message).await?);
        }

        if cacheable {
            let encoded = json!(views);
            self.history_cache.put_l1(conversation_id, encoded.clone());
            self.history_cache.put_l2(&self.cache, conversation_id, &encoded, 5).await;
        }

        Ok(views)
    }

    pub async fn fetch_pinned(&self, conversation_id: i64, viewer_id: i64) -> AppResult<Vec<MessageView>> {
        self.member_role(conversation_id, viewer_id).await?;
        let rows = sqlx::query_as::<_, Message>(
            "SELECT * FROM messages WHERE conversation_id = $1 AND is_pinned = TRUE AND status != 'deleted' ORDER BY created_at DESC",
        )
        .bind(conversation_id)
        .fetch_all(&self.db)
        .await
        .map_err(|e| AppError::Internal(e.into()))?;

        let mut views = Vec::with_capacity(rows.len());
        for message in rows {
            views.push(self.to_view(message).await?);
        }
        Ok(views)
    }

    async fn to_view(&self, message: Message) -> AppResult<MessageView> {
        let reactions = self.get_reactions(message.id).await?;
        let mention_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM message_mentions WHERE message_id = $1")
            .bind(message.id)
            .fetch_one(&self.db)
            .await
            .map_err(|e| AppError::Internal(e.into()))?;
        let thread_count = message.thread_count;
        Ok(MessageView { message, reactions, mention_count, thread_count })
    }

    pub async fn get_stats(&self, conversation_id: i64, viewer_id: i64) -> AppResult<ConversationStats> {
        self.member_role(conversation_id, viewer_id).await?;
        let message_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = $1 AND status != 'deleted'",
        )
        .bind(conversation_id)
        .fetch_one(&self.db)
        .await
        .map_err(|e| AppError::Internal(e.into()))?;

        let pinned_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = $1 AND is_pinned = TRUE AND status != 'deleted'",
        )
        .bind(conversation_id)
        .fetch_one(&self.db)
        .await
        .map_err(|e| AppError::Internal(e.into()))?;

        let thread_message_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = $1 AND parent_message_id IS NOT NULL AND status != 'deleted'",
        )
        .bind(conversation_id)
        .fetch_one(&self.db)
        .await
        .map_err(|e| AppError::Internal(e.into()))?;

        let reaction_count: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM message_reactions r JOIN messages m ON m.id = r.message_id
               WHERE m.conversation_id = $1"#,
        )
        .bind(conversation_id)
        .fetch_one(&self.db)
        .await
        .map_err(|e| AppError::Internal(e.into()))?;

        Ok(ConversationStats { message_count, pinned_count, thread_message_count, reaction_count })
    }

    // ------------------------------------------------------------
    // Reactions
    // ------------------------------------------------------------

    pub async fn add_reaction(&self, message_id: i64, user_id: i64, emoji: &str) -> AppResult<()> {
        let message = self.get_message(message_id).await?;
        self.member_role(message.conversation_id, user_id).await?;

        sqlx::query(
            "INSERT INTO message_reactions (message_id, user_id, emoji) VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
        )
        .bind(message_id)
        .bind(user_id)
        .bind(emoji)
        .execute(&self.db)
        .await
        .map_err(|e| AppError::Internal(e.into()))?;
        Ok(())
    }

    pub async fn remove_reaction(&self, message_id: i64, user_id: i64, emoji: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM message_reactions WHERE message_id = $1 AND user_id = $2 AND emoji = $3")
            .bind(message_id)
            .bind(user_id)
            .bind(emoji)
            .execute(&self.db)
            .await
            .map_err(|e| AppError::Internal(e.into()))?;
        Ok(())
    }

    pub async fn get_reactions(&self, message_id: i64) -> AppResult<Vec<ReactionGroup>> {
        let rows = sqlx::query_as::<_, MessageReaction>(
            "SELECT * FROM message_reactions WHERE message_id = $1 ORDER BY emoji",
        )
        .bind(message_id)
        .fetch_all(&self.db)
        .await
        .map_err(|e| AppError::Internal(e.into()))?;

        let mut groups: Vec<ReactionGroup> = Vec::new();
        for reaction in rows {
            if let Some(group) = groups.iter_mut().find(|g| g.emoji == reaction.emoji) {
                group.count += 1;
                if group.sample_user_ids.len() < 5 {
                    group.sample_user_ids.push(reaction.user_id);
                }
            } else {
                groups.push(ReactionGroup { emoji: reaction.emoji, count: 1, sample_user_ids: vec![reaction.user_id] });
            }
        }
        Ok(groups)
    }

    // ------------------------------------------------------------
    // DM blocking
    // ------------------------------------------------------------

    pub async fn block_dm(&self, conversation_id: i64, actor_id: i64, blocked: bool) -> AppResult<()> {
        self.member_role(conversation_id, actor_id).await?;
        let blocked_by = if blocked { Some(actor_id) } else { None };
        sqlx::query(
            "UPDATE conversations SET dm_is_blocked = $2, dm_blocked_by = $3
             WHERE id = $1 AND conversation_type = 'direct_message'",
        )
        .bind(conversation_id)
        .bind(blocked)
        .bind(blocked_by)
        .execute(&self.db)
        .await
        .map_err(|e| AppError::Internal(e.into()))?;

        self.publish_audit(
            conversation_id,
            Some(actor_id),
            if blocked { "dm_blocked" } else { "dm_unblocked" },
            json!({}),
            AuditSeverity::Warning,
        )
        .await;
        Ok(())
    }

    async fn publish_audit(&self, conversation_id: i64, user_id: Option<i64>, event_type: &str, data: serde_json::Value, severity: AuditSeverity) {
        if let Err(e) = self
            .audit
            .record(AuditEventDraft {
                aggregate_id: format!("conversation:{conversation_id}"),
                aggregate_type: "conversation".to_string(),
                event_type: event_type.to_string(),
                event_data: data,
                user_id,
                severity,
                category: AuditCategory::Data,
                ..Default::default()
            })
            .await
        {
            tracing::warn!(error = %e, event_type, "chat: audit record failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_mentions_deduped_and_ordered() {
        let candidates = extract_mention_candidates("hey @alice_doe and @bob, also @alice_doe again");
        assert_eq!(candidates, vec!["alice_doe".to_string(), "bob".to_string()]);
    }

    #[test]
    fn ignores_short_tokens() {
        let candidates = extract_mention_candidates("@ab @xyz");
        assert_eq!(candidates, vec!["xyz".to_string()]);
    }
}
