//! Data model (§3): users, sessions, conversations, messages, reactions,
//! mentions, history, audit events and notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// ============================================================
// Users & sessions
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Banned,
    User,
    Moderator,
    Admin,
    Owner,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Banned => "banned",
            UserRole::User => "user",
            UserRole::Moderator => "moderator",
            UserRole::Admin => "admin",
            UserRole::Owner => "owner",
        }
    }

    pub fn from_str_loose(s: &str) -> Self {
        match s {
            "banned" => UserRole::Banned,
            "moderator" => UserRole::Moderator,
            "admin" => UserRole::Admin,
            "owner" => UserRole::Owner,
            _ => UserRole::User,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub uuid: Uuid,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: String,
    pub is_verified: bool,
    pub is_active: bool,
    #[serde(skip_serializing)]
    pub two_fa_secret: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn role(&self) -> UserRole {
        UserRole::from_str_loose(&self.role)
    }
}

/// `3–50, [A-Za-z0-9_-]` username boundary (§8 tests this at 2/3/50/51).
pub fn is_valid_username(username: &str) -> bool {
    let len = username.chars().count();
    (3..=50).contains(&len)
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Session {
    pub id: i64,
    pub user_id: i64,
    pub session_token: String,
    pub refresh_token: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub device_info: Option<serde_json::Value>,
    pub expires_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub is_active: bool,
}

// ============================================================
// Conversations & members
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationType {
    DirectMessage,
    GroupChat,
    PublicRoom,
    PrivateRoom,
}

impl ConversationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationType::DirectMessage => "direct_message",
            ConversationType::GroupChat => "group_chat",
            ConversationType::PublicRoom => "public_room",
            ConversationType::PrivateRoom => "private_room",
        }
    }

    pub fn from_str_loose(s: &str) -> Self {
        match s {
            "group_chat" => ConversationType::GroupChat,
            "public_room" => ConversationType::PublicRoom,
            "private_room" => ConversationType::PrivateRoom,
            _ => ConversationType::DirectMessage,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Conversation {
    pub id: i64,
    pub uuid: Uuid,
    #[sqlx(rename = "conversation_type")]
    pub conv_type: String,
    pub name: Option<String>,
    pub owner_id: Option<i64>,
    pub is_public: bool,
    pub is_archived: bool,
    pub max_members: i32,
    pub member_count: i32,
    pub message_count: i64,
    pub last_message_at: Option<DateTime<Utc>>,
    /// Ordered DM pair `(min(u1,u2), max(u1,u2))`; `None` for non-DM conversations.
    pub dm_user1_id: Option<i64>,
    pub dm_user2_id: Option<i64>,
    pub dm_is_blocked: bool,
    pub dm_blocked_by: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn conversation_type(&self) -> ConversationType {
        ConversationType::from_str_loose(&self.conv_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    ReadOnly,
    Member,
    Moderator,
    Admin,
    Owner,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::ReadOnly => "read_only",
            MemberRole::Member => "member",
            MemberRole::Moderator => "moderator",
            MemberRole::Admin => "admin",
            MemberRole::Owner => "owner",
        }
    }

    pub fn from_str_loose(s: &str) -> Self {
        match s {
            "owner" => MemberRole::Owner,
            "admin" => MemberRole::Admin,
            "moderator" => MemberRole::Moderator,
            "read_only" => MemberRole::ReadOnly,
            _ => MemberRole::Member,
        }
    }

    /// Whether this role can moderate (delete others' messages, pin, etc.)
    pub fn can_moderate(&self) -> bool {
        matches!(self, MemberRole::Moderator | MemberRole::Admin | MemberRole::Owner)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ConversationMember {
    pub conversation_id: i64,
    pub user_id: i64,
    pub role: String,
    pub joined_at: DateTime<Utc>,
    pub last_read_message_id: Option<i64>,
    pub notifications_enabled: bool,
}

impl ConversationMember {
    pub fn member_role(&self) -> MemberRole {
        MemberRole::from_str_loose(&self.role)
    }
}

// ============================================================
// Messages
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    Image,
    File,
    System,
    ReactionOnly,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Image => "image",
            ContentType::File => "file",
            ContentType::System => "system",
            ContentType::ReactionOnly => "reaction_only",
        }
    }

    pub fn from_str_loose(s: &str) -> Self {
        match s {
            "image" => ContentType::Image,
            "file" => ContentType::File,
            "system" => ContentType::System,
            "reaction_only" => ContentType::ReactionOnly,
            _ => ContentType::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Edited,
    Deleted,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Edited => "edited",
            MessageStatus::Deleted => "deleted",
        }
    }

    pub fn from_str_loose(s: &str) -> Self {
        match s {
            "sending" => MessageStatus::Sending,
            "delivered" => MessageStatus::Delivered,
            "read" => MessageStatus::Read,
            "edited" => MessageStatus::Edited,
            "deleted" => MessageStatus::Deleted,
            _ => MessageStatus::Sent,
        }
    }
}

pub const MESSAGE_CONTENT_MAX_BYTES: usize = 4000;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    pub id: i64,
    pub uuid: Uuid,
    pub conversation_id: i64,
    pub author_id: i64,
    pub content: String,
    pub content_type: String,
    pub parent_message_id: Option<i64>,
    pub thread_count: i64,
    pub status: String,
    pub is_pinned: bool,
    pub is_edited: bool,
    pub edit_count: i32,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn status(&self) -> MessageStatus {
        MessageStatus::from_str_loose(&self.status)
    }

    pub fn content_type(&self) -> ContentType {
        ContentType::from_str_loose(&self.content_type)
    }

    pub fn content_hash(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.content.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Content invariant: trimmed, non-empty, <= 4000 bytes.
pub fn validate_message_content(content: &str) -> Result<String, String> {
    let trimmed = content.trim().to_string();
    if trimmed.is_empty() {
        return Err("content must not be empty".to_string());
    }
    if trimmed.len() > MESSAGE_CONTENT_MAX_BYTES {
        return Err(format!(
            "content exceeds {} bytes",
            MESSAGE_CONTENT_MAX_BYTES
        ));
    }
    Ok(trimmed)
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MessageReaction {
    pub message_id: i64,
    pub user_id: i64,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionGroup {
    pub emoji: String,
    pub count: i64,
    pub sample_user_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MessageMention {
    pub message_id: i64,
    pub mentioned_user_id: i64,
    pub is_read: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MessageHistory {
    pub id: i64,
    pub message_id: i64,
    pub previous_content: String,
    pub edited_by: i64,
    pub edited_at: DateTime<Utc>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageView {
    #[serde(flatten)]
    pub message: Message,
    pub reactions: Vec<ReactionGroup>,
    pub mention_count: i64,
    pub thread_count: i64,
}

// ============================================================
// Audit events
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl AuditSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditSeverity::Info => "info",
            AuditSeverity::Warning => "warning",
            AuditSeverity::Error => "error",
            AuditSeverity::Critical => "critical",
        }
    }

    pub fn from_str_loose(s: &str) -> Self {
        match s {
            "warning" => AuditSeverity::Warning,
            "error" => AuditSeverity::Error,
            "critical" => AuditSeverity::Critical,
            _ => AuditSeverity::Info,
        }
    }

    /// Severity → bus priority mapping (§4.4).
    pub fn bus_priority(&self) -> crate::notifications::Priority {
        use crate::notifications::Priority;
        match self {
            AuditSeverity::Info => Priority::Normal,
            AuditSeverity::Warning | AuditSeverity::Error => Priority::High,
            AuditSeverity::Critical => Priority::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    Authentication,
    Data,
    Administration,
    Security,
    #[default]
    System,
}

impl AuditCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditCategory::Authentication => "authentication",
            AuditCategory::Data => "data",
            AuditCategory::Administration => "administration",
            AuditCategory::Security => "security",
            AuditCategory::System => "system",
        }
    }

    pub fn from_str_loose(s: &str) -> Self {
        match s {
            "authentication" => AuditCategory::Authentication,
            "data" => AuditCategory::Data,
            "administration" => AuditCategory::Administration,
            "security" => AuditCategory::Security,
            _ => AuditCategory::System,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditEvent {
    pub id: String,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub version: i64,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    pub user_id: Option<i64>,
    pub session_id: Option<String>,
    pub ip: Option<String>,
    pub severity: String,
    pub category: String,
}

impl AuditEvent {
    pub fn severity(&self) -> AuditSeverity {
        AuditSeverity::from_str_loose(&self.severity)
    }

    pub fn category(&self) -> AuditCategory {
        AuditCategory::from_str_loose(&self.category)
    }
}

// ============================================================
// Notifications
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub recipients: Vec<String>,
    pub subject: Option<String>,
    pub template: String,
    pub data: HashMap<String, String>,
    pub priority: crate::notifications::Priority,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub language: String,
    pub user_id: Option<i64>,
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub total: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_length_boundaries() {
        assert!(!is_valid_username("ab"));
        assert!(is_valid_username("abc"));
        assert!(is_valid_username(&"a".repeat(50)));
        assert!(!is_valid_username(&"a".repeat(51)));
    }

    #[test]
    fn username_rejects_disallowed_characters() {
        assert!(!is_valid_username("bad name"));
        assert!(!is_valid_username("bad@name"));
        assert!(is_valid_username("good_name-1"));
    }

    #[test]
    fn message_content_boundary_accepts_exactly_max_bytes() {
        let content = "a".repeat(MESSAGE_CONTENT_MAX_BYTES);
        assert_eq!(validate_message_content(&content).unwrap(), content);
    }

    #[test]
    fn message_content_boundary_rejects_one_over_max_bytes() {
        let content = "a".repeat(MESSAGE_CONTENT_MAX_BYTES + 1);
        assert!(validate_message_content(&content).is_err());
    }

    #[test]
    fn message_content_trims_and_rejects_empty() {
        assert_eq!(validate_message_content("  hello  ").unwrap(), "hello");
        assert!(validate_message_content("   ").is_err());
    }

    #[test]
    fn message_status_round_trips_through_loose_string() {
        assert_eq!(MessageStatus::from_str_loose("deleted"), MessageStatus::Deleted);
        assert_eq!(MessageStatus::from_str_loose("garbage"), MessageStatus::Sent);
    }
}
