//! Primary-pool schema initialization (§3 as canonical wire format) and the
//! query helpers `auth` and `chat` build on. Kept here rather than scattered
//! across call sites so the SQL surface for each table has one home.

use crate::models::{Session, User, UserRole};
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};

pub async fn init_schema(pool: &Pool<Postgres>) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id BIGSERIAL PRIMARY KEY,
            uuid UUID NOT NULL DEFAULT gen_random_uuid(),
            username TEXT NOT NULL UNIQUE,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'user',
            is_verified BOOLEAN NOT NULL DEFAULT FALSE,
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            two_fa_secret TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id BIGSERIAL PRIMARY KEY,
            user_id BIGINT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            session_token TEXT NOT NULL UNIQUE,
            refresh_token TEXT,
            ip TEXT,
            user_agent TEXT,
            device_info JSONB,
            expires_at TIMESTAMPTZ NOT NULL,
            last_used TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            is_active BOOLEAN NOT NULL DEFAULT TRUE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversations (
            id BIGSERIAL PRIMARY KEY,
            uuid UUID NOT NULL DEFAULT gen_random_uuid(),
            conversation_type TEXT NOT NULL,
            name TEXT,
            owner_id BIGINT REFERENCES users(id) ON DELETE SET NULL,
            is_public BOOLEAN NOT NULL DEFAULT FALSE,
            is_archived BOOLEAN NOT NULL DEFAULT FALSE,
            max_members INT NOT NULL DEFAULT 0,
            member_count INT NOT NULL DEFAULT 0,
            message_count BIGINT NOT NULL DEFAULT 0,
            last_message_at TIMESTAMPTZ,
            dm_user1_id BIGINT REFERENCES users(id) ON DELETE SET NULL,
            dm_user2_id BIGINT REFERENCES users(id) ON DELETE SET NULL,
            dm_is_blocked BOOLEAN NOT NULL DEFAULT FALSE,
            dm_blocked_by BIGINT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            CONSTRAINT dm_pair_ordered CHECK (dm_user1_id IS NULL OR dm_user1_id < dm_user2_id),
            CONSTRAINT name_required_unless_dm CHECK (conversation_type = 'direct_message' OR name IS NOT NULL)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_dm_pair ON conversations (dm_user1_id, dm_user2_id) WHERE conversation_type = 'direct_message'",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversation_members (
            conversation_id BIGINT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            user_id BIGINT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            role TEXT NOT NULL DEFAULT 'member',
            joined_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            last_read_message_id BIGINT,
            notifications_enabled BOOLEAN NOT NULL DEFAULT TRUE,
            PRIMARY KEY (conversation_id, user_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id BIGSERIAL PRIMARY KEY,
            uuid UUID NOT NULL DEFAULT gen_random_uuid(),
            conversation_id BIGINT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            author_id BIGINT REFERENCES users(id) ON DELETE SET NULL,
            content TEXT NOT NULL,
            content_type TEXT NOT NULL DEFAULT 'text',
            parent_message_id BIGINT REFERENCES messages(id) ON DELETE SET NULL,
            thread_count BIGINT NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'sent',
            is_pinned BOOLEAN NOT NULL DEFAULT FALSE,
            is_edited BOOLEAN NOT NULL DEFAULT FALSE,
            edit_count INT NOT NULL DEFAULT 0,
            metadata JSONB NOT NULL DEFAULT '{}',
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            edited_at TIMESTAMPTZ,
            CONSTRAINT content_len CHECK (char_length(content) <= 4000)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages (conversation_id, created_at DESC, id DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_parent ON messages (parent_message_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS message_reactions (
            message_id BIGINT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            user_id BIGINT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            emoji TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (message_id, user_id, emoji)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS message_mentions (
            message_id BIGINT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            mentioned_user_id BIGINT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            is_read BOOLEAN NOT NULL DEFAULT FALSE,
            PRIMARY KEY (message_id, mentioned_user_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS message_history (
            id BIGSERIAL PRIMARY KEY,
            message_id BIGINT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            previous_content TEXT NOT NULL,
            edited_by BIGINT REFERENCES users(id) ON DELETE SET NULL,
            edited_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            reason TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_events (
            id TEXT PRIMARY KEY,
            aggregate_id TEXT NOT NULL,
            aggregate_type TEXT NOT NULL,
            event_type TEXT NOT NULL,
            event_data JSONB NOT NULL DEFAULT '{}',
            metadata JSONB NOT NULL DEFAULT '{}',
            timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            version BIGINT NOT NULL DEFAULT 1,
            correlation_id TEXT,
            causation_id TEXT,
            user_id BIGINT,
            session_id TEXT,
            ip TEXT,
            severity TEXT NOT NULL DEFAULT 'info',
            category TEXT NOT NULL DEFAULT 'system'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_aggregate ON audit_events (aggregate_id, version)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_user ON audit_events (user_id, timestamp DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_type ON audit_events (event_type, timestamp DESC)")
        .execute(pool)
        .await?;

    Ok(())
}

// ============================================================
// Users
// ============================================================

pub async fn create_user(
    pool: &Pool<Postgres>,
    username: &str,
    email: &str,
    password_hash: &str,
) -> Result<User, sqlx::Error> {
    sqlx::query_as::<_, User>(
        r#"
        INSERT INTO users (username, email, password_hash, role)
        VALUES ($1, $2, $3, $4)
        RETURNING id, uuid, username, email, password_hash, role, is_verified, is_active,
                  two_fa_secret, created_at, updated_at
        "#,
    )
    .bind(username)
    .bind(email)
    .bind(password_hash)
    .bind(UserRole::User.as_str())
    .fetch_one(pool)
    .await
}

pub async fn get_user_by_id(pool: &Pool<Postgres>, id: i64) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn get_user_by_username(pool: &Pool<Postgres>, username: &str) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = $1")
        .bind(username)
        .fetch_optional(pool)
        .await
}

pub async fn get_user_by_email(pool: &Pool<Postgres>, email: &str) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = $1")
        .bind(email)
        .fetch_optional(pool)
        .await
}

pub async fn set_user_verified(pool: &Pool<Postgres>, user_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE users SET is_verified = TRUE, updated_at = NOW() WHERE id = $1")
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_user_role(pool: &Pool<Postgres>, user_id: i64, role: UserRole) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE users SET role = $2, updated_at = NOW() WHERE id = $1")
        .bind(user_id)
        .bind(role.as_str())
        .execute(pool)
        .await?;
    Ok(())
}

// ============================================================
// Sessions
// ============================================================

#[allow(clippy::too_many_arguments)]
pub async fn create_session(
    pool: &Pool<Postgres>,
    user_id: i64,
    session_token: &str,
    refresh_token: Option<&str>,
    ip: Option<&str>,
    user_agent: Option<&str>,
    device_info: Option<serde_json::Value>,
    expires_at: DateTime<Utc>,
) -> Result<Session, sqlx::Error> {
    sqlx::query_as::<_, Session>(
        r#"
        INSERT INTO sessions (user_id, session_token, refresh_token, ip, user_agent, device_info, expires_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING id, user_id, session_token, refresh_token, ip, user_agent, device_info,
                  expires_at, last_used, is_active
        "#,
    )
    .bind(user_id)
    .bind(session_token)
    .bind(refresh_token)
    .bind(ip)
    .bind(user_agent)
    .bind(device_info)
    .bind(expires_at)
    .fetch_one(pool)
    .await
}

pub async fn get_session_by_token(pool: &Pool<Postgres>, token: &str) -> Result<Option<Session>, sqlx::Error> {
    sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE session_token = $1 AND is_active = TRUE")
        .bind(token)
        .fetch_optional(pool)
        .await
}

pub async fn get_session_by_refresh_token(pool: &Pool<Postgres>, refresh_token: &str) -> Result<Option<Session>, sqlx::Error> {
    sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE refresh_token = $1 AND is_active = TRUE")
        .bind(refresh_token)
        .fetch_optional(pool)
        .await
}

pub async fn touch_session(pool: &Pool<Postgres>, session_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE sessions SET last_used = NOW() WHERE id = $1")
        .bind(session_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn revoke_session(pool: &Pool<Postgres>, session_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE sessions SET is_active = FALSE WHERE id = $1")
        .bind(session_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn revoke_all_sessions_for_user(pool: &Pool<Postgres>, user_id: i64) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("UPDATE sessions SET is_active = FALSE WHERE user_id = $1 AND is_active = TRUE")
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Deactivates rows past `expires_at`; returns the count swept. Driven by
/// the auth module's periodic sweeper, mirroring the audit/notification
/// background-loop pattern.
pub async fn sweep_expired_sessions(pool: &Pool<Postgres>) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("UPDATE sessions SET is_active = FALSE WHERE is_active = TRUE AND expires_at < NOW()")
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
