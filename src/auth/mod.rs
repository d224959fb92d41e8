//! Authentication and authorization (§3.1, §3.3, §6): password hashing,
//! token issuance, session lifecycle, and the role checks handlers use to
//! gate moderation/admin surfaces.

mod jwt;
mod password;
mod session;

pub use jwt::{JwtIssuer, TokenPair};
pub use password::{hash_password, verify_password};
pub use session::SessionManager;

use crate::audit::{AuditEngine, AuditEventDraft};
use crate::db;
use crate::error::{AppError, AppResult};
use crate::models::{is_valid_username, AuditCategory, AuditSeverity, User, UserRole};
use rand::Rng;
use sqlx::{Pool, Postgres};
use std::sync::Arc;

pub struct AuthService {
    pool: Pool<Postgres>,
    issuer: JwtIssuer,
    sessions: SessionManager,
    bcrypt_cost: u32,
    audit: Arc<AuditEngine>,
}

impl AuthService {
    pub fn new(pool: Pool<Postgres>, issuer: JwtIssuer, bcrypt_cost: u32, audit: Arc<AuditEngine>) -> Self {
        let sessions = SessionManager::new(pool.clone());
        Self { pool, issuer, sessions, bcrypt_cost, audit }
    }

    async fn publish_auth_event(&self, user_id: i64, event_type: &str, ip: Option<&str>) {
        if let Err(e) = self
            .audit
            .record(AuditEventDraft {
                aggregate_id: format!("user:{user_id}"),
                aggregate_type: "user".to_string(),
                event_type: event_type.to_string(),
                event_data: serde_json::json!({}),
                user_id: Some(user_id),
                ip: ip.map(str::to_string),
                severity: AuditSeverity::Info,
                category: AuditCategory::Authentication,
                ..Default::default()
            })
            .await
        {
            tracing::warn!(error = %e, event_type, "auth: audit record failed");
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub async fn register(&self, username: &str, email: &str, password: &str) -> AppResult<User> {
        if !is_valid_username(username) {
            return Err(AppError::Validation("username must be 3-50 alphanumeric/_/- characters".into()));
        }
        if password.len() < 8 {
            return Err(AppError::Validation("password must be at least 8 characters".into()));
        }
        if db::get_user_by_username(&self.pool, username).await.map_err(|e| AppError::Internal(e.into()))?.is_some() {
            return Err(AppError::Conflict("username already taken".into()));
        }
        if db::get_user_by_email(&self.pool, email).await.map_err(|e| AppError::Internal(e.into()))?.is_some() {
            return Err(AppError::Conflict("email already registered".into()));
        }

        let hash = password::hash_password(password, self.bcrypt_cost)?;
        db::create_user(&self.pool, username, email, &hash).await.map_err(|e| AppError::Internal(e.into()))
    }

    pub async fn login(
        &self,
        username: &str,
        password: &str,
        ip: Option<&str>,
        user_agent: Option<&str>,
        remember_me: bool,
    ) -> AppResult<(User, TokenPair)> {
        let user = db::get_user_by_username(&self.pool, username)
            .await
            .map_err(|e| AppError::Internal(e.into()))?
            .ok_or(AppError::Auth)?;

        if !password::verify_password(password, &user.password_hash)? {
            return Err(AppError::Auth);
        }
        if !user.is_active || user.role() == UserRole::Banned {
            return Err(AppError::Permission);
        }

        let pair = self.issuer.issue_pair(&user, remember_me)?;
        self.sessions
            .create(user.id, &pair.access_token, &pair.refresh_token, ip, user_agent, pair.access_expires_in)
            .await?;
        self.publish_auth_event(user.id, "login", ip).await;

        Ok((user, pair))
    }

    pub async fn refresh(&self, refresh_token: &str) -> AppResult<TokenPair> {
        let session = self.sessions.by_refresh_token(refresh_token).await?;
        let user = db::get_user_by_id(&self.pool, session.user_id)
            .await
            .map_err(|e| AppError::Internal(e.into()))?
            .ok_or(AppError::Auth)?;
        if !user.is_active || user.role() == UserRole::Banned {
            return Err(AppError::Permission);
        }

        self.sessions.revoke(session.id).await?;
        let pair = self.issuer.issue_pair(&user, false)?;
        self.sessions.create(user.id, &pair.access_token, &pair.refresh_token, None, None, pair.access_expires_in).await?;
        self.publish_auth_event(user.id, "token_refresh", None).await;
        Ok(pair)
    }

    pub async fn logout(&self, session_token: &str) -> AppResult<()> {
        let session = self.sessions.validate(session_token).await?;
        self.sessions.revoke(session.id).await?;
        self.publish_auth_event(session.user_id, "logout", None).await;
        Ok(())
    }

    pub async fn me(&self, session_token: &str) -> AppResult<User> {
        let session = self.sessions.validate(session_token).await?;
        db::get_user_by_id(&self.pool, session.user_id)
            .await
            .map_err(|e| AppError::Internal(e.into()))?
            .ok_or(AppError::Auth)
    }
}

/// Role checks shared by handlers (§3.1): moderation-capable vs admin-only
/// surfaces, reusing [`crate::models::MemberRole::can_moderate`]'s naming
/// for global (non-conversation-scoped) roles.
pub fn require_role(user: &User, minimum: UserRole) -> AppResult<()> {
    if user.role() as i32 >= minimum as i32 {
        Ok(())
    } else {
        Err(AppError::Permission)
    }
}

pub fn generate_opaque_secret() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 32] = rng.gen();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_ordering_gates_correctly() {
        let admin = User {
            id: 1,
            uuid: uuid::Uuid::new_v4(),
            username: "admin".into(),
            email: "a@example.com".into(),
            password_hash: String::new(),
            role: "admin".into(),
            is_verified: true,
            is_active: true,
            two_fa_secret: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        assert!(require_role(&admin, UserRole::Moderator).is_ok());

        let plain = User { role: "user".into(), ..admin };
        assert!(require_role(&plain, UserRole::Admin).is_err());
    }
}
