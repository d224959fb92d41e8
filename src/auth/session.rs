//! Session lifecycle (§3.3): one row per login, refresh rotates the
//! session's tokens rather than minting a parallel session, and a periodic
//! sweeper deactivates rows past `expires_at` — the same background-loop
//! shape the audit engine and notification engine use for their own
//! sweepers.

use crate::db;
use crate::error::AppError;
use crate::models::Session;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::{Pool, Postgres};
use std::time::Duration;
use tokio::sync::watch;

pub struct SessionManager {
    pool: Pool<Postgres>,
}

impl SessionManager {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        user_id: i64,
        session_token: &str,
        refresh_token: &str,
        ip: Option<&str>,
        user_agent: Option<&str>,
        ttl_secs: i64,
    ) -> Result<Session, AppError> {
        let expires_at: DateTime<Utc> = Utc::now() + ChronoDuration::seconds(ttl_secs);
        db::create_session(&self.pool, user_id, session_token, Some(refresh_token), ip, user_agent, None, expires_at)
            .await
            .map_err(|e| AppError::Internal(e.into()))
    }

    pub async fn validate(&self, session_token: &str) -> Result<Session, AppError> {
        let session = db::get_session_by_token(&self.pool, session_token)
            .await
            .map_err(|e| AppError::Internal(e.into()))?
            .ok_or(AppError::Auth)?;
        if session.expires_at < Utc::now() {
            return Err(AppError::Auth);
        }
        db::touch_session(&self.pool, session.id).await.map_err(|e| AppError::Internal(e.into()))?;
        Ok(session)
    }

    pub async fn by_refresh_token(&self, refresh_token: &str) -> Result<Session, AppError> {
        let session = db::get_session_by_refresh_token(&self.pool, refresh_token)
            .await
            .map_err(|e| AppError::Internal(e.into()))?
            .ok_or(AppError::Auth)?;
        if session.expires_at < Utc::now() {
            return Err(AppError::Auth);
        }
        Ok(session)
    }

    pub async fn revoke(&self, session_id: i64) -> Result<(), AppError> {
        db::revoke_session(&self.pool, session_id).await.map_err(|e| AppError::Internal(e.into()))
    }

    pub async fn revoke_all_for_user(&self, user_id: i64) -> Result<u64, AppError> {
        db::revoke_all_sessions_for_user(&self.pool, user_id).await.map_err(|e| AppError::Internal(e.into()))
    }

    pub async fn sweep_expired(&self) -> Result<u64, AppError> {
        db::sweep_expired_sessions(&self.pool).await.map_err(|e| AppError::Internal(e.into()))
    }

    pub async fn run_sweeper_loop(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep_expired().await {
                        Ok(count) if count > 0 => tracing::info!(count, "swept expired sessions"),
                        Ok(_) => {}
                        Err(err) => tracing::warn!(error = %err, "session sweep failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
