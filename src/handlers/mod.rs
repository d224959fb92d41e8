//! HTTP handlers for the REST surface (§6), split one file per resource,
//! with a shared `CurrentUser` extractor for bearer-authenticated routes.

pub mod admin;
pub mod auth;
pub mod conversations;
pub mod health;
pub mod messages;
pub mod rooms;

use crate::error::AppError;
use crate::models::User;
use crate::AppState;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

/// Extracts and validates the bearer session token, loading the full user
/// record (touches `last_used` on the session, per [`crate::auth::SessionManager::validate`]).
pub struct CurrentUser(pub User);

#[axum::async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts.headers.get(axum::http::header::AUTHORIZATION).ok_or(AppError::Auth)?;
        let value = header.to_str().map_err(|_| AppError::Auth)?;
        let token = value.strip_prefix("Bearer ").ok_or(AppError::Auth)?;
        let user = state.auth.me(token).await?;
        Ok(CurrentUser(user))
    }
}
