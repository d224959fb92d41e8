//! `/api/v1/admin/ratelimit/{stats,config}`, `POST .../reset` (§6): the
//! admin-only rate-limiter control surface.

use crate::auth::require_role;
use crate::config::RateLimitTable;
use crate::error::AppResult;
use crate::handlers::CurrentUser;
use crate::models::UserRole;
use crate::rate_limiter::RateLimiterStats;
use crate::AppState;
use axum::extract::State;
use axum::Json;
use serde::Deserialize;

pub async fn stats(State(state): State<AppState>, CurrentUser(user): CurrentUser) -> AppResult<Json<RateLimiterStats>> {
    require_role(&user, UserRole::Admin)?;
    Ok(Json(state.rate_limiter.get_stats()))
}

pub async fn get_config(State(state): State<AppState>, CurrentUser(user): CurrentUser) -> AppResult<Json<RateLimitTable>> {
    require_role(&user, UserRole::Admin)?;
    Ok(Json(state.rate_limiter.get_config()))
}

pub async fn reload_config(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(table): Json<RateLimitTable>,
) -> AppResult<axum::http::StatusCode> {
    require_role(&user, UserRole::Admin)?;
    state.rate_limiter.reload_config(table);
    Ok(axum::http::StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    pub scope: String,
}

pub async fn reset(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(body): Json<ResetRequest>,
) -> AppResult<axum::http::StatusCode> {
    require_role(&user, UserRole::Admin)?;
    state.rate_limiter.reset(&body.scope).await.map_err(|e| crate::error::AppError::Internal(e.into()))?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}
