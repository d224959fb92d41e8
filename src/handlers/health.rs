//! Liveness/readiness (§6): unauthenticated, cheap, no rate limiting applied.

use crate::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

pub async fn live() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "live"})))
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "ok"})))
}

/// Ready only once the primary pool and cache both answer; degraded replica
/// or RPC peers don't fail readiness, they're reported for visibility.
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = sqlx::query("SELECT 1").execute(&state.db).await.is_ok();
    let redis_ok = {
        let mut conn = state.cache.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await.is_ok()
    };

    let body = json!({
        "database": db_ok,
        "cache": redis_ok,
        "analytics_degraded": state.analytics.is_degraded(),
        "rate_limiter_degraded": state.rate_limiter.is_degraded(),
    });

    if db_ok && redis_ok {
        (StatusCode::OK, Json(body))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body))
    }
}
