//! HTTP-layer concerns that apply before a handler runs: rate limiting and
//! best-effort caller identification for it (§4.1, §6).

use crate::error::AppError;
use crate::rate_limiter::Decision;
use crate::AppState;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;

fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let ip = first.trim();
            if !ip.is_empty() {
                return ip.to_string();
            }
        }
    }
    peer.map(|a| a.ip().to_string()).unwrap_or_else(|| "unknown".to_string())
}

/// Best-effort caller id for the per-user rate-limit scope: decodes the
/// bearer token locally without touching the database.
fn caller_user_id(state: &AppState, headers: &HeaderMap) -> Option<i64> {
    let token = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?.strip_prefix("Bearer ")?;
    let claims = state.rpc.credentials.validate(token, None).ok()?;
    claims.sub.parse().ok()
}

pub async fn rate_limit(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let ip = client_ip(req.headers(), Some(peer));
    let user_id = caller_user_id(&state, req.headers());

    let decision = state.rate_limiter.allow(&method, &path, user_id, &ip, None).await;
    crate::metrics::record_rate_limit_decision(decision.allowed);
    crate::metrics::record_rate_limit_degraded(state.rate_limiter.is_degraded());
    if decision.ban_active {
        crate::metrics::record_ban_set();
    }
    if !decision.allowed {
        let mut response = AppError::RateLimited { retry_after_secs: decision.retry_after.unwrap_or(60) }.into_response();
        apply_rate_limit_headers(&mut response, &decision);
        return Ok(response);
    }

    let mut response = next.run(req).await;
    apply_rate_limit_headers(&mut response, &decision);
    Ok(response)
}

/// `X-RateLimit-{Limit,Remaining,Reset}` (§4.1 "Response headers contract").
/// `Retry-After` is set separately, only on the deny path, by
/// [`AppError::RateLimited`]'s own `IntoResponse` impl.
fn apply_rate_limit_headers(response: &mut Response, decision: &Decision) {
    let headers = response.headers_mut();
    for (name, value) in [
        ("X-RateLimit-Limit", decision.limit.to_string()),
        ("X-RateLimit-Remaining", decision.remaining.to_string()),
        ("X-RateLimit-Reset", decision.reset_at.to_string()),
    ] {
        if let Ok(v) = axum::http::HeaderValue::from_str(&value) {
            headers.insert(name, v);
        }
    }
}
