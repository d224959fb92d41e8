//! `/api/v1/messages/{id}` (§6): edit/delete/pin, reactions. Resource-scoped
//! rather than conversation-scoped because the client only has the message id
//! once it has one.

use crate::error::AppResult;
use crate::handlers::CurrentUser;
use crate::models::Message;
use crate::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct EditMessageRequest {
    pub content: String,
    pub reason: Option<String>,
}

pub async fn edit_message(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(message_id): Path<i64>,
    Json(body): Json<EditMessageRequest>,
) -> AppResult<Json<Message>> {
    let message = state.chat.edit_message(message_id, user.id, &body.content, body.reason.as_deref()).await?;
    Ok(Json(message))
}

pub async fn delete_message(State(state): State<AppState>, CurrentUser(user): CurrentUser, Path(message_id): Path<i64>) -> AppResult<StatusCode> {
    state.chat.delete_message(message_id, user.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct PinRequest {
    #[serde(default = "default_true")]
    pub pinned: bool,
}

fn default_true() -> bool {
    true
}

pub async fn pin_message(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(message_id): Path<i64>,
    Json(body): Json<PinRequest>,
) -> AppResult<StatusCode> {
    state.chat.pin(message_id, user.id, body.pinned).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ReactionRequest {
    pub emoji: String,
}

pub async fn add_reaction(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(message_id): Path<i64>,
    Json(body): Json<ReactionRequest>,
) -> AppResult<StatusCode> {
    state.chat.add_reaction(message_id, user.id, &body.emoji).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn remove_reaction(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path((message_id, emoji)): Path<(i64, String)>,
) -> AppResult<StatusCode> {
    state.chat.remove_reaction(message_id, user.id, &emoji).await?;
    Ok(StatusCode::NO_CONTENT)
}
