//! `/api/v1/conversations` (§6): direct-message conversations, backed by
//! [`crate::chat::ChatService::get_or_create_dm`].

use crate::error::AppResult;
use crate::handlers::CurrentUser;
use crate::models::{Conversation, Message, MessageView};
use crate::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

pub async fn list_conversations(State(state): State<AppState>, CurrentUser(user): CurrentUser) -> AppResult<Json<Vec<Conversation>>> {
    Ok(Json(state.chat.list_dms(user.id).await?))
}

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    pub other_user_id: i64,
}

#[derive(Debug, serde::Serialize)]
pub struct CreateConversationResponse {
    pub id: i64,
}

pub async fn create_conversation(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(body): Json<CreateConversationRequest>,
) -> AppResult<(StatusCode, Json<CreateConversationResponse>)> {
    let id = state.chat.get_or_create_dm(user.id, body.other_user_id).await?;
    Ok((StatusCode::CREATED, Json(CreateConversationResponse { id })))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    pub before_id: Option<i64>,
}

fn default_limit() -> i64 {
    50
}

pub async fn list_messages(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(conversation_id): Path<i64>,
    Query(q): Query<HistoryQuery>,
) -> AppResult<Json<Vec<MessageView>>> {
    Ok(Json(state.chat.fetch_history(conversation_id, user.id, q.limit, q.before_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    pub parent_message_id: Option<i64>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

pub async fn send_message(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(conversation_id): Path<i64>,
    Json(body): Json<SendMessageRequest>,
) -> AppResult<(StatusCode, Json<Message>)> {
    let message = state.chat.send_message(conversation_id, user.id, &body.content, body.parent_message_id, body.metadata).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

#[derive(Debug, Deserialize)]
pub struct BlockRequest {
    #[serde(default = "default_true")]
    pub blocked: bool,
}

fn default_true() -> bool {
    true
}

pub async fn block_conversation(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(conversation_id): Path<i64>,
    Json(body): Json<BlockRequest>,
) -> AppResult<StatusCode> {
    state.chat.block_dm(conversation_id, user.id, body.blocked).await?;
    Ok(StatusCode::NO_CONTENT)
}
