//! `/api/v1/rooms` (§6): group chats and public/private rooms, backed by
//! [`crate::chat::ChatService`]'s generic (non-DM) conversations.

use crate::error::AppResult;
use crate::handlers::CurrentUser;
use crate::models::{Conversation, ConversationType, Message, MessageView};
use crate::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct CreateRoomRequest {
    pub name: String,
    #[serde(default = "default_room_type")]
    pub room_type: String,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub max_members: i32,
}

fn default_room_type() -> String {
    "group_chat".to_string()
}

#[derive(Debug, serde::Serialize)]
pub struct CreateRoomResponse {
    pub id: i64,
}

pub async fn list_rooms(State(state): State<AppState>, CurrentUser(user): CurrentUser) -> AppResult<Json<Vec<Conversation>>> {
    Ok(Json(state.chat.list_rooms(user.id).await?))
}

pub async fn create_room(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(body): Json<CreateRoomRequest>,
) -> AppResult<(StatusCode, Json<CreateRoomResponse>)> {
    let conv_type = ConversationType::from_str_loose(&body.room_type);
    let id = state.chat.create_conversation(user.id, &body.name, conv_type, body.is_public, body.max_members).await?;
    Ok((StatusCode::CREATED, Json(CreateRoomResponse { id })))
}

pub async fn get_room(State(state): State<AppState>, CurrentUser(user): CurrentUser, Path(room_id): Path<i64>) -> AppResult<Json<Conversation>> {
    Ok(Json(state.chat.get_conversation(room_id, user.id).await?))
}

#[derive(Debug, Deserialize)]
pub struct RenameRoomRequest {
    pub name: String,
}

pub async fn update_room(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(room_id): Path<i64>,
    Json(body): Json<RenameRoomRequest>,
) -> AppResult<StatusCode> {
    state.chat.rename_room(room_id, user.id, &body.name).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_room(State(state): State<AppState>, CurrentUser(user): CurrentUser, Path(room_id): Path<i64>) -> AppResult<StatusCode> {
    state.chat.archive_room(room_id, user.id).await?;
    Ok(StatusCode::NO_CONTENT)
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
    Path(room_id): Path<i64>,
    Query(q): Query<HistoryQuery>,
) -> AppResult<Json<Vec<MessageView>>> {
    Ok(Json(state.chat.fetch_history(room_id, user.id, q.limit, q.before_id).await?))
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
    Path(room_id): Path<i64>,
    Json(body): Json<SendMessageRequest>,
) -> AppResult<(StatusCode, Json<Message>)> {
    let message = state.chat.send_message(room_id, user.id, &body.content, body.parent_message_id, body.metadata).await?;
    Ok((StatusCode::CREATED, Json(message)))
}
