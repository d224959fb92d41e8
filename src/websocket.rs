//! WebSocket envelope dispatch (§6): `{type, data}` in, `{type, data}` or
//! `{type: "error", data}` out. One connection per authenticated user;
//! message-type handling mirrors the REST handlers in [`crate::handlers`]
//! rather than duplicating `ChatService` call sites.

use crate::error::AppError;
use crate::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    pub token: String,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

pub async fn upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
) -> axum::response::Response {
    match state.auth.me(&query.token).await {
        Ok(user) => ws.on_upgrade(move |socket| handle_socket(socket, state, user.id)),
        Err(_) => (axum::http::StatusCode::UNAUTHORIZED, "invalid or expired session").into_response(),
    }
}

async fn handle_socket(mut socket: WebSocket, state: AppState, user_id: i64) {
    loop {
        let Some(Ok(msg)) = socket.recv().await else { break };
        let Message::Text(text) = msg else { continue };

        let envelope: Envelope = match serde_json::from_str(&text) {
            Ok(e) => e,
            Err(e) => {
                let _ = socket.send(Message::Text(error_frame(&e.to_string()))).await;
                continue;
            }
        };

        let reply = match dispatch(&state, user_id, &envelope.kind, envelope.data).await {
            Ok(data) => json!({"type": envelope.kind, "data": data}).to_string(),
            Err(e) => error_frame(&e.to_string()),
        };

        if socket.send(Message::Text(reply)).await.is_err() {
            break;
        }
    }
}

fn error_frame(message: &str) -> String {
    json!({"type": "error", "data": {"message": message}}).to_string()
}

#[derive(Debug, Deserialize)]
struct SendMessageData {
    conversation_id: i64,
    content: String,
    parent_message_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct EditMessageData {
    message_id: i64,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessageIdData {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct ConversationIdData {
    conversation_id: i64,
}

#[derive(Debug, Deserialize)]
struct HistoryData {
    conversation_id: i64,
    #[serde(default = "default_limit")]
    limit: i64,
    before_id: Option<i64>,
}

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Deserialize)]
struct ReactionData {
    message_id: i64,
    emoji: String,
}

#[derive(Debug, Deserialize)]
struct PinData {
    message_id: i64,
    #[serde(default = "default_true")]
    pinned: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct BlockData {
    conversation_id: i64,
    #[serde(default = "default_true")]
    blocked: bool,
}

/// Dispatches one envelope. DM and room-scoped types share the same
/// [`crate::chat::ChatService`] calls since conversations are the common
/// abstraction underneath both; only `list_*`/`get_stats` differ by scope.
async fn dispatch(state: &AppState, user_id: i64, kind: &str, data: Value) -> Result<Value, AppError> {
    match kind {
        "send_dm_message" | "send_room_message" => {
            let d: SendMessageData = from_data(data)?;
            let message = state.chat.send_message(d.conversation_id, user_id, &d.content, d.parent_message_id, None).await?;
            Ok(json!(message))
        }
        "edit_dm_message" | "edit_room_message" => {
            let d: EditMessageData = from_data(data)?;
            let message = state.chat.edit_message(d.message_id, user_id, &d.content, None).await?;
            Ok(json!(message))
        }
        "delete_dm_message" | "delete_room_message" => {
            let d: MessageIdData = from_data(data)?;
            state.chat.delete_message(d.message_id, user_id).await?;
            Ok(json!({"message_id": d.message_id}))
        }
        "get_dm_history" | "get_room_history" => {
            let d: HistoryData = from_data(data)?;
            let views = state.chat.fetch_history(d.conversation_id, user_id, d.limit, d.before_id).await?;
            Ok(json!(views))
        }
        "get_pinned_dm_messages" | "get_pinned_room_messages" => {
            let d: ConversationIdData = from_data(data)?;
            let views = state.chat.fetch_pinned(d.conversation_id, user_id).await?;
            Ok(json!(views))
        }
        "add_dm_reaction" | "add_room_reaction" => {
            let d: ReactionData = from_data(data)?;
            state.chat.add_reaction(d.message_id, user_id, &d.emoji).await?;
            Ok(json!({"message_id": d.message_id, "emoji": d.emoji}))
        }
        "remove_dm_reaction" | "remove_room_reaction" => {
            let d: ReactionData = from_data(data)?;
            state.chat.remove_reaction(d.message_id, user_id, &d.emoji).await?;
            Ok(json!({"message_id": d.message_id, "emoji": d.emoji}))
        }
        "pin_dm_message" | "pin_room_message" => {
            let d: PinData = from_data(data)?;
            state.chat.pin(d.message_id, user_id, d.pinned).await?;
            Ok(json!({"message_id": d.message_id, "pinned": d.pinned}))
        }
        "unpin_dm_message" | "unpin_room_message" => {
            let d: MessageIdData = from_data(data)?;
            state.chat.pin(d.message_id, user_id, false).await?;
            Ok(json!({"message_id": d.message_id, "pinned": false}))
        }
        "block_dm_conversation" => {
            let d: BlockData = from_data(data)?;
            state.chat.block_dm(d.conversation_id, user_id, d.blocked).await?;
            Ok(json!({"conversation_id": d.conversation_id, "blocked": d.blocked}))
        }
        "list_dm_conversations" => {
            let conversations = state.chat.list_dms(user_id).await?;
            Ok(json!(conversations))
        }
        "list_room_conversations" => {
            let conversations = state.chat.list_rooms(user_id).await?;
            Ok(json!(conversations))
        }
        "get_dm_stats" | "get_room_stats" => {
            let d: ConversationIdData = from_data(data)?;
            let stats = state.chat.get_stats(d.conversation_id, user_id).await?;
            Ok(json!(stats))
        }
        "get_dm_audit_logs" | "get_room_audit_logs" => {
            let d: ConversationIdData = from_data(data)?;
            let aggregate_id = format!("conversation:{}", d.conversation_id);
            let events = state
                .audit
                .get_events(&aggregate_id, 0)
                .await
                .map_err(AppError::Internal)?;
            Ok(json!(events))
        }
        other => Err(AppError::Validation(format!("unknown message type: {other}"))),
    }
}

fn from_data<T: serde::de::DeserializeOwned>(data: Value) -> Result<T, AppError> {
    serde_json::from_value(data).map_err(|e| AppError::Validation(e.to_string()))
}
