//! Service catalogs (§4.2, abstracted): the typed method sets each service
//! exposes to its peers. Capability traits rather than concrete clients, so
//! mocks can drive tests — the fabric dispatches through whichever
//! implementation is registered.

use crate::error::AppError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    pub user_id: i64,
    pub username: String,
    pub role: String,
}

/// Marker for a single typed RPC call: request in, response out.
pub trait ServiceCall {
    type Request;
    type Response;
}

#[async_trait]
pub trait AuthService: Send + Sync {
    async fn validate_token(&self, token: &str) -> Result<UserInfo, AppError>;
    async fn get_user_info(&self, user_id: i64) -> Result<UserInfo, AppError>;
    async fn check_permissions(&self, user_id: i64, permission: &str) -> Result<bool, AppError>;
    async fn revoke_token(&self, token: &str) -> Result<(), AppError>;
}

#[async_trait]
pub trait ChatService: Send + Sync {
    async fn create_room(&self, owner_id: i64, name: &str) -> Result<i64, AppError>;
    async fn join_room(&self, room_id: i64, user_id: i64) -> Result<(), AppError>;
    async fn leave_room(&self, room_id: i64, user_id: i64) -> Result<(), AppError>;
    async fn send_message_history(&self, room_id: i64, limit: i64) -> Result<Vec<i64>, AppError>;
    async fn mute_user(&self, room_id: i64, user_id: i64, actor_id: i64) -> Result<(), AppError>;
    async fn ban_user(&self, room_id: i64, user_id: i64, actor_id: i64) -> Result<(), AppError>;
    async fn get_room_stats(&self, room_id: i64) -> Result<serde_json::Value, AppError>;
    async fn get_user_activity(&self, user_id: i64) -> Result<serde_json::Value, AppError>;
}

#[async_trait]
pub trait StreamService: Send + Sync {
    async fn create_stream(&self, owner_id: i64, title: &str) -> Result<i64, AppError>;
    async fn start_stream(&self, stream_id: i64) -> Result<(), AppError>;
    async fn stop_stream(&self, stream_id: i64) -> Result<(), AppError>;
    async fn join_stream(&self, stream_id: i64, user_id: i64) -> Result<(), AppError>;
    async fn leave_stream(&self, stream_id: i64, user_id: i64) -> Result<(), AppError>;
    async fn change_quality(&self, stream_id: i64, quality: &str) -> Result<(), AppError>;
    async fn get_audio_metrics(&self, stream_id: i64) -> Result<serde_json::Value, AppError>;
    async fn get_stream_analytics(&self, stream_id: i64) -> Result<serde_json::Value, AppError>;
}
