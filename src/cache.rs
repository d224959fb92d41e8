//! Redis-backed cache wrapper: primitive get/set operations plus typed
//! helpers layered on top for the hot-path caches the chat persistence core
//! and rate limiter use.

use redis::aio::ConnectionManager;
use serde::{de::DeserializeOwned, Serialize};

pub struct CacheService;

impl CacheService {
    pub async fn get(cache: &ConnectionManager, key: &str) -> redis::RedisResult<Option<String>> {
        let mut con = cache.clone();
        redis::cmd("GET").arg(key).query_async(&mut con).await
    }

    pub async fn set(cache: &ConnectionManager, key: &str, value: &str, ttl_secs: usize) -> redis::RedisResult<()> {
        let mut con = cache.clone();
        redis::cmd("SET").arg(key).arg(value).arg("EX").arg(ttl_secs).query_async(&mut con).await
    }

    pub async fn del(cache: &ConnectionManager, key: &str) -> redis::RedisResult<()> {
        let mut con = cache.clone();
        redis::cmd("DEL").arg(key).query_async(&mut con).await
    }

    pub async fn get_json<T: DeserializeOwned>(cache: &ConnectionManager, key: &str) -> Option<T> {
        let raw = Self::get(cache, key).await.ok().flatten()?;
        serde_json::from_str(&raw).ok()
    }

    pub async fn set_json<T: Serialize>(cache: &ConnectionManager, key: &str, value: &T, ttl_secs: usize) -> redis::RedisResult<()> {
        let json = serde_json::to_string(value).unwrap_or_default();
        Self::set(cache, key, &json, ttl_secs).await
    }
}

/// L1 (in-process) / L2 (Redis) cache in front of Postgres for hot
/// conversations, used internally by `FetchHistory`.
pub struct MessageHistoryCache {
    l1: dashmap::DashMap<i64, (std::time::Instant, serde_json::Value)>,
    l1_ttl: std::time::Duration,
}

impl MessageHistoryCache {
    pub fn new(l1_ttl: std::time::Duration) -> Self {
        Self { l1: dashmap::DashMap::new(), l1_ttl }
    }

    fn l2_key(conversation_id: i64) -> String {
        format!("chat:history:{}", conversation_id)
    }

    pub fn get_l1(&self, conversation_id: i64) -> Option<serde_json::Value> {
        let entry = self.l1.get(&conversation_id)?;
        if entry.0.elapsed() < self.l1_ttl {
            Some(entry.1.clone())
        } else {
            None
        }
    }

    pub fn put_l1(&self, conversation_id: i64, value: serde_json::Value) {
        self.l1.insert(conversation_id, (std::time::Instant::now(), value));
    }

    pub fn invalidate_l1(&self, conversation_id: i64) {
        self.l1.remove(&conversation_id);
    }

    pub async fn get_l2(&self, cache: &ConnectionManager, conversation_id: i64) -> Option<serde_json::Value> {
        CacheService::get_json(cache, &Self::l2_key(conversation_id)).await
    }

    pub async fn put_l2(&self, cache: &ConnectionManager, conversation_id: i64, value: &serde_json::Value, ttl_secs: usize) {
        let _ = CacheService::set_json(cache, &Self::l2_key(conversation_id), value, ttl_secs).await;
    }

    pub async fn invalidate(&self, cache: &ConnectionManager, conversation_id: i64) {
        self.invalidate_l1(conversation_id);
        let _ = CacheService::del(cache, &Self::l2_key(conversation_id)).await;
    }
}
