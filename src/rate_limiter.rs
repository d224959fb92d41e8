//! Distributed sliding-window rate limiter (§4.1).
//!
//! The decision script is a single Lua script evaluated atomically on Redis,
//! built on the same `ConnectionManager` [`crate::cache`] wraps, generalized
//! into the sliding-window + DDoS-ban contract. When Redis is unreachable
//! the limiter degrades to a local, process-wide counter with the same window
//! semantics and never fails closed (§4.1 "Degraded mode").

use crate::config::{RateLimitRule, RateLimitTable, ReloadableConfig};
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::Script;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Atomically: trim entries older than `now - window`, add `now`, read
/// cardinality, set TTL. Returns the post-insert cardinality.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
redis.call('ZADD', key, now, now .. '-' .. ARGV[3])
local count = redis.call('ZCARD', key)
redis.call('EXPIRE', key, window)
return count
"#;

const BAN_SCRIPT: &str = r#"
local key = KEYS[1]
local ttl = tonumber(ARGV[1])
redis.call('SET', key, '1')
redis.call('EXPIRE', key, ttl)
return 1
"#;

#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: i64,
    pub retry_after: Option<u64>,
    pub ban_active: bool,
}

struct LocalWindow {
    timestamps: std::sync::Mutex<Vec<f64>>,
}

/// Process-wide fallback counters, keyed by the same `window_key` the Redis
/// path uses, so semantics match when degraded.
struct LocalFallback {
    windows: DashMap<String, Arc<LocalWindow>>,
}

impl LocalFallback {
    fn new() -> Self {
        Self { windows: DashMap::new() }
    }

    fn count_and_insert(&self, key: &str, now: f64, window_secs: f64) -> u64 {
        let entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(LocalWindow { timestamps: std::sync::Mutex::new(Vec::new()) }))
            .clone();
        let mut ts = entry.timestamps.lock().unwrap();
        ts.retain(|t| *t > now - window_secs);
        ts.push(now);
        ts.len() as u64
    }
}

pub struct RateLimiter {
    redis: ConnectionManager,
    config: ReloadableConfig,
    script: Script,
    ban_script: Script,
    local_fallback: LocalFallback,
    /// Observable degraded-mode signal (§4.1): flips true when Redis calls fail.
    degraded: AtomicBool,
    degraded_transitions: AtomicU64,
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs_f64()
}

/// Picks the most specific matching pattern for `method:path`, e.g.
/// `GET:/api/v1/demo/stress` over `GET:/api/*`.
pub fn resolve_endpoint_rule<'a>(
    table: &'a RateLimitTable,
    method: &str,
    path: &str,
) -> Option<&'a RateLimitRule> {
    let exact = format!("{}:{}", method, path);
    if let Some(r) = table.endpoint_rules.get(&exact) {
        return Some(r);
    }
    let mut best: Option<(&String, &RateLimitRule)> = None;
    for (pattern, rule) in table.endpoint_rules.iter() {
        if let Some((pm, pp)) = pattern.split_once(':') {
            if pm != method {
                continue;
            }
            if pattern_matches(pp, path) {
                let specificity = pp.len();
                if best.map(|(p, _)| p.len() < specificity).unwrap_or(true) {
                    best = Some((pattern, rule));
                }
            }
        }
    }
    best.map(|(_, r)| r)
}

fn pattern_matches(pattern: &str, path: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        path.starts_with(prefix)
    } else {
        pattern == path
    }
}

impl RateLimiter {
    pub fn new(redis: ConnectionManager, config: ReloadableConfig) -> Self {
        Self {
            redis,
            config,
            script: Script::new(SLIDING_WINDOW_SCRIPT),
            ban_script: Script::new(BAN_SCRIPT),
            local_fallback: LocalFallback::new(),
            degraded: AtomicBool::new(false),
            degraded_transitions: AtomicU64::new(0),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    fn mark_degraded(&self) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            self.degraded_transitions.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("rate limiter: Redis unreachable, falling back to local window");
        }
    }

    fn mark_healthy(&self) {
        self.degraded.store(false, Ordering::Relaxed);
    }

    async fn count_window(&self, window_key: &str, now: f64, window_secs: u64) -> u64 {
        let nonce: u32 = rand::random();
        let mut conn = self.redis.clone();
        let result: redis::RedisResult<u64> = self
            .script
            .key(window_key)
            .arg(now)
            .arg(window_secs as f64)
            .arg(nonce)
            .invoke_async(&mut conn)
            .await;
        match result {
            Ok(count) => {
                self.mark_healthy();
                count
            }
            Err(e) => {
                tracing::warn!(error = %e, "rate limiter: redis script failed, using local fallback");
                self.mark_degraded();
                self.local_fallback.count_and_insert(window_key, now, window_secs as f64)
            }
        }
    }

    async fn ban_active(&self, ip: &str) -> bool {
        let mut conn = self.redis.clone();
        let key = format!("ban|{}", ip);
        let result: redis::RedisResult<Option<String>> =
            redis::cmd("GET").arg(&key).query_async(&mut conn).await;
        matches!(result, Ok(Some(_)))
    }

    async fn set_ban(&self, ip: &str, ttl_secs: u64) {
        let key = format!("ban|{}", ip);
        let mut conn = self.redis.clone();
        if let Err(e) = self
            .ban_script
            .key(key)
            .arg(ttl_secs)
            .invoke_async::<_, i64>(&mut conn)
            .await
        {
            tracing::warn!(error = %e, "rate limiter: failed to set ban key");
        } else {
            tracing::warn!(ip, ttl_secs, "rate limiter: DDoS threshold crossed, ban set");
        }
    }

    /// `Allow(key, endpoint, user?, ip)` from §4.1.
    pub async fn allow(
        &self,
        method: &str,
        path: &str,
        user_id: Option<i64>,
        ip: &str,
        now: Option<f64>,
    ) -> Decision {
        let now = now.unwrap_or_else(now_secs);
        let table = self.config.rate_limits.load();

        if table.whitelist.iter().any(|w| w == ip) {
            return Decision { allowed: true, limit: u64::MAX, remaining: u64::MAX, reset_at: now as i64, retry_after: None, ban_active: false };
        }
        if table.blacklist.iter().any(|b| b == ip) {
            return Decision { allowed: false, limit: 0, remaining: 0, reset_at: now as i64, retry_after: Some(table.ban_duration_secs), ban_active: false };
        }

        if self.ban_active(ip).await {
            return Decision {
                allowed: false,
                limit: 0,
                remaining: 0,
                reset_at: (now + table.ban_duration_secs as f64) as i64,
                retry_after: Some(table.ban_duration_secs),
                ban_active: true,
            };
        }

        // Endpoint-specific scope.
        let mut worst: Option<(u64, u64, u64, u64)> = None; // (remaining, reset_at, retry_after, limit)
        let mut endpoint_count: Option<u64> = None;
        if let Some(rule) = resolve_endpoint_rule(&table, method, path) {
            let scope_key = format!("endpoint|{}:{}|{}", method, path, floor_window(now, rule.window_secs));
            let count = self.count_window(&scope_key, now, rule.window_secs).await;
            endpoint_count = Some(count);
            if count > rule.limit {
                worst = Some((0, (now + rule.window_secs as f64) as u64, rule.window_secs, rule.limit));
            }
        }

        // Per-IP global scope.
        let ip_rule = &table.global_ip_limit;
        let ip_key = format!("ip|{}|{}", ip, floor_window(now, ip_rule.window_secs));
        let ip_count = self.count_window(&ip_key, now, ip_rule.window_secs).await;
        if ip_count > ip_rule.limit && worst.is_none() {
            worst = Some((0, (now + ip_rule.window_secs as f64) as u64, ip_rule.window_secs, ip_rule.limit));
        }

        // Per-user scope (only if authenticated).
        if let Some(uid) = user_id {
            let user_key = format!("user|{}|{}", uid, floor_window(now, ip_rule.window_secs));
            let user_count = self.count_window(&user_key, now, ip_rule.window_secs).await;
            if user_count > ip_rule.limit && worst.is_none() {
                worst = Some((0, (now + ip_rule.window_secs as f64) as u64, ip_rule.window_secs, ip_rule.limit));
            }
        }

        // DDoS scope: per-minute count on the IP, independent of the other
        // scopes' verdicts, because crossing it bans regardless of budget.
        let ddos_key = format!("ddos|{}|{}", ip, floor_window(now, 60));
        let ddos_count = self.count_window(&ddos_key, now, 60).await;
        if ddos_count > table.ddos_threshold_per_minute {
            self.set_ban(ip, table.ban_duration_secs).await;
            return Decision {
                allowed: false,
                limit: table.ddos_threshold_per_minute,
                remaining: 0,
                reset_at: (now + table.ban_duration_secs as f64) as i64,
                retry_after: Some(table.ban_duration_secs),
                ban_active: true,
            };
        }

        match worst {
            Some((remaining, reset_at, retry_after, limit)) => Decision {
                allowed: false,
                limit,
                remaining,
                reset_at: reset_at as i64,
                retry_after: Some(retry_after),
                ban_active: false,
            },
            None => {
                let rule = resolve_endpoint_rule(&table, method, path).unwrap_or(ip_rule);
                let count = endpoint_count.unwrap_or(ip_count);
                let remaining = rule.limit.saturating_sub(count.max(1));
                Decision {
                    allowed: true,
                    limit: rule.limit,
                    remaining,
                    reset_at: (now + rule.window_secs as f64) as i64,
                    retry_after: None,
                    ban_active: false,
                }
            }
        }
    }

    // ---- admin surface ----

    pub fn get_config(&self) -> RateLimitTable {
        (**self.config.rate_limits.load()).clone()
    }

    pub fn reload_config(&self, table: RateLimitTable) {
        self.config.reload_rate_limits(table);
    }

    pub async fn reset(&self, scope: &str) -> redis::RedisResult<()> {
        let mut conn = self.redis.clone();
        let pattern = format!("{}*", scope);
        let keys: Vec<String> = redis::cmd("KEYS").arg(&pattern).query_async(&mut conn).await?;
        if !keys.is_empty() {
            redis::cmd("DEL").arg(keys).query_async::<_, ()>(&mut conn).await?;
        }
        Ok(())
    }

    pub fn get_stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            degraded: self.is_degraded(),
            degraded_transitions: self.degraded_transitions.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RateLimiterStats {
    pub degraded: bool,
    pub degraded_transitions: u64,
}

fn floor_window(now: f64, window_secs: u64) -> u64 {
    if window_secs == 0 {
        return 0;
    }
    (now as u64) / window_secs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn endpoint_pattern_resolution_prefers_specific() {
        let mut endpoint_rules = HashMap::new();
        endpoint_rules.insert("GET:/api/*".to_string(), RateLimitRule { limit: 100, window_secs: 60 });
        endpoint_rules.insert(
            "GET:/api/v1/demo/stress".to_string(),
            RateLimitRule { limit: 3, window_secs: 60 },
        );
        let table = RateLimitTable {
            endpoint_rules,
            global_ip_limit: RateLimitRule { limit: 600, window_secs: 60 },
            ddos_threshold_per_minute: 120,
            ban_duration_secs: 600,
            whitelist: vec![],
            blacklist: vec![],
        };
        let rule = resolve_endpoint_rule(&table, "GET", "/api/v1/demo/stress").unwrap();
        assert_eq!(rule.limit, 3);
        let rule = resolve_endpoint_rule(&table, "GET", "/api/v1/other").unwrap();
        assert_eq!(rule.limit, 100);
    }

    #[test]
    fn local_fallback_respects_window() {
        let fb = LocalFallback::new();
        let now = 1000.0;
        for _ in 0..3 {
            fb.count_and_insert("k", now, 60.0);
        }
        let count = fb.count_and_insert("k", now + 1.0, 60.0);
        assert_eq!(count, 4);
        let count_after_expiry = fb.count_and_insert("k", now + 120.0, 60.0);
        assert_eq!(count_after_expiry, 1);
    }
}
