//! Environment-driven configuration, with a hot-reloadable subset (rate-limit
//! table, CORS origins, log level) swapped atomically, the way §5 requires
//! for the rate-limiter pattern table.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_or_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub limit: u64,
    pub window_secs: u64,
}

/// The hot-reloadable table: endpoint pattern -> rule, plus global knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitTable {
    pub endpoint_rules: HashMap<String, RateLimitRule>,
    pub global_ip_limit: RateLimitRule,
    pub ddos_threshold_per_minute: u64,
    pub ban_duration_secs: u64,
    pub whitelist: Vec<String>,
    pub blacklist: Vec<String>,
}

impl Default for RateLimitTable {
    fn default() -> Self {
        let mut endpoint_rules = HashMap::new();
        endpoint_rules.insert(
            "GET:/api/v1/demo/stress".to_string(),
            RateLimitRule { limit: 3, window_secs: 60 },
        );
        endpoint_rules.insert(
            "POST:/api/v1/auth/*".to_string(),
            RateLimitRule { limit: 10, window_secs: 60 },
        );
        endpoint_rules.insert(
            "GET:/api/*".to_string(),
            RateLimitRule { limit: 120, window_secs: 60 },
        );
        Self {
            endpoint_rules,
            global_ip_limit: RateLimitRule { limit: 600, window_secs: 60 },
            ddos_threshold_per_minute: 120,
            ban_duration_secs: 600,
            whitelist: Vec::new(),
            blacklist: Vec::new(),
        }
    }
}

/// Reloadable config wrapped so hot-reload is an atomic pointer swap, never
/// a lock held across request processing.
#[derive(Clone)]
pub struct ReloadableConfig {
    pub rate_limits: Arc<ArcSwap<RateLimitTable>>,
    pub cors_origins: Arc<ArcSwap<Vec<String>>>,
}

impl ReloadableConfig {
    pub fn new(rate_limits: RateLimitTable, cors_origins: Vec<String>) -> Self {
        Self {
            rate_limits: Arc::new(ArcSwap::from_pointee(rate_limits)),
            cors_origins: Arc::new(ArcSwap::from_pointee(cors_origins)),
        }
    }

    pub fn reload_rate_limits(&self, table: RateLimitTable) {
        self.rate_limits.store(Arc::new(table));
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub read_replica_urls: Vec<String>,
    pub jwt_secret: String,
    pub access_token_ttl_secs: i64,
    pub refresh_token_ttl_secs: i64,
    pub refresh_token_ttl_remember_me_secs: i64,
    pub bcrypt_cost: u32,
    pub nats_url: Option<String>,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: String,
    pub smtp_password: String,
    pub smtp_from: String,
    pub notification_worker_count: usize,
    pub notification_max_retries: u32,
    pub notification_retry_delay_secs: u64,
    pub notification_backoff_factor: f64,
    pub email_rate_limit_per_minute: u64,
    pub audit_retention_days: i64,
    pub credential_ttl_secs: i64,
    pub rpc_max_attempts: u32,
    pub circuit_max_failures: u32,
    pub circuit_reset_secs: u64,
    pub bind_addr: String,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            database_url: env_or(
                "DATABASE_URL",
                "postgres://postgres@localhost:5432/veza?sslmode=disable",
            ),
            redis_url: env_or("REDIS_URL", "redis://localhost:6379"),
            read_replica_urls: std::env::var("READ_REPLICA_URLS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                .unwrap_or_default(),
            jwt_secret: env_or("JWT_SECRET", "change-me-in-production"),
            access_token_ttl_secs: 3600,
            refresh_token_ttl_secs: 7 * 24 * 3600,
            refresh_token_ttl_remember_me_secs: 30 * 24 * 3600,
            bcrypt_cost: env_or_parse("BCRYPT_COST", 12),
            nats_url: std::env::var("NATS_URL").ok(),
            smtp_host: env_or("SMTP_HOST", "localhost"),
            smtp_port: env_or_parse("SMTP_PORT", 1025),
            smtp_username: env_or("SMTP_USERNAME", ""),
            smtp_password: env_or("SMTP_PASSWORD", ""),
            smtp_from: env_or("SMTP_FROM", "no-reply@veza.example"),
            notification_worker_count: env_or_parse("NOTIFICATION_WORKERS", 4),
            notification_max_retries: env_or_parse("NOTIFICATION_MAX_RETRIES", 3),
            notification_retry_delay_secs: env_or_parse("NOTIFICATION_RETRY_DELAY_SECS", 30),
            notification_backoff_factor: env_or_parse("NOTIFICATION_BACKOFF_FACTOR", 2.0),
            email_rate_limit_per_minute: env_or_parse("EMAIL_RATE_LIMIT_PER_MINUTE", 100),
            audit_retention_days: env_or_parse("AUDIT_RETENTION_DAYS", 365),
            credential_ttl_secs: env_or_parse("CREDENTIAL_TTL_SECS", 300),
            rpc_max_attempts: env_or_parse("RPC_MAX_ATTEMPTS", 3),
            circuit_max_failures: env_or_parse("CIRCUIT_MAX_FAILURES", 3),
            circuit_reset_secs: env_or_parse("CIRCUIT_RESET_SECS", 30),
            bind_addr: env_or("BIND_ADDR", "0.0.0.0:8080"),
            log_level: env_or("LOG_LEVEL", "info"),
        }
    }
}
