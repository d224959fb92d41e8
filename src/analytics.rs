//! Analytics / read-replica router (§4.7): routes read-only queries tagged
//! by category to a replica handle chosen by one of three strategies, with
//! health tracking and degraded-mode fallback when every replica is down.

use crate::error::AppError;
use crate::metrics;
use sqlx::{Pool, Postgres};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaStrategy {
    RoundRobin,
    LeastLatency,
    WeightedRound,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ReplicaHealthSnapshot {
    pub name: String,
    pub healthy: bool,
    pub latency_ms: i64,
}

pub struct Replica {
    pub name: String,
    pool: Pool<Postgres>,
    weight: u32,
    healthy: AtomicBool,
    latency_ms: AtomicI64,
}

impl Replica {
    pub fn new(name: impl Into<String>, pool: Pool<Postgres>, weight: u32) -> Self {
        Self { name: name.into(), pool, weight: weight.max(1), healthy: AtomicBool::new(true), latency_ms: AtomicI64::new(0) }
    }

    pub fn snapshot(&self) -> ReplicaHealthSnapshot {
        ReplicaHealthSnapshot {
            name: self.name.clone(),
            healthy: self.healthy.load(Ordering::Relaxed),
            latency_ms: self.latency_ms.load(Ordering::Relaxed),
        }
    }
}

pub struct AnalyticsConfig {
    pub max_concurrent_queries: usize,
    pub query_timeout: Duration,
    pub slow_query_threshold: Duration,
    pub health_check_interval: Duration,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_queries: 50,
            query_timeout: Duration::from_secs(300),
            slow_query_threshold: Duration::from_secs(2),
            health_check_interval: Duration::from_secs(15),
        }
    }
}

/// Round-robin / least-latency / weighted-round replica router, with
/// optional per-category dedicated pools (§4.7 "Configuration").
pub struct AnalyticsRouter {
    default_replicas: Vec<Arc<Replica>>,
    category_replicas: HashMap<String, Vec<Arc<Replica>>>,
    strategy: ReplicaStrategy,
    config: AnalyticsConfig,
    rr_counter: AtomicUsize,
    concurrency: Semaphore,
    degraded: AtomicBool,
}

impl AnalyticsRouter {
    pub fn new(default_replicas: Vec<Arc<Replica>>, strategy: ReplicaStrategy, config: AnalyticsConfig) -> Self {
        let concurrency = Semaphore::new(config.max_concurrent_queries);
        Self {
            default_replicas,
            category_replicas: HashMap::new(),
            strategy,
            config,
            rr_counter: AtomicUsize::new(0),
            concurrency,
            degraded: AtomicBool::new(false),
        }
    }

    pub fn with_category_pool(mut self, category: impl Into<String>, replicas: Vec<Arc<Replica>>) -> Self {
        self.category_replicas.insert(category.into(), replicas);
        self
    }

    fn replicas_for(&self, category: &str) -> &[Arc<Replica>] {
        self.category_replicas.get(category).map(|v| v.as_slice()).unwrap_or(&self.default_replicas)
    }

    /// Picks a replica for `category` per the configured strategy. Falls
    /// back to the first replica (degraded mode) when none are healthy.
    fn select(&self, category: &str) -> Result<Arc<Replica>, AppError> {
        let pool = self.replicas_for(category);
        if pool.is_empty() {
            return Err(AppError::Internal(anyhow::anyhow!("no replicas configured for category {category}")));
        }

        let healthy: Vec<&Arc<Replica>> = pool.iter().filter(|r| r.healthy.load(Ordering::Relaxed)).collect();
        if healthy.is_empty() {
            self.degraded.store(true, Ordering::Relaxed);
            tracing::warn!(category, "analytics router: all replicas unhealthy, falling back to first");
            return Ok(pool[0].clone());
        }
        self.degraded.store(false, Ordering::Relaxed);

        let chosen = match self.strategy {
            ReplicaStrategy::RoundRobin => {
                let idx = self.rr_counter.fetch_add(1, Ordering::Relaxed) % healthy.len();
                healthy[idx]
            }
            ReplicaStrategy::LeastLatency => *healthy
                .iter()
                .min_by_key(|r| r.latency_ms.load(Ordering::Relaxed))
                .expect("non-empty healthy set"),
            ReplicaStrategy::WeightedRound => {
                let total_weight: u32 = healthy.iter().map(|r| r.weight).sum();
                let mut target = (self.rr_counter.fetch_add(1, Ordering::Relaxed) as u32) % total_weight.max(1);
                let mut pick = healthy[0];
                for r in &healthy {
                    if target < r.weight {
                        pick = *r;
                        break;
                    }
                    target -= r.weight;
                }
                pick
            }
        };

        Ok(chosen.clone())
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Runs a read-only query against the replica selected for `category`,
    /// bounded by the configured concurrency limit and query timeout, and
    /// records duration/slow-query metrics.
    pub async fn query<F, Fut, T>(&self, category: &str, query: F) -> Result<T, AppError>
    where
        F: FnOnce(Pool<Postgres>) -> Fut,
        Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        let _permit = self
            .concurrency
            .acquire()
            .await
            .map_err(|_| AppError::Internal(anyhow::anyhow!("analytics concurrency semaphore closed")))?;
        metrics::set_concurrent_queries((self.config.max_concurrent_queries - self.concurrency.available_permits()) as i64);

        let replica = self.select(category)?;
        let timer = metrics::QueryTimer::start(category, &replica.name);
        let started = std::time::Instant::now();

        let result = tokio::time::timeout(self.config.query_timeout, query(replica.pool.clone()))
            .await
            .map_err(|_| AppError::Timeout)?
            .map_err(|e| AppError::Internal(e.into()));

        drop(timer);
        if started.elapsed() >= self.config.slow_query_threshold {
            metrics::record_slow_query(category);
        }

        result
    }

    /// Pings every replica with a cheap round-trip and updates health +
    /// latency; intended to be driven by a periodic background task.
    pub async fn health_check_once(replicas: &[Arc<Replica>]) {
        for replica in replicas {
            let start = std::time::Instant::now();
            let healthy = sqlx::query("SELECT 1").execute(&replica.pool).await.is_ok();
            let latency_ms = start.elapsed().as_millis() as i64;
            replica.healthy.store(healthy, Ordering::Relaxed);
            replica.latency_ms.store(latency_ms, Ordering::Relaxed);
            metrics::set_replica_health(&replica.name, healthy);
        }
    }

    pub fn all_replicas(&self) -> Vec<Arc<Replica>> {
        let mut all = self.default_replicas.clone();
        for v in self.category_replicas.values() {
            all.extend(v.iter().cloned());
        }
        all
    }

    pub async fn run_health_check_loop(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.health_check_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let replicas = self.all_replicas();
                    Self::health_check_once(&replicas).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
            }
        }
    }

    pub fn health_snapshot(&self) -> Vec<ReplicaHealthSnapshot> {
        self.all_replicas().iter().map(|r| r.snapshot()).collect()
    }
}

/// Query category tags named in §4.7.
pub mod category {
    pub const USER_ANALYTICS: &str = "user_analytics";
    pub const CHAT_ANALYTICS: &str = "chat_analytics";
    pub const PERFORMANCE_ANALYTICS: &str = "performance_analytics";
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_pool() -> Pool<Postgres> {
        sqlx::postgres::PgPoolOptions::new().connect_lazy("postgres://invalid/invalid").expect("lazy pool")
    }

    #[tokio::test]
    async fn round_robin_cycles_through_healthy_replicas() {
        let replicas = vec![
            Arc::new(Replica::new("a", dummy_pool(), 1)),
            Arc::new(Replica::new("b", dummy_pool(), 1)),
        ];
        let router = AnalyticsRouter::new(replicas, ReplicaStrategy::RoundRobin, AnalyticsConfig::default());
        let first = router.select("user_analytics").unwrap();
        let second = router.select("user_analytics").unwrap();
        assert_ne!(first.name, second.name);
    }

    #[tokio::test]
    async fn falls_back_to_first_when_all_unhealthy() {
        let replicas = vec![Arc::new(Replica::new("a", dummy_pool(), 1)), Arc::new(Replica::new("b", dummy_pool(), 1))];
        for r in &replicas {
            r.healthy.store(false, Ordering::Relaxed);
        }
        let router = AnalyticsRouter::new(replicas, ReplicaStrategy::RoundRobin, AnalyticsConfig::default());
        let chosen = router.select("user_analytics").unwrap();
        assert_eq!(chosen.name, "a");
        assert!(router.is_degraded());
    }
}
