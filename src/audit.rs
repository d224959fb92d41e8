//! Audit & event-sourcing engine (§4.4): enrichment, append-only persistence,
//! projection fan-out, sweepers.

use crate::event_bus::{BusEvent, EventTransport, Priority};
use crate::models::{AuditCategory, AuditEvent, AuditSeverity};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use sqlx::{Pool, Postgres};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Incoming event before enrichment: caller supplies what it knows, the
/// engine fills in `id`/`timestamp`/environment defaults.
#[derive(Debug, Clone, Default)]
pub struct AuditEventDraft {
    pub id: Option<String>,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub metadata: serde_json::Value,
    pub timestamp: Option<DateTime<Utc>>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    pub user_id: Option<i64>,
    pub session_id: Option<String>,
    pub ip: Option<String>,
    pub severity: AuditSeverity,
    pub category: AuditCategory,
}

static EVENT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn generate_id() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or(0);
    let counter = EVENT_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("audit_{}_{}", nanos, counter)
}

/// `ProcessEvent`/`GetName`/`Reset` capability set (§9).
#[async_trait]
pub trait Projection: Send + Sync {
    fn name(&self) -> &str;
    async fn process_event(&self, event: &AuditEvent) -> Result<(), anyhow::Error>;
    async fn reset(&self);
}

#[derive(Default)]
struct UserActivityState {
    events_by_user: HashMap<i64, u64>,
}

/// Records any event carrying a `user_id`.
pub struct UserActivityProjection {
    state: RwLock<UserActivityState>,
}

impl UserActivityProjection {
    pub fn new() -> Self {
        Self { state: RwLock::new(UserActivityState::default()) }
    }

    pub async fn count_for(&self, user_id: i64) -> u64 {
        self.state.read().await.events_by_user.get(&user_id).copied().unwrap_or(0)
    }
}

impl Default for UserActivityProjection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Projection for UserActivityProjection {
    fn name(&self) -> &str {
        "user_activity"
    }

    async fn process_event(&self, event: &AuditEvent) -> Result<(), anyhow::Error> {
        if let Some(uid) = event.user_id {
            let mut state = self.state.write().await;
            *state.events_by_user.entry(uid).or_insert(0) += 1;
        }
        Ok(())
    }

    async fn reset(&self) {
        self.state.write().await.events_by_user.clear();
    }
}

/// Acts on events with `category = security`; elevates alerts at `critical`.
pub struct SecurityEventsProjection {
    critical_alerts: AtomicU64,
    total: AtomicU64,
}

impl SecurityEventsProjection {
    pub fn new() -> Self {
        Self { critical_alerts: AtomicU64::new(0), total: AtomicU64::new(0) }
    }

    pub fn critical_alert_count(&self) -> u64 {
        self.critical_alerts.load(Ordering::Relaxed)
    }
}

impl Default for SecurityEventsProjection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Projection for SecurityEventsProjection {
    fn name(&self) -> &str {
        "security_events"
    }

    async fn process_event(&self, event: &AuditEvent) -> Result<(), anyhow::Error> {
        if event.category() != AuditCategory::Security {
            return Ok(());
        }
        self.total.fetch_add(1, Ordering::Relaxed);
        if event.severity() == AuditSeverity::Critical {
            self.critical_alerts.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(event_id = %event.id, "security projection: critical alert elevated");
        }
        Ok(())
    }

    async fn reset(&self) {
        self.critical_alerts.store(0, Ordering::Relaxed);
        self.total.store(0, Ordering::Relaxed);
    }
}

/// Acts on events with `category = data`; maintains change history.
pub struct DataChangesProjection {
    history: RwLock<Vec<(String, DateTime<Utc>)>>,
}

impl DataChangesProjection {
    pub fn new() -> Self {
        Self { history: RwLock::new(Vec::new()) }
    }

    pub async fn history_len(&self) -> usize {
        self.history.read().await.len()
    }
}

impl Default for DataChangesProjection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Projection for DataChangesProjection {
    fn name(&self) -> &str {
        "data_changes"
    }

    async fn process_event(&self, event: &AuditEvent) -> Result<(), anyhow::Error> {
        if event.category() != AuditCategory::Data {
            return Ok(());
        }
        self.history.write().await.push((event.aggregate_id.clone(), event.timestamp));
        Ok(())
    }

    async fn reset(&self) {
        self.history.write().await.clear();
    }
}

/// Projection registry: locked only during registration, dispatch reads a
/// snapshot (§5).
pub struct ProjectionRegistry {
    projections: RwLock<Vec<Arc<dyn Projection>>>,
    failure_counts: RwLock<HashMap<String, u64>>,
}

impl ProjectionRegistry {
    pub fn new() -> Self {
        Self { projections: RwLock::new(Vec::new()), failure_counts: RwLock::new(HashMap::new()) }
    }

    pub async fn register(&self, projection: Arc<dyn Projection>) {
        self.projections.write().await.push(projection);
    }

    /// A projection's failure never stops the others (§4.4); it's logged and
    /// counted instead.
    async fn dispatch(&self, event: &AuditEvent) {
        let snapshot: Vec<Arc<dyn Projection>> = self.projections.read().await.clone();
        for projection in snapshot {
            if let Err(e) = projection.process_event(event).await {
                tracing::warn!(projection = projection.name(), error = %e, "projection failed to process event");
                *self.failure_counts.write().await.entry(projection.name().to_string()).or_insert(0) += 1;
            }
        }
    }

    pub async fn failure_count(&self, projection_name: &str) -> u64 {
        self.failure_counts.read().await.get(projection_name).copied().unwrap_or(0)
    }
}

impl Default for ProjectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Append-only event store backed by Postgres (§4.4 "Persistence").
pub struct AuditEngine {
    db: Pool<Postgres>,
    bus: Arc<dyn EventTransport>,
    pub projections: ProjectionRegistry,
    retention_days: i64,
}

impl AuditEngine {
    pub fn new(db: Pool<Postgres>, bus: Arc<dyn EventTransport>, retention_days: i64) -> Self {
        Self { db, bus, projections: ProjectionRegistry::new(), retention_days }
    }

    fn enrich(&self, draft: AuditEventDraft) -> AuditEvent {
        AuditEvent {
            id: draft.id.unwrap_or_else(generate_id),
            aggregate_id: draft.aggregate_id,
            aggregate_type: draft.aggregate_type,
            event_type: draft.event_type,
            event_data: draft.event_data,
            metadata: draft.metadata,
            timestamp: draft.timestamp.unwrap_or_else(Utc::now),
            version: 0,
            correlation_id: draft.correlation_id,
            causation_id: draft.causation_id,
            user_id: draft.user_id,
            session_id: draft.session_id,
            ip: draft.ip,
            severity: draft.severity.as_str().to_string(),
            category: draft.category.as_str().to_string(),
        }
    }

    /// Validates presence of required fields (§4.4).
    fn validate(event: &AuditEvent) -> Result<(), String> {
        if event.id.is_empty() || event.aggregate_id.is_empty() || event.aggregate_type.is_empty() || event.event_type.is_empty() {
            return Err("audit event missing required field".to_string());
        }
        Ok(())
    }

    /// Persists, then fans out to projections, then publishes on the bus.
    /// Persistence must precede bus publication; publication failure is
    /// warn-only and never undoes persistence (§4.4).
    pub async fn record(&self, draft: AuditEventDraft) -> Result<AuditEvent, anyhow::Error> {
        let event = self.enrich(draft);
        Self::validate(&event).map_err(anyhow::Error::msg)?;

        let next_version: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM audit_events WHERE aggregate_id = $1",
        )
        .bind(&event.aggregate_id)
        .fetch_one(&self.db)
        .await?;
        let mut event = event;
        event.version = next_version;

        sqlx::query(
            r#"INSERT INTO audit_events
               (id, aggregate_id, aggregate_type, event_type, event_data, metadata,
                timestamp, version, correlation_id, causation_id, user_id, session_id,
                ip, severity, category)
               VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)"#,
        )
        .bind(&event.id)
        .bind(&event.aggregate_id)
        .bind(&event.aggregate_type)
        .bind(&event.event_type)
        .bind(&event.event_data)
        .bind(&event.metadata)
        .bind(event.timestamp)
        .bind(event.version)
        .bind(&event.correlation_id)
        .bind(&event.causation_id)
        .bind(event.user_id)
        .bind(&event.session_id)
        .bind(&event.ip)
        .bind(&event.severity)
        .bind(&event.category)
        .execute(&self.db)
        .await?;

        self.projections.dispatch(&event).await;

        let bus_event = BusEvent::new(
            &event.event_type,
            "audit_engine",
            "audit",
            json!(event),
            severity_priority(event.severity()),
        );
        if let Err(e) = self.bus.publish(bus_event).await {
            tracing::warn!(event_id = %event.id, error = %e, "audit: bus publish failed, persistence already committed");
        }

        Ok(event)
    }

    pub async fn get_events(&self, aggregate_id: &str, from_version: i64) -> Result<Vec<AuditEvent>, anyhow::Error> {
        let rows = sqlx::query_as::<_, AuditEvent>(
            "SELECT * FROM audit_events WHERE aggregate_id = $1 AND version >= $2 ORDER BY version ASC",
        )
        .bind(aggregate_id)
        .bind(from_version)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    pub async fn get_events_by_type(&self, event_type: &str, limit: i64) -> Result<Vec<AuditEvent>, anyhow::Error> {
        let rows = sqlx::query_as::<_, AuditEvent>(
            "SELECT * FROM audit_events WHERE event_type = $1 ORDER BY timestamp DESC LIMIT $2",
        )
        .bind(event_type)
        .bind(limit)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    pub async fn get_events_by_time_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<AuditEvent>, anyhow::Error> {
        let rows = sqlx::query_as::<_, AuditEvent>(
            "SELECT * FROM audit_events WHERE timestamp >= $1 AND timestamp <= $2 ORDER BY timestamp ASC",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    pub async fn get_events_by_user(&self, user_id: i64, limit: i64) -> Result<Vec<AuditEvent>, anyhow::Error> {
        let rows = sqlx::query_as::<_, AuditEvent>(
            "SELECT * FROM audit_events WHERE user_id = $1 ORDER BY timestamp DESC LIMIT $2",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    /// Daily cleanup of events older than `retention_period`, excluding
    /// `critical` (§3.3, §4.4).
    pub async fn sweep_expired(&self) -> Result<u64, anyhow::Error> {
        let cutoff = Utc::now() - ChronoDuration::days(self.retention_days);
        let result = sqlx::query(
            "DELETE FROM audit_events WHERE timestamp < $1 AND severity NOT IN ('critical', 'error')",
        )
        .bind(cutoff)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn run_sweeper_loop(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(24 * 3600));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.sweep_expired().await {
                        Ok(n) => tracing::info!(deleted = n, "audit sweeper: purged expired events"),
                        Err(e) => tracing::error!(error = %e, "audit sweeper failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
            }
        }
    }
}

fn severity_priority(sev: AuditSeverity) -> Priority {
    match sev {
        AuditSeverity::Info => Priority::Normal,
        AuditSeverity::Warning | AuditSeverity::Error => Priority::High,
        AuditSeverity::Critical => Priority::Critical,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn user_activity_projection_counts_and_resets() {
        let proj = UserActivityProjection::new();
        let event = AuditEvent {
            id: "a1".into(),
            aggregate_id: "user:1".into(),
            aggregate_type: "user".into(),
            event_type: "login".into(),
            event_data: json!({}),
            metadata: json!({}),
            timestamp: Utc::now(),
            version: 1,
            correlation_id: None,
            causation_id: None,
            user_id: Some(42),
            session_id: None,
            ip: None,
            severity: "info".into(),
            category: "authentication".into(),
        };
        proj.process_event(&event).await.unwrap();
        proj.process_event(&event).await.unwrap();
        assert_eq!(proj.count_for(42).await, 2);
        proj.reset().await;
        assert_eq!(proj.count_for(42).await, 0);
    }

    #[tokio::test]
    async fn security_projection_elevates_on_critical() {
        let proj = SecurityEventsProjection::new();
        let mut event = AuditEvent {
            id: "a1".into(),
            aggregate_id: "x".into(),
            aggregate_type: "x".into(),
            event_type: "intrusion".into(),
            event_data: json!({}),
            metadata: json!({}),
            timestamp: Utc::now(),
            version: 1,
            correlation_id: None,
            causation_id: None,
            user_id: None,
            session_id: None,
            ip: None,
            severity: "critical".into(),
            category: "security".into(),
        };
        proj.process_event(&event).await.unwrap();
        assert_eq!(proj.critical_alert_count(), 1);
        event.severity = "info".into();
        proj.process_event(&event).await.unwrap();
        assert_eq!(proj.critical_alert_count(), 1);
    }
}
