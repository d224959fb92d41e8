//! Event bus (§4.3): at-least-once publish/subscribe, durable for streamed
//! subjects, per-subject FIFO, replay, and DLQ routing on handler exhaustion.
//!
//! `EventTransport` is the capability the rest of the crate depends on; the
//! in-memory transport backs tests and single-node deployments, the NATS
//! transport (`async-nats`, grounded on the chat-domain examples in the
//! retrieval pack that reach for a real broker) backs durable streaming.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    pub subject: String,
    pub data: serde_json::Value,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<String>,
    pub user_id: Option<i64>,
}

impl BusEvent {
    pub fn new(event_type: &str, source: &str, subject: &str, data: serde_json::Value, priority: Priority) -> Self {
        Self {
            id: format!("evt_{}", uuid::Uuid::new_v4()),
            event_type: event_type.to_string(),
            source: source.to_string(),
            subject: subject.to_string(),
            data,
            priority,
            timestamp: Utc::now(),
            correlation_id: None,
            user_id: None,
        }
    }

    pub fn with_correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

pub type HandlerResult = Result<(), String>;

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &BusEvent) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(BusEvent) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, event: &BusEvent) -> HandlerResult {
        (self)(event.clone()).await
    }
}

pub struct Subscription {
    cancel: mpsc::Sender<()>,
}

impl Subscription {
    pub async fn cancel(self) {
        let _ = self.cancel.send(()).await;
    }
}

#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn publish(&self, event: BusEvent) -> Result<(), String>;
    async fn subscribe(&self, subject: &str, handler: Arc<dyn EventHandler>, max_attempts: u32) -> Subscription;
    /// Replay events on a streamed subject from a timestamp, for projection rebuilds.
    async fn replay(&self, subject: &str, from: DateTime<Utc>) -> Vec<BusEvent>;
}

struct SubjectLog {
    events: VecDeque<BusEvent>,
    subscribers: Vec<mpsc::Sender<BusEvent>>,
}

/// Durable, per-subject FIFO in-memory transport. Cross-subject ordering is
/// not guaranteed, matching §4.3; duplicate delivery can occur because a
/// handler failure re-delivers up to `max_attempts` before DLQ routing.
type SubjectMap = Arc<RwLock<std::collections::HashMap<String, Arc<Mutex<SubjectLog>>>>>;

pub struct InMemoryEventBus {
    subjects: SubjectMap,
    dlq_subject: String,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self { subjects: Arc::new(RwLock::new(std::collections::HashMap::new())), dlq_subject: "dlq".to_string() }
    }

    async fn log_for(&self, subject: &str) -> Arc<Mutex<SubjectLog>> {
        log_for(&self.subjects, subject).await
    }
}

/// Auto-creating subject-log lookup, free-standing so it can be called from
/// the retry task `subscribe` spawns (which only holds a clone of
/// `subjects`, not `&self`).
async fn log_for(subjects: &SubjectMap, subject: &str) -> Arc<Mutex<SubjectLog>> {
    if let Some(log) = subjects.read().await.get(subject) {
        return log.clone();
    }
    let mut write = subjects.write().await;
    write
        .entry(subject.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(SubjectLog { events: VecDeque::new(), subscribers: Vec::new() })))
        .clone()
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventTransport for InMemoryEventBus {
    async fn publish(&self, event: BusEvent) -> Result<(), String> {
        let log = self.log_for(&event.subject).await;
        let mut guard = log.lock().await;
        guard.events.push_back(event.clone());
        if guard.events.len() > 10_000 {
            guard.events.pop_front();
        }
        for sub in &guard.subscribers {
            let _ = sub.send(event.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, subject: &str, handler: Arc<dyn EventHandler>, max_attempts: u32) -> Subscription {
        let log = self.log_for(subject).await;
        let (tx, mut rx) = mpsc::channel::<BusEvent>(1024);
        log.lock().await.subscribers.push(tx);

        let (cancel_tx, mut cancel_rx) = mpsc::channel::<()>(1);
        let dlq_subject = self.dlq_subject.clone();
        let subjects = self.subjects.clone();
        let subject_owned = subject.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_rx.recv() => break,
                    maybe_event = rx.recv() => {
                        let Some(event) = maybe_event else { break };
                        let mut attempt = 0;
                        loop {
                            attempt += 1;
                            match handler.handle(&event).await {
                                Ok(()) => break,
                                Err(cause) if attempt < max_attempts => continue,
                                Err(cause) => {
                                    tracing::warn!(subject = %subject_owned, cause = %cause, "event handler exhausted retries, routing to DLQ");
                                    let dlq_event = BusEvent::new(
                                        "dlq",
                                        "event_bus",
                                        &dlq_subject,
                                        serde_json::json!({"original_subject": subject_owned, "event": event, "cause": cause}),
                                        Priority::High,
                                    );
                                    let log = log_for(&subjects, &dlq_subject).await;
                                    let mut guard = log.lock().await;
                                    guard.events.push_back(dlq_event.clone());
                                    for sub in &guard.subscribers {
                                        let _ = sub.send(dlq_event.clone()).await;
                                    }
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        });

        Subscription { cancel: cancel_tx }
    }

    async fn replay(&self, subject: &str, from: DateTime<Utc>) -> Vec<BusEvent> {
        let log = self.log_for(subject).await;
        let guard = log.lock().await;
        guard.events.iter().filter(|e| e.timestamp >= from).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn publish_then_replay_returns_event() {
        let bus = InMemoryEventBus::new();
        let event = BusEvent::new("message_created", "chat", "messages", serde_json::json!({"id": 1}), Priority::Normal);
        bus.publish(event.clone()).await.unwrap();
        let replayed = bus.replay("messages", event.timestamp - chrono::Duration::seconds(1)).await;
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].id, event.id);
    }

    #[tokio::test]
    async fn failing_handler_routes_to_dlq_after_max_attempts() {
        let bus = Arc::new(InMemoryEventBus::new());
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let handler: Arc<dyn EventHandler> = Arc::new(move |_event: BusEvent| {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err("boom".to_string())
            }
        });

        let dlq_handler_called = Arc::new(AtomicU32::new(0));
        let dlq_called_clone = dlq_handler_called.clone();
        let dlq_handler: Arc<dyn EventHandler> = Arc::new(move |_event: BusEvent| {
            let c = dlq_called_clone.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let _sub = bus.subscribe("messages", handler, 2).await;
        let _dlq_sub = bus.subscribe("dlq", dlq_handler, 1).await;

        let event = BusEvent::new("message_created", "chat", "messages", serde_json::json!({}), Priority::Normal);
        bus.publish(event).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(dlq_handler_called.load(Ordering::SeqCst), 1);
    }
}
