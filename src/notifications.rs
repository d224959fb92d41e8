//! Notification engine (§4.5): priority queues over the event bus, templated
//! rendering, SMTP delivery, retry with backoff, scheduled delivery, DLQ.

use crate::event_bus::{BusEvent, EventHandler, EventTransport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::message::{Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message as MailMessage, Tokio1Executor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub use crate::event_bus::Priority;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    pub language: String,
    pub subject: String,
    pub body: String,
    pub html_body: Option<String>,
}

/// Registered by `{name, language}` with fallback to `{name}` (§4.5).
#[derive(Default)]
pub struct TemplateRegistry {
    templates: RwLock<HashMap<(String, String), Template>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self { templates: RwLock::new(HashMap::new()) }
    }

    pub fn with_defaults() -> Self {
        let registry = Self::new();
        for t in default_templates() {
            let key = (t.name.clone(), t.language.clone());
            registry.templates.blocking_write_or_panic(key, t);
        }
        registry
    }

    pub async fn register(&self, template: Template) {
        let key = (template.name.clone(), template.language.clone());
        self.templates.write().await.insert(key, template);
    }

    pub async fn resolve(&self, name: &str, language: &str) -> Option<Template> {
        let templates = self.templates.read().await;
        if let Some(t) = templates.get(&(name.to_string(), language.to_string())) {
            return Some(t.clone());
        }
        templates.get(&(name.to_string(), "en".to_string())).cloned()
    }
}

/// Small helper to make `with_defaults` synchronous-friendly without an
/// async constructor; registration at startup never contends with readers.
trait BlockingInsert {
    fn blocking_write_or_panic(&self, key: (String, String), value: Template);
}

impl BlockingInsert for RwLock<HashMap<(String, String), Template>> {
    fn blocking_write_or_panic(&self, key: (String, String), value: Template) {
        self.try_write().expect("template registry uncontended at startup").insert(key, value);
    }
}

fn default_templates() -> Vec<Template> {
    vec![
        Template {
            name: "welcome".into(),
            language: "en".into(),
            subject: "Welcome, {{username}}!".into(),
            body: "Hi {{username}}, welcome aboard.".into(),
            html_body: Some("<p>Hi {{username}}, welcome aboard.</p>".into()),
        },
        Template {
            name: "verification".into(),
            language: "en".into(),
            subject: "Verify your account".into(),
            body: "Your verification code is {{code}}.".into(),
            html_body: Some("<p>Your verification code is <b>{{code}}</b>.</p>".into()),
        },
        Template {
            name: "password_reset".into(),
            language: "en".into(),
            subject: "Reset your password".into(),
            body: "Use this link to reset your password: {{reset_link}}".into(),
            html_body: Some("<p>Use this link to reset your password: <a href=\"{{reset_link}}\">{{reset_link}}</a></p>".into()),
        },
    ]
}

/// Replaces `{{var}}` placeholders in subject/body/html_body.
fn render(template: &str, data: &HashMap<String, String>) -> String {
    let mut out = template.to_string();
    for (k, v) in data {
        out = out.replace(&format!("{{{{{}}}}}", k), v);
    }
    out
}

#[derive(Debug, Clone)]
pub struct RenderedNotification {
    pub subject: String,
    pub body: String,
    pub html_body: Option<String>,
}

pub fn render_notification(template: &Template, message: &crate::models::NotificationMessage) -> RenderedNotification {
    RenderedNotification {
        subject: message.subject.clone().unwrap_or_else(|| render(&template.subject, &message.data)),
        body: render(&template.body, &message.data),
        html_body: template.html_body.as_ref().map(|h| render(h, &message.data)),
    }
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, rendered: &RenderedNotification) -> Result<(), String>;
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
}

impl SmtpMailer {
    pub fn new(host: &str, port: u16, username: &str, password: &str, from: &str) -> Result<Self, String> {
        let builder = if username.is_empty() {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host).port(port)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::relay(host)
                .map_err(|e| e.to_string())?
                .port(port)
                .credentials(Credentials::new(username.to_string(), password.to_string()))
        };
        Ok(Self { transport: builder.build(), from: from.to_string() })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, to: &str, rendered: &RenderedNotification) -> Result<(), String> {
        let from: Mailbox = self.from.parse().map_err(|e: lettre::address::AddressError| e.to_string())?;
        let to: Mailbox = to.parse().map_err(|e: lettre::address::AddressError| e.to_string())?;

        let email = if let Some(html) = &rendered.html_body {
            MailMessage::builder()
                .from(from)
                .to(to)
                .subject(&rendered.subject)
                .multipart(
                    MultiPart::alternative()
                        .singlepart(SinglePart::plain(rendered.body.clone()))
                        .singlepart(SinglePart::html(html.clone())),
                )
                .map_err(|e| e.to_string())?
        } else {
            MailMessage::builder()
                .from(from)
                .to(to)
                .subject(&rendered.subject)
                .body(rendered.body.clone())
                .map_err(|e| e.to_string())?
        };

        self.transport.send(email).await.map_err(|e| e.to_string())?;
        Ok(())
    }
}

/// Stub mailer for tests: records every attempt and can be told to fail.
pub struct StubMailer {
    pub sent: RwLock<Vec<(String, String)>>,
    pub fail: std::sync::atomic::AtomicBool,
}

impl StubMailer {
    pub fn new(fail: bool) -> Self {
        Self { sent: RwLock::new(Vec::new()), fail: std::sync::atomic::AtomicBool::new(fail) }
    }
}

#[async_trait]
impl Mailer for StubMailer {
    async fn send(&self, to: &str, rendered: &RenderedNotification) -> Result<(), String> {
        if self.fail.load(std::sync::atomic::Ordering::Relaxed) {
            return Err("smtp error".to_string());
        }
        self.sent.write().await.push((to.to_string(), rendered.subject.clone()));
        Ok(())
    }
}

/// A message routed to DLQ carries the original payload, cause, retry count
/// and failure timestamp (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub notification: crate::models::NotificationMessage,
    pub cause: String,
    pub retry_count: u32,
    pub failed_at: DateTime<Utc>,
}

pub struct NotificationConfig {
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub backoff_factor: f64,
}

pub struct NotificationEngine {
    bus: Arc<dyn EventTransport>,
    templates: Arc<TemplateRegistry>,
    mailer: Arc<dyn Mailer>,
    config: NotificationConfig,
}

fn subject_for(kind: &str) -> &'static str {
    match kind {
        k if k.starts_with("push") => "push",
        k if k.starts_with("in_app") => "in_app",
        k if k.starts_with("sms") => "sms",
        _ => "email",
    }
}

impl NotificationEngine {
    pub fn new(bus: Arc<dyn EventTransport>, templates: Arc<TemplateRegistry>, mailer: Arc<dyn Mailer>, config: NotificationConfig) -> Self {
        Self { bus, templates, mailer, config }
    }

    /// `QueueNotification` (§4.5 step 1): validates then publishes on the
    /// type-specific subject with priority mapped from the message.
    pub async fn queue(&self, message: crate::models::NotificationMessage) -> Result<(), String> {
        if message.id.is_empty() {
            return Err("notification id required".to_string());
        }
        if message.recipients.is_empty() {
            return Err("at least one recipient required".to_string());
        }
        if message.template.is_empty() {
            return Err("template required".to_string());
        }

        let subject = subject_for(&message.kind);
        let event = BusEvent::new("notification_queued", "notification_engine", subject, serde_json::json!(message), message.priority);
        self.bus.publish(event).await
    }

    async fn requeue_delayed(&self, message: crate::models::NotificationMessage, subject: &str, delay: std::time::Duration) {
        let bus = self.bus.clone();
        let subject = subject.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let event = BusEvent::new("notification_requeued", "notification_engine", &subject, serde_json::json!(message), message.priority);
            let _ = bus.publish(event).await;
        });
    }

    /// Processes one message per the §4.5 lifecycle: schedule check, expiry
    /// check, render+deliver, retry-with-backoff or DLQ on failure.
    pub async fn process(&self, mut message: crate::models::NotificationMessage) {
        if let Some(scheduled_at) = message.scheduled_at {
            let remaining = scheduled_at - Utc::now();
            if remaining > chrono::Duration::zero() {
                let delay = remaining.to_std().unwrap_or(std::time::Duration::ZERO);
                let subject = subject_for(&message.kind).to_string();
                self.requeue_delayed(message, &subject, delay).await;
                return;
            }
        }

        if let Some(expires_at) = message.expires_at {
            if expires_at < Utc::now() {
                tracing::warn!(notification_id = %message.id, "notification expired before delivery");
                return;
            }
        }

        let template = match self.templates.resolve(&message.template, &message.language).await {
            Some(t) => t,
            None => {
                self.route_to_dlq(message, "template not found".to_string()).await;
                return;
            }
        };
        let rendered = render_notification(&template, &message);

        let mut failure = None;
        for recipient in &message.recipients {
            if let Err(e) = self.mailer.send(recipient, &rendered).await {
                failure = Some(e);
                break;
            }
        }

        match failure {
            None => {}
            Some(cause) => {
                if message.retry_count < self.config.max_retries {
                    message.retry_count += 1;
                    let delay_secs = self.config.retry_delay_secs as f64
                        * message.retry_count as f64
                        * self.config.backoff_factor;
                    self.requeue_delayed(message, "retry", std::time::Duration::from_secs_f64(delay_secs)).await;
                } else {
                    self.route_to_dlq(message, cause).await;
                }
            }
        }
    }

    async fn route_to_dlq(&self, message: crate::models::NotificationMessage, cause: String) {
        let entry = DlqEntry { retry_count: message.retry_count, notification: message, cause, failed_at: Utc::now() };
        tracing::warn!(notification_id = %entry.notification.id, cause = %entry.cause, "notification routed to DLQ");
        let event = BusEvent::new("notification_dlq", "notification_engine", "dlq", serde_json::json!(entry), Priority::High);
        let _ = self.bus.publish(event).await;
    }
}

/// Subscribes the engine to all four primary subjects plus `retry`, so a
/// worker pool of `worker_count` tasks (via the bus's own concurrency) drains
/// them (§4.5 "Rate & concurrency").
pub struct NotificationWorker {
    engine: Arc<NotificationEngine>,
}

#[async_trait]
impl EventHandler for NotificationWorker {
    async fn handle(&self, event: &BusEvent) -> Result<(), String> {
        let message: crate::models::NotificationMessage =
            serde_json::from_value(event.data.clone()).map_err(|e| e.to_string())?;
        self.engine.process(message).await;
        Ok(())
    }
}

impl NotificationWorker {
    pub fn new(engine: Arc<NotificationEngine>) -> Self {
        Self { engine }
    }

    pub async fn spawn_all(self: Arc<Self>, bus: Arc<dyn EventTransport>, max_attempts: u32) -> Vec<crate::event_bus::Subscription> {
        let mut subs = Vec::new();
        for subject in ["email", "push", "in_app", "sms", "retry"] {
            subs.push(bus.subscribe(subject, self.clone(), max_attempts).await);
        }
        subs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::InMemoryEventBus;
    use crate::models::NotificationMessage;
    use std::collections::HashMap as Map;

    fn sample_message(id: &str) -> NotificationMessage {
        NotificationMessage {
            id: id.to_string(),
            kind: "email_welcome".into(),
            recipients: vec!["user@example.com".into()],
            subject: None,
            template: "welcome".into(),
            data: Map::from([("username".to_string(), "alice".to_string())]),
            priority: Priority::Normal,
            scheduled_at: None,
            expires_at: None,
            language: "en".into(),
            user_id: Some(1),
            retry_count: 0,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn happy_path_delivers_once() {
        let bus: Arc<dyn EventTransport> = Arc::new(InMemoryEventBus::new());
        let templates = Arc::new(TemplateRegistry::with_defaults());
        let mailer = Arc::new(StubMailer::new(false));
        let engine = NotificationEngine::new(
            bus,
            templates,
            mailer.clone(),
            NotificationConfig { max_retries: 3, retry_delay_secs: 1, backoff_factor: 2.0 },
        );
        engine.process(sample_message("n1")).await;
        assert_eq!(mailer.sent.read().await.len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_route_to_dlq() {
        let bus: Arc<dyn EventTransport> = Arc::new(InMemoryEventBus::new());
        let dlq_count = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let dlq_count_clone = dlq_count.clone();
        let _sub = bus
            .subscribe(
                "dlq",
                Arc::new(move |_e: BusEvent| {
                    let c = dlq_count_clone.clone();
                    async move {
                        c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        Ok(())
                    }
                }),
                1,
            )
            .await;

        let templates = Arc::new(TemplateRegistry::with_defaults());
        let mailer = Arc::new(StubMailer::new(true));
        let engine = Arc::new(NotificationEngine::new(
            bus,
            templates,
            mailer,
            NotificationConfig { max_retries: 3, retry_delay_secs: 0, backoff_factor: 1.0 },
        ));

        let mut message = sample_message("n2");
        for _ in 0..=3 {
            engine.process(message.clone()).await;
            message.retry_count += 1;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(dlq_count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
