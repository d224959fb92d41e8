//! Entry point: wires config, database/cache connections, the service layer
//! and the axum router, then serves until a shutdown signal drains every
//! background worker.

mod analytics;
mod audit;
mod auth;
mod cache;
mod chat;
mod config;
mod db;
mod error;
mod event_bus;
mod handlers;
mod metrics;
mod middleware;
mod models;
mod notifications;
mod rate_limiter;
mod rpc;
mod shutdown;
mod websocket;

use crate::analytics::{AnalyticsConfig, AnalyticsRouter, Replica, ReplicaStrategy};
use crate::audit::{AuditEngine, DataChangesProjection, SecurityEventsProjection, UserActivityProjection};
use crate::auth::{AuthService, JwtIssuer};
use crate::chat::ChatService;
use crate::config::{Config, RateLimitTable, ReloadableConfig};
use crate::event_bus::{EventTransport, InMemoryEventBus};
use crate::notifications::{Mailer, NotificationConfig, NotificationEngine, NotificationWorker, SmtpMailer, StubMailer, TemplateRegistry};
use crate::rate_limiter::RateLimiter;
use crate::rpc::{CredentialValidator, RetryPolicy, RpcFabric};
use crate::shutdown::ShutdownSignal;
use axum::routing::{get, post, put};
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub db: sqlx::Pool<sqlx::Postgres>,
    pub cache: redis::aio::ConnectionManager,
    pub config: Arc<Config>,
    pub auth: Arc<AuthService>,
    pub chat: Arc<ChatService>,
    pub rate_limiter: Arc<RateLimiter>,
    pub rpc: Arc<RpcFabric>,
    pub audit: Arc<AuditEngine>,
    pub notifications: Arc<NotificationEngine>,
    pub analytics: Arc<AnalyticsRouter>,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let config = Arc::new(Config::from_env());

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.log_level))
        .init();

    metrics::init_metrics();

    tracing::info!("connecting to postgres");
    let db_pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to postgres");

    db::init_schema(&db_pool).await.expect("failed to initialize database schema");
    tracing::info!("database schema ready");

    tracing::info!("connecting to redis");
    let redis_client = redis::Client::open(config.redis_url.clone()).expect("failed to create redis client");
    let cache = redis_client.get_connection_manager().await.expect("failed to connect to redis");

    let (shutdown_signal, shutdown_rx) = ShutdownSignal::new();

    let bus: Arc<dyn EventTransport> = Arc::new(InMemoryEventBus::new());
    if config.nats_url.is_some() {
        tracing::warn!("NATS_URL set but NATS transport is not wired in this build; falling back to the in-process bus");
    }

    let audit = Arc::new(AuditEngine::new(db_pool.clone(), bus.clone(), config.audit_retention_days));
    audit.projections.register(Arc::new(UserActivityProjection::new())).await;
    audit.projections.register(Arc::new(SecurityEventsProjection::new())).await;
    audit.projections.register(Arc::new(DataChangesProjection::new())).await;

    let chat = Arc::new(ChatService::new(db_pool.clone(), cache.clone(), audit.clone()));

    let jwt_issuer = JwtIssuer::new(
        config.jwt_secret.clone(),
        config.access_token_ttl_secs,
        config.refresh_token_ttl_secs,
        config.refresh_token_ttl_remember_me_secs,
    );
    let auth = Arc::new(AuthService::new(db_pool.clone(), jwt_issuer, config.bcrypt_cost, audit.clone()));

    let reloadable = ReloadableConfig::new(RateLimitTable::default(), Vec::new());
    let rate_limiter = Arc::new(RateLimiter::new(cache.clone(), reloadable));

    let credentials = CredentialValidator::new(config.jwt_secret.clone(), config.credential_ttl_secs);
    let retry_policy = RetryPolicy {
        max_attempts: config.rpc_max_attempts,
        max_failures: config.circuit_max_failures,
        reset_timeout: Duration::from_secs(config.circuit_reset_secs),
        ..RetryPolicy::default()
    };
    let rpc = Arc::new(RpcFabric::new(retry_policy, credentials));

    let mailer: Arc<dyn Mailer> = if config.smtp_username.is_empty() {
        tracing::warn!("SMTP_USERNAME unset; using a stub mailer that only logs notifications");
        Arc::new(StubMailer::new(false))
    } else {
        match SmtpMailer::new(&config.smtp_host, config.smtp_port, &config.smtp_username, &config.smtp_password, &config.smtp_from) {
            Ok(mailer) => Arc::new(mailer),
            Err(e) => {
                tracing::warn!("failed to build SMTP mailer ({e}); falling back to stub");
                Arc::new(StubMailer::new(false))
            }
        }
    };
    let notification_config = NotificationConfig {
        max_retries: config.notification_max_retries,
        retry_delay_secs: config.notification_retry_delay_secs,
        backoff_factor: config.notification_backoff_factor,
    };
    let templates = Arc::new(TemplateRegistry::with_defaults());
    let notifications = Arc::new(NotificationEngine::new(bus.clone(), templates, mailer, notification_config));
    let notification_worker = Arc::new(NotificationWorker::new(notifications.clone()));
    let _notification_subs = notification_worker.spawn_all(bus.clone(), config.notification_max_retries).await;

    let analytics_replicas: Vec<Arc<Replica>> = if config.read_replica_urls.is_empty() {
        tracing::warn!("READ_REPLICA_URLS empty; analytics router will serve reads from the primary pool only");
        vec![Arc::new(Replica::new("primary", db_pool.clone(), 1))]
    } else {
        let mut replicas = Vec::with_capacity(config.read_replica_urls.len());
        for (i, url) in config.read_replica_urls.iter().enumerate() {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .unwrap_or_else(|e| panic!("failed to connect to read replica {i} ({url}): {e}"));
            replicas.push(Arc::new(Replica::new(format!("replica-{i}"), pool, 1)));
        }
        replicas
    };
    let analytics = Arc::new(AnalyticsRouter::new(analytics_replicas, ReplicaStrategy::RoundRobin, AnalyticsConfig::default()));

    let state = AppState {
        db: db_pool,
        cache,
        config: config.clone(),
        auth: auth.clone(),
        chat,
        rate_limiter,
        rpc,
        audit: audit.clone(),
        notifications,
        analytics: analytics.clone(),
    };

    let mut worker_handles = Vec::new();

    {
        let sessions_rx = shutdown_signal.subscribe();
        let auth = auth.clone();
        worker_handles.push(tokio::spawn(async move {
            auth.sessions().run_sweeper_loop(Duration::from_secs(300), sessions_rx).await;
        }));
    }
    {
        let audit_rx = shutdown_signal.subscribe();
        let audit = audit.clone();
        worker_handles.push(tokio::spawn(async move {
            audit.run_sweeper_loop(audit_rx).await;
        }));
    }
    {
        let analytics_rx = shutdown_signal.subscribe();
        let analytics = analytics.clone();
        worker_handles.push(tokio::spawn(async move {
            analytics.run_health_check_loop(analytics_rx).await;
        }));
    }

    let app = build_router(state.clone());

    let addr: SocketAddr = config.bind_addr.parse().expect("BIND_ADDR must be a valid socket address");
    tracing::info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await.expect("failed to bind");
    let server = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>());

    let shutdown_rx_for_serve = shutdown_rx.clone();
    let serve_result = server.with_graceful_shutdown(async move {
        let mut rx = shutdown_rx_for_serve;
        let _ = rx.changed().await;
    });

    tokio::select! {
        result = serve_result => {
            if let Err(e) = result {
                tracing::error!("server error: {e}");
            }
        }
        _ = shutdown::listen_for_shutdown(shutdown_signal.clone()) => {}
    }

    shutdown_signal.trigger();
    shutdown::drain(worker_handles, Duration::from_secs(10)).await;
    tracing::info!("shutdown complete");
}

fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let rate_limited = Router::new()
        .route("/api/v1/auth/register", post(handlers::auth::register))
        .route("/api/v1/auth/login", post(handlers::auth::login))
        .route("/api/v1/auth/refresh", post(handlers::auth::refresh))
        .route("/api/v1/auth/logout", post(handlers::auth::logout))
        .route("/api/v1/auth/me", get(handlers::auth::me))
        .route("/api/v1/rooms", get(handlers::rooms::list_rooms).post(handlers::rooms::create_room))
        .route(
            "/api/v1/rooms/:id",
            get(handlers::rooms::get_room).put(handlers::rooms::update_room).delete(handlers::rooms::delete_room),
        )
        .route(
            "/api/v1/rooms/:id/messages",
            get(handlers::rooms::list_messages).post(handlers::rooms::send_message),
        )
        .route("/api/v1/conversations", get(handlers::conversations::list_conversations).post(handlers::conversations::create_conversation))
        .route(
            "/api/v1/conversations/:id/messages",
            get(handlers::conversations::list_messages).post(handlers::conversations::send_message),
        )
        .route("/api/v1/conversations/:id/block", put(handlers::conversations::block_conversation))
        .route(
            "/api/v1/messages/:id",
            put(handlers::messages::edit_message).delete(handlers::messages::delete_message),
        )
        .route("/api/v1/messages/:id/pin", put(handlers::messages::pin_message))
        .route("/api/v1/messages/:id/reactions", post(handlers::messages::add_reaction))
        .route("/api/v1/messages/:id/reactions/:emoji", axum::routing::delete(handlers::messages::remove_reaction))
        .route("/api/v1/admin/ratelimit/stats", get(handlers::admin::stats))
        .route("/api/v1/admin/ratelimit/config", get(handlers::admin::get_config).put(handlers::admin::reload_config))
        .route("/api/v1/admin/ratelimit/reset", post(handlers::admin::reset))
        .route("/ws", get(websocket::upgrade))
        .route_layer(axum::middleware::from_fn_with_state(state.clone(), middleware::rate_limit));

    Router::new()
        .route("/health", get(handlers::health::health))
        .route("/health/live", get(handlers::health::live))
        .route("/health/ready", get(handlers::health::ready))
        .route("/metrics", get(metrics::metrics_handler))
        .merge(rate_limited)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
