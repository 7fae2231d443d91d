//! RelayCore Daemon
//!
//! Runs the reliability core as a standalone service: accepts messages over
//! HTTP, polls retryable messages, delivers confirmations, repairs stuck
//! work and evaluates alerts on the clustered scheduler.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `RC_CONFIG` | - | Path to the TOML configuration file (optional) |
//! | `RC_STORE` | `postgres` | Store backend: `memory`, `postgres` |
//! | `RC_DB_URL` | - | Database connection URL (required for postgres) |
//! | `RC_PROCESS_TARGET_URL` | - | Downstream endpoint messages are dispatched to (required) |
//! | `RC_HTTP_PORT` | `8080` | HTTP API/health port |
//! | `RC_ALERT_FAILED_LIMIT` | `10` | FAILED messages per alert window before notifying |
//! | `RUST_LOG` | `info` | Log level |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rc_alerts::{AlertChecker, AlertDefinition, StateCountSource};
use rc_common::{CoreError, ExternalCallKeyType, LogNotifier, Message, MsgState};
use rc_config::CoreConfig;
use rc_confirm::{ConfirmationPoller, ConfirmationPollerConfig, ConfirmationService};
use rc_confirm::http_sender::{HttpConfirmationSender, HttpSenderConfig};
use rc_ledger::{CallDecision, ExternalCallService};
use rc_queue::{
    MessageOperationService, MessagePoller, MessagePollerConfig, MessageProcessor, RepairService,
};
use rc_scheduler::{
    FiringGuard, JobExecutionMode, JobHandler, JobRegistry, JobSpec, LocalFiringGuard,
    RedisFiringGuard, Scheduler, SchedulerConfig,
};
use rc_store::memory::MemoryStore;
use rc_store::postgres::PostgresStore;
use rc_store::{ExternalCallRepository, MessageRepository};
use rc_throttle::{
    MemoryThrottleCounter, RedisThrottleCounter, ThrottleCounter, ThrottleRules, ThrottleScope,
    ThrottleService,
};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_or_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_required(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("{} environment variable is required", key))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Starting RelayCore daemon");

    // Configuration
    let config = match std::env::var("RC_CONFIG") {
        Ok(path) => {
            info!("Loading configuration from {}", path);
            CoreConfig::from_file(&path)?
        }
        Err(_) => CoreConfig::default(),
    };
    let http_port: u16 = env_or_parse("RC_HTTP_PORT", 8080);
    let process_target_url = env_required("RC_PROCESS_TARGET_URL")?;

    // Stores
    let (messages, calls) = create_stores(&env_or("RC_STORE", "postgres")).await?;

    // Cluster collaborators: Redis when clustering is on, in-process otherwise
    let (firing_guard, throttle_counter): (Arc<dyn FiringGuard>, Arc<dyn ThrottleCounter>) =
        if config.cluster.enabled {
            info!(redis = %config.cluster.redis_url, "Cluster coordination enabled");
            let guard = RedisFiringGuard::connect(
                &config.cluster.redis_url,
                config.cluster.instance_id.clone(),
                Duration::from_secs(config.cluster.firing_ttl_secs),
            )
            .await?;
            let counter = RedisThrottleCounter::connect(&config.cluster.redis_url).await?;
            (Arc::new(guard), Arc::new(counter))
        } else {
            (Arc::new(LocalFiringGuard), Arc::new(MemoryThrottleCounter::new()))
        };

    let notifier = Arc::new(LogNotifier);

    // Throttling gate in front of message acceptance
    let throttle = Arc::new(ThrottleService::new(
        ThrottleRules::from_config(&config.throttling),
        throttle_counter,
        config.throttling.disabled,
    ));

    // Message poller and downstream dispatch
    let processor = Arc::new(HttpForwardProcessor::new(process_target_url.clone())?);
    info!("Dispatching messages to {}", process_target_url);
    let poller = Arc::new(MessagePoller::new(
        messages.clone(),
        processor,
        notifier.clone(),
        MessagePollerConfig {
            postponed_interval: Duration::from_secs(config.polling.postponed_interval_secs),
            partly_failed_interval: Duration::from_secs(config.polling.partly_failed_interval_secs),
            postponed_when_failed: Duration::from_secs(config.polling.postponed_when_failed_secs),
            partly_failed_limit: config.retry.partly_failed_limit,
            max_lock_failures: 5,
        },
    ));

    let repair = Arc::new(RepairService::new(
        messages.clone(),
        notifier.clone(),
        Duration::from_secs(config.polling.repair_grace_secs),
    ));

    // Confirmations: only delivered when a callback endpoint is configured
    let confirmation_poller = match &config.confirmation.target_url {
        Some(target_url) => {
            let service = Arc::new(ConfirmationService::new(
                calls.clone(),
                messages.clone(),
                notifier.clone(),
                config.retry.confirmation_failed_limit,
            ));
            let sender = Arc::new(HttpConfirmationSender::new(HttpSenderConfig {
                target_url: target_url.clone(),
                connect_timeout: Duration::from_secs(config.confirmation.connect_timeout_secs),
                request_timeout: Duration::from_secs(config.confirmation.request_timeout_secs),
            })?);
            info!("Delivering confirmations to {}", target_url);
            Some(Arc::new(ConfirmationPoller::new(
                service,
                calls.clone(),
                sender,
                ConfirmationPollerConfig {
                    interval: Duration::from_secs(config.polling.confirmation_interval_secs),
                    max_lock_failures: 5,
                },
            )))
        }
        None => {
            warn!("No confirmation.target_url configured, confirmations will not be delivered");
            None
        }
    };

    // Alerts
    let mut checker = AlertChecker::new(notifier.clone());
    checker.add(
        AlertDefinition::new("failed-messages", env_or_parse("RC_ALERT_FAILED_LIMIT", 10))
            .with_body("$actualCount messages failed recently (limit $limit)"),
        Arc::new(StateCountSource::new(
            messages.clone(),
            MsgState::Failed,
            chrono::Duration::seconds(config.polling.alert_interval_secs as i64),
        )),
    );
    let checker = Arc::new(checker);

    // Job table
    let mut registry = JobRegistry::new();
    registry.register(
        JobSpec::new(
            "message-poller",
            JobExecutionMode::Concurrent,
            Duration::from_secs(config.polling.postponed_interval_secs),
        ),
        Arc::new(PollerJob(poller)),
    )?;
    registry.register(
        JobSpec::new(
            "repair",
            JobExecutionMode::NotConcurrent,
            Duration::from_secs(config.polling.repair_grace_secs),
        ),
        Arc::new(RepairJob(repair)),
    )?;
    if let Some(confirmation_poller) = confirmation_poller {
        registry.register(
            JobSpec::new(
                "confirmation-poller",
                JobExecutionMode::Concurrent,
                Duration::from_secs(config.polling.confirmation_interval_secs),
            ),
            Arc::new(ConfirmationJob(confirmation_poller)),
        )?;
    }
    registry.register(
        JobSpec::new(
            "alerts",
            JobExecutionMode::NotConcurrent,
            Duration::from_secs(config.polling.alert_interval_secs),
        ),
        Arc::new(AlertJob(checker)),
    )?;
    registry.register(
        JobSpec::new(
            "throttle-prune",
            JobExecutionMode::Concurrent,
            Duration::from_secs(config.throttling.default_interval_secs),
        ),
        Arc::new(ThrottlePruneJob(throttle.clone())),
    )?;

    let scheduler = Arc::new(Scheduler::new(
        SchedulerConfig::from_cluster_config(&config.cluster),
        firing_guard,
    ));
    scheduler.start(registry)?;

    // HTTP API
    let state = AppState {
        messages: messages.clone(),
        operations: Arc::new(MessageOperationService::new(messages)),
        ledger: Arc::new(ExternalCallService::new(
            calls.clone(),
            config.retry.external_call_failed_limit,
        )),
        calls,
        throttle,
    };
    let app = axum::Router::new()
        .route("/messages", axum::routing::post(accept_message))
        .route("/messages/:id/restart", axum::routing::post(restart_message))
        .route("/messages/:id/cancel", axum::routing::post(cancel_message))
        .route("/external-calls", axum::routing::post(request_external_call))
        .route(
            "/external-calls/:id/complete",
            axum::routing::post(complete_external_call),
        )
        .route(
            "/external-calls/:id/fail",
            axum::routing::post(fail_external_call),
        )
        .route("/health", axum::routing::get(health_handler))
        .route("/ready", axum::routing::get(ready_handler))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], http_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP API listening on http://{}", addr);

    let server_scheduler = scheduler.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .ok();
        server_scheduler.standby();
    });

    // The API is up, scheduler jobs may fire
    scheduler.app_ready();
    info!("RelayCore daemon started");

    let _ = server.await;
    info!("Shutdown signal received...");

    let _ = tokio::time::timeout(Duration::from_secs(30), scheduler.shutdown()).await;
    info!("RelayCore daemon shutdown complete");
    Ok(())
}

async fn create_stores(
    store_type: &str,
) -> Result<(Arc<dyn MessageRepository>, Arc<dyn ExternalCallRepository>)> {
    match store_type {
        "memory" => {
            info!("Using in-memory store (single node, non-durable)");
            let store = Arc::new(MemoryStore::new());
            Ok((store.clone(), store))
        }
        "postgres" => {
            let url = env_required("RC_DB_URL")?;
            let pool = PgPoolOptions::new().max_connections(10).connect(&url).await?;
            let store = Arc::new(PostgresStore::new(pool));
            store.init_schema().await?;
            info!("Using PostgreSQL store");
            Ok((store.clone(), store))
        }
        other => Err(anyhow::anyhow!(
            "Unknown store type: {}. Use memory or postgres",
            other
        )),
    }
}

// Downstream dispatch: POST the message to the processing pipeline endpoint.
struct HttpForwardProcessor {
    client: reqwest::Client,
    target_url: String,
}

impl HttpForwardProcessor {
    fn new(target_url: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client, target_url })
    }
}

#[async_trait]
impl MessageProcessor for HttpForwardProcessor {
    async fn process(&self, message: &Message) -> rc_common::Result<()> {
        let response = self
            .client
            .post(&self.target_url)
            .json(message)
            .send()
            .await
            .map_err(|e| CoreError::Integration(format!("dispatch failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(CoreError::Integration(format!(
                "dispatch rejected with HTTP {}",
                status
            )))
        }
    }
}

// Job adapters wiring the services onto the scheduler.

struct PollerJob(Arc<MessagePoller>);

#[async_trait]
impl JobHandler for PollerJob {
    async fn execute(&self) -> rc_common::Result<()> {
        self.0.run().await;
        Ok(())
    }
}

struct RepairJob(Arc<RepairService>);

#[async_trait]
impl JobHandler for RepairJob {
    async fn execute(&self) -> rc_common::Result<()> {
        self.0.run().await?;
        Ok(())
    }
}

struct ConfirmationJob(Arc<ConfirmationPoller>);

#[async_trait]
impl JobHandler for ConfirmationJob {
    async fn execute(&self) -> rc_common::Result<()> {
        self.0.run().await;
        Ok(())
    }
}

struct AlertJob(Arc<AlertChecker>);

#[async_trait]
impl JobHandler for AlertJob {
    async fn execute(&self) -> rc_common::Result<()> {
        self.0.check_all().await
    }
}

struct ThrottlePruneJob(Arc<ThrottleService>);

#[async_trait]
impl JobHandler for ThrottlePruneJob {
    async fn execute(&self) -> rc_common::Result<()> {
        self.0.prune().await;
        Ok(())
    }
}

// HTTP API

#[derive(Clone)]
struct AppState {
    messages: Arc<dyn MessageRepository>,
    operations: Arc<MessageOperationService>,
    ledger: Arc<ExternalCallService>,
    calls: Arc<dyn ExternalCallRepository>,
    throttle: Arc<ThrottleService>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AcceptMessageRequest {
    correlation_id: String,
    source_system: String,
    service: String,
    operation_name: String,
    /// Business time; defaults to the receive time
    msg_timestamp: Option<DateTime<Utc>>,
    payload: String,
    funnel_value: Option<String>,
    #[serde(default)]
    guaranteed_order: bool,
}

async fn accept_message(
    State(state): State<AppState>,
    Json(request): Json<AcceptMessageRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    state
        .throttle
        .throttle(&ThrottleScope::new(
            request.source_system.clone(),
            request.service.clone(),
        ))
        .await?;

    let mut message = Message::new(
        request.correlation_id,
        request.source_system,
        request.service,
        request.operation_name,
        request.msg_timestamp.unwrap_or_else(Utc::now),
        request.payload,
    );
    if let Some(funnel_value) = request.funnel_value {
        message = message.with_funnel(funnel_value, request.guaranteed_order);
    }

    let message = state.messages.insert(message).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "msgId": message.msg_id })),
    ))
}

async fn restart_message(
    State(state): State<AppState>,
    Path(msg_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.operations.restart(msg_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cancel_message(
    State(state): State<AppState>,
    Path(msg_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.operations.cancel(msg_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExternalCallRequest {
    msg_id: i64,
    operation_name: String,
    /// Explicit deduplication key; omitted means the message's correlation
    /// id is the key
    key: Option<String>,
}

async fn request_external_call(
    State(state): State<AppState>,
    Json(request): Json<ExternalCallRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let message = state
        .messages
        .find_by_id(request.msg_id)
        .await?
        .ok_or_else(|| CoreError::NoDataFound(format!("message {} not found", request.msg_id)))?;

    let (key_type, key) = match &request.key {
        Some(key) => (ExternalCallKeyType::Custom, key.as_str()),
        None => (ExternalCallKeyType::Message, ""),
    };
    let decision = state
        .ledger
        .request_call(key_type, &request.operation_name, key, &message)
        .await?;

    let (verdict, call) = match &decision {
        CallDecision::Execute(call) => ("execute", call),
        CallDecision::Suppress(call) => ("suppress", call),
    };
    Ok(Json(serde_json::json!({
        "decision": verdict,
        "callId": call.id,
    })))
}

async fn complete_external_call(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let call = state
        .calls
        .find_call_by_id(id)
        .await?
        .ok_or_else(|| CoreError::NoDataFound(format!("external call {} not found", id)))?;
    state.ledger.complete(&call).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn fail_external_call(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let call = state
        .calls
        .find_call_by_id(id)
        .await?
        .ok_or_else(|| CoreError::NoDataFound(format!("external call {} not found", id)))?;
    state.ledger.fail(&call).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "UP",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn ready_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "READY"
    }))
}

struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(e)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self(CoreError::Store(e.to_string()))
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            CoreError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            CoreError::LockFailure(_) => StatusCode::CONFLICT,
            CoreError::NoDataFound(_) => StatusCode::NOT_FOUND,
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({
            "errorCode": self.0.error_code(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            warn!("Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(_) => {
                warn!("Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
