use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use config_manager::{GatewaySettings, SystemConfig};
use job_orchestrator::{JobSubmitter, OrchestratorError, RequestLimits};
use persistence_layer::{PersistenceError, RedisClient};
use progress_gateway::{GatewayConfig, ProgressGateway};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

mod handlers;
pub mod service_manager;
mod types;
mod ws;

use handlers::*;
pub use service_manager::{Backends, ServiceManager, ServiceState, WorkerServices};
use types::*;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: SystemConfig,
    pub submitter: JobSubmitter,
    pub gateway: Arc<ProgressGateway>,
    pub services: Arc<ServiceManager>,
    /// Present when running against Redis; reported by the health check
    pub redis: Option<Arc<RedisClient>>,
}

impl AppState {
    pub fn new(config: SystemConfig, backends: Backends, redis: Option<Arc<RedisClient>>) -> Self {
        let submitter = JobSubmitter::new(
            backends.queue.clone(),
            RequestLimits::from(&config.pipeline),
        );
        let gateway = Arc::new(ProgressGateway::new(
            backends.channel.clone(),
            gateway_config(&config.gateway),
        ));
        let services = Arc::new(ServiceManager::new(config.clone(), backends));

        Self {
            config,
            submitter,
            gateway,
            services,
            redis,
        }
    }

    /// Jobs are only accepted when something will consume them
    pub async fn accepts_jobs(&self) -> bool {
        self.config.api.external_workers || self.services.is_running().await
    }
}

/// Main application error type
#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    Orchestrator(#[from] OrchestratorError),
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("No similarity worker is attached to this server")]
    NoWorkers,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Orchestrator(e) if e.is_rejection() => StatusCode::CONFLICT,
            ApiError::Orchestrator(OrchestratorError::InvalidRequest(_)) => StatusCode::BAD_REQUEST,
            ApiError::NoWorkers => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(ErrorResponse {
            error: self.to_string(),
            timestamp: chrono::Utc::now(),
        });

        (status, body).into_response()
    }
}

fn gateway_config(settings: &GatewaySettings) -> GatewayConfig {
    GatewayConfig {
        topic_namespace: settings.topic_namespace.clone(),
        reconnect_delay: Duration::from_millis(settings.reconnect_delay_ms),
        broadcast_when_unsubscribed: settings.broadcast_when_unsubscribed,
        client_buffer: settings.client_buffer,
    }
}

pub fn init_tracing(config: &SystemConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log_filter().into());

    if config.system.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Connect to Redis and serve the API. With `services`, the similarity
/// workers run in this process as well.
pub async fn serve(config: SystemConfig, services: Option<WorkerServices>) -> anyhow::Result<()> {
    let redis = Arc::new(RedisClient::new(&config.redis.url, &config.redis.key_prefix).await?);
    info!("Connected to Redis at {}", config.redis.url);

    let app_state = AppState::new(
        config.clone(),
        Backends::redis(redis.clone()),
        Some(redis),
    );
    app_state.gateway.clone().spawn();
    info!(
        "Progress gateway listening on namespace '{}'",
        config.gateway.topic_namespace
    );

    match services {
        Some(services) => app_state.services.start_workers(services).await,
        None if config.api.external_workers => {
            info!("Similarity jobs are consumed by external workers")
        }
        None => warn!("No similarity worker attached: job submissions will be refused"),
    }

    let app = create_router(app_state);

    info!("📋 Available endpoints:");
    info!("   • POST /api/similarity/jobs - Queue a wallet similarity analysis");
    info!("   • GET /api/similarity/queue - Similarity queue depth");
    info!("   • GET /ws/progress - Job progress subscriptions (WebSocket)");
    info!("   • GET /health - Health check");

    let bind_addr = format!("{}:{}", config.api.host, config.api.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Server listening on {}", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/similarity/jobs", post(submit_similarity_job))
        .route("/api/similarity/queue", get(get_queue_status))
        .route("/ws/progress", get(ws::progress_ws))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .into_inner(),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use futures::StreamExt;
    use job_orchestrator::{
        BalanceSnapshot, BlockchainDataClient, ChainClientError, CollaboratorError, JobRequest,
        SimilarityEngine, SimilarityResult, SyncOptions, VectorType,
    };
    use persistence_layer::{
        EventChannel, InMemoryEventChannel, InMemoryJobQueue, InMemoryLockStore,
        InMemorySubjectStore,
    };
    use progress_gateway::EventTopics;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use tower::ServiceExt;

    struct IdleChain;

    #[async_trait]
    impl BlockchainDataClient for IdleChain {
        async fn fetch_balances(
            &self,
            _wallets: &[String],
        ) -> Result<HashMap<String, BalanceSnapshot>, ChainClientError> {
            Ok(HashMap::new())
        }

        async fn sync_history(
            &self,
            _wallet: &str,
            _options: &SyncOptions,
        ) -> Result<(), ChainClientError> {
            Ok(())
        }
    }

    struct EmptyEngine;

    #[async_trait]
    impl SimilarityEngine for EmptyEngine {
        async fn compute(
            &self,
            _wallets: &[String],
            vector_type: VectorType,
            _balances: &HashMap<String, BalanceSnapshot>,
        ) -> Result<Option<SimilarityResult>, CollaboratorError> {
            Ok(Some(SimilarityResult {
                vector_type,
                pairs: Vec::new(),
                details: Value::Null,
            }))
        }
    }

    fn backends() -> (Backends, Arc<InMemoryEventChannel>) {
        let channel = Arc::new(InMemoryEventChannel::default());
        let backends = Backends {
            lock: Arc::new(InMemoryLockStore::new()),
            subjects: Arc::new(InMemorySubjectStore::new()),
            queue: Arc::new(InMemoryJobQueue::new()),
            channel: channel.clone(),
        };
        (backends, channel)
    }

    fn state_with(external_workers: bool) -> (AppState, Arc<InMemoryEventChannel>) {
        let mut config = SystemConfig::default();
        config.pipeline.max_wallets_per_request = 3;
        config.pipeline.queue_pop_timeout_seconds = 1;
        config.api.external_workers = external_workers;
        let (backends, channel) = backends();
        (AppState::new(config, backends, None), channel)
    }

    fn test_state() -> AppState {
        state_with(true).0
    }

    async fn call(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn post_job(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/similarity/jobs")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_submit_job_and_read_queue_depth() {
        let state = test_state();
        let app = create_router(state.clone());

        let (status, body) = call(
            app.clone(),
            post_job(json!({
                "wallet_addresses": ["w2", "w1"],
                "request_id": "req-1",
                "vector_type": "binary"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let expected = JobRequest::new(Some("req-1".into()), vec!["w2".into(), "w1".into()], 3)
            .unwrap()
            .identity();
        assert_eq!(body["data"]["job_id"], expected.as_str());
        assert_eq!(body["data"]["deduplicated"], false);
        assert_eq!(body["data"]["wallet_count"], 2);

        let (status, body) = call(app, get_request("/api/similarity/queue")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["depth"], 1);
    }

    #[tokio::test]
    async fn test_invalid_submissions_are_bad_requests() {
        let app = create_router(test_state());

        let (status, body) = call(app.clone(), post_job(json!({ "wallet_addresses": [] }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("wallet"));

        let (status, _) = call(
            app.clone(),
            post_job(json!({ "wallet_addresses": ["a", "b", "c", "d"] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            app,
            post_job(json!({
                "wallet_addresses": ["a", "b"],
                "options": { "timeout_ms": u64::MAX }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("timeout_ms"));
    }

    #[tokio::test]
    async fn test_submit_without_workers_is_refused() {
        let (state, _) = state_with(false);
        let app = create_router(state);

        let (status, body) = call(
            app.clone(),
            post_job(json!({ "wallet_addresses": ["w1", "w2"] })),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].as_str().unwrap().contains("worker"));

        let (_, body) = call(app, get_request("/api/similarity/queue")).await;
        assert_eq!(body["data"]["depth"], 0);
    }

    #[tokio::test]
    async fn test_hosted_workers_consume_submitted_jobs() {
        let (state, channel) = state_with(false);
        let topics = EventTopics::new(state.config.gateway.topic_namespace.clone());
        let mut events = channel.subscribe(&topics.all()).await.unwrap();

        state
            .services
            .start_workers(WorkerServices {
                chain: Arc::new(IdleChain),
                engine: Arc::new(EmptyEngine),
                enricher: None,
            })
            .await;
        assert_eq!(state.services.state().await, ServiceState::Running);

        let app = create_router(state.clone());
        let (status, body) = call(
            app.clone(),
            post_job(json!({ "wallet_addresses": ["w1", "w2"] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let job_id = body["data"]["job_id"].as_str().unwrap().to_string();

        let completed = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(message) = events.next().await {
                if message.topic == topics.topic(progress_gateway::EventKind::Completed) {
                    return Some(message);
                }
            }
            None
        })
        .await
        .unwrap()
        .unwrap();
        assert!(completed.payload.contains(&job_id));

        let (_, body) = call(app, get_request("/health")).await;
        assert_eq!(body["data"]["workers"], "running");

        state.services.stop_workers().await;
        assert!(!state.accepts_jobs().await);
    }

    #[tokio::test]
    async fn test_health_without_redis() {
        let app = create_router(test_state());
        let (status, body) = call(app, get_request("/health")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "healthy");
        assert_eq!(body["data"]["gateway_connections"], 0);
        assert_eq!(body["data"]["workers"], "stopped");
    }

    #[test]
    fn test_error_status_mapping() {
        let busy = ApiError::from(OrchestratorError::AlreadyInProgress {
            job_id: "j".into(),
        });
        let invalid = ApiError::from(OrchestratorError::InvalidRequest("x".into()));
        let internal = ApiError::from(OrchestratorError::Persistence("down".into()));

        assert_eq!(busy.status(), StatusCode::CONFLICT);
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::NoWorkers.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(internal.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
