use crate::types::*;
use crate::{ApiError, AppState};
use axum::{
    extract::State,
    response::{IntoResponse, Json},
};
use job_orchestrator::JobRequest;
use tracing::info;

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let redis = match &state.redis {
        Some(client) => Some(client.health_check().await.connected),
        None => None,
    };
    let status = if redis == Some(false) { "degraded" } else { "healthy" };

    Json(SuccessResponse::new(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        redis,
        gateway_connections: state.gateway.registry().connection_count().await,
        workers: state.services.state().await,
    }))
}

/// Queue a similarity analysis
pub async fn submit_similarity_job(
    State(state): State<AppState>,
    Json(request): Json<SubmitSimilarityJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.accepts_jobs().await {
        return Err(ApiError::NoWorkers);
    }

    let job_request = JobRequest::new(
        request.request_id,
        request.wallet_addresses,
        state.config.pipeline.max_wallets_per_request,
    )?
    .with_vector_type(request.vector_type)
    .with_options(request.options);

    let queued = state.submitter.enqueue(job_request).await?;
    info!(
        job_id = %queued.job_id,
        deduplicated = queued.deduplicated,
        "Accepted similarity job"
    );

    Ok(Json(SuccessResponse::new(SubmitSimilarityJobResponse {
        job: queued,
        progress_url: "/ws/progress".to_string(),
    })))
}

/// Depth of the similarity job queue
pub async fn get_queue_status(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let depth = state.submitter.queue_depth().await?;
    Ok(Json(SuccessResponse::new(QueueStatusResponse {
        queue: state.submitter.queue_name().to_string(),
        depth,
    })))
}
