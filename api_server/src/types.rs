use crate::service_manager::ServiceState;
use chrono::{DateTime, Utc};
use job_orchestrator::{QueuedJob, StageOptions, VectorType};
use serde::{Deserialize, Serialize};

/// Standard API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// Standard API success response
#[derive(Debug, Serialize, Deserialize)]
pub struct SuccessResponse<T> {
    pub data: T,
    pub timestamp: DateTime<Utc>,
}

impl<T> SuccessResponse<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub redis: Option<bool>,
    pub gateway_connections: usize,
    pub workers: ServiceState,
}

/// Request to run a similarity analysis
#[derive(Debug, Deserialize)]
pub struct SubmitSimilarityJobRequest {
    pub wallet_addresses: Vec<String>,
    pub request_id: Option<String>,
    #[serde(default)]
    pub vector_type: VectorType,
    #[serde(default)]
    pub options: StageOptions,
}

/// Response for similarity job submission
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitSimilarityJobResponse {
    #[serde(flatten)]
    pub job: QueuedJob,
    /// Send `{"type":"subscribe","job_id":...}` here to follow progress
    pub progress_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueueStatusResponse {
    pub queue: String,
    pub depth: u64,
}
