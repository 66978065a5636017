use chrono::{DateTime, Utc};
use config_manager::PipelineSettings;
use persistence_layer::PersistenceError;
use progress_gateway::GatewayError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

pub mod batch;
pub mod collaborators;
pub mod enrichment;
pub mod identity;
pub mod similarity_pipeline;
pub mod submitter;
pub mod worker;

pub use batch::{
    process_batch, AbortReason, BatchConfig, BatchItemOutcome, BatchSummary, ItemOutcome,
    RetryClassify,
};
pub use collaborators::{
    BalanceSnapshot, BlockchainDataClient, ChainClientError, CollaboratorError, MetadataEnricher,
    SimilarityEngine, SimilarityResult, SyncOptions, TokenBalance, WalletPairScore,
};
pub use enrichment::{EnrichmentHandle, EnrichmentJob, EnrichmentQueue, EnrichmentWorker};
pub use identity::{job_identity, normalize_subject, verify_identity};
pub use similarity_pipeline::{
    LockGuard, PipelineConfig, SimilarityAnalysisResult, SimilarityOutcome, SimilarityPipeline,
    WalletAccounting,
};
pub use submitter::{JobSubmitter, SIMILARITY_QUEUE};
pub use worker::SimilarityWorker;

/// Operation name mixed into every similarity job identity
pub const SIMILARITY_OPERATION: &str = "similarity_analysis";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Initializing,
    Filtering,
    ParallelFetch,
    Enrichment,
    Computing,
    Finalizing,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Initializing => "initializing",
            PipelineStage::Filtering => "filtering",
            PipelineStage::ParallelFetch => "parallel_fetch",
            PipelineStage::Enrichment => "enrichment",
            PipelineStage::Computing => "computing",
            PipelineStage::Finalizing => "finalizing",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone)]
pub enum OrchestratorError {
    #[error("Analysis already in progress for this request (job {job_id})")]
    AlreadyInProgress { job_id: String },
    #[error("Job identity mismatch, possible duplicate dispatch: dispatched {dispatched}, recomputed {recomputed}")]
    IdentityMismatch {
        dispatched: String,
        recomputed: String,
    },
    #[error("Stage {stage} failed: {message}")]
    StageFailed {
        stage: PipelineStage,
        message: String,
    },
    #[error("Only {valid} valid wallets remain, {required} required; invalid wallets: {}", .invalid.join(", "))]
    InsufficientValidWallets {
        invalid: Vec<String>,
        valid: usize,
        required: usize,
    },
    #[error("Stage {stage} timed out after {elapsed_ms}ms (budget {budget_ms}ms)")]
    StageTimeout {
        stage: PipelineStage,
        elapsed_ms: u64,
        budget_ms: u64,
    },
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl OrchestratorError {
    /// Expected outcomes that signal a duplicate rather than a fault. Never retried.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            OrchestratorError::AlreadyInProgress { .. } | OrchestratorError::IdentityMismatch { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, OrchestratorError::StageTimeout { .. })
    }
}

impl From<PersistenceError> for OrchestratorError {
    fn from(err: PersistenceError) -> Self {
        OrchestratorError::Persistence(err.to_string())
    }
}

impl From<GatewayError> for OrchestratorError {
    fn from(err: GatewayError) -> Self {
        OrchestratorError::Persistence(err.to_string())
    }
}

impl From<config_manager::ConfigurationError> for OrchestratorError {
    fn from(err: config_manager::ConfigurationError) -> Self {
        OrchestratorError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// How balances are turned into comparable vectors by the similarity engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorType {
    /// Weighted by USD value held per token
    #[default]
    Capital,
    /// Held / not held per token
    Binary,
}

/// Per-request overrides of the pipeline defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageOptions {
    pub timeout_ms: Option<u64>,
    pub min_valid_wallets: Option<usize>,
    pub sync_failure_threshold: Option<f64>,
    pub force_sync: bool,
    pub skip_enrichment: bool,
}

/// Bounds a request has to stay within before it is queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLimits {
    pub max_wallets: usize,
    /// Ceiling for `StageOptions::timeout_ms`; the configured pipeline budget
    pub max_timeout_ms: u64,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_wallets: 100,
            max_timeout_ms: 900_000,
        }
    }
}

impl From<&PipelineSettings> for RequestLimits {
    fn from(settings: &PipelineSettings) -> Self {
        Self {
            max_wallets: settings.max_wallets_per_request,
            max_timeout_ms: settings.timeout_ms,
        }
    }
}

/// One similarity analysis request. Build it with [`JobRequest::new`] so the
/// wallet list is trimmed and unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub request_id: String,
    pub wallets: Vec<String>,
    pub vector_type: VectorType,
    #[serde(default)]
    pub options: StageOptions,
}

impl JobRequest {
    pub fn new(
        request_id: Option<String>,
        wallets: Vec<String>,
        max_wallets: usize,
    ) -> Result<Self> {
        let mut seen = HashSet::new();
        let wallets: Vec<String> = wallets
            .into_iter()
            .map(|w| w.trim().to_string())
            .filter(|w| !w.is_empty())
            .filter(|w| seen.insert(normalize_subject(w)))
            .collect();

        let request = Self {
            request_id: request_id
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            wallets,
            vector_type: VectorType::default(),
            options: StageOptions::default(),
        };
        request.validate_wallets(max_wallets)?;
        Ok(request)
    }

    pub fn with_vector_type(mut self, vector_type: VectorType) -> Self {
        self.vector_type = vector_type;
        self
    }

    pub fn with_options(mut self, options: StageOptions) -> Self {
        self.options = options;
        self
    }

    /// Check the wallet list and every stage override against `limits`.
    pub fn validate(&self, limits: &RequestLimits) -> Result<()> {
        self.validate_wallets(limits.max_wallets)?;

        if let Some(threshold) = self.options.sync_failure_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(OrchestratorError::InvalidRequest(format!(
                    "sync_failure_threshold must be within [0, 1], got {}",
                    threshold
                )));
            }
        }
        match self.options.timeout_ms {
            Some(0) => {
                return Err(OrchestratorError::InvalidRequest(
                    "timeout_ms must be greater than zero".to_string(),
                ))
            }
            Some(timeout_ms) if timeout_ms > limits.max_timeout_ms => {
                return Err(OrchestratorError::InvalidRequest(format!(
                    "timeout_ms {} exceeds the pipeline budget of {}",
                    timeout_ms, limits.max_timeout_ms
                )))
            }
            _ => {}
        }
        if self.options.min_valid_wallets == Some(0) {
            return Err(OrchestratorError::InvalidRequest(
                "min_valid_wallets must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_wallets(&self, max_wallets: usize) -> Result<()> {
        if self.wallets.is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "At least one wallet address is required".to_string(),
            ));
        }
        if self.wallets.len() > max_wallets {
            return Err(OrchestratorError::InvalidRequest(format!(
                "Too many wallets: {} (maximum {})",
                self.wallets.len(),
                max_wallets
            )));
        }
        Ok(())
    }

    /// Deterministic identity of this request; the lock and dedup key
    pub fn identity(&self) -> String {
        job_identity(SIMILARITY_OPERATION, &self.wallets, Some(&self.request_id))
    }
}

/// What a worker pops off the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchedJob {
    pub job_id: String,
    pub request: JobRequest,
    pub attempt: u32,
    pub max_attempts: u32,
    pub dispatched_at: DateTime<Utc>,
}

impl DispatchedJob {
    pub fn new(request: JobRequest) -> Self {
        Self {
            job_id: request.identity(),
            request,
            attempt: 1,
            max_attempts: 1,
            dispatched_at: Utc::now(),
        }
    }
}

/// Handle returned to the enqueue caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub job_id: String,
    pub request_id: String,
    pub wallet_count: usize,
    /// The same job was already waiting in the queue
    pub deduplicated: bool,
    pub queued_at: DateTime<Utc>,
}
