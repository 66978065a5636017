//! The similarity analysis pipeline for one dispatched job.
//!
//! ```text
//! Initializing -> Filtering -> ParallelFetch -> Enrichment -> Computing -> Finalizing
//! ```
//!
//! The job's distributed lock is held from Initializing until the terminal
//! event has been published. Every stage runs inside the remaining share of
//! the job's time budget.

use crate::batch::{process_batch, BatchConfig, BatchSummary, ItemOutcome, RetryClassify};
use crate::collaborators::{
    BalanceSnapshot, BlockchainDataClient, ChainClientError, SimilarityEngine, SimilarityResult,
    SyncOptions,
};
use crate::enrichment::{EnrichmentHandle, EnrichmentJob, EnrichmentQueue};
use crate::identity::verify_identity;
use crate::{DispatchedJob, JobRequest, OrchestratorError, PipelineStage, Result, VectorType};
use chrono::{DateTime, Utc};
use config_manager::SystemConfig;
use persistence_layer::{DistributedLock, SubjectStore};
use progress_gateway::ProgressPublisher;
use retry_utils::retry_with_backoff;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Cumulative budget for one run, also used as the lock TTL
    pub timeout: Duration,
    pub min_valid_wallets: usize,
    pub sync_concurrency: usize,
    pub sync_staleness: Duration,
    pub enrichment_enabled: bool,
    /// Retry and threshold defaults for the history sync batch and balance fetch
    pub batch: BatchConfig,
    pub worker_id: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(900),
            min_valid_wallets: 2,
            sync_concurrency: 3,
            sync_staleness: Duration::from_secs(24 * 3600),
            enrichment_enabled: true,
            batch: BatchConfig::default(),
            worker_id: format!("worker-{}", std::process::id()),
        }
    }
}

impl PipelineConfig {
    pub fn from_config(config: &SystemConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.pipeline.timeout_ms),
            min_valid_wallets: config.pipeline.min_valid_wallets,
            sync_concurrency: config.pipeline.sync_concurrency,
            sync_staleness: Duration::from_secs(config.pipeline.sync_staleness_hours * 3600),
            enrichment_enabled: config.pipeline.enrichment_enabled,
            batch: BatchConfig::from(&config.batch),
            worker_id: config.worker_id(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidWallet {
    pub wallet: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedWallet {
    pub wallet: String,
    pub error: String,
}

/// Per-wallet bookkeeping reported with every completed analysis
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WalletAccounting {
    pub requested: usize,
    pub valid: Vec<String>,
    pub invalid: Vec<InvalidWallet>,
    pub synced: Vec<String>,
    pub sync_failed: Vec<FailedWallet>,
    /// Fresh wallets plus any the sync batch never started
    pub sync_skipped: Vec<String>,
    /// Valid wallets the data source returned no balances for
    pub missing_balances: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SimilarityOutcome {
    Computed { similarity: SimilarityResult },
    InsufficientData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityAnalysisResult {
    pub job_id: String,
    pub request_id: String,
    pub vector_type: VectorType,
    pub outcome: SimilarityOutcome,
    pub wallets: WalletAccounting,
    pub enrichment_job_id: Option<String>,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

/// A held distributed lock. Release it explicitly with [`LockGuard::release`];
/// a guard dropped without release (panic, cancelled future) releases from a
/// spawned task.
pub struct LockGuard {
    lock: Arc<dyn DistributedLock>,
    key: String,
    owner: String,
    released: bool,
}

impl LockGuard {
    /// `Ok(None)` when another owner holds the key
    pub async fn acquire(
        lock: Arc<dyn DistributedLock>,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> persistence_layer::Result<Option<Self>> {
        if !lock.acquire(key, owner, ttl).await? {
            return Ok(None);
        }
        Ok(Some(Self {
            lock,
            key: key.to_string(),
            owner: owner.to_string(),
            released: false,
        }))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn release(mut self) -> bool {
        self.released = true;
        match self.lock.release(&self.key, &self.owner).await {
            Ok(true) => true,
            Ok(false) => {
                warn!(key = %self.key, "Lock expired or was taken over before release");
                false
            }
            Err(e) => {
                warn!(key = %self.key, "Failed to release lock: {}", e);
                false
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(key = %self.key, "Lock guard dropped outside a runtime; lock will expire by TTL");
            return;
        };
        let lock = self.lock.clone();
        let key = std::mem::take(&mut self.key);
        let owner = std::mem::take(&mut self.owner);
        runtime.spawn(async move {
            if let Err(e) = lock.release(&key, &owner).await {
                warn!(%key, "Failed to release dropped lock: {}", e);
            }
        });
    }
}

/// Wall clock of one run against its budget
struct RunClock {
    started: Instant,
    budget: Duration,
}

impl RunClock {
    fn start(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn timeout_error(&self, stage: PipelineStage) -> OrchestratorError {
        OrchestratorError::StageTimeout {
            stage,
            elapsed_ms: self.elapsed_ms(),
            budget_ms: self.budget.as_millis() as u64,
        }
    }

    /// Refuse to enter `stage` once the budget is spent
    fn check(&self, stage: PipelineStage) -> Result<()> {
        if self.started.elapsed() >= self.budget {
            return Err(self.timeout_error(stage));
        }
        Ok(())
    }

    /// Run one stage, cut off when the remaining budget runs out
    async fn bounded<T, F>(&self, stage: PipelineStage, stage_future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check(stage)?;
        let remaining = self.budget.saturating_sub(self.started.elapsed());
        match tokio::time::timeout(remaining, stage_future).await {
            Ok(result) => result,
            Err(_) => Err(self.timeout_error(stage)),
        }
    }
}

#[derive(Debug, Clone)]
struct SyncTarget {
    wallet: String,
    last_synced: Option<DateTime<Utc>>,
}

struct FilteredWallets {
    valid: Vec<String>,
    invalid: Vec<InvalidWallet>,
}

struct FetchedData {
    balances: HashMap<String, BalanceSnapshot>,
    fresh: Vec<String>,
    sync: BatchSummary<()>,
}

pub struct SimilarityPipeline {
    config: PipelineConfig,
    lock: Arc<dyn DistributedLock>,
    subjects: Arc<dyn SubjectStore>,
    chain: Arc<dyn BlockchainDataClient>,
    engine: Arc<dyn SimilarityEngine>,
    publisher: ProgressPublisher,
    enrichment: Option<EnrichmentQueue>,
}

impl SimilarityPipeline {
    pub fn new(
        config: PipelineConfig,
        lock: Arc<dyn DistributedLock>,
        subjects: Arc<dyn SubjectStore>,
        chain: Arc<dyn BlockchainDataClient>,
        engine: Arc<dyn SimilarityEngine>,
        publisher: ProgressPublisher,
    ) -> Self {
        Self {
            config,
            lock,
            subjects,
            chain,
            engine,
            publisher,
            enrichment: None,
        }
    }

    pub fn with_enrichment(mut self, queue: EnrichmentQueue) -> Self {
        self.enrichment = Some(queue);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run one dispatched job to a terminal state.
    ///
    /// Rejections (identity mismatch, lock already held) return before any
    /// collaborator is contacted and publish nothing. Every other failure
    /// publishes a `failed` event; success publishes exactly one `completed`.
    pub async fn run(&self, job: &DispatchedJob) -> Result<SimilarityAnalysisResult> {
        let job_id = job.job_id.as_str();
        let clock = RunClock::start(
            job.request
                .options
                .timeout_ms
                .map(Duration::from_millis)
                .map_or(self.config.timeout, |t| t.min(self.config.timeout)),
        );

        if let Err(e) = verify_identity(job_id, &job.request.identity()) {
            warn!(job_id, "Rejecting dispatched job: {}", e);
            return Err(e);
        }

        let owner = format!("{}:{}", self.config.worker_id, Uuid::new_v4());
        let guard = match LockGuard::acquire(self.lock.clone(), job_id, &owner, clock.budget).await
        {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                info!(job_id, "Analysis already in progress, rejecting duplicate");
                return Err(OrchestratorError::AlreadyInProgress {
                    job_id: job_id.to_string(),
                });
            }
            Err(e) => {
                let err = OrchestratorError::from(e);
                error!(job_id, "Could not confirm job lock: {}", err);
                self.publish_failed(job, &err).await;
                return Err(err);
            }
        };

        info!(
            job_id,
            request_id = %job.request.request_id,
            wallets = job.request.wallets.len(),
            "Similarity pipeline started"
        );

        let mut enrichment = None;
        let outcome = self.execute(job, &clock, &mut enrichment).await;

        match &outcome {
            Ok(result) => {
                info!(job_id, duration_ms = result.duration_ms, "Similarity pipeline completed");
                let payload = serde_json::to_value(result).unwrap_or_else(|e| {
                    warn!(job_id, "Failed to serialize analysis result: {}", e);
                    serde_json::Value::Null
                });
                if let Err(e) = self
                    .publisher
                    .publish_completed(job_id, payload, result.duration_ms)
                    .await
                {
                    warn!(job_id, "Failed to publish completion: {}", e);
                }
            }
            Err(e) => {
                error!(job_id, elapsed_ms = clock.elapsed_ms(), "Similarity pipeline failed: {}", e);
                if let Some(handle) = enrichment.take() {
                    handle.cancel().await;
                }
                self.publish_failed(job, e).await;
            }
        }

        guard.release().await;
        outcome
    }

    async fn execute(
        &self,
        job: &DispatchedJob,
        clock: &RunClock,
        enrichment: &mut Option<EnrichmentHandle>,
    ) -> Result<SimilarityAnalysisResult> {
        let request = &job.request;
        self.checkpoint(job, PipelineStage::Initializing, 5, json!({})).await;

        let filtered = clock
            .bounded(PipelineStage::Filtering, self.filter_wallets(request))
            .await?;
        self.checkpoint(
            job,
            PipelineStage::Filtering,
            10,
            json!({ "valid": filtered.valid.len(), "invalid": filtered.invalid.len() }),
        )
        .await;

        let fetched = clock
            .bounded(
                PipelineStage::ParallelFetch,
                self.parallel_fetch(request, &filtered.valid),
            )
            .await?;
        self.checkpoint(
            job,
            PipelineStage::ParallelFetch,
            60,
            json!({
                "synced": fetched.sync.succeeded_items,
                "sync_failed": fetched.sync.failed_items,
                "balances": fetched.balances.len(),
            }),
        )
        .await;

        clock.check(PipelineStage::Enrichment)?;
        if self.config.enrichment_enabled && !request.options.skip_enrichment {
            if let Some(queue) = &self.enrichment {
                let handle =
                    queue.submit(EnrichmentJob::from_balances(&job.job_id, &fetched.balances));
                debug!(job_id = %job.job_id, enrichment_job = handle.job_id(), "Enrichment submitted");
                *enrichment = Some(handle);
            }
        }
        self.checkpoint(
            job,
            PipelineStage::Enrichment,
            70,
            json!({ "submitted": enrichment.is_some() }),
        )
        .await;

        let similarity = clock
            .bounded(PipelineStage::Computing, async {
                self.engine
                    .compute(&filtered.valid, request.vector_type, &fetched.balances)
                    .await
                    .map_err(|e| OrchestratorError::StageFailed {
                        stage: PipelineStage::Computing,
                        message: e.to_string(),
                    })
            })
            .await?;
        self.checkpoint(
            job,
            PipelineStage::Computing,
            90,
            json!({ "insufficient_data": similarity.is_none() }),
        )
        .await;

        clock.check(PipelineStage::Finalizing)?;
        let outcome = match similarity {
            Some(similarity) => SimilarityOutcome::Computed { similarity },
            None => {
                warn!(job_id = %job.job_id, "Similarity engine reported insufficient data");
                SimilarityOutcome::InsufficientData
            }
        };

        let result = SimilarityAnalysisResult {
            job_id: job.job_id.clone(),
            request_id: request.request_id.clone(),
            vector_type: request.vector_type,
            outcome,
            wallets: Self::account(request, filtered, &fetched),
            enrichment_job_id: enrichment.as_ref().map(|h| h.job_id().to_string()),
            duration_ms: clock.elapsed_ms(),
            completed_at: Utc::now(),
        };
        self.checkpoint(job, PipelineStage::Finalizing, 100, json!({})).await;
        Ok(result)
    }

    /// Partition requested wallets against the invalid set. No network access.
    async fn filter_wallets(&self, request: &JobRequest) -> Result<FilteredWallets> {
        let flagged = self
            .subjects
            .flagged_invalid(&request.wallets)
            .await
            .map_err(|e| OrchestratorError::StageFailed {
                stage: PipelineStage::Filtering,
                message: format!("invalid wallet lookup failed: {}", e),
            })?;

        let (invalid, valid): (Vec<&String>, Vec<&String>) = request
            .wallets
            .iter()
            .partition(|wallet| flagged.contains_key(*wallet));

        let invalid: Vec<InvalidWallet> = invalid
            .into_iter()
            .map(|wallet| InvalidWallet {
                wallet: wallet.clone(),
                reason: flagged.get(wallet).cloned().unwrap_or_default(),
            })
            .collect();
        let valid: Vec<String> = valid.into_iter().cloned().collect();

        let required = request
            .options
            .min_valid_wallets
            .unwrap_or(self.config.min_valid_wallets)
            .max(1);
        if valid.len() < required {
            return Err(OrchestratorError::InsufficientValidWallets {
                invalid: invalid.iter().map(|w| w.wallet.clone()).collect(),
                valid: valid.len(),
                required,
            });
        }

        if !invalid.is_empty() {
            info!(
                invalid = invalid.len(),
                valid = valid.len(),
                "Excluded previously flagged wallets"
            );
        }
        Ok(FilteredWallets { valid, invalid })
    }

    /// History sync and balance fetch, side by side. Both run to completion
    /// before either result is inspected.
    async fn parallel_fetch(&self, request: &JobRequest, wallets: &[String]) -> Result<FetchedData> {
        let targets = self
            .sync_targets(wallets, request.options.force_sync)
            .await;
        let queued: HashSet<&str> = targets.iter().map(|t| t.wallet.as_str()).collect();
        let fresh: Vec<String> = wallets
            .iter()
            .filter(|w| !queued.contains(w.as_str()))
            .cloned()
            .collect();

        let (sync, balances) = tokio::join!(
            self.deep_sync(&targets, request),
            self.fetch_balances(wallets)
        );

        let mut problems = Vec::new();
        if let Some(reason) = &sync.aborted {
            problems.push(format!("history sync aborted: {}", reason));
        }
        let balances = match balances {
            Ok(balances) => Some(balances),
            Err(e) => {
                problems.push(format!("balance fetch failed: {}", e));
                None
            }
        };

        match balances {
            Some(balances) if problems.is_empty() => {
                if sync.failed_items > 0 {
                    warn!(
                        failed = sync.failed_items,
                        total = sync.total_items,
                        "Some wallet history syncs failed"
                    );
                }
                Ok(FetchedData {
                    balances,
                    fresh,
                    sync,
                })
            }
            _ => Err(OrchestratorError::StageFailed {
                stage: PipelineStage::ParallelFetch,
                message: problems.join("; "),
            }),
        }
    }

    async fn sync_targets(&self, wallets: &[String], force: bool) -> Vec<SyncTarget> {
        let last_synced = match self.subjects.last_synced(wallets).await {
            Ok(map) => map,
            Err(e) => {
                warn!("Sync status lookup failed, syncing every wallet: {}", e);
                HashMap::new()
            }
        };
        let staleness = chrono::Duration::from_std(self.config.sync_staleness)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        let now = Utc::now();

        wallets
            .iter()
            .filter_map(|wallet| {
                let last = last_synced.get(wallet).copied();
                let stale = match last {
                    None => true,
                    Some(at) => now - at > staleness,
                };
                (force || stale).then(|| SyncTarget {
                    wallet: wallet.clone(),
                    last_synced: last,
                })
            })
            .collect()
    }

    async fn deep_sync(&self, targets: &[SyncTarget], request: &JobRequest) -> BatchSummary<()> {
        let mut config = self.config.batch.clone();
        config.max_concurrency = self.config.sync_concurrency;
        if let Some(threshold) = request.options.sync_failure_threshold {
            config.failure_threshold = threshold;
        }
        let force = request.options.force_sync;

        process_batch(
            targets,
            |target, _| {
                let chain = self.chain.clone();
                let subjects = self.subjects.clone();
                let target = target.clone();
                async move {
                    let options = SyncOptions {
                        force,
                        since: target.last_synced,
                    };
                    match chain.sync_history(&target.wallet, &options).await {
                        Ok(()) => {
                            if let Err(e) = subjects.mark_synced(&target.wallet, Utc::now()).await {
                                warn!(wallet = %target.wallet, "Failed to record sync time: {}", e);
                            }
                            Ok(())
                        }
                        Err(ChainClientError::InvalidSubject { wallet, reason }) => {
                            if let Err(e) = subjects.mark_invalid(&target.wallet, &reason).await {
                                warn!(wallet = %target.wallet, "Failed to flag invalid wallet: {}", e);
                            }
                            Err(ChainClientError::InvalidSubject { wallet, reason })
                        }
                        Err(e) => Err(e),
                    }
                }
            },
            |target, _| target.wallet.clone(),
            &config,
        )
        .await
    }

    async fn fetch_balances(
        &self,
        wallets: &[String],
    ) -> std::result::Result<HashMap<String, BalanceSnapshot>, ChainClientError> {
        retry_with_backoff(
            || self.chain.fetch_balances(wallets),
            &self.config.batch.retry_config(),
            |e: &ChainClientError| e.retry_class(),
        )
        .await
        .into_result()
    }

    fn account(
        request: &JobRequest,
        filtered: FilteredWallets,
        fetched: &FetchedData,
    ) -> WalletAccounting {
        let mut sync_skipped = fetched.fresh.clone();
        sync_skipped.extend(fetched.sync.skipped().map(str::to_string));

        let missing_balances = filtered
            .valid
            .iter()
            .filter(|w| !fetched.balances.contains_key(*w))
            .cloned()
            .collect();

        WalletAccounting {
            requested: request.wallets.len(),
            synced: fetched.sync.successes().map(|(id, _)| id.to_string()).collect(),
            sync_failed: fetched
                .sync
                .outcomes
                .iter()
                .filter_map(|o| match &o.outcome {
                    ItemOutcome::Failed { error, .. } => Some(FailedWallet {
                        wallet: o.id.clone(),
                        error: error.clone(),
                    }),
                    _ => None,
                })
                .collect(),
            sync_skipped,
            missing_balances,
            valid: filtered.valid,
            invalid: filtered.invalid,
        }
    }

    async fn checkpoint(
        &self,
        job: &DispatchedJob,
        stage: PipelineStage,
        percentage: u8,
        details: serde_json::Value,
    ) {
        debug!(job_id = %job.job_id, %stage, percentage, "Pipeline checkpoint");
        let payload = json!({
            "stage": stage,
            "percentage": percentage,
            "details": details,
        });
        if let Err(e) = self.publisher.publish_progress(&job.job_id, payload).await {
            warn!(job_id = %job.job_id, "Failed to publish progress: {}", e);
        }
    }

    async fn publish_failed(&self, job: &DispatchedJob, error: &OrchestratorError) {
        if let Err(e) = self
            .publisher
            .publish_failed(&job.job_id, &error.to_string(), job.attempt, job.max_attempts)
            .await
        {
            warn!(job_id = %job.job_id, "Failed to publish failure: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use persistence_layer::InMemoryLockStore;

    #[tokio::test]
    async fn test_lock_guard_release_frees_key() {
        let store = Arc::new(InMemoryLockStore::new());
        let guard = LockGuard::acquire(store.clone(), "job", "a", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert!(LockGuard::acquire(store.clone(), "job", "b", Duration::from_secs(5))
            .await
            .unwrap()
            .is_none());

        assert!(guard.release().await);
        assert!(store.acquire("job", "b", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_in_background() {
        let store = Arc::new(InMemoryLockStore::new());
        let guard = LockGuard::acquire(store.clone(), "job", "a", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        drop(guard);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.holder("job").await, None);
    }

    #[test]
    fn test_run_clock_rejects_spent_budget() {
        let clock = RunClock::start(Duration::ZERO);
        assert!(matches!(
            clock.check(PipelineStage::Computing),
            Err(OrchestratorError::StageTimeout {
                stage: PipelineStage::Computing,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_run_clock_bounds_stage() {
        let clock = RunClock::start(Duration::from_millis(30));
        let result: Result<()> = clock
            .bounded(PipelineStage::ParallelFetch, async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(OrchestratorError::StageTimeout { .. })));
    }

    #[test]
    fn test_pipeline_config_from_system_config() {
        let mut system = SystemConfig::default();
        system.pipeline.timeout_ms = 1_000;
        system.pipeline.sync_staleness_hours = 2;
        system.system.worker_id = Some("worker-a".to_string());

        let config = PipelineConfig::from_config(&system);
        assert_eq!(config.timeout, Duration::from_secs(1));
        assert_eq!(config.sync_staleness, Duration::from_secs(7200));
        assert_eq!(config.worker_id, "worker-a");
    }
}
