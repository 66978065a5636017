//! Fire-and-forget token metadata enrichment.

use crate::collaborators::{BalanceSnapshot, MetadataEnricher};
use crate::Result;
use chrono::{DateTime, Utc};
use config_manager::SystemConfig;
use persistence_layer::JobQueue;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const ENRICHMENT_QUEUE: &str = "enrichment";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentJob {
    pub job_id: String,
    pub parent_job_id: String,
    pub wallets: Vec<String>,
    /// Unique token mints seen across the fetched balances
    pub tokens: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl EnrichmentJob {
    pub fn from_balances(parent_job_id: &str, balances: &HashMap<String, BalanceSnapshot>) -> Self {
        let mut wallets: Vec<String> = balances.keys().cloned().collect();
        wallets.sort();
        let tokens: BTreeSet<&str> = balances
            .values()
            .flat_map(|snapshot| snapshot.tokens.iter().map(|t| t.mint.as_str()))
            .collect();

        Self {
            job_id: format!("enrichment:{}", parent_job_id),
            parent_job_id: parent_job_id.to_string(),
            wallets,
            tokens: tokens.into_iter().map(str::to_string).collect(),
            created_at: Utc::now(),
        }
    }
}

/// Submits enrichment jobs without blocking the caller
#[derive(Clone)]
pub struct EnrichmentQueue {
    queue: Arc<dyn JobQueue>,
    queue_name: String,
}

impl EnrichmentQueue {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self {
            queue,
            queue_name: ENRICHMENT_QUEUE.to_string(),
        }
    }

    /// Push the job from a background task. Errors are logged only.
    pub fn submit(&self, job: EnrichmentJob) -> EnrichmentHandle {
        let job_id = job.job_id.clone();
        let queue = self.queue.clone();
        let queue_name = self.queue_name.clone();

        let task = tokio::spawn(async move {
            let payload = match serde_json::to_string(&job) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(job_id = %job.job_id, "Failed to serialize enrichment job: {}", e);
                    return;
                }
            };
            match queue.push(&queue_name, &job.job_id, &payload).await {
                Ok(true) => debug!(job_id = %job.job_id, tokens = job.tokens.len(), "Enrichment job queued"),
                Ok(false) => debug!(job_id = %job.job_id, "Enrichment job already queued"),
                Err(e) => warn!(job_id = %job.job_id, "Failed to queue enrichment job: {}", e),
            }
        });

        EnrichmentHandle {
            job_id,
            task,
            queue: self.queue.clone(),
            queue_name: self.queue_name.clone(),
        }
    }
}

/// Cancellation handle for one submitted enrichment job
pub struct EnrichmentHandle {
    job_id: String,
    task: JoinHandle<()>,
    queue: Arc<dyn JobQueue>,
    queue_name: String,
}

impl EnrichmentHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Best-effort cancellation: stop the submission if it is still pending,
    /// then remove the job from the queue. A job a worker already picked up
    /// keeps running. Returns whether a queued job was removed.
    pub async fn cancel(mut self) -> bool {
        self.task.abort();
        // Wait for the task to settle so a push in progress cannot land after the removal
        let _ = (&mut self.task).await;

        match self.queue.remove(&self.queue_name, &self.job_id).await {
            Ok(removed) => {
                debug!(job_id = %self.job_id, removed, "Enrichment job cancelled");
                removed
            }
            Err(e) => {
                warn!(job_id = %self.job_id, "Failed to remove enrichment job: {}", e);
                false
            }
        }
    }
}

/// Drains the enrichment queue into a [`MetadataEnricher`]
pub struct EnrichmentWorker {
    queue: Arc<dyn JobQueue>,
    enricher: Arc<dyn MetadataEnricher>,
    pop_timeout: Duration,
}

impl EnrichmentWorker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        enricher: Arc<dyn MetadataEnricher>,
        pop_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            enricher,
            pop_timeout,
        }
    }

    pub fn from_config(
        config: &SystemConfig,
        queue: Arc<dyn JobQueue>,
        enricher: Arc<dyn MetadataEnricher>,
    ) -> Self {
        Self::new(
            queue,
            enricher,
            Duration::from_secs(config.pipeline.queue_pop_timeout_seconds),
        )
    }

    /// Process at most one job. Returns `false` when the queue stayed empty.
    pub async fn run_once(&self) -> Result<bool> {
        let Some(queued) = self.queue.pop(ENRICHMENT_QUEUE, self.pop_timeout).await? else {
            return Ok(false);
        };

        let job: EnrichmentJob = match serde_json::from_str(&queued.payload) {
            Ok(job) => job,
            Err(e) => {
                warn!(job_id = %queued.job_id, "Dropping undecodable enrichment job: {}", e);
                return Ok(true);
            }
        };

        match self.enricher.enrich(&job).await {
            Ok(()) => info!(job_id = %job.job_id, tokens = job.tokens.len(), "Enrichment completed"),
            Err(e) => warn!(job_id = %job.job_id, "Enrichment failed: {}", e),
        }
        Ok(true)
    }

    pub async fn run(self: Arc<Self>) {
        info!("Enrichment worker started");
        loop {
            if let Err(e) = self.run_once().await {
                error!("Enrichment worker error: {}", e);
                tokio::time::sleep(self.pop_timeout).await;
            }
        }
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{CollaboratorError, TokenBalance};
    use async_trait::async_trait;
    use persistence_layer::InMemoryJobQueue;
    use rust_decimal::Decimal;
    use tokio::sync::Mutex;

    fn snapshot(wallet: &str, mints: &[&str]) -> BalanceSnapshot {
        BalanceSnapshot {
            wallet: wallet.to_string(),
            tokens: mints
                .iter()
                .map(|m| TokenBalance {
                    mint: m.to_string(),
                    amount: Decimal::ONE,
                    usd_value: None,
                })
                .collect(),
            fetched_at: Utc::now(),
        }
    }

    fn balances() -> HashMap<String, BalanceSnapshot> {
        HashMap::from([
            ("w2".to_string(), snapshot("w2", &["USDC", "SOL"])),
            ("w1".to_string(), snapshot("w1", &["SOL", "BONK"])),
        ])
    }

    #[derive(Default)]
    struct RecordingEnricher {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MetadataEnricher for RecordingEnricher {
        async fn enrich(&self, job: &EnrichmentJob) -> std::result::Result<(), CollaboratorError> {
            self.seen.lock().await.push(job.job_id.clone());
            Ok(())
        }
    }

    #[test]
    fn test_job_collects_unique_tokens() {
        let job = EnrichmentJob::from_balances("parent", &balances());
        assert_eq!(job.job_id, "enrichment:parent");
        assert_eq!(job.wallets, vec!["w1", "w2"]);
        assert_eq!(job.tokens, vec!["BONK", "SOL", "USDC"]);
    }

    #[tokio::test]
    async fn test_cancel_removes_queued_job() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let enrichment = EnrichmentQueue::new(queue.clone());

        let handle = enrichment.submit(EnrichmentJob::from_balances("p", &balances()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.len(ENRICHMENT_QUEUE).await.unwrap(), 1);

        assert!(handle.cancel().await);
        assert_eq!(queue.len(ENRICHMENT_QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_worker_drains_queue() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let enricher = Arc::new(RecordingEnricher::default());
        let worker = EnrichmentWorker::new(queue.clone(), enricher.clone(), Duration::from_millis(10));

        let handle = EnrichmentQueue::new(queue.clone())
            .submit(EnrichmentJob::from_balances("p", &balances()));
        let _ = handle.task.await;

        assert!(worker.run_once().await.unwrap());
        assert!(!worker.run_once().await.unwrap());
        assert_eq!(*enricher.seen.lock().await, vec!["enrichment:p".to_string()]);
    }
}
