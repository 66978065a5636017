use crate::similarity_pipeline::{SimilarityAnalysisResult, SimilarityPipeline};
use crate::submitter::SIMILARITY_QUEUE;
use crate::{DispatchedJob, Result};
use config_manager::SystemConfig;
use persistence_layer::JobQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Pops dispatched jobs and runs each through the pipeline, at most
/// `concurrency` at a time.
pub struct SimilarityWorker {
    queue: Arc<dyn JobQueue>,
    pipeline: Arc<SimilarityPipeline>,
    permits: Arc<Semaphore>,
    pop_timeout: Duration,
}

impl SimilarityWorker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        pipeline: Arc<SimilarityPipeline>,
        concurrency: usize,
        pop_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            pipeline,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            pop_timeout,
        }
    }

    /// Concurrency from `system.worker_concurrency`, pop timeout from
    /// `pipeline.queue_pop_timeout_seconds`
    pub fn from_config(
        config: &SystemConfig,
        queue: Arc<dyn JobQueue>,
        pipeline: Arc<SimilarityPipeline>,
    ) -> Self {
        Self::new(
            queue,
            pipeline,
            config.system.worker_concurrency,
            Duration::from_secs(config.pipeline.queue_pop_timeout_seconds),
        )
    }

    /// Wait for a free slot, pop one job and start it. Returns the running
    /// pipeline task, or `None` when the queue stayed empty or the payload was
    /// unreadable.
    pub async fn run_once(&self) -> Result<Option<JoinHandle<Result<SimilarityAnalysisResult>>>> {
        let Ok(permit) = self.permits.clone().acquire_owned().await else {
            return Ok(None);
        };

        let Some(queued) = self.queue.pop(SIMILARITY_QUEUE, self.pop_timeout).await? else {
            return Ok(None);
        };

        let job: DispatchedJob = match serde_json::from_str(&queued.payload) {
            Ok(job) => job,
            Err(e) => {
                warn!(job_id = %queued.job_id, "Dropping undecodable job payload: {}", e);
                return Ok(None);
            }
        };
        if job.job_id != queued.job_id {
            warn!(
                queued_as = %queued.job_id,
                job_id = %job.job_id,
                "Dropping job filed under a foreign queue key"
            );
            return Ok(None);
        }

        debug!(job_id = %job.job_id, "Dispatching similarity job");
        let pipeline = self.pipeline.clone();
        Ok(Some(tokio::spawn(async move {
            let _permit = permit;
            pipeline.run(&job).await
        })))
    }

    pub async fn run(self: Arc<Self>) {
        info!(
            available = self.permits.available_permits(),
            "Similarity worker started"
        );
        loop {
            if let Err(e) = self.run_once().await {
                error!("Similarity worker error: {}", e);
                tokio::time::sleep(self.pop_timeout).await;
            }
        }
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
