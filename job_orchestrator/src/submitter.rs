use crate::{DispatchedJob, JobRequest, QueuedJob, RequestLimits, Result};
use persistence_layer::JobQueue;
use std::sync::Arc;
use tracing::info;

pub const SIMILARITY_QUEUE: &str = "similarity";

/// Enqueue side of the similarity job queue
#[derive(Clone)]
pub struct JobSubmitter {
    queue: Arc<dyn JobQueue>,
    queue_name: String,
    limits: RequestLimits,
}

impl JobSubmitter {
    pub fn new(queue: Arc<dyn JobQueue>, limits: RequestLimits) -> Self {
        Self {
            queue,
            queue_name: SIMILARITY_QUEUE.to_string(),
            limits,
        }
    }

    pub fn limits(&self) -> &RequestLimits {
        &self.limits
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Queue a request under its job identity. Re-submitting an identity that
    /// is still waiting in the queue does not queue it twice.
    pub async fn enqueue(&self, request: JobRequest) -> Result<QueuedJob> {
        request.validate(&self.limits)?;

        let job = DispatchedJob::new(request);
        let payload = serde_json::to_string(&job)?;
        let pushed = self.queue.push(&self.queue_name, &job.job_id, &payload).await?;

        info!(
            job_id = %job.job_id,
            request_id = %job.request.request_id,
            wallets = job.request.wallets.len(),
            deduplicated = !pushed,
            "Similarity job enqueued"
        );

        Ok(QueuedJob {
            job_id: job.job_id,
            request_id: job.request.request_id,
            wallet_count: job.request.wallets.len(),
            deduplicated: !pushed,
            queued_at: job.dispatched_at,
        })
    }

    pub async fn queue_depth(&self) -> Result<u64> {
        Ok(self.queue.len(&self.queue_name).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OrchestratorError, StageOptions};
    use persistence_layer::InMemoryJobQueue;
    use std::time::Duration;

    #[tokio::test]
    async fn test_enqueue_dedups_waiting_job() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let submitter = JobSubmitter::new(queue.clone(), RequestLimits::default());
        let request =
            JobRequest::new(Some("req".into()), vec!["a".into(), "b".into()], 10).unwrap();

        let first = submitter.enqueue(request.clone()).await.unwrap();
        let second = submitter.enqueue(request).await.unwrap();

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.job_id, second.job_id);
        assert_eq!(submitter.queue_depth().await.unwrap(), 1);

        let popped = queue
            .pop(SIMILARITY_QUEUE, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        let job: DispatchedJob = serde_json::from_str(&popped.payload).unwrap();
        assert_eq!(job.job_id, first.job_id);
        assert_eq!(job.request.wallets, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_enqueue_validates_size() {
        let limits = RequestLimits {
            max_wallets: 1,
            ..RequestLimits::default()
        };
        let submitter = JobSubmitter::new(Arc::new(InMemoryJobQueue::new()), limits);
        let request = JobRequest::new(None, vec!["a".into(), "b".into()], 10).unwrap();
        assert!(submitter.enqueue(request).await.is_err());
    }

    #[tokio::test]
    async fn test_enqueue_rejects_timeout_above_budget() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let submitter = JobSubmitter::new(queue.clone(), RequestLimits::default());
        let request = JobRequest::new(None, vec!["a".into(), "b".into()], 10)
            .unwrap()
            .with_options(StageOptions {
                timeout_ms: Some(u64::MAX),
                ..Default::default()
            });

        assert!(matches!(
            submitter.enqueue(request).await,
            Err(OrchestratorError::InvalidRequest(_))
        ));
        assert_eq!(submitter.queue_depth().await.unwrap(), 0);
    }
}
