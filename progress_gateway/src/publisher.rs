use crate::{EventTopics, JobCompleted, JobFailed, ProgressEvent, ProgressUpdate, Result};
use chrono::Utc;
use persistence_layer::EventChannel;
use std::sync::Arc;
use tracing::debug;

/// Publishes job lifecycle events onto the shared event channel.
#[derive(Clone)]
pub struct ProgressPublisher {
    channel: Arc<dyn EventChannel>,
    topics: EventTopics,
}

impl ProgressPublisher {
    pub fn new(channel: Arc<dyn EventChannel>, topics: EventTopics) -> Self {
        Self { channel, topics }
    }

    pub fn topics(&self) -> &EventTopics {
        &self.topics
    }

    pub async fn publish(&self, event: &ProgressEvent) -> Result<()> {
        let message = self.topics.encode(event)?;
        self.channel.publish(&message.topic, &message.payload).await?;
        debug!(
            job_id = event.job_id(),
            kind = event.kind().as_str(),
            "Published job event"
        );
        Ok(())
    }

    pub async fn publish_progress(&self, job_id: &str, payload: serde_json::Value) -> Result<()> {
        self.publish(&ProgressEvent::Progress(ProgressUpdate {
            job_id: job_id.to_string(),
            payload,
            timestamp: Utc::now(),
        }))
        .await
    }

    pub async fn publish_completed(
        &self,
        job_id: &str,
        result: serde_json::Value,
        duration_ms: u64,
    ) -> Result<()> {
        self.publish(&ProgressEvent::Completed(JobCompleted {
            job_id: job_id.to_string(),
            result,
            duration_ms,
            timestamp: Utc::now(),
        }))
        .await
    }

    pub async fn publish_failed(
        &self,
        job_id: &str,
        error: &str,
        attempt: u32,
        max_attempts: u32,
    ) -> Result<()> {
        self.publish(&ProgressEvent::Failed(JobFailed {
            job_id: job_id.to_string(),
            error: error.to_string(),
            attempt,
            max_attempts,
            timestamp: Utc::now(),
        }))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventKind;
    use futures::StreamExt;
    use persistence_layer::InMemoryEventChannel;
    use serde_json::json;

    #[tokio::test]
    async fn test_each_kind_goes_to_its_own_topic() {
        let channel = Arc::new(InMemoryEventChannel::default());
        let topics = EventTopics::new("test");
        let publisher = ProgressPublisher::new(channel.clone(), topics.clone());
        let mut stream = channel.subscribe(&topics.all()).await.unwrap();

        publisher
            .publish_progress("job", json!({"percentage": 10}))
            .await
            .unwrap();
        publisher
            .publish_completed("job", json!({"ok": true}), 42)
            .await
            .unwrap();
        publisher.publish_failed("job", "boom", 1, 3).await.unwrap();

        let mut kinds = Vec::new();
        for _ in 0..3 {
            let message = stream.next().await.unwrap();
            kinds.push(topics.kind_of(&message.topic).unwrap());
        }
        assert_eq!(
            kinds,
            vec![EventKind::Progress, EventKind::Completed, EventKind::Failed]
        );
    }
}
