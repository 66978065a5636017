//! Job lifecycle events and their real-time fan-out.
//!
//! Producers publish through [`ProgressPublisher`] onto a shared
//! [`persistence_layer::EventChannel`], one channel per event kind. Any number
//! of [`ProgressGateway`] instances, possibly in other processes, subscribe to
//! those channels and forward each event to the client connections that asked
//! for its job.

use chrono::{DateTime, Utc};
use persistence_layer::{ChannelMessage, PersistenceError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod gateway;
pub mod publisher;

pub use gateway::{GatewayConfig, ProgressGateway, Subscription, SubscriptionRegistry};
pub use publisher::ProgressPublisher;

pub type ConnectionId = Uuid;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Event channel error: {0}")]
    Channel(#[from] PersistenceError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Progress,
    Completed,
    Failed,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [EventKind::Progress, EventKind::Completed, EventKind::Failed];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Progress => "progress",
            EventKind::Completed => "completed",
            EventKind::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub job_id: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCompleted {
    pub job_id: String,
    pub result: serde_json::Value,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailed {
    pub job_id: String,
    pub error: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub timestamp: DateTime<Utc>,
}

/// One lifecycle occurrence of a job
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Progress(ProgressUpdate),
    Completed(JobCompleted),
    Failed(JobFailed),
}

impl ProgressEvent {
    pub fn job_id(&self) -> &str {
        match self {
            ProgressEvent::Progress(e) => &e.job_id,
            ProgressEvent::Completed(e) => &e.job_id,
            ProgressEvent::Failed(e) => &e.job_id,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            ProgressEvent::Progress(_) => EventKind::Progress,
            ProgressEvent::Completed(_) => EventKind::Completed,
            ProgressEvent::Failed(_) => EventKind::Failed,
        }
    }

    fn body_json(&self) -> serde_json::Result<String> {
        match self {
            ProgressEvent::Progress(e) => serde_json::to_string(e),
            ProgressEvent::Completed(e) => serde_json::to_string(e),
            ProgressEvent::Failed(e) => serde_json::to_string(e),
        }
    }
}

/// Channel names for each event kind, namespaced so several deployments can
/// share one Redis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTopics {
    namespace: String,
}

impl EventTopics {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn topic(&self, kind: EventKind) -> String {
        format!("{}:{}", self.namespace, kind.as_str())
    }

    pub fn all(&self) -> Vec<String> {
        EventKind::ALL.iter().map(|kind| self.topic(*kind)).collect()
    }

    pub fn kind_of(&self, topic: &str) -> Option<EventKind> {
        topic
            .strip_prefix(&self.namespace)
            .and_then(|rest| rest.strip_prefix(':'))
            .and_then(EventKind::parse)
    }

    /// Serialize an event into the channel message it is published as
    pub fn encode(&self, event: &ProgressEvent) -> Result<ChannelMessage> {
        Ok(ChannelMessage {
            topic: self.topic(event.kind()),
            payload: event.body_json()?,
        })
    }

    /// The topic alone decides how the payload is parsed.
    pub fn decode(&self, message: &ChannelMessage) -> Result<ProgressEvent> {
        let kind = self
            .kind_of(&message.topic)
            .ok_or_else(|| GatewayError::UnknownTopic(message.topic.clone()))?;

        let event = match kind {
            EventKind::Progress => ProgressEvent::Progress(serde_json::from_str(&message.payload)?),
            EventKind::Completed => {
                ProgressEvent::Completed(serde_json::from_str(&message.payload)?)
            }
            EventKind::Failed => ProgressEvent::Failed(serde_json::from_str(&message.payload)?),
        };
        Ok(event)
    }
}

/// Client -> server messages of the subscription protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { job_id: String },
    Unsubscribe { job_id: String },
    SubscribeTopic { topic: EventKind },
    UnsubscribeTopic { topic: EventKind },
}

/// Server -> client messages of the subscription protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        connection_id: ConnectionId,
    },
    Subscribed {
        job_id: String,
    },
    Unsubscribed {
        job_id: String,
    },
    Progress {
        job_id: String,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
    Completed {
        job_id: String,
        result: serde_json::Value,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    Failed {
        job_id: String,
        error: String,
        attempt: u32,
        max_attempts: u32,
        timestamp: DateTime<Utc>,
    },
    Error {
        message: String,
    },
}

impl From<ProgressEvent> for ServerMessage {
    fn from(event: ProgressEvent) -> Self {
        match event {
            ProgressEvent::Progress(e) => ServerMessage::Progress {
                job_id: e.job_id,
                payload: e.payload,
                timestamp: e.timestamp,
            },
            ProgressEvent::Completed(e) => ServerMessage::Completed {
                job_id: e.job_id,
                result: e.result,
                duration_ms: e.duration_ms,
                timestamp: e.timestamp,
            },
            ProgressEvent::Failed(e) => ServerMessage::Failed {
                job_id: e.job_id,
                error: e.error,
                attempt: e.attempt,
                max_attempts: e.max_attempts,
                timestamp: e.timestamp,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_topics_are_namespaced_per_kind() {
        let topics = EventTopics::new("similarity");
        assert_eq!(topics.topic(EventKind::Progress), "similarity:progress");
        assert_eq!(topics.kind_of("similarity:failed"), Some(EventKind::Failed));
        assert_eq!(topics.kind_of("other:failed"), None);
        assert_eq!(topics.kind_of("similarity:unknown"), None);
        assert_eq!(topics.all().len(), 3);
    }

    #[test]
    fn test_decode_uses_topic_for_kind() {
        let topics = EventTopics::new("similarity");
        let event = ProgressEvent::Completed(JobCompleted {
            job_id: "job-1".to_string(),
            result: json!({"pairs": 3}),
            duration_ms: 1200,
            timestamp: Utc::now(),
        });

        let message = topics.encode(&event).unwrap();
        assert_eq!(message.topic, "similarity:completed");
        assert_eq!(topics.decode(&message).unwrap(), event);

        // Same body on the failed channel does not parse as a failure
        let misrouted = ChannelMessage {
            topic: topics.topic(EventKind::Failed),
            payload: message.payload,
        };
        assert!(topics.decode(&misrouted).is_err());
    }

    #[test]
    fn test_client_message_wire_format() {
        let parsed: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","job_id":"abc"}"#).unwrap();
        assert_eq!(
            parsed,
            ClientMessage::Subscribe {
                job_id: "abc".to_string()
            }
        );

        let topic: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe_topic","topic":"completed"}"#).unwrap();
        assert_eq!(
            topic,
            ClientMessage::SubscribeTopic {
                topic: EventKind::Completed
            }
        );
    }

    #[test]
    fn test_server_message_wire_format() {
        let message = ServerMessage::Failed {
            job_id: "abc".to_string(),
            error: "boom".to_string(),
            attempt: 1,
            max_attempts: 1,
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "failed");
        assert_eq!(value["max_attempts"], 1);
    }
}
