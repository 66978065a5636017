use crate::{
    ClientMessage, ConnectionId, EventKind, EventTopics, GatewayError, ProgressEvent, Result,
    ServerMessage,
};
use futures::StreamExt;
use persistence_layer::{ChannelMessage, EventChannel, MessageStream};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub topic_namespace: String,
    pub reconnect_delay: Duration,
    /// Connections that hold no job or topic subscription receive every event.
    pub broadcast_when_unsubscribed: bool,
    pub client_buffer: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            topic_namespace: "similarity".to_string(),
            reconnect_delay: Duration::from_secs(2),
            broadcast_when_unsubscribed: true,
            client_buffer: 256,
        }
    }
}

/// Snapshot of one connection's interests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub connection_id: ConnectionId,
    pub job_ids: HashSet<String>,
    pub topics: HashSet<EventKind>,
}

impl Subscription {
    pub fn is_empty(&self) -> bool {
        self.job_ids.is_empty() && self.topics.is_empty()
    }
}

struct Connection {
    sender: mpsc::Sender<ServerMessage>,
    job_ids: HashSet<String>,
    topics: HashSet<EventKind>,
}

impl Connection {
    fn wants(&self, event: &ProgressEvent, broadcast_when_unsubscribed: bool) -> bool {
        if self.job_ids.is_empty() && self.topics.is_empty() {
            return broadcast_when_unsubscribed;
        }
        self.job_ids.contains(event.job_id()) || self.topics.contains(&event.kind())
    }
}

/// Live connections and what each is subscribed to. Owned by one gateway.
pub struct SubscriptionRegistry {
    connections: RwLock<HashMap<ConnectionId, Connection>>,
    broadcast_when_unsubscribed: bool,
}

impl SubscriptionRegistry {
    pub fn new(broadcast_when_unsubscribed: bool) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            broadcast_when_unsubscribed,
        }
    }

    pub async fn register(&self, sender: mpsc::Sender<ServerMessage>) -> ConnectionId {
        let connection_id = Uuid::new_v4();
        self.connections.write().await.insert(
            connection_id,
            Connection {
                sender,
                job_ids: HashSet::new(),
                topics: HashSet::new(),
            },
        );
        connection_id
    }

    pub async fn deregister(&self, connection_id: ConnectionId) -> bool {
        self.connections.write().await.remove(&connection_id).is_some()
    }

    /// Returns `true` when the subscription is new
    pub async fn subscribe(&self, connection_id: ConnectionId, job_id: &str) -> Result<bool> {
        let mut connections = self.connections.write().await;
        let connection = connections
            .get_mut(&connection_id)
            .ok_or(GatewayError::UnknownConnection(connection_id))?;
        Ok(connection.job_ids.insert(job_id.to_string()))
    }

    pub async fn unsubscribe(&self, connection_id: ConnectionId, job_id: &str) -> Result<bool> {
        let mut connections = self.connections.write().await;
        let connection = connections
            .get_mut(&connection_id)
            .ok_or(GatewayError::UnknownConnection(connection_id))?;
        Ok(connection.job_ids.remove(job_id))
    }

    pub async fn subscribe_topic(
        &self,
        connection_id: ConnectionId,
        topic: EventKind,
    ) -> Result<bool> {
        let mut connections = self.connections.write().await;
        let connection = connections
            .get_mut(&connection_id)
            .ok_or(GatewayError::UnknownConnection(connection_id))?;
        Ok(connection.topics.insert(topic))
    }

    pub async fn unsubscribe_topic(
        &self,
        connection_id: ConnectionId,
        topic: EventKind,
    ) -> Result<bool> {
        let mut connections = self.connections.write().await;
        let connection = connections
            .get_mut(&connection_id)
            .ok_or(GatewayError::UnknownConnection(connection_id))?;
        Ok(connection.topics.remove(&topic))
    }

    pub async fn subscription(&self, connection_id: ConnectionId) -> Option<Subscription> {
        let connections = self.connections.read().await;
        connections.get(&connection_id).map(|c| Subscription {
            connection_id,
            job_ids: c.job_ids.clone(),
            topics: c.topics.clone(),
        })
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    async fn sender(&self, connection_id: ConnectionId) -> Option<mpsc::Sender<ServerMessage>> {
        let connections = self.connections.read().await;
        connections.get(&connection_id).map(|c| c.sender.clone())
    }

    async fn recipients(
        &self,
        event: &ProgressEvent,
    ) -> Vec<(ConnectionId, mpsc::Sender<ServerMessage>)> {
        let connections = self.connections.read().await;
        connections
            .iter()
            .filter(|(_, c)| c.wants(event, self.broadcast_when_unsubscribed))
            .map(|(id, c)| (*id, c.sender.clone()))
            .collect()
    }
}

/// Fans events from the shared channel out to subscribed client connections.
///
/// The gateway is transport-agnostic: a connection is an `mpsc` receiver of
/// [`ServerMessage`]s that the hosting server forwards over its socket.
pub struct ProgressGateway {
    registry: SubscriptionRegistry,
    channel: Arc<dyn EventChannel>,
    topics: EventTopics,
    config: GatewayConfig,
}

impl ProgressGateway {
    pub fn new(channel: Arc<dyn EventChannel>, config: GatewayConfig) -> Self {
        Self {
            registry: SubscriptionRegistry::new(config.broadcast_when_unsubscribed),
            channel,
            topics: EventTopics::new(config.topic_namespace.clone()),
            config,
        }
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Register a new connection and queue its `connected` acknowledgement
    pub async fn connect(&self) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        let (sender, receiver) = mpsc::channel(self.config.client_buffer.max(1));
        let connection_id = self.registry.register(sender.clone()).await;

        // Fresh channel with capacity >= 1, so this cannot be full
        let _ = sender.try_send(ServerMessage::Connected { connection_id });

        info!(%connection_id, "Client connected");
        (connection_id, receiver)
    }

    pub async fn disconnect(&self, connection_id: ConnectionId) {
        if self.registry.deregister(connection_id).await {
            info!(%connection_id, "Client disconnected");
        }
    }

    pub async fn handle_client_message(
        &self,
        connection_id: ConnectionId,
        message: ClientMessage,
    ) -> Result<()> {
        let reply = match message {
            ClientMessage::Subscribe { job_id } => {
                self.registry.subscribe(connection_id, &job_id).await?;
                debug!(%connection_id, %job_id, "Subscribed");
                Some(ServerMessage::Subscribed { job_id })
            }
            ClientMessage::Unsubscribe { job_id } => {
                self.registry.unsubscribe(connection_id, &job_id).await?;
                debug!(%connection_id, %job_id, "Unsubscribed");
                Some(ServerMessage::Unsubscribed { job_id })
            }
            ClientMessage::SubscribeTopic { topic } => {
                self.registry.subscribe_topic(connection_id, topic).await?;
                None
            }
            ClientMessage::UnsubscribeTopic { topic } => {
                self.registry.unsubscribe_topic(connection_id, topic).await?;
                None
            }
        };

        if let Some(reply) = reply {
            self.send_to(connection_id, reply).await;
        }
        Ok(())
    }

    /// Queue a message for one connection. Returns `false` if it is gone or saturated.
    pub async fn send_to(&self, connection_id: ConnectionId, message: ServerMessage) -> bool {
        let Some(sender) = self.registry.sender(connection_id).await else {
            return false;
        };
        match sender.try_send(message) {
            Ok(()) => true,
            Err(e) => {
                warn!(%connection_id, "Dropping message for client: {}", e);
                false
            }
        }
    }

    /// Deliver an event to every interested connection; returns the delivery count.
    pub async fn dispatch(&self, event: &ProgressEvent) -> usize {
        let recipients = self.registry.recipients(event).await;
        let mut delivered = 0;
        let mut closed = Vec::new();

        for (connection_id, sender) in recipients {
            match sender.try_send(ServerMessage::from(event.clone())) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(%connection_id, job_id = event.job_id(), "Client buffer full, event dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(connection_id),
            }
        }

        for connection_id in closed {
            self.disconnect(connection_id).await;
        }
        delivered
    }

    /// Decode one raw channel message and dispatch it. Malformed messages are dropped.
    pub async fn handle_channel_message(&self, message: &ChannelMessage) -> usize {
        match self.topics.decode(message) {
            Ok(event) => self.dispatch(&event).await,
            Err(e) => {
                warn!(topic = %message.topic, "Dropping malformed event: {}", e);
                0
            }
        }
    }

    pub async fn subscribe_channel(&self) -> Result<MessageStream> {
        Ok(self.channel.subscribe(&self.topics.all()).await?)
    }

    /// Forward messages from one channel subscription until it ends
    pub async fn pump(&self, mut stream: MessageStream) {
        while let Some(message) = stream.next().await {
            self.handle_channel_message(&message).await;
        }
    }

    /// Consume the event channel forever, re-subscribing after every disconnect.
    /// Events published while disconnected are not replayed.
    pub async fn run(self: Arc<Self>) {
        loop {
            match self.subscribe_channel().await {
                Ok(stream) => {
                    info!("Progress gateway subscribed to {:?}", self.topics.all());
                    self.pump(stream).await;
                    warn!("Event channel subscription ended");
                }
                Err(e) => error!("Failed to subscribe to event channel: {}", e),
            }
            tokio::time::sleep(self.config.reconnect_delay).await;
        }
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
