//! Process-local implementations of the coordination contracts.
//!
//! Each backend is an explicit object with no shared static state, so two
//! instances never see each other's locks, messages or jobs. They back
//! single-process deployments and the test suites.

use crate::{
    ChannelMessage, DistributedLock, EventChannel, JobQueue, MessageStream, PersistenceError,
    QueuedPayload, Result, SubjectStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct LockEntry {
    owner: String,
    expires_at: Instant,
}

/// Lock table guarded by a single async mutex, which makes check-and-set atomic.
#[derive(Debug, Default)]
pub struct InMemoryLockStore {
    locks: Mutex<HashMap<String, LockEntry>>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current owner of `key`, ignoring expired entries
    pub async fn holder(&self, key: &str) -> Option<String> {
        let locks = self.locks.lock().await;
        locks
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.owner.clone())
    }
}

#[async_trait]
impl DistributedLock for InMemoryLockStore {
    async fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut locks = self.locks.lock().await;
        let now = Instant::now();

        if let Some(entry) = locks.get(key) {
            if entry.expires_at > now {
                debug!("Lock already held: {} (owner {})", key, entry.owner);
                return Ok(false);
            }
        }

        locks.insert(
            key.to_string(),
            LockEntry {
                owner: owner.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<bool> {
        let mut locks = self.locks.lock().await;
        match locks.get(key) {
            Some(entry) if entry.owner == owner => {
                locks.remove(key);
                Ok(true)
            }
            Some(_) => {
                warn!("Lock {} is held by another owner, not releasing", key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn extend(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut locks = self.locks.lock().await;
        let now = Instant::now();
        match locks.get_mut(key) {
            Some(entry) if entry.owner == owner && entry.expires_at > now => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Fan-out channel over `tokio::sync::broadcast`.
pub struct InMemoryEventChannel {
    sender: broadcast::Sender<ChannelMessage>,
}

impl InMemoryEventChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }
}

impl Default for InMemoryEventChannel {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventChannel for InMemoryEventChannel {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        // No subscribers is not an error: the message is simply lost
        let _ = self.sender.send(ChannelMessage {
            topic: topic.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> Result<MessageStream> {
        if topics.is_empty() {
            return Err(PersistenceError::Backend(
                "subscribe requires at least one topic".to_string(),
            ));
        }
        let topics: HashSet<String> = topics.iter().cloned().collect();
        let receiver = self.sender.subscribe();

        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => return Some((message, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("In-memory channel subscriber lagged by {} messages", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |message| futures::future::ready(topics.contains(&message.topic)));

        Ok(Box::pin(stream))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    order: HashMap<String, VecDeque<String>>,
    payloads: HashMap<(String, String), String>,
}

#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    async fn try_pop(&self, queue: &str) -> Option<QueuedPayload> {
        let mut state = self.state.lock().await;
        let job_id = state.order.get_mut(queue)?.pop_front()?;
        let payload = state.payloads.remove(&(queue.to_string(), job_id.clone()))?;
        Some(QueuedPayload { job_id, payload })
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn push(&self, queue: &str, job_id: &str, payload: &str) -> Result<bool> {
        {
            let mut state = self.state.lock().await;
            let slot = (queue.to_string(), job_id.to_string());
            if state.payloads.contains_key(&slot) {
                return Ok(false);
            }
            state.payloads.insert(slot, payload.to_string());
            state
                .order
                .entry(queue.to_string())
                .or_default()
                .push_back(job_id.to_string());
        }
        self.notify.notify_waiters();
        Ok(true)
    }

    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<QueuedPayload>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(job) = self.try_pop(queue).await {
                return Ok(Some(job));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn remove(&self, queue: &str, job_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let removed_payload = state
            .payloads
            .remove(&(queue.to_string(), job_id.to_string()))
            .is_some();
        if let Some(order) = state.order.get_mut(queue) {
            order.retain(|queued| queued != job_id);
        }
        Ok(removed_payload)
    }

    async fn len(&self, queue: &str) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state.order.get(queue).map(|o| o.len() as u64).unwrap_or(0))
    }
}

#[derive(Debug, Default)]
pub struct InMemorySubjectStore {
    invalid: Mutex<HashMap<String, String>>,
    synced: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl InMemorySubjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubjectStore for InMemorySubjectStore {
    async fn flagged_invalid(&self, wallets: &[String]) -> Result<HashMap<String, String>> {
        let invalid = self.invalid.lock().await;
        Ok(wallets
            .iter()
            .filter_map(|w| invalid.get(w).map(|reason| (w.clone(), reason.clone())))
            .collect())
    }

    async fn last_synced(&self, wallets: &[String]) -> Result<HashMap<String, DateTime<Utc>>> {
        let synced = self.synced.lock().await;
        Ok(wallets
            .iter()
            .filter_map(|w| synced.get(w).map(|at| (w.clone(), *at)))
            .collect())
    }

    async fn mark_invalid(&self, wallet: &str, reason: &str) -> Result<()> {
        self.invalid
            .lock()
            .await
            .insert(wallet.to_string(), reason.to_string());
        Ok(())
    }

    async fn mark_synced(&self, wallet: &str, at: DateTime<Utc>) -> Result<()> {
        self.synced.lock().await.insert(wallet.to_string(), at);
        Ok(())
    }
}
