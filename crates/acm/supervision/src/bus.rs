//! Message bus seam
//!
//! The runtime only ever publishes fire-and-forget. [`InMemoryBus`] pushes
//! every message through its JSON wire form and fans it out over a tokio
//! broadcast channel per topic.

use acm_types::{ParticipantMessage, Topic};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::trace;

/// Bus errors
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Topic {0} is closed")]
    Closed(Topic),
}

/// Publishes messages to participants
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Send without waiting for any reply
    async fn publish(&self, topic: Topic, message: ParticipantMessage) -> Result<(), BusError>;
}

/// In-process bus backed by broadcast channels
pub struct InMemoryBus {
    channels: DashMap<Topic, broadcast::Sender<ParticipantMessage>>,
    capacity: usize,
    /// Published messages, kept only by recording buses
    history: Option<Mutex<Vec<(Topic, ParticipantMessage)>>>,
    closed: DashSet<Topic>,
}

impl InMemoryBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity,
            history: None,
            closed: DashSet::new(),
        }
    }

    /// A bus that also records everything published, for inspection
    pub fn recording(capacity: usize) -> Self {
        Self {
            history: Some(Mutex::new(Vec::new())),
            ..Self::new(capacity)
        }
    }

    /// Refuse further publishes on `topic` and disconnect its subscribers
    pub fn close(&self, topic: Topic) {
        self.closed.insert(topic);
        self.channels.remove(&topic);
    }

    fn sender(&self, topic: Topic) -> broadcast::Sender<ParticipantMessage> {
        self.channels
            .entry(topic)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Subscribe to a topic; only messages published afterwards are received
    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<ParticipantMessage> {
        self.sender(topic).subscribe()
    }

    /// Take every message recorded on `topic` so far
    pub async fn drain(&self, topic: Topic) -> Vec<ParticipantMessage> {
        let Some(history) = &self.history else {
            return Vec::new();
        };
        let mut history = history.lock().await;
        let (taken, kept): (Vec<_>, Vec<_>) = history.drain(..).partition(|(t, _)| *t == topic);
        *history = kept;
        taken.into_iter().map(|(_, m)| m).collect()
    }

    /// Number of messages recorded on `topic` and not yet drained
    pub async fn pending(&self, topic: Topic) -> usize {
        match &self.history {
            Some(history) => history
                .lock()
                .await
                .iter()
                .filter(|(t, _)| *t == topic)
                .count(),
            None => 0,
        }
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(4096)
    }
}

#[async_trait]
impl MessagePublisher for InMemoryBus {
    async fn publish(&self, topic: Topic, message: ParticipantMessage) -> Result<(), BusError> {
        if self.closed.contains(&topic) {
            return Err(BusError::Closed(topic));
        }

        let wire = serde_json::to_vec(&message)?;
        let decoded: ParticipantMessage = serde_json::from_slice(&wire)?;

        trace!(%topic, kind = decoded.body.kind(), bytes = wire.len(), "Publishing message");
        if let Some(history) = &self.history {
            history.lock().await.push((topic, decoded.clone()));
        }

        // No subscriber is not an error for a fire-and-forget bus
        let _ = self.sender(topic).send(decoded);
        Ok(())
    }
}
