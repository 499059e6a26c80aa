//! Event stream for supervision activity
//!
//! Every component emits through one [`EventEmitter`]; operators subscribe to
//! follow completions, failures, timeouts and participant changes.

use acm_types::{AcmEvent, AcmEventEnvelope, EventSource};
use tokio::sync::broadcast;
use tracing::debug;

/// Broadcasts supervision events
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<AcmEventEnvelope>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to the event stream
    pub fn subscribe(&self) -> broadcast::Receiver<AcmEventEnvelope> {
        self.tx.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Emit an event, ignoring the absence of subscribers
    pub fn emit(&self, source: EventSource, event: AcmEvent) {
        let envelope = AcmEventEnvelope::new(event, source);
        debug!(event_id = %envelope.id, severity = ?envelope.severity, "Emitting event");
        let _ = self.tx.send(envelope);
    }
}
