//! Event types for ACM observability
//!
//! Events provide a unified stream of definition, instance and participant
//! lifecycle activities.

use crate::ids::{CompositionId, InstanceId, ParticipantId, ReplicaId, Revision};
use crate::state::AcTypeState;
use crate::transition::Operation;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping all ACM events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmEventEnvelope {
    /// Unique event ID
    pub id: Uuid,

    /// Event timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Event source
    pub source: EventSource,

    /// Event severity
    pub severity: EventSeverity,

    /// Correlation ID for tracing
    pub correlation_id: Option<String>,

    /// The actual event
    pub event: AcmEvent,
}

/// Event sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSource {
    /// Prime/deprime and definition lifecycle
    Definition,
    /// Phased instance operations
    Phase,
    /// Staged migration and rollback
    Migration,
    /// Ack correlation
    Correlator,
    /// Periodic supervision sweep
    Scanner,
    /// Participant registry and resync
    Participant,
}

/// Event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

/// ACM events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AcmEvent {
    // ═══════════════════════════════════════════════════════════════════
    // DEFINITION EVENTS
    // ═══════════════════════════════════════════════════════════════════
    DefinitionCommissioned {
        composition_id: CompositionId,
    },
    DefinitionDecommissioned {
        composition_id: CompositionId,
    },
    PrimeDispatched {
        composition_id: CompositionId,
        target: AcTypeState,
        revision: Revision,
        participants: usize,
    },
    PrimeCompleted {
        composition_id: CompositionId,
        state: AcTypeState,
    },
    PrimeFailed {
        composition_id: CompositionId,
        reason: String,
    },

    // ═══════════════════════════════════════════════════════════════════
    // INSTANCE EVENTS
    // ═══════════════════════════════════════════════════════════════════
    InstanceCreated {
        instance_id: InstanceId,
        composition_id: CompositionId,
    },
    OperationDispatched {
        instance_id: InstanceId,
        operation: Operation,
        phase: i32,
        revision: Revision,
    },
    PhaseAdvanced {
        instance_id: InstanceId,
        operation: Operation,
        phase: i32,
        revision: Revision,
    },
    OperationCompleted {
        instance_id: InstanceId,
        operation: Operation,
    },
    OperationFailed {
        instance_id: InstanceId,
        operation: Operation,
        reason: String,
    },
    InstanceDeleted {
        instance_id: InstanceId,
    },
    AckDiscarded {
        instance_id: InstanceId,
        revision: Revision,
        reason: String,
    },

    // ═══════════════════════════════════════════════════════════════════
    // SUPERVISION EVENTS
    // ═══════════════════════════════════════════════════════════════════
    DefinitionTimedOut {
        composition_id: CompositionId,
        state: AcTypeState,
    },
    InstanceTimedOut {
        instance_id: InstanceId,
        operation: Option<Operation>,
    },

    // ═══════════════════════════════════════════════════════════════════
    // PARTICIPANT EVENTS
    // ═══════════════════════════════════════════════════════════════════
    ParticipantRegistered {
        participant_id: ParticipantId,
        replica_id: ReplicaId,
    },
    ParticipantDeregistered {
        participant_id: ParticipantId,
        replica_id: ReplicaId,
    },
    ParticipantOffline {
        participant_id: ParticipantId,
        replica_id: ReplicaId,
    },
    ParticipantResynced {
        participant_id: ParticipantId,
        replica_id: ReplicaId,
        instances: usize,
        restart: bool,
    },
}

impl AcmEventEnvelope {
    /// Create a new event envelope
    pub fn new(event: AcmEvent, source: EventSource) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            source,
            severity: Self::infer_severity(&event),
            correlation_id: None,
            event,
        }
    }

    /// Create with correlation ID
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    fn infer_severity(event: &AcmEvent) -> EventSeverity {
        match event {
            AcmEvent::PrimeFailed { .. }
            | AcmEvent::OperationFailed { .. }
            | AcmEvent::DefinitionTimedOut { .. }
            | AcmEvent::InstanceTimedOut { .. } => EventSeverity::Error,

            AcmEvent::ParticipantOffline { .. } | AcmEvent::ParticipantDeregistered { .. } => {
                EventSeverity::Warning
            }

            AcmEvent::AckDiscarded { .. } => EventSeverity::Debug,

            _ => EventSeverity::Info,
        }
    }
}
