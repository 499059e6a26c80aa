//! Registry error types

use acm_types::{CompositionId, InstanceId, ParticipantId, ReplicaId};
use thiserror::Error;

/// Registry errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Composition definition not found: {0}")]
    DefinitionNotFound(CompositionId),

    #[error("Instance not found: {0}")]
    InstanceNotFound(InstanceId),

    #[error("Participant not found: {0}")]
    ParticipantNotFound(ParticipantId),

    #[error("Replica {replica_id} not registered for {participant_id}")]
    ReplicaNotFound {
        participant_id: ParticipantId,
        replica_id: ReplicaId,
    },

    #[error("Composition definition already exists: {0}")]
    DefinitionAlreadyExists(CompositionId),

    #[error("Instance already exists: {0}")]
    InstanceAlreadyExists(InstanceId),

    #[error("Version conflict: current {current}, expected {expected}")]
    VersionConflict { current: u64, expected: u64 },

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;
