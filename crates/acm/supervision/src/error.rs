//! Supervision error types

use crate::bus::BusError;
use acm_registry::RegistryError;
use acm_types::{
    AcTypeState, CompositionId, ConceptId, InstanceId, ParticipantId, TransitionRejected,
};
use thiserror::Error;

/// Errors returned synchronously by supervision operations
#[derive(Debug, Error)]
pub enum SupervisionError {
    #[error("Invalid transition: {0}")]
    InvalidTransition(#[from] TransitionRejected),

    #[error("Cannot {action} composition definition {composition_id} while {state}")]
    InvalidDefinitionState {
        composition_id: CompositionId,
        state: AcTypeState,
        action: &'static str,
    },

    #[error("Composition definition not found: {0}")]
    DefinitionNotFound(CompositionId),

    #[error("Instance not found: {0}")]
    InstanceNotFound(InstanceId),

    #[error("No participant supports element types {types:?} of {composition_id}")]
    Unassignable {
        composition_id: CompositionId,
        types: Vec<ConceptId>,
    },

    #[error("Participant is off line: {0}")]
    ParticipantOffline(ParticipantId),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Gave up after {attempts} conflicting concurrent updates")]
    Contention { attempts: u32 },

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

/// Result type for supervision operations
pub type Result<T> = std::result::Result<T, SupervisionError>;
