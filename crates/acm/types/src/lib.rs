//! ACM Types - Core types for automation composition supervision
//!
//! The runtime commissions composition definitions, primes them onto a fleet
//! of participant agents, and drives instances of those compositions through
//! deploy, lock, migrate and delete. Everything is coordinated through
//! one-way messages; this crate holds the shared vocabulary.
//!
//! ## Key Concepts
//!
//! - **CompositionDefinition**: a set of node templates, primed onto participants
//! - **AutomationComposition**: a running instance with one element per node template
//! - **Participant**: an agent hosting elements of supported types, with replicas
//! - **Revision**: the operation token every ack must echo
//! - **MessageBody**: the tagged union of everything on the bus
//! - **Events**: unified observability stream

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod composition;
pub mod definition;
pub mod events;
pub mod ids;
pub mod messages;
pub mod participant;
pub mod request;
pub mod stage;
pub mod state;
pub mod transition;

// Re-export main types
pub use composition::{AutomationComposition, Element, RollbackSnapshot};
pub use definition::{CompositionDefinition, ElementDefinition, NodeTemplateState};
pub use events::{AcmEvent, AcmEventEnvelope, EventSeverity, EventSource};
pub use ids::{
    CompositionId, ConceptId, ElementId, InstanceId, MessageId, ParticipantId, ReplicaId, Revision,
};
pub use messages::{
    AcElementAck, AcElementDeploy, AckKind, MessageBody, ParticipantDeploy, ParticipantMessage,
    PrimeOrder, SyncSnapshot, Topic,
};
pub use participant::{Participant, ParticipantReplica, SupportedElementType};
pub use request::{ElementRequest, InstanceRequest, MigrationRequest};
pub use stage::{Properties, StageKind};
pub use state::{
    AcTypeState, DeployOrder, DeployState, ElementState, LockOrder, LockState, ParticipantState,
    StateChangeResult, SubState,
};
pub use transition::{CompositeState, Operation, TransitionRejected};
