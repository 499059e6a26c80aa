//! ACM Registry - Participant registry and entity stores
//!
//! This crate provides the storage layer of the supervision runtime:
//!
//! - **ParticipantRegistry**: participant identity, replicas, liveness and
//!   supported element types
//! - **DefinitionStore**: composition definitions
//! - **InstanceStore**: automation composition instances
//!
//! Stores are versioned: every write is a compare-and-swap against the version
//! the writer read, which is what keeps concurrent ack handlers from losing
//! each other's updates.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod error;
pub mod memory;
pub mod participant;
pub mod store;

// Re-exports
pub use error::{RegistryError, Result};
pub use memory::{InMemoryDefinitionStore, InMemoryInstanceStore, InMemoryParticipantRegistry};
pub use participant::{Heartbeat, ParticipantRegistry, Registration};
pub use store::{DefinitionStore, InstanceStore, Versioned};
