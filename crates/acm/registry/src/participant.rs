//! Participant registry trait
//!
//! Tracks participant identity, replicas, liveness and the element types each
//! participant can host.

use crate::error::Result;
use acm_types::{ConceptId, Participant, ParticipantId, ReplicaId, SupportedElementType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// What a registration changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// First time this participant was seen
    NewParticipant,
    /// Known participant, new replica
    NewReplica,
    /// A replica we already knew registered again, i.e. it restarted
    Rejoined,
}

/// Outcome of a status heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heartbeat {
    /// Known replica that was already on line
    Alive,
    /// Known replica that had been marked off line
    Recovered,
    /// Replica never registered
    Unknown,
}

/// Registry for participants and their replicas
#[async_trait]
pub trait ParticipantRegistry: Send + Sync {
    /// Register a replica, creating the participant if needed
    async fn register(
        &self,
        participant_id: ParticipantId,
        replica_id: ReplicaId,
        supported: Vec<SupportedElementType>,
        now: DateTime<Utc>,
    ) -> Result<Registration>;

    /// Remove a replica; returns true if the participant has no replica left
    async fn deregister(&self, participant_id: ParticipantId, replica_id: ReplicaId) -> Result<bool>;

    /// Refresh a replica's liveness
    async fn heartbeat(
        &self,
        participant_id: ParticipantId,
        replica_id: ReplicaId,
        now: DateTime<Utc>,
    ) -> Result<Heartbeat>;

    /// Get a participant by ID
    async fn get(&self, id: ParticipantId) -> Result<Option<Participant>>;

    /// List all participants
    async fn list(&self) -> Result<Vec<Participant>>;

    /// Element type to hosting participant, on-line participants only.
    ///
    /// When several participants support a type the lowest ID wins, so the
    /// map is deterministic.
    async fn supported_element_map(&self) -> Result<HashMap<ConceptId, ParticipantId>>;

    /// Mark every replica silent since before `cutoff` as off line and return
    /// the replicas that changed
    async fn mark_stale_offline(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(ParticipantId, ReplicaId)>>;
}
