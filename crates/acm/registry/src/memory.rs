//! In-memory implementations of registry traits
//!
//! These are suitable for development and testing. Production deployments
//! should use persistent backends.

use crate::error::{RegistryError, Result};
use crate::participant::{Heartbeat, ParticipantRegistry, Registration};
use crate::store::{DefinitionStore, InstanceStore, Versioned};
use acm_types::{
    AutomationComposition, CompositionDefinition, CompositionId, ConceptId, InstanceId,
    Participant, ParticipantId, ParticipantReplica, ParticipantState, ReplicaId,
    SupportedElementType,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::hash::Hash;

/// Why a versioned write was refused
enum CasFailure {
    Missing,
    Conflict(u64),
}

/// DashMap of versioned values with compare-and-swap writes
struct VersionedMap<K, V> {
    entries: DashMap<K, Versioned<V>>,
}

impl<K: Eq + Hash + Copy, V: Clone> VersionedMap<K, V> {
    fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    fn insert(&self, key: K, value: V) -> Option<Versioned<V>> {
        match self.entries.entry(key) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let stored = Versioned { value, version: 1 };
                slot.insert(stored.clone());
                Some(stored)
            }
        }
    }

    fn get(&self, key: &K) -> Option<Versioned<V>> {
        self.entries.get(key).map(|v| v.clone())
    }

    fn values(&self) -> Vec<Versioned<V>> {
        self.entries.iter().map(|v| v.value().clone()).collect()
    }

    fn replace(&self, key: K, value: V, expected: u64) -> std::result::Result<u64, CasFailure> {
        let mut slot = self.entries.get_mut(&key).ok_or(CasFailure::Missing)?;
        if slot.version != expected {
            return Err(CasFailure::Conflict(slot.version));
        }
        slot.version += 1;
        slot.value = value;
        Ok(slot.version)
    }

    fn remove(&self, key: K, expected: u64) -> std::result::Result<(), CasFailure> {
        match self.entries.remove_if(&key, |_, v| v.version == expected) {
            Some(_) => Ok(()),
            None => match self.entries.get(&key) {
                Some(current) => Err(CasFailure::Conflict(current.version)),
                None => Err(CasFailure::Missing),
            },
        }
    }
}

fn cas_error(failure: CasFailure, expected: u64, missing: RegistryError) -> RegistryError {
    match failure {
        CasFailure::Missing => missing,
        CasFailure::Conflict(current) => RegistryError::VersionConflict { current, expected },
    }
}

/// In-memory composition definition store
pub struct InMemoryDefinitionStore {
    definitions: VersionedMap<CompositionId, CompositionDefinition>,
}

impl InMemoryDefinitionStore {
    pub fn new() -> Self {
        Self {
            definitions: VersionedMap::new(),
        }
    }
}

impl Default for InMemoryDefinitionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DefinitionStore for InMemoryDefinitionStore {
    async fn insert(
        &self,
        definition: CompositionDefinition,
    ) -> Result<Versioned<CompositionDefinition>> {
        let id = definition.composition_id;
        self.definitions
            .insert(id, definition)
            .ok_or(RegistryError::DefinitionAlreadyExists(id))
    }

    async fn get(&self, id: CompositionId) -> Result<Option<Versioned<CompositionDefinition>>> {
        Ok(self.definitions.get(&id))
    }

    async fn list(&self) -> Result<Vec<Versioned<CompositionDefinition>>> {
        Ok(self.definitions.values())
    }

    async fn replace(
        &self,
        definition: CompositionDefinition,
        expected_version: u64,
    ) -> Result<u64> {
        let id = definition.composition_id;
        self.definitions
            .replace(id, definition, expected_version)
            .map_err(|f| cas_error(f, expected_version, RegistryError::DefinitionNotFound(id)))
    }

    async fn remove(&self, id: CompositionId, expected_version: u64) -> Result<()> {
        self.definitions
            .remove(id, expected_version)
            .map_err(|f| cas_error(f, expected_version, RegistryError::DefinitionNotFound(id)))
    }
}

/// In-memory instance store
pub struct InMemoryInstanceStore {
    instances: VersionedMap<InstanceId, AutomationComposition>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self {
            instances: VersionedMap::new(),
        }
    }
}

impl Default for InMemoryInstanceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn insert(
        &self,
        instance: AutomationComposition,
    ) -> Result<Versioned<AutomationComposition>> {
        let id = instance.instance_id;
        self.instances
            .insert(id, instance)
            .ok_or(RegistryError::InstanceAlreadyExists(id))
    }

    async fn get(&self, id: InstanceId) -> Result<Option<Versioned<AutomationComposition>>> {
        Ok(self.instances.get(&id))
    }

    async fn list(&self) -> Result<Vec<Versioned<AutomationComposition>>> {
        Ok(self.instances.values())
    }

    async fn list_for_composition(
        &self,
        id: CompositionId,
    ) -> Result<Vec<Versioned<AutomationComposition>>> {
        Ok(self
            .instances
            .values()
            .into_iter()
            .filter(|v| v.value.composition_id == id || v.value.composition_target_id == Some(id))
            .collect())
    }

    async fn list_for_participant(
        &self,
        participant: ParticipantId,
    ) -> Result<Vec<Versioned<AutomationComposition>>> {
        Ok(self
            .instances
            .values()
            .into_iter()
            .filter(|v| {
                v.value
                    .elements
                    .values()
                    .any(|e| e.participant_id == participant)
            })
            .collect())
    }

    async fn replace(&self, instance: AutomationComposition, expected_version: u64) -> Result<u64> {
        let id = instance.instance_id;
        self.instances
            .replace(id, instance, expected_version)
            .map_err(|f| cas_error(f, expected_version, RegistryError::InstanceNotFound(id)))
    }

    async fn remove(&self, id: InstanceId, expected_version: u64) -> Result<()> {
        self.instances
            .remove(id, expected_version)
            .map_err(|f| cas_error(f, expected_version, RegistryError::InstanceNotFound(id)))
    }
}

/// In-memory participant registry
pub struct InMemoryParticipantRegistry {
    participants: DashMap<ParticipantId, Participant>,
}

impl InMemoryParticipantRegistry {
    pub fn new() -> Self {
        Self {
            participants: DashMap::new(),
        }
    }
}

impl Default for InMemoryParticipantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn online_replica(replica_id: ReplicaId, now: DateTime<Utc>) -> ParticipantReplica {
    ParticipantReplica {
        replica_id,
        state: ParticipantState::OnLine,
        last_msg: now,
    }
}

#[async_trait]
impl ParticipantRegistry for InMemoryParticipantRegistry {
    async fn register(
        &self,
        participant_id: ParticipantId,
        replica_id: ReplicaId,
        supported: Vec<SupportedElementType>,
        now: DateTime<Utc>,
    ) -> Result<Registration> {
        let registration = match self.participants.entry(participant_id) {
            Entry::Vacant(slot) => {
                let mut participant = Participant::new(participant_id, supported);
                participant
                    .replicas
                    .insert(replica_id, online_replica(replica_id, now));
                participant.refresh_state();
                slot.insert(participant);
                Registration::NewParticipant
            }
            Entry::Occupied(mut slot) => {
                let participant = slot.get_mut();
                if !supported.is_empty() {
                    participant.supported_element_types = supported;
                }
                let registration = if participant.replicas.contains_key(&replica_id) {
                    Registration::Rejoined
                } else {
                    Registration::NewReplica
                };
                participant
                    .replicas
                    .insert(replica_id, online_replica(replica_id, now));
                participant.refresh_state();
                registration
            }
        };
        Ok(registration)
    }

    async fn deregister(
        &self,
        participant_id: ParticipantId,
        replica_id: ReplicaId,
    ) -> Result<bool> {
        let mut participant = self
            .participants
            .get_mut(&participant_id)
            .ok_or(RegistryError::ParticipantNotFound(participant_id))?;

        if participant.replicas.remove(&replica_id).is_none() {
            return Err(RegistryError::ReplicaNotFound {
                participant_id,
                replica_id,
            });
        }
        participant.refresh_state();
        Ok(participant.replicas.is_empty())
    }

    async fn heartbeat(
        &self,
        participant_id: ParticipantId,
        replica_id: ReplicaId,
        now: DateTime<Utc>,
    ) -> Result<Heartbeat> {
        let Some(mut participant) = self.participants.get_mut(&participant_id) else {
            return Ok(Heartbeat::Unknown);
        };
        let Some(replica) = participant.replicas.get_mut(&replica_id) else {
            return Ok(Heartbeat::Unknown);
        };

        let outcome = match replica.state {
            ParticipantState::OnLine => Heartbeat::Alive,
            ParticipantState::OffLine => Heartbeat::Recovered,
        };
        replica.state = ParticipantState::OnLine;
        replica.last_msg = now;
        participant.refresh_state();
        Ok(outcome)
    }

    async fn get(&self, id: ParticipantId) -> Result<Option<Participant>> {
        Ok(self.participants.get(&id).map(|p| p.clone()))
    }

    async fn list(&self) -> Result<Vec<Participant>> {
        Ok(self.participants.iter().map(|p| p.value().clone()).collect())
    }

    async fn supported_element_map(&self) -> Result<HashMap<ConceptId, ParticipantId>> {
        let mut map: HashMap<ConceptId, ParticipantId> = HashMap::new();
        for participant in self.participants.iter().filter(|p| p.is_online()) {
            for supported in &participant.supported_element_types {
                map.entry(supported.type_id.clone())
                    .and_modify(|current| {
                        if participant.participant_id < *current {
                            *current = participant.participant_id;
                        }
                    })
                    .or_insert(participant.participant_id);
            }
        }
        Ok(map)
    }

    async fn mark_stale_offline(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(ParticipantId, ReplicaId)>> {
        let mut changed = Vec::new();
        for mut participant in self.participants.iter_mut() {
            let participant_id = participant.participant_id;
            for replica in participant.replicas.values_mut() {
                if replica.state == ParticipantState::OnLine && replica.last_msg < cutoff {
                    replica.state = ParticipantState::OffLine;
                    changed.push((participant_id, replica.replica_id));
                }
            }
            participant.refresh_state();
        }
        Ok(changed)
    }
}
