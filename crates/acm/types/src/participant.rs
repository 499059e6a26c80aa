//! Participants and their replicas

use crate::ids::{ConceptId, ParticipantId, ReplicaId};
use crate::state::ParticipantState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Element type a participant can host
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedElementType {
    pub type_id: ConceptId,
    /// Free-form participant kind, e.g. "k8s" or "http"
    pub participant_type: String,
}

/// One running process of a participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantReplica {
    pub replica_id: ReplicaId,
    pub state: ParticipantState,
    pub last_msg: DateTime<Utc>,
}

/// A logical participant agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub participant_id: ParticipantId,
    pub participant_state: ParticipantState,
    pub replicas: BTreeMap<ReplicaId, ParticipantReplica>,
    pub supported_element_types: Vec<SupportedElementType>,
}

impl Participant {
    pub fn new(participant_id: ParticipantId, supported: Vec<SupportedElementType>) -> Self {
        Self {
            participant_id,
            participant_state: ParticipantState::OffLine,
            replicas: BTreeMap::new(),
            supported_element_types: supported,
        }
    }

    pub fn supports(&self, type_id: &ConceptId) -> bool {
        self.supported_element_types
            .iter()
            .any(|s| &s.type_id == type_id)
    }

    pub fn is_online(&self) -> bool {
        self.participant_state == ParticipantState::OnLine
    }

    /// Recompute the participant state from its replicas
    pub fn refresh_state(&mut self) {
        self.participant_state = if self
            .replicas
            .values()
            .any(|r| r.state == ParticipantState::OnLine)
        {
            ParticipantState::OnLine
        } else {
            ParticipantState::OffLine
        };
    }
}
