//! Wire messages exchanged between the runtime and participants
//!
//! Every message is a [`ParticipantMessage`] envelope around a
//! [`MessageBody`] variant, serialized as JSON with a `messageType` tag.

use crate::definition::ElementDefinition;
use crate::ids::{
    CompositionId, ConceptId, ElementId, InstanceId, MessageId, ParticipantId, ReplicaId, Revision,
};
use crate::participant::SupportedElementType;
use crate::stage::Properties;
use crate::state::{
    AcTypeState, DeployOrder, DeployState, ElementState, LockOrder, LockState, ParticipantState,
    StateChangeResult, SubState,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Logical bus topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    /// Runtime to participants
    Participant,
    /// Participants to runtime
    Runtime,
    /// Runtime to participant replicas, cache synchronisation
    Sync,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Participant => write!(f, "acm-participant"),
            Topic::Runtime => write!(f, "acm-runtime"),
            Topic::Sync => write!(f, "acm-participant-sync"),
        }
    }
}

/// Envelope for every message on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantMessage {
    pub message_id: MessageId,
    pub timestamp: DateTime<Utc>,
    pub body: MessageBody,
}

impl ParticipantMessage {
    pub fn new(body: MessageBody) -> Self {
        Self {
            message_id: MessageId::generate(),
            timestamp: Utc::now(),
            body,
        }
    }
}

/// Prime or deprime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrimeOrder {
    Prime,
    Deprime,
}

/// Kind of command an instance ack answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AckKind {
    Deploy,
    StateChange,
    Migration,
    Prepare,
    Update,
}

/// Node templates a participant must prime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantDefinition {
    pub participant_id: ParticipantId,
    pub element_definitions: Vec<ElementDefinition>,
}

/// One element inside an instance command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcElementDeploy {
    pub id: ElementId,
    pub definition: ConceptId,
    pub order: DeployOrder,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default)]
    pub migration_state: ElementState,
    /// Stages the element takes part in, empty for unstaged commands
    #[serde(default)]
    pub stages: Vec<i32>,
}

/// Elements of one command batched for one participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantDeploy {
    pub participant_id: ParticipantId,
    pub ac_element_list: Vec<AcElementDeploy>,
}

/// Result for one element carried by an instance ack
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcElementAck {
    pub deploy_state: Option<DeployState>,
    pub lock_state: Option<LockState>,
    pub operational_state: Option<String>,
    pub use_state: Option<String>,
    #[serde(default)]
    pub out_properties: Properties,
    pub message: Option<String>,
}

/// Participant-reported runtime data for one element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementReport {
    pub id: ElementId,
    pub operational_state: Option<String>,
    pub use_state: Option<String>,
    #[serde(default)]
    pub out_properties: Properties,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceReport {
    pub instance_id: InstanceId,
    pub elements: Vec<ElementReport>,
}

/// Node template as seen by a participant in a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignedElementDefinition {
    pub definition: ElementDefinition,
    pub state: AcTypeState,
    #[serde(default)]
    pub out_properties: Properties,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionSnapshot {
    pub composition_id: CompositionId,
    pub state: AcTypeState,
    pub state_change_result: StateChangeResult,
    pub revision: Revision,
    pub element_definitions: Vec<AssignedElementDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementSnapshot {
    pub id: ElementId,
    pub definition: ConceptId,
    pub deploy_state: DeployState,
    pub lock_state: LockState,
    pub sub_state: SubState,
    pub operational_state: Option<String>,
    pub use_state: Option<String>,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default)]
    pub out_properties: Properties,
    pub message: Option<String>,
    #[serde(default)]
    pub state_change_result: StateChangeResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSnapshot {
    pub instance_id: InstanceId,
    pub composition_id: CompositionId,
    pub composition_target_id: Option<CompositionId>,
    pub deploy_state: DeployState,
    pub lock_state: LockState,
    pub sub_state: SubState,
    pub state_change_result: StateChangeResult,
    pub revision: Revision,
    pub elements: Vec<ElementSnapshot>,
}

/// Authoritative state pushed to a participant on restart or sync
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    pub definitions: Vec<DefinitionSnapshot>,
    pub instances: Vec<InstanceSnapshot>,
}

/// All message types, tagged by `messageType`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "messageType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageBody {
    // ═══════════════════════════════════════════════════════════════════════
    // Runtime → participant
    // ═══════════════════════════════════════════════════════════════════════
    #[serde(rename_all = "camelCase")]
    ParticipantPrime {
        composition_id: CompositionId,
        revision: Revision,
        order: PrimeOrder,
        participant_definition_updates: Vec<ParticipantDefinition>,
    },

    #[serde(rename_all = "camelCase")]
    AutomationCompositionDeploy {
        instance_id: InstanceId,
        composition_id: CompositionId,
        revision: Revision,
        start_phase: i32,
        first_start_phase: bool,
        participant_updates: Vec<ParticipantDeploy>,
    },

    #[serde(rename_all = "camelCase")]
    AutomationCompositionStateChange {
        instance_id: InstanceId,
        composition_id: CompositionId,
        revision: Revision,
        deploy_order: DeployOrder,
        lock_order: LockOrder,
        start_phase: i32,
        first_start_phase: bool,
        participant_updates: Vec<ParticipantDeploy>,
    },

    #[serde(rename_all = "camelCase")]
    AutomationCompositionMigration {
        instance_id: InstanceId,
        composition_id: CompositionId,
        composition_target_id: CompositionId,
        revision: Revision,
        stage: i32,
        first_stage: bool,
        precheck: bool,
        rollback: bool,
        participant_updates: Vec<ParticipantDeploy>,
    },

    #[serde(rename_all = "camelCase")]
    AutomationCompositionPrepare {
        instance_id: InstanceId,
        composition_id: CompositionId,
        revision: Revision,
        stage: i32,
        first_stage: bool,
        /// true for prepare (undeployed), false for review (deployed)
        pre_deploy: bool,
        participant_updates: Vec<ParticipantDeploy>,
    },

    #[serde(rename_all = "camelCase")]
    PropertiesUpdate {
        instance_id: InstanceId,
        composition_id: CompositionId,
        revision: Revision,
        participant_updates: Vec<ParticipantDeploy>,
    },

    #[serde(rename_all = "camelCase")]
    ParticipantSync {
        participant_id: ParticipantId,
        /// Target replica; all replicas when absent
        replica_id: Option<ReplicaId>,
        delete: bool,
        snapshot: SyncSnapshot,
    },

    #[serde(rename_all = "camelCase")]
    ParticipantRestart {
        participant_id: ParticipantId,
        replica_id: ReplicaId,
        snapshot: SyncSnapshot,
    },

    #[serde(rename_all = "camelCase")]
    ParticipantRegisterAck {
        participant_id: ParticipantId,
        replica_id: ReplicaId,
        message: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    ParticipantDeregisterAck {
        participant_id: ParticipantId,
        replica_id: ReplicaId,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Participant → runtime
    // ═══════════════════════════════════════════════════════════════════════
    #[serde(rename_all = "camelCase")]
    ParticipantRegister {
        participant_id: ParticipantId,
        replica_id: ReplicaId,
        supported_element_types: Vec<SupportedElementType>,
    },

    #[serde(rename_all = "camelCase")]
    ParticipantDeregister {
        participant_id: ParticipantId,
        replica_id: ReplicaId,
    },

    #[serde(rename_all = "camelCase")]
    ParticipantStatus {
        participant_id: ParticipantId,
        replica_id: ReplicaId,
        state: ParticipantState,
        #[serde(default)]
        supported_element_types: Vec<SupportedElementType>,
        #[serde(default)]
        instance_reports: Vec<InstanceReport>,
    },

    #[serde(rename_all = "camelCase")]
    ParticipantPrimeAck {
        composition_id: CompositionId,
        participant_id: ParticipantId,
        replica_id: ReplicaId,
        revision: Revision,
        composition_state: AcTypeState,
        state_change_result: StateChangeResult,
        message: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    AutomationCompositionDeployAck {
        kind: AckKind,
        instance_id: InstanceId,
        participant_id: ParticipantId,
        replica_id: ReplicaId,
        revision: Revision,
        stage: Option<i32>,
        state_change_result: StateChangeResult,
        message: Option<String>,
        #[serde(default)]
        element_results: BTreeMap<ElementId, AcElementAck>,
    },

    #[serde(rename_all = "camelCase")]
    ParticipantReqSync {
        participant_id: ParticipantId,
        replica_id: ReplicaId,
        composition_id: Option<CompositionId>,
        instance_id: Option<InstanceId>,
    },
}

impl MessageBody {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::ParticipantPrime { .. } => "participant_prime",
            MessageBody::AutomationCompositionDeploy { .. } => "ac_deploy",
            MessageBody::AutomationCompositionStateChange { .. } => "ac_state_change",
            MessageBody::AutomationCompositionMigration { .. } => "ac_migration",
            MessageBody::AutomationCompositionPrepare { .. } => "ac_prepare",
            MessageBody::PropertiesUpdate { .. } => "properties_update",
            MessageBody::ParticipantSync { .. } => "participant_sync",
            MessageBody::ParticipantRestart { .. } => "participant_restart",
            MessageBody::ParticipantRegisterAck { .. } => "participant_register_ack",
            MessageBody::ParticipantDeregisterAck { .. } => "participant_deregister_ack",
            MessageBody::ParticipantRegister { .. } => "participant_register",
            MessageBody::ParticipantDeregister { .. } => "participant_deregister",
            MessageBody::ParticipantStatus { .. } => "participant_status",
            MessageBody::ParticipantPrimeAck { .. } => "participant_prime_ack",
            MessageBody::AutomationCompositionDeployAck { .. } => "ac_deploy_ack",
            MessageBody::ParticipantReqSync { .. } => "participant_req_sync",
        }
    }

    /// Whether the message flows from a participant to the runtime
    pub fn is_inbound(&self) -> bool {
        matches!(
            self,
            MessageBody::ParticipantRegister { .. }
                | MessageBody::ParticipantDeregister { .. }
                | MessageBody::ParticipantStatus { .. }
                | MessageBody::ParticipantPrimeAck { .. }
                | MessageBody::AutomationCompositionDeployAck { .. }
                | MessageBody::ParticipantReqSync { .. }
        )
    }

    /// Elements addressed to `participant` by an instance command
    pub fn elements_for(&self, participant: ParticipantId) -> Vec<&AcElementDeploy> {
        let updates = match self {
            MessageBody::AutomationCompositionDeploy {
                participant_updates,
                ..
            }
            | MessageBody::AutomationCompositionStateChange {
                participant_updates,
                ..
            }
            | MessageBody::AutomationCompositionMigration {
                participant_updates,
                ..
            }
            | MessageBody::AutomationCompositionPrepare {
                participant_updates,
                ..
            }
            | MessageBody::PropertiesUpdate {
                participant_updates,
                ..
            } => participant_updates,
            _ => return Vec::new(),
        };

        updates
            .iter()
            .filter(|u| u.participant_id == participant)
            .flat_map(|u| u.ac_element_list.iter())
            .collect()
    }
}
