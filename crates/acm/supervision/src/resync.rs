//! Participant resynchronisation
//!
//! A participant that restarts, rejoins or gains a replica has no reliable
//! local state. The runtime answers with one authoritative [`SyncSnapshot`]
//! holding every definition assignment and instance element the participant
//! owns. Completed operations are also pushed incrementally so standby
//! replicas keep their cache current.

use crate::context::SupervisionContext;
use crate::error::Result;
use acm_types::messages::{
    AssignedElementDefinition, DefinitionSnapshot, ElementSnapshot, InstanceSnapshot,
};
use acm_types::{
    AcmEvent, AutomationComposition, CompositionDefinition, EventSource, MessageBody,
    ParticipantId, ReplicaId, SyncSnapshot, Topic,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Definition as seen by one participant
pub fn definition_snapshot(
    definition: &CompositionDefinition,
    participant: ParticipantId,
) -> DefinitionSnapshot {
    let element_definitions = definition
        .element_state_map
        .iter()
        .filter(|(_, state)| state.participant_id == Some(participant))
        .filter_map(|(id, state)| {
            definition.element(id).map(|d| AssignedElementDefinition {
                definition: d.clone(),
                state: state.state,
                out_properties: state.out_properties.clone(),
            })
        })
        .collect();

    DefinitionSnapshot {
        composition_id: definition.composition_id,
        state: definition.state,
        state_change_result: definition.state_change_result,
        revision: definition.revision,
        element_definitions,
    }
}

/// Instance as seen by one participant
pub fn instance_snapshot(ac: &AutomationComposition, participant: ParticipantId) -> InstanceSnapshot {
    InstanceSnapshot {
        instance_id: ac.instance_id,
        composition_id: ac.composition_id,
        composition_target_id: ac.composition_target_id,
        deploy_state: ac.deploy_state,
        lock_state: ac.lock_state,
        sub_state: ac.sub_state,
        state_change_result: ac.state_change_result,
        revision: ac.revision,
        elements: ac
            .elements
            .values()
            .filter(|e| e.participant_id == participant)
            .map(|e| ElementSnapshot {
                id: e.id,
                definition: e.definition.clone(),
                deploy_state: e.deploy_state,
                lock_state: e.lock_state,
                sub_state: e.sub_state,
                operational_state: e.operational_state.clone(),
                use_state: e.use_state.clone(),
                properties: e.properties.clone(),
                out_properties: e.out_properties.clone(),
                message: e.message.clone(),
                state_change_result: e.state_change_result,
            })
            .collect(),
    }
}

/// Pushes authoritative state to participants
#[derive(Clone)]
pub struct ResyncProtocol {
    ctx: Arc<SupervisionContext>,
}

impl ResyncProtocol {
    pub fn new(ctx: Arc<SupervisionContext>) -> Self {
        Self { ctx }
    }

    /// Everything `participant` must know about
    pub async fn snapshot_for(&self, participant: ParticipantId) -> Result<SyncSnapshot> {
        let definitions = self
            .ctx
            .definitions
            .list()
            .await?
            .into_iter()
            .map(|v| v.value)
            .filter(|d| d.participants().contains(&participant))
            .map(|d| definition_snapshot(&d, participant))
            .collect();

        let instances = self
            .ctx
            .instances
            .list_for_participant(participant)
            .await?
            .into_iter()
            .map(|v| instance_snapshot(&v.value, participant))
            .collect();

        Ok(SyncSnapshot {
            definitions,
            instances,
        })
    }

    /// Push a restart snapshot and flag the participant's instances
    #[instrument(skip(self))]
    pub async fn restart(&self, participant_id: ParticipantId, replica_id: ReplicaId) -> Result<()> {
        let snapshot = self.snapshot_for(participant_id).await?;
        let instances: Vec<_> = snapshot.instances.iter().map(|i| i.instance_id).collect();

        self.ctx
            .publish(
                Topic::Participant,
                MessageBody::ParticipantRestart {
                    participant_id,
                    replica_id,
                    snapshot,
                },
            )
            .await?;

        for instance_id in &instances {
            self.ctx
                .update_instance(*instance_id, |ac| {
                    if ac.restarting {
                        return Ok(None);
                    }
                    ac.restarting = true;
                    Ok(Some(()))
                })
                .await?;
        }

        info!(instances = instances.len(), "Participant restart snapshot sent");
        self.ctx.emit(
            EventSource::Participant,
            AcmEvent::ParticipantResynced {
                participant_id,
                replica_id,
                instances: instances.len(),
                restart: true,
            },
        );
        Ok(())
    }

    /// Push a full snapshot to one replica
    #[instrument(skip(self))]
    pub async fn sync_replica(&self, participant_id: ParticipantId, replica_id: ReplicaId) -> Result<()> {
        let snapshot = self.snapshot_for(participant_id).await?;
        let instances = snapshot.instances.len();

        self.ctx
            .publish(
                Topic::Sync,
                MessageBody::ParticipantSync {
                    participant_id,
                    replica_id: Some(replica_id),
                    delete: false,
                    snapshot,
                },
            )
            .await?;

        debug!(instances, "Replica synchronised");
        self.ctx.emit(
            EventSource::Participant,
            AcmEvent::ParticipantResynced {
                participant_id,
                replica_id,
                instances,
                restart: false,
            },
        );
        Ok(())
    }

    /// Clear the restarting flag once the participant reports in
    pub async fn clear_restarting(&self, participant_id: ParticipantId) -> Result<()> {
        let flagged = self
            .ctx
            .instances
            .list_for_participant(participant_id)
            .await?
            .into_iter()
            .filter(|v| v.value.restarting);

        for instance in flagged {
            self.ctx
                .update_instance(instance.value.instance_id, |ac| {
                    if !ac.restarting {
                        return Ok(None);
                    }
                    ac.restarting = false;
                    Ok(Some(()))
                })
                .await?;
        }
        Ok(())
    }

    /// Replicated participants among `ids`
    async fn replicated(&self, ids: BTreeSet<ParticipantId>) -> Result<Vec<ParticipantId>> {
        let mut replicated = Vec::new();
        for id in ids {
            if let Some(p) = self.ctx.participants.get(id).await? {
                if p.replicas.len() > 1 {
                    replicated.push(id);
                }
            }
        }
        Ok(replicated)
    }

    /// Incremental sync of one instance to replicated participants
    pub async fn sync_instance(&self, ac: &AutomationComposition, delete: bool) -> Result<()> {
        for participant_id in self.replicated(ac.participants()).await? {
            self.ctx
                .publish(
                    Topic::Sync,
                    MessageBody::ParticipantSync {
                        participant_id,
                        replica_id: None,
                        delete,
                        snapshot: SyncSnapshot {
                            definitions: Vec::new(),
                            instances: vec![instance_snapshot(ac, participant_id)],
                        },
                    },
                )
                .await?;
        }
        Ok(())
    }

    /// Incremental sync of one definition to replicated participants
    pub async fn sync_definition(
        &self,
        definition: &CompositionDefinition,
        participants: BTreeSet<ParticipantId>,
        delete: bool,
    ) -> Result<()> {
        for participant_id in self.replicated(participants).await? {
            self.ctx
                .publish(
                    Topic::Sync,
                    MessageBody::ParticipantSync {
                        participant_id,
                        replica_id: None,
                        delete,
                        snapshot: SyncSnapshot {
                            definitions: vec![definition_snapshot(definition, participant_id)],
                            instances: Vec::new(),
                        },
                    },
                )
                .await?;
        }
        Ok(())
    }
}
