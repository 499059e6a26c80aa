//! Simulated participant
//!
//! Answers runtime commands the way a well-behaved participant agent would:
//! one ack per element, staged migrations walked stage by stage, removed
//! elements acked UNDEPLOYED then DELETED. A [`SimBehavior`] decides per
//! element whether to succeed, fail or stay silent, so each scenario
//! injects its own failure pattern.

use crate::bus::{InMemoryBus, MessagePublisher};
use acm_types::stage::next_stage;
use acm_types::{
    AcElementAck, AcElementDeploy, AcTypeState, AckKind, CompositionId, DeployOrder,
    DeployState, ElementState, InstanceId, LockOrder, LockState, MessageBody, ParticipantId,
    ParticipantMessage, ParticipantState, PrimeOrder, ReplicaId, Revision, StateChangeResult,
    SupportedElementType, SyncSnapshot, Topic,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Command an element is asked to carry out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimCommand {
    Deploy,
    Undeploy,
    Delete,
    Lock,
    Unlock,
    Update,
    Migrate { stage: i32, rollback: bool },
    Precheck,
    Prepare { stage: i32 },
    Review,
}

/// How the simulated participant answers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimOutcome {
    Succeed,
    Fail(String),
    /// Send nothing at all
    Ignore,
}

/// Per-scenario behavior of a simulated participant
pub trait SimBehavior: Send + Sync {
    fn element(&self, _command: SimCommand, _element: &AcElementDeploy) -> SimOutcome {
        SimOutcome::Succeed
    }

    fn prime(&self, _composition_id: CompositionId, _order: PrimeOrder) -> SimOutcome {
        SimOutcome::Succeed
    }
}

/// Succeeds at everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysSucceed;

impl SimBehavior for AlwaysSucceed {}

/// In-process participant answering over an [`InMemoryBus`]
pub struct SimParticipant {
    pub participant_id: ParticipantId,
    pub replica_id: ReplicaId,
    pub supported: Vec<SupportedElementType>,
    behavior: Arc<dyn SimBehavior>,
    last_snapshot: Mutex<Option<SyncSnapshot>>,
}

struct Reply {
    kind: AckKind,
    instance_id: InstanceId,
    revision: Revision,
}

impl SimParticipant {
    pub fn new(supported: Vec<SupportedElementType>) -> Self {
        Self {
            participant_id: ParticipantId::generate(),
            replica_id: ReplicaId::generate(),
            supported,
            behavior: Arc::new(AlwaysSucceed),
            last_snapshot: Mutex::new(None),
        }
    }

    pub fn with_behavior(mut self, behavior: Arc<dyn SimBehavior>) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn register_message(&self) -> ParticipantMessage {
        ParticipantMessage::new(MessageBody::ParticipantRegister {
            participant_id: self.participant_id,
            replica_id: self.replica_id,
            supported_element_types: self.supported.clone(),
        })
    }

    pub fn status_message(&self) -> ParticipantMessage {
        ParticipantMessage::new(MessageBody::ParticipantStatus {
            participant_id: self.participant_id,
            replica_id: self.replica_id,
            state: ParticipantState::OnLine,
            supported_element_types: self.supported.clone(),
            instance_reports: Vec::new(),
        })
    }

    /// Last snapshot pushed to this replica by a restart or sync
    pub fn last_snapshot(&self) -> Option<SyncSnapshot> {
        self.last_snapshot.lock().ok().and_then(|s| s.clone())
    }

    fn remember(&self, snapshot: &SyncSnapshot) {
        if let Ok(mut last) = self.last_snapshot.lock() {
            *last = Some(snapshot.clone());
        }
    }

    /// Replies to one runtime message
    pub fn respond(&self, message: &ParticipantMessage) -> Vec<ParticipantMessage> {
        match &message.body {
            MessageBody::ParticipantPrime {
                composition_id,
                revision,
                order,
                participant_definition_updates,
            } => {
                let addressed = participant_definition_updates
                    .iter()
                    .any(|u| u.participant_id == self.participant_id);
                if !addressed {
                    return Vec::new();
                }
                self.prime_ack(*composition_id, *revision, *order)
                    .into_iter()
                    .collect()
            }
            MessageBody::AutomationCompositionDeploy {
                instance_id,
                revision,
                ..
            } => self.each_element(
                &message.body,
                Reply {
                    kind: AckKind::Deploy,
                    instance_id: *instance_id,
                    revision: *revision,
                },
                |_| Some(SimCommand::Deploy),
            ),
            MessageBody::AutomationCompositionStateChange {
                instance_id,
                revision,
                deploy_order,
                lock_order,
                ..
            } => {
                let command = match (deploy_order, lock_order) {
                    (DeployOrder::Undeploy, _) => SimCommand::Undeploy,
                    (DeployOrder::Delete, _) => SimCommand::Delete,
                    (_, LockOrder::Lock) => SimCommand::Lock,
                    (_, LockOrder::Unlock) => SimCommand::Unlock,
                    _ => return Vec::new(),
                };
                self.each_element(
                    &message.body,
                    Reply {
                        kind: AckKind::StateChange,
                        instance_id: *instance_id,
                        revision: *revision,
                    },
                    |_| Some(command),
                )
            }
            MessageBody::PropertiesUpdate {
                instance_id,
                revision,
                ..
            } => self.each_element(
                &message.body,
                Reply {
                    kind: AckKind::Update,
                    instance_id: *instance_id,
                    revision: *revision,
                },
                |_| Some(SimCommand::Update),
            ),
            MessageBody::AutomationCompositionMigration {
                instance_id,
                revision,
                stage,
                precheck,
                rollback,
                ..
            } => self.each_element(
                &message.body,
                Reply {
                    kind: AckKind::Migration,
                    instance_id: *instance_id,
                    revision: *revision,
                },
                |element| {
                    if *precheck {
                        Some(SimCommand::Precheck)
                    } else if element.stages.contains(stage) {
                        Some(SimCommand::Migrate {
                            stage: *stage,
                            rollback: *rollback,
                        })
                    } else {
                        None
                    }
                },
            ),
            MessageBody::AutomationCompositionPrepare {
                instance_id,
                revision,
                stage,
                pre_deploy,
                ..
            } => self.each_element(
                &message.body,
                Reply {
                    kind: AckKind::Prepare,
                    instance_id: *instance_id,
                    revision: *revision,
                },
                |element| {
                    if !*pre_deploy {
                        Some(SimCommand::Review)
                    } else if element.stages.contains(stage) {
                        Some(SimCommand::Prepare { stage: *stage })
                    } else {
                        None
                    }
                },
            ),
            MessageBody::ParticipantRestart {
                participant_id,
                replica_id,
                snapshot,
            } if *participant_id == self.participant_id && *replica_id == self.replica_id => {
                self.remember(snapshot);
                vec![self.status_message()]
            }
            MessageBody::ParticipantSync {
                participant_id,
                replica_id,
                snapshot,
                ..
            } if *participant_id == self.participant_id
                && replica_id.map_or(true, |r| r == self.replica_id) =>
            {
                self.remember(snapshot);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn prime_ack(
        &self,
        composition_id: CompositionId,
        revision: Revision,
        order: PrimeOrder,
    ) -> Option<ParticipantMessage> {
        let (composition_state, state_change_result, message) =
            match self.behavior.prime(composition_id, order) {
                SimOutcome::Ignore => return None,
                SimOutcome::Succeed => {
                    let state = match order {
                        PrimeOrder::Prime => AcTypeState::Primed,
                        PrimeOrder::Deprime => AcTypeState::Commissioned,
                    };
                    (state, StateChangeResult::NoError, None)
                }
                SimOutcome::Fail(reason) => {
                    let state = match order {
                        PrimeOrder::Prime => AcTypeState::Priming,
                        PrimeOrder::Deprime => AcTypeState::Depriming,
                    };
                    (state, StateChangeResult::Failed, Some(reason))
                }
            };

        Some(ParticipantMessage::new(MessageBody::ParticipantPrimeAck {
            composition_id,
            participant_id: self.participant_id,
            replica_id: self.replica_id,
            revision,
            composition_state,
            state_change_result,
            message,
        }))
    }

    fn each_element(
        &self,
        body: &MessageBody,
        reply: Reply,
        command_for: impl Fn(&AcElementDeploy) -> Option<SimCommand>,
    ) -> Vec<ParticipantMessage> {
        let mut replies = Vec::new();
        for element in body.elements_for(self.participant_id) {
            let Some(command) = command_for(element) else {
                continue;
            };
            match self.behavior.element(command, element) {
                SimOutcome::Ignore => {}
                SimOutcome::Fail(reason) => replies.push(self.ack(
                    &reply,
                    element,
                    None,
                    AcElementAck {
                        message: Some(reason.clone()),
                        ..AcElementAck::default()
                    },
                    StateChangeResult::Failed,
                    Some(reason),
                )),
                SimOutcome::Succeed => {
                    for (stage, result) in success(command, element) {
                        replies.push(self.ack(
                            &reply,
                            element,
                            stage,
                            result,
                            StateChangeResult::NoError,
                            None,
                        ));
                    }
                }
            }
        }
        replies
    }

    fn ack(
        &self,
        reply: &Reply,
        element: &AcElementDeploy,
        stage: Option<i32>,
        result: AcElementAck,
        state_change_result: StateChangeResult,
        message: Option<String>,
    ) -> ParticipantMessage {
        ParticipantMessage::new(MessageBody::AutomationCompositionDeployAck {
            kind: reply.kind,
            instance_id: reply.instance_id,
            participant_id: self.participant_id,
            replica_id: self.replica_id,
            revision: reply.revision,
            stage,
            state_change_result,
            message,
            element_results: BTreeMap::from([(element.id, result)]),
        })
    }

    /// Answer everything published on the participant topics until the bus
    /// closes
    pub fn spawn(self: Arc<Self>, bus: Arc<InMemoryBus>) -> JoinHandle<()> {
        let mut commands = bus.subscribe(Topic::Participant);
        let mut syncs = bus.subscribe(Topic::Sync);

        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    r = commands.recv() => r,
                    r = syncs.recv() => r,
                };
                match received {
                    Ok(message) => {
                        for reply in self.respond(&message) {
                            if let Err(e) = bus.publish(Topic::Runtime, reply).await {
                                warn!(participant_id = %self.participant_id, error = %e, "Simulated participant could not reply");
                                return;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(participant_id = %self.participant_id, lagged = n, "Simulated participant lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(participant_id = %self.participant_id, "Simulated participant stopped");
                        return;
                    }
                }
            }
        })
    }
}

/// Acks a succeeding element sends, in order, with the stage they carry
fn success(command: SimCommand, element: &AcElementDeploy) -> Vec<(Option<i32>, AcElementAck)> {
    let deployed = |deploy: DeployState| AcElementAck {
        deploy_state: Some(deploy),
        ..AcElementAck::default()
    };

    let staged = |stage: i32| {
        let stages: BTreeSet<i32> = element.stages.iter().copied().collect();
        next_stage(&stages, stage)
    };

    match command {
        SimCommand::Deploy | SimCommand::Update => vec![(None, deployed(DeployState::Deployed))],
        SimCommand::Undeploy => vec![(None, deployed(DeployState::Undeployed))],
        SimCommand::Delete => vec![(None, deployed(DeployState::Deleted))],
        SimCommand::Lock => vec![(
            None,
            AcElementAck {
                lock_state: Some(LockState::Locked),
                ..AcElementAck::default()
            },
        )],
        SimCommand::Unlock => vec![(
            None,
            AcElementAck {
                lock_state: Some(LockState::Unlocked),
                ..AcElementAck::default()
            },
        )],
        SimCommand::Migrate { stage, .. } => match staged(stage) {
            Some(next) => vec![(Some(next), AcElementAck::default())],
            None if element.migration_state == ElementState::Removed => vec![
                (None, deployed(DeployState::Undeployed)),
                (None, deployed(DeployState::Deleted)),
            ],
            None => vec![(None, deployed(DeployState::Deployed))],
        },
        SimCommand::Prepare { stage } => match staged(stage) {
            Some(next) => vec![(Some(next), AcElementAck::default())],
            None => vec![(None, AcElementAck::default())],
        },
        SimCommand::Precheck | SimCommand::Review => vec![(None, AcElementAck::default())],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acm_types::{ConceptId, ElementId, ParticipantDeploy, Properties};

    fn element(stages: Vec<i32>, migration_state: ElementState) -> AcElementDeploy {
        AcElementDeploy {
            id: ElementId::generate(),
            definition: ConceptId::new("a", "1.0.0"),
            order: DeployOrder::Migrate,
            properties: Properties::new(),
            migration_state,
            stages,
        }
    }

    fn migration(sim: &SimParticipant, stage: i32, elements: Vec<AcElementDeploy>) -> ParticipantMessage {
        ParticipantMessage::new(MessageBody::AutomationCompositionMigration {
            instance_id: InstanceId::generate(),
            composition_id: CompositionId::generate(),
            composition_target_id: CompositionId::generate(),
            revision: Revision::new(2),
            stage,
            first_stage: stage == 0,
            precheck: false,
            rollback: false,
            participant_updates: vec![ParticipantDeploy {
                participant_id: sim.participant_id,
                ac_element_list: elements,
            }],
        })
    }

    #[test]
    fn test_staged_element_acks_next_stage() {
        let sim = SimParticipant::new(Vec::new());
        let replies = sim.respond(&migration(&sim, 0, vec![element(vec![0, 2], ElementState::Present)]));

        assert_eq!(replies.len(), 1);
        match &replies[0].body {
            MessageBody::AutomationCompositionDeployAck { stage, revision, .. } => {
                assert_eq!(*stage, Some(2));
                assert_eq!(*revision, Revision::new(2));
            }
            other => panic!("unexpected {}", other.kind()),
        }
    }

    #[test]
    fn test_removed_element_acks_twice() {
        let sim = SimParticipant::new(Vec::new());
        let replies = sim.respond(&migration(&sim, 0, vec![element(vec![0], ElementState::Removed)]));

        let states: Vec<_> = replies
            .iter()
            .filter_map(|m| match &m.body {
                MessageBody::AutomationCompositionDeployAck { element_results, .. } => {
                    element_results.values().next().and_then(|r| r.deploy_state)
                }
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![DeployState::Undeployed, DeployState::Deleted]);
    }

    #[test]
    fn test_other_participants_elements_are_ignored() {
        let sim = SimParticipant::new(Vec::new());
        let other = SimParticipant::new(Vec::new());
        assert!(sim
            .respond(&migration(&other, 0, vec![element(vec![0], ElementState::New)]))
            .is_empty());
    }
}
