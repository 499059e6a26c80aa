//! Composition definition lifecycle
//!
//! Commission, prime, deprime and decommission. Priming assigns every node
//! template to an on-line participant supporting its element type and sends
//! each participant its share of the definition; prime acks move the
//! definition to PRIMED (or back to COMMISSIONED) once every node template
//! has been confirmed.

use crate::context::SupervisionContext;
use crate::error::{Result, SupervisionError};
use crate::resync::ResyncProtocol;
use acm_types::messages::ParticipantDefinition;
use acm_types::{
    AcTypeState, AcmEvent, CompositionDefinition, CompositionId, ConceptId, ElementDefinition,
    EventSource, MessageBody, ParticipantId, PrimeOrder, ReplicaId, Revision, StateChangeResult,
    Topic,
};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// A prime or deprime ack, lifted from the wire message
#[derive(Debug, Clone, PartialEq)]
pub struct PrimeAck {
    pub composition_id: CompositionId,
    pub participant_id: ParticipantId,
    pub replica_id: ReplicaId,
    pub revision: Revision,
    pub composition_state: AcTypeState,
    pub state_change_result: StateChangeResult,
    pub message: Option<String>,
}

impl PrimeAck {
    pub fn from_message(body: &MessageBody) -> Option<Self> {
        match body {
            MessageBody::ParticipantPrimeAck {
                composition_id,
                participant_id,
                replica_id,
                revision,
                composition_state,
                state_change_result,
                message,
            } => Some(Self {
                composition_id: *composition_id,
                participant_id: *participant_id,
                replica_id: *replica_id,
                revision: *revision,
                composition_state: *composition_state,
                state_change_result: *state_change_result,
                message: message.clone(),
            }),
            _ => None,
        }
    }
}

enum PrimeProgress {
    Waiting,
    Completed {
        state: AcTypeState,
        participants: BTreeSet<ParticipantId>,
    },
    Failed,
}

/// Drives definitions through COMMISSIONED, PRIMING, PRIMED and DEPRIMING
#[derive(Clone)]
pub struct PrimeCoordinator {
    ctx: Arc<SupervisionContext>,
    resync: ResyncProtocol,
}

impl PrimeCoordinator {
    pub fn new(ctx: Arc<SupervisionContext>, resync: ResyncProtocol) -> Self {
        Self { ctx, resync }
    }

    /// Store a new COMMISSIONED definition
    #[instrument(skip(self, definition), fields(composition_id = %definition.composition_id))]
    pub async fn commission(&self, definition: CompositionDefinition) -> Result<CompositionDefinition> {
        if definition.elements.is_empty() {
            return Err(SupervisionError::InvalidRequest(format!(
                "composition definition {} has no node templates",
                definition.name
            )));
        }

        let stored = self.ctx.definitions.insert(definition).await?.value;
        info!(name = %stored.name, version = %stored.version, "Composition definition commissioned");
        self.ctx.emit(
            EventSource::Definition,
            AcmEvent::DefinitionCommissioned {
                composition_id: stored.composition_id,
            },
        );
        Ok(stored)
    }

    /// Remove a COMMISSIONED definition no instance refers to
    #[instrument(skip(self))]
    pub async fn decommission(&self, composition_id: CompositionId) -> Result<()> {
        let current = self.ctx.load_definition(composition_id).await?;
        if current.value.state != AcTypeState::Commissioned {
            return Err(SupervisionError::InvalidDefinitionState {
                composition_id,
                state: current.value.state,
                action: "decommission",
            });
        }
        self.ensure_unused(composition_id).await?;

        self.ctx
            .definitions
            .remove(composition_id, current.version)
            .await?;
        info!("Composition definition decommissioned");
        self.ctx.emit(
            EventSource::Definition,
            AcmEvent::DefinitionDecommissioned { composition_id },
        );
        Ok(())
    }

    async fn ensure_unused(&self, composition_id: CompositionId) -> Result<()> {
        let instances = self
            .ctx
            .instances
            .list_for_composition(composition_id)
            .await?;
        if instances.is_empty() {
            Ok(())
        } else {
            Err(SupervisionError::InvalidRequest(format!(
                "{} instance(s) still use composition definition {composition_id}",
                instances.len()
            )))
        }
    }

    /// Participant for every node template, keeping on-line assignments from
    /// an earlier prime. Returns the types nobody supports as the error.
    async fn assign(
        &self,
        definition: &CompositionDefinition,
    ) -> Result<std::result::Result<BTreeMap<ConceptId, ParticipantId>, Vec<ConceptId>>> {
        let supported = self.ctx.participants.supported_element_map().await?;
        let mut assignments = BTreeMap::new();
        let mut unsupported = Vec::new();

        for (id, element) in &definition.elements {
            if let Some(existing) = definition.assigned_participant(id) {
                let online = self
                    .ctx
                    .participants
                    .get(existing)
                    .await?
                    .is_some_and(|p| p.is_online());
                if online {
                    assignments.insert(id.clone(), existing);
                    continue;
                }
            }
            match supported.get(&element.type_id) {
                Some(participant) => {
                    assignments.insert(id.clone(), *participant);
                }
                None => unsupported.push(element.type_id.clone()),
            }
        }

        if unsupported.is_empty() {
            Ok(Ok(assignments))
        } else {
            unsupported.sort();
            unsupported.dedup();
            Ok(Err(unsupported))
        }
    }

    /// Assign node templates and send each participant its share
    #[instrument(skip(self))]
    pub async fn prime(&self, composition_id: CompositionId) -> Result<()> {
        let definition = self.ctx.load_definition(composition_id).await?.value;
        check_primable(&definition)?;

        let assignments = match self.assign(&definition).await? {
            Ok(assignments) => assignments,
            Err(types) => return self.reject_prime(composition_id, types).await,
        };

        let updated = self
            .ctx
            .update_definition(composition_id, |def| {
                check_primable(def)?;
                def.state = AcTypeState::Priming;
                def.state_change_result = StateChangeResult::NoError;
                def.revision = def.revision.next();
                def.last_msg = Utc::now();
                for (id, state) in def.element_state_map.iter_mut() {
                    state.state = AcTypeState::Priming;
                    state.participant_id = assignments.get(id).copied();
                    state.message = None;
                }
                Ok(Some(()))
            })
            .await?;
        let Some(updated) = updated else {
            return Ok(());
        };
        let definition = updated.value;

        let mut shares: BTreeMap<ParticipantId, Vec<ElementDefinition>> = BTreeMap::new();
        for (id, participant) in &assignments {
            if let Some(element) = definition.element(id) {
                shares.entry(*participant).or_default().push(element.clone());
            }
        }
        let participants = shares.len();

        self.ctx
            .publish(
                Topic::Participant,
                MessageBody::ParticipantPrime {
                    composition_id,
                    revision: definition.revision,
                    order: PrimeOrder::Prime,
                    participant_definition_updates: shares
                        .into_iter()
                        .map(|(participant_id, element_definitions)| ParticipantDefinition {
                            participant_id,
                            element_definitions,
                        })
                        .collect(),
                },
            )
            .await?;

        info!(participants, revision = %definition.revision, "Priming dispatched");
        self.ctx.emit(
            EventSource::Definition,
            AcmEvent::PrimeDispatched {
                composition_id,
                target: AcTypeState::Primed,
                revision: definition.revision,
                participants,
            },
        );
        Ok(())
    }

    async fn reject_prime(&self, composition_id: CompositionId, types: Vec<ConceptId>) -> Result<()> {
        let missing: BTreeSet<_> = types.iter().cloned().collect();
        self.ctx
            .update_definition(composition_id, |def| {
                def.state_change_result = StateChangeResult::Failed;
                def.last_msg = Utc::now();
                let unsupported: Vec<_> = def
                    .elements
                    .values()
                    .filter(|e| missing.contains(&e.type_id))
                    .map(|e| (e.id.clone(), e.type_id.clone()))
                    .collect();
                for (id, type_id) in unsupported {
                    if let Some(state) = def.element_state_map.get_mut(&id) {
                        state.message = Some(format!("No participant supports {type_id}"));
                    }
                }
                Ok(Some(()))
            })
            .await?;

        let reason = format!(
            "unsupported element types: {}",
            types.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
        );
        warn!(%reason, "Priming rejected");
        self.ctx.emit(
            EventSource::Definition,
            AcmEvent::PrimeFailed {
                composition_id,
                reason,
            },
        );
        Err(SupervisionError::Unassignable {
            composition_id,
            types,
        })
    }

    /// Ask participants to forget a definition no instance uses
    #[instrument(skip(self))]
    pub async fn deprime(&self, composition_id: CompositionId) -> Result<()> {
        let definition = self.ctx.load_definition(composition_id).await?.value;
        check_deprimable(&definition)?;
        self.ensure_unused(composition_id).await?;

        let participants = definition.participants();
        let updated = self
            .ctx
            .update_definition(composition_id, |def| {
                check_deprimable(def)?;
                def.state_change_result = StateChangeResult::NoError;
                def.revision = def.revision.next();
                def.last_msg = Utc::now();
                if participants.is_empty() {
                    def.state = AcTypeState::Commissioned;
                    for state in def.element_state_map.values_mut() {
                        state.state = AcTypeState::Commissioned;
                        state.participant_id = None;
                    }
                } else {
                    def.state = AcTypeState::Depriming;
                    for state in def.element_state_map.values_mut() {
                        state.state = AcTypeState::Depriming;
                        state.message = None;
                    }
                }
                Ok(Some(()))
            })
            .await?;
        let Some(updated) = updated else {
            return Ok(());
        };

        if participants.is_empty() {
            info!("Nothing was primed, definition back to COMMISSIONED");
            self.ctx.emit(
                EventSource::Definition,
                AcmEvent::PrimeCompleted {
                    composition_id,
                    state: AcTypeState::Commissioned,
                },
            );
            return Ok(());
        }

        self.ctx
            .publish(
                Topic::Participant,
                MessageBody::ParticipantPrime {
                    composition_id,
                    revision: updated.value.revision,
                    order: PrimeOrder::Deprime,
                    participant_definition_updates: participants
                        .iter()
                        .map(|participant_id| ParticipantDefinition {
                            participant_id: *participant_id,
                            element_definitions: Vec::new(),
                        })
                        .collect(),
                },
            )
            .await?;

        info!(participants = participants.len(), "Depriming dispatched");
        self.ctx.emit(
            EventSource::Definition,
            AcmEvent::PrimeDispatched {
                composition_id,
                target: AcTypeState::Commissioned,
                revision: updated.value.revision,
                participants: participants.len(),
            },
        );
        Ok(())
    }

    /// Record a participant's prime or deprime result
    #[instrument(skip(self, ack), fields(composition_id = %ack.composition_id, participant_id = %ack.participant_id))]
    pub async fn on_prime_ack(&self, ack: PrimeAck) -> Result<bool> {
        if self.ctx.definitions.get(ack.composition_id).await?.is_none() {
            debug!("Prime ack for unknown definition");
            return Ok(false);
        }

        let updated = self
            .ctx
            .update_definition(ack.composition_id, |def| {
                if def.revision != ack.revision || !def.state.is_transitional() {
                    return Ok(None);
                }
                let target = def.state.completion_target();
                let participants = def.participants();
                let mut changed = false;

                for state in def.element_state_map.values_mut() {
                    if state.participant_id != Some(ack.participant_id) {
                        continue;
                    }
                    if ack.state_change_result == StateChangeResult::NoError
                        && state.state != ack.composition_state
                    {
                        state.state = ack.composition_state;
                        changed = true;
                    }
                    if ack.message.is_some() && state.message != ack.message {
                        state.message = ack.message.clone();
                        changed = true;
                    }
                }

                if ack.state_change_result == StateChangeResult::Failed {
                    if def.state_change_result == StateChangeResult::Failed && !changed {
                        return Ok(None);
                    }
                    def.state_change_result = StateChangeResult::Failed;
                    def.last_msg = Utc::now();
                    return Ok(Some(PrimeProgress::Failed));
                }
                if !changed {
                    return Ok(None);
                }
                def.last_msg = Utc::now();

                if def.state_change_result == StateChangeResult::NoError
                    && def.all_elements_in(target)
                {
                    def.state = target;
                    if target == AcTypeState::Commissioned {
                        for state in def.element_state_map.values_mut() {
                            state.participant_id = None;
                        }
                    }
                    return Ok(Some(PrimeProgress::Completed {
                        state: target,
                        participants,
                    }));
                }
                Ok(Some(PrimeProgress::Waiting))
            })
            .await?;

        let Some(updated) = updated else {
            debug!(revision = %ack.revision, "Prime ack discarded");
            return Ok(false);
        };

        match updated.output {
            PrimeProgress::Completed {
                state,
                participants,
            } => {
                info!(%state, "Definition settled");
                self.ctx.emit(
                    EventSource::Definition,
                    AcmEvent::PrimeCompleted {
                        composition_id: ack.composition_id,
                        state,
                    },
                );
                self.resync
                    .sync_definition(
                        &updated.value,
                        participants,
                        state == AcTypeState::Commissioned,
                    )
                    .await?;
            }
            PrimeProgress::Failed => {
                let reason = ack
                    .message
                    .unwrap_or_else(|| format!("{} reported failure", ack.participant_id));
                warn!(%reason, "Priming failed");
                self.ctx.emit(
                    EventSource::Definition,
                    AcmEvent::PrimeFailed {
                        composition_id: ack.composition_id,
                        reason,
                    },
                );
            }
            PrimeProgress::Waiting => {}
        }
        Ok(true)
    }
}

fn check_primable(definition: &CompositionDefinition) -> Result<()> {
    let failed = definition.state_change_result == StateChangeResult::Failed;
    match definition.state {
        AcTypeState::Commissioned | AcTypeState::Primed => Ok(()),
        AcTypeState::Priming if failed => Ok(()),
        state => Err(SupervisionError::InvalidDefinitionState {
            composition_id: definition.composition_id,
            state,
            action: "prime",
        }),
    }
}

fn check_deprimable(definition: &CompositionDefinition) -> Result<()> {
    let failed = definition.state_change_result == StateChangeResult::Failed;
    match definition.state {
        AcTypeState::Primed => Ok(()),
        AcTypeState::Priming | AcTypeState::Depriming if failed => Ok(()),
        state => Err(SupervisionError::InvalidDefinitionState {
            composition_id: definition.composition_id,
            state,
            action: "deprime",
        }),
    }
}
