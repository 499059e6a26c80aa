//! Ack correlation
//!
//! Participants answer every instance command with per-element acks. An ack
//! lands only when it echoes the instance's current revision; it is then
//! applied and the instance progression is evaluated inside the same
//! compare-and-swap, so exactly one handler dispatches the next phase or
//! stage no matter how many acks race.

use crate::context::SupervisionContext;
use crate::error::Result;
use crate::phase;
use crate::plan::{self, Step};
use crate::resync::ResyncProtocol;
use acm_types::{
    AcElementAck, AcmEvent, AutomationComposition, ElementId, EventSource, InstanceId,
    MessageBody, ParticipantId, ReplicaId, Revision, StateChangeResult, SubState, Topic,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// What happened to an ack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The ack changed the instance
    Applied,
    /// Same revision, but nothing left to change
    Duplicate,
    /// Revision does not match the instance
    Stale,
    /// No operation is in flight for the instance
    NotInFlight,
    /// The instance does not exist (any more)
    UnknownInstance,
}

/// An instance ack, lifted from the wire message
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceAck {
    pub instance_id: InstanceId,
    pub participant_id: ParticipantId,
    pub replica_id: ReplicaId,
    pub revision: Revision,
    pub stage: Option<i32>,
    pub state_change_result: StateChangeResult,
    pub message: Option<String>,
    pub element_results: BTreeMap<ElementId, AcElementAck>,
}

impl InstanceAck {
    pub fn from_message(body: &MessageBody) -> Option<Self> {
        match body {
            MessageBody::AutomationCompositionDeployAck {
                instance_id,
                participant_id,
                replica_id,
                revision,
                stage,
                state_change_result,
                message,
                element_results,
                ..
            } => Some(Self {
                instance_id: *instance_id,
                participant_id: *participant_id,
                replica_id: *replica_id,
                revision: *revision,
                stage: *stage,
                state_change_result: *state_change_result,
                message: message.clone(),
                element_results: element_results.clone(),
            }),
            _ => None,
        }
    }
}

/// Apply an ack to an instance, without evaluating progression
pub(crate) fn apply_ack(
    ac: &mut AutomationComposition,
    ack: &InstanceAck,
    now: DateTime<Utc>,
) -> AckOutcome {
    if ack.revision != ac.revision {
        return AckOutcome::Stale;
    }
    let Some(operation) = plan::current_operation(ac) else {
        return AckOutcome::NotInFlight;
    };

    let succeeded = ack.state_change_result == StateChangeResult::NoError;
    let mut changed = false;

    for (id, result) in &ack.element_results {
        let Some(element) = ac.elements.get_mut(id) else {
            continue;
        };
        if element.participant_id != ack.participant_id || element.is_deleted() {
            continue;
        }
        let before = element.clone();

        if let Some(stage) = ack.stage {
            // Stage acks only move the element to the stage it waits for next
            if Some(stage) > element.stage {
                element.stage = Some(stage);
            }
        } else if plan::is_sub_operation(operation) {
            if succeeded {
                element.sub_state = SubState::None;
            }
        } else {
            if let Some(deploy) = result.deploy_state {
                element.deploy_state = deploy;
            }
            if let Some(lock) = result.lock_state {
                element.lock_state = lock;
            }
        }

        if result.operational_state.is_some() {
            element.operational_state = result.operational_state.clone();
        }
        if result.use_state.is_some() {
            element.use_state = result.use_state.clone();
        }
        if !result.out_properties.is_empty() {
            element.out_properties = result.out_properties.clone();
        }
        if result.message.is_some() {
            element.message = result.message.clone();
        }
        element.state_change_result = ack.state_change_result;

        changed |= *element != before;
    }

    if !succeeded && !ac.is_failed() {
        ac.state_change_result = StateChangeResult::Failed;
        changed = true;
    }

    if changed {
        ac.last_msg = now;
        AckOutcome::Applied
    } else {
        AckOutcome::Duplicate
    }
}

/// Applies instance acks and drives progression
#[derive(Clone)]
pub struct AckCorrelator {
    ctx: Arc<SupervisionContext>,
    resync: ResyncProtocol,
}

impl AckCorrelator {
    pub fn new(ctx: Arc<SupervisionContext>, resync: ResyncProtocol) -> Self {
        Self { ctx, resync }
    }

    /// Handle one instance ack
    #[instrument(skip(self, ack), fields(instance_id = %ack.instance_id, revision = %ack.revision))]
    pub async fn on_instance_ack(&self, ack: InstanceAck) -> Result<AckOutcome> {
        let Some(snapshot) = self.ctx.instances.get(ack.instance_id).await? else {
            debug!("Ack for unknown instance");
            return Ok(AckOutcome::UnknownInstance);
        };
        let definitions = self.ctx.definitions_for(&snapshot.value).await?;

        let now = Utc::now();
        let mut rejected = AckOutcome::Duplicate;
        let updated = self
            .ctx
            .update_instance(ack.instance_id, |ac| {
                let outcome = apply_ack(ac, &ack, now);
                if outcome != AckOutcome::Applied {
                    rejected = outcome;
                    return Ok(None);
                }
                // apply_ack only accepts acks while an operation is in flight
                let Some(operation) = plan::current_operation(ac) else {
                    rejected = AckOutcome::NotInFlight;
                    return Ok(None);
                };
                let step = plan::advance(operation, ac, &definitions);
                Ok(Some((operation, step)))
            })
            .await?;

        let Some(updated) = updated else {
            if matches!(rejected, AckOutcome::Stale | AckOutcome::NotInFlight) {
                debug!(outcome = ?rejected, "Discarding ack");
                self.ctx.emit(
                    EventSource::Correlator,
                    AcmEvent::AckDiscarded {
                        instance_id: ack.instance_id,
                        revision: ack.revision,
                        reason: format!("{rejected:?}"),
                    },
                );
            }
            return Ok(rejected);
        };

        let (operation, step) = updated.output;
        let ac = updated.value;
        match step {
            Step::Dispatch { slot, first } => {
                let command = plan::build_command(operation, &ac, &definitions, slot, first);
                self.ctx.publish(Topic::Participant, command).await?;
                info!(%operation, phase = slot, revision = %ac.revision, "Advanced to next phase");
                self.ctx.emit(
                    EventSource::Phase,
                    AcmEvent::PhaseAdvanced {
                        instance_id: ac.instance_id,
                        operation,
                        phase: slot,
                        revision: ac.revision,
                    },
                );
            }
            Step::Completed => {
                phase::settle(&self.ctx, &self.resync, operation, ac).await?
            }
            Step::Halted if ack.state_change_result == StateChangeResult::Failed => {
                let reason = ack
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("{} reported failure", ack.participant_id));
                warn!(%operation, participant_id = %ack.participant_id, %reason, "Operation failed");
                self.ctx.emit(
                    EventSource::Correlator,
                    AcmEvent::OperationFailed {
                        instance_id: ac.instance_id,
                        operation,
                        reason,
                    },
                );
            }
            Step::Halted | Step::Wait => {}
        }

        Ok(AckOutcome::Applied)
    }
}
