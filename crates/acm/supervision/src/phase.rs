//! Phased instance operations
//!
//! Deploy, undeploy, delete, lock and unlock walk the instance's elements in
//! `startPhase` order: ascending for deploy and unlock, descending for the
//! others. Only the first phase is published here; later phases are released
//! by the ack correlator as each one completes.

use crate::context::SupervisionContext;
use crate::error::{Result, SupervisionError};
use crate::plan::{self, Definitions, Step};
use crate::resync::ResyncProtocol;
use acm_types::transition::resolve;
use acm_types::{
    AcmEvent, AutomationComposition, DeployState, Element, ElementId, EventSource,
    InstanceId, InstanceRequest, LockState, Operation, Properties, StateChangeResult, SubState,
    Topic,
};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Instance right after an operation was started
pub(crate) struct Started {
    pub ac: AutomationComposition,
    pub step: Step,
}

/// Start `operation` on an instance.
///
/// `begin` moves the instance into the operation's transitional state; the
/// legality check, revision bump and first slot selection happen around it
/// inside one compare-and-swap.
pub(crate) async fn begin_operation<F>(
    ctx: &SupervisionContext,
    instance_id: InstanceId,
    operation: Operation,
    definitions: &Definitions,
    mut begin: F,
) -> Result<Started>
where
    F: FnMut(&mut AutomationComposition) -> Result<()> + Send,
{
    let now = Utc::now();
    let updated = ctx
        .update_instance(instance_id, |ac| {
            resolve(operation, ac.composite_state())?;
            begin(ac)?;
            ac.state_change_result = StateChangeResult::NoError;
            ac.revision = ac.revision.next();
            ac.last_msg = now;
            Ok(Some(plan::start(operation, ac, definitions)))
        })
        .await?
        .ok_or(SupervisionError::InstanceNotFound(instance_id))?;

    Ok(Started {
        ac: updated.value,
        step: updated.output,
    })
}

/// Publish the first slot of a started operation, or settle it at once
pub(crate) async fn publish_start(
    ctx: &SupervisionContext,
    resync: &ResyncProtocol,
    operation: Operation,
    definitions: &Definitions,
    started: Started,
) -> Result<()> {
    let Started { ac, step } = started;
    match step {
        Step::Dispatch { slot, first } => {
            let command = plan::build_command(operation, &ac, definitions, slot, first);
            ctx.publish(Topic::Participant, command).await?;
            info!(instance_id = %ac.instance_id, %operation, phase = slot, revision = %ac.revision, "Operation dispatched");
            ctx.emit(
                EventSource::Phase,
                AcmEvent::OperationDispatched {
                    instance_id: ac.instance_id,
                    operation,
                    phase: slot,
                    revision: ac.revision,
                },
            );
            Ok(())
        }
        Step::Completed => settle(ctx, resync, operation, ac).await,
        Step::Wait | Step::Halted => Ok(()),
    }
}

/// Announce a completed operation and sync replicas
pub(crate) async fn settle(
    ctx: &SupervisionContext,
    resync: &ResyncProtocol,
    operation: Operation,
    ac: AutomationComposition,
) -> Result<()> {
    info!(instance_id = %ac.instance_id, %operation, "Operation completed");
    ctx.emit(
        EventSource::Phase,
        AcmEvent::OperationCompleted {
            instance_id: ac.instance_id,
            operation,
        },
    );

    if operation == Operation::Delete {
        if !ctx.remove_deleted_instance(ac.instance_id).await? {
            warn!(instance_id = %ac.instance_id, "Instance no longer DELETED, keeping it");
            return Ok(());
        }
        info!(instance_id = %ac.instance_id, "Instance deleted");
        ctx.emit(
            EventSource::Phase,
            AcmEvent::InstanceDeleted {
                instance_id: ac.instance_id,
            },
        );
        return resync.sync_instance(&ac, true).await;
    }
    resync.sync_instance(&ac, false).await
}

/// Runs phased deploy-level and lock-level operations
#[derive(Clone)]
pub struct PhaseCoordinator {
    ctx: Arc<SupervisionContext>,
    resync: ResyncProtocol,
}

impl PhaseCoordinator {
    pub fn new(ctx: Arc<SupervisionContext>, resync: ResyncProtocol) -> Self {
        Self { ctx, resync }
    }

    /// Create an UNDEPLOYED instance of a PRIMED definition
    #[instrument(skip(self, request), fields(composition_id = %request.composition_id))]
    pub async fn instantiate(&self, request: InstanceRequest) -> Result<AutomationComposition> {
        let definition = self.ctx.load_definition(request.composition_id).await?.value;
        if !definition.is_primed() {
            return Err(SupervisionError::InvalidDefinitionState {
                composition_id: definition.composition_id,
                state: definition.state,
                action: "instantiate",
            });
        }
        if request.elements.is_empty() {
            return Err(SupervisionError::InvalidRequest(
                "an instance needs at least one element".into(),
            ));
        }

        let mut seen = BTreeSet::new();
        let mut elements = Vec::with_capacity(request.elements.len());
        for element in request.elements {
            if !seen.insert(element.id) {
                return Err(SupervisionError::InvalidRequest(format!(
                    "duplicate element {}",
                    element.id
                )));
            }
            if definition.element(&element.definition).is_none() {
                return Err(SupervisionError::InvalidRequest(format!(
                    "{} is not a node template of {}",
                    element.definition, definition.composition_id
                )));
            }
            let participant = definition
                .assigned_participant(&element.definition)
                .ok_or_else(|| {
                    SupervisionError::InvalidRequest(format!(
                        "{} has no assigned participant",
                        element.definition
                    ))
                })?;

            let mut created = Element::new(element.definition, participant)
                .with_properties(element.properties);
            created.id = element.id;
            elements.push(created);
        }

        let ac = AutomationComposition::new(
            request.name,
            request.version,
            request.composition_id,
            elements,
        );
        let stored = self.ctx.instances.insert(ac).await?.value;

        info!(instance_id = %stored.instance_id, elements = stored.elements.len(), "Instance created");
        self.ctx.emit(
            EventSource::Phase,
            AcmEvent::InstanceCreated {
                instance_id: stored.instance_id,
                composition_id: stored.composition_id,
            },
        );
        self.resync.sync_instance(&stored, false).await?;
        Ok(stored)
    }

    async fn run<F>(&self, instance_id: InstanceId, operation: Operation, mut begin: F) -> Result<()>
    where
        F: FnMut(&mut AutomationComposition) -> Result<()> + Send,
    {
        let ac = self.ctx.load_instance(instance_id).await?.value;
        resolve(operation, ac.composite_state())?;
        self.ctx.verify_online(&ac.participants()).await?;
        let definitions = self.ctx.definitions_for(&ac).await?;

        let started = begin_operation(&self.ctx, instance_id, operation, &definitions, |ac| {
            // A failed precheck leaves its target behind
            if ac.precheck {
                ac.precheck = false;
                ac.composition_target_id = None;
            }
            begin(ac)
        })
        .await?;
        publish_start(&self.ctx, &self.resync, operation, &definitions, started).await
    }

    #[instrument(skip(self))]
    pub async fn deploy(&self, instance_id: InstanceId) -> Result<()> {
        self.run(instance_id, Operation::Deploy, |ac| {
            ac.set_cascaded_sub_state(SubState::None);
            ac.set_cascaded_state(DeployState::Deploying, LockState::None);
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn undeploy(&self, instance_id: InstanceId) -> Result<()> {
        self.run(instance_id, Operation::Undeploy, |ac| {
            ac.set_cascaded_sub_state(SubState::None);
            let lock = ac.lock_state;
            ac.set_cascaded_state(DeployState::Undeploying, lock);
            Ok(())
        })
        .await
    }

    /// Delete an instance; it is removed once every element is DELETED
    #[instrument(skip(self))]
    pub async fn delete(&self, instance_id: InstanceId) -> Result<()> {
        self.run(instance_id, Operation::Delete, |ac| {
            ac.set_cascaded_sub_state(SubState::None);
            let lock = ac.lock_state;
            ac.set_cascaded_state(DeployState::Deleting, lock);
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn lock(&self, instance_id: InstanceId) -> Result<()> {
        self.run(instance_id, Operation::Lock, |ac| {
            ac.set_cascaded_sub_state(SubState::None);
            ac.set_cascaded_state(DeployState::Deployed, LockState::Locking);
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn unlock(&self, instance_id: InstanceId) -> Result<()> {
        self.run(instance_id, Operation::Unlock, |ac| {
            ac.set_cascaded_sub_state(SubState::None);
            ac.set_cascaded_state(DeployState::Deployed, LockState::Unlocking);
            Ok(())
        })
        .await
    }

    /// Merge new properties into deployed elements and push them out in one
    /// message
    #[instrument(skip(self, properties))]
    pub async fn update(
        &self,
        instance_id: InstanceId,
        properties: BTreeMap<ElementId, Properties>,
    ) -> Result<()> {
        let ac = self.ctx.load_instance(instance_id).await?.value;
        if let Some(unknown) = properties.keys().find(|id| !ac.elements.contains_key(id)) {
            return Err(SupervisionError::InvalidRequest(format!(
                "{unknown} is not an element of {instance_id}"
            )));
        }

        self.run(instance_id, Operation::Update, |ac| {
            ac.set_cascaded_sub_state(SubState::None);
            for (id, changes) in &properties {
                if let Some(element) = ac.elements.get_mut(id) {
                    for (key, value) in changes {
                        element.properties.insert(key.clone(), value.clone());
                    }
                }
            }
            let lock = ac.lock_state;
            ac.set_cascaded_state(DeployState::Updating, lock);
            Ok(())
        })
        .await
    }
}
