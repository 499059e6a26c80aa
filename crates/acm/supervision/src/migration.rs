//! Staged migration, rollback and sub-state operations
//!
//! Migration moves a deployed instance to another composition definition
//! without a full redeploy. Every element is classified against the request
//! and the two definitions, then the whole instance walks the union of the
//! `stage.migrate` sets of its elements in ascending order. Rollback replays
//! the same protocol with source and target swapped to restore the elements
//! captured when the migration started.
//!
//! Precheck, prepare and review use the same staged protocol but only move
//! the instance's sub state.

use crate::context::SupervisionContext;
use crate::error::{Result, SupervisionError};
use crate::phase::{begin_operation, publish_start, Started};
use crate::plan::{self, Definitions, Step};
use crate::resync::ResyncProtocol;
use acm_types::transition::resolve;
use acm_types::{
    AcmEvent, AutomationComposition, CompositionDefinition, DeployState, Element, ElementId,
    ElementState, EventSource, InstanceId, MessageBody, MigrationRequest, Operation,
    ParticipantDeploy, RollbackSnapshot, StateChangeResult, SubState, Topic,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, instrument};

/// Classify the elements of `ac` against a migration request.
///
/// Returns the element map the instance will carry while migrating.
pub(crate) fn classify(
    ac: &AutomationComposition,
    request: &MigrationRequest,
    source: &CompositionDefinition,
    target: &CompositionDefinition,
) -> Result<BTreeMap<ElementId, Element>> {
    let mut elements = BTreeMap::new();

    for requested in &request.elements {
        if elements.contains_key(&requested.id) {
            return Err(SupervisionError::InvalidRequest(format!(
                "duplicate element {}",
                requested.id
            )));
        }
        if target.element(&requested.definition).is_none() {
            return Err(SupervisionError::InvalidRequest(format!(
                "{} is not a node template of {}",
                requested.definition, target.composition_id
            )));
        }

        let element = match ac.elements.get(&requested.id) {
            Some(existing) => {
                let mut element = existing.clone();
                element.definition = requested.definition.clone();
                for (key, value) in &requested.properties {
                    element.properties.insert(key.clone(), value.clone());
                }
                element.migration_state = ElementState::Present;
                element
            }
            None => {
                let participant = target
                    .assigned_participant(&requested.definition)
                    .ok_or_else(|| {
                        SupervisionError::InvalidRequest(format!(
                            "{} has no assigned participant",
                            requested.definition
                        ))
                    })?;
                let mut element = Element::new(requested.definition.clone(), participant)
                    .with_properties(requested.properties.clone());
                element.id = requested.id;
                element.lock_state = ac.lock_state;
                element.migration_state = ElementState::New;
                element
            }
        };
        elements.insert(element.id, element);
    }

    for (id, existing) in &ac.elements {
        if elements.contains_key(id) {
            continue;
        }
        let mut element = existing.clone();
        let known = source.element(&existing.definition).is_some()
            || target.element(&existing.definition).is_some();
        element.migration_state = if known {
            ElementState::Removed
        } else {
            ElementState::NotPresent
        };
        elements.insert(*id, element);
    }

    Ok(elements)
}

/// Elements restored by reverting to `snapshot`
pub(crate) fn restore(
    ac: &AutomationComposition,
    snapshot: &RollbackSnapshot,
) -> BTreeMap<ElementId, Element> {
    let mut elements = BTreeMap::new();

    for (id, original) in &snapshot.elements {
        let mut element = original.clone();
        element.migration_state = match ac.elements.get(id) {
            Some(current) if !current.is_deleted() => ElementState::Present,
            _ => ElementState::New,
        };
        elements.insert(*id, element);
    }

    for (id, current) in &ac.elements {
        if snapshot.elements.contains_key(id) || current.is_deleted() {
            continue;
        }
        let mut element = current.clone();
        element.migration_state = ElementState::Removed;
        elements.insert(*id, element);
    }

    elements
}

/// Move every taking part element into `deploy`, leaving untouched ones alone
fn cascade_migration(ac: &mut AutomationComposition, deploy: DeployState) {
    ac.deploy_state = deploy;
    for element in ac.elements.values_mut().filter(|e| !e.is_deleted()) {
        element.sub_state = SubState::None;
        element.stage = None;
        if element.migration_state != ElementState::NotPresent {
            element.deploy_state = deploy;
            element.message = None;
            element.state_change_result = StateChangeResult::NoError;
        }
    }
}

/// Runs migrations, rollbacks and staged sub-state operations
#[derive(Clone)]
pub struct MigrationCoordinator {
    ctx: Arc<SupervisionContext>,
    resync: ResyncProtocol,
}

impl MigrationCoordinator {
    pub fn new(ctx: Arc<SupervisionContext>, resync: ResyncProtocol) -> Self {
        Self { ctx, resync }
    }

    /// Load and validate everything a migration or precheck needs
    async fn migration_inputs(
        &self,
        instance_id: InstanceId,
        operation: Operation,
        request: &MigrationRequest,
    ) -> Result<(Definitions, BTreeMap<ElementId, Element>)> {
        let ac = self.ctx.load_instance(instance_id).await?.value;
        resolve(operation, ac.composite_state())?;

        if request.composition_target_id == ac.composition_id {
            return Err(SupervisionError::InvalidRequest(format!(
                "{instance_id} already uses {}",
                ac.composition_id
            )));
        }
        let source = self.ctx.load_definition(ac.composition_id).await?.value;
        let target = self
            .ctx
            .load_definition(request.composition_target_id)
            .await?
            .value;
        if !target.is_primed() {
            return Err(SupervisionError::InvalidDefinitionState {
                composition_id: target.composition_id,
                state: target.state,
                action: "migrate to",
            });
        }

        let elements = classify(&ac, request, &source, &target)?;
        let participants = elements
            .values()
            .filter(|e| e.migration_state != ElementState::NotPresent)
            .map(|e| e.participant_id)
            .collect::<BTreeSet<_>>();
        self.ctx.verify_online(&participants).await?;

        Ok((
            Definitions {
                current: source,
                target: Some(target),
            },
            elements,
        ))
    }

    /// Migrate a deployed instance to another primed definition
    #[instrument(skip(self, request), fields(target = %request.composition_target_id))]
    pub async fn migrate(&self, instance_id: InstanceId, request: MigrationRequest) -> Result<()> {
        let (definitions, elements) = self
            .migration_inputs(instance_id, Operation::Migrate, &request)
            .await?;
        let target = request.composition_target_id;

        let started = begin_operation(
            &self.ctx,
            instance_id,
            Operation::Migrate,
            &definitions,
            |ac| {
                ac.rollback = Some(RollbackSnapshot {
                    composition_id: ac.composition_id,
                    elements: ac.elements.clone(),
                });
                ac.sub_state = SubState::None;
                ac.precheck = false;
                ac.composition_target_id = Some(target);
                ac.elements = elements.clone();
                cascade_migration(ac, DeployState::Migrating);
                Ok(())
            },
        )
        .await?;

        self.report(&started, Operation::Migrate, EventSource::Migration);
        publish_start(&self.ctx, &self.resync, Operation::Migrate, &definitions, started).await
    }

    /// Validate a migration with participants without changing anything
    #[instrument(skip(self, request), fields(target = %request.composition_target_id))]
    pub async fn migrate_precheck(
        &self,
        instance_id: InstanceId,
        request: MigrationRequest,
    ) -> Result<()> {
        let (definitions, elements) = self
            .migration_inputs(instance_id, Operation::MigratePrecheck, &request)
            .await?;
        let target = request.composition_target_id;

        let started = begin_operation(
            &self.ctx,
            instance_id,
            Operation::MigratePrecheck,
            &definitions,
            |ac| {
                ac.set_cascaded_sub_state(SubState::MigrationPrechecking);
                ac.precheck = true;
                ac.composition_target_id = Some(target);
                Ok(())
            },
        )
        .await?;

        let Step::Dispatch { slot, first } = started.step else {
            return publish_start(
                &self.ctx,
                &self.resync,
                Operation::MigratePrecheck,
                &definitions,
                started,
            )
            .await;
        };

        // Participants check the full classified element list, including
        // elements the instance does not have yet
        let mut command = plan::build_command(
            Operation::MigratePrecheck,
            &started.ac,
            &definitions,
            slot,
            first,
        );
        if let MessageBody::AutomationCompositionMigration {
            participant_updates,
            ..
        } = &mut command
        {
            *participant_updates = precheck_updates(&elements, &definitions);
        }
        self.ctx.publish(Topic::Participant, command).await?;
        self.report(&started, Operation::MigratePrecheck, EventSource::Migration);
        Ok(())
    }

    /// Revert a FAILED migration to the elements it started from
    #[instrument(skip(self))]
    pub async fn rollback(&self, instance_id: InstanceId) -> Result<()> {
        let ac = self.ctx.load_instance(instance_id).await?.value;
        resolve(Operation::Rollback, ac.composite_state())?;
        let snapshot = ac.rollback.clone().ok_or_else(|| {
            SupervisionError::InvalidRequest(format!("{instance_id} has nothing to roll back"))
        })?;
        let participants: BTreeSet<_> = restore(&ac, &snapshot)
            .values()
            .map(|e| e.participant_id)
            .collect();
        self.ctx.verify_online(&participants).await?;
        let definitions = self.ctx.definitions_for(&ac).await?;

        let started = begin_operation(
            &self.ctx,
            instance_id,
            Operation::Rollback,
            &definitions,
            |ac| {
                let snapshot = ac.rollback.clone().ok_or_else(|| {
                    SupervisionError::InvalidRequest(format!(
                        "{} has nothing to roll back",
                        ac.instance_id
                    ))
                })?;
                ac.elements = restore(ac, &snapshot);
                cascade_migration(ac, DeployState::MigrationReverting);
                Ok(())
            },
        )
        .await?;

        self.report(&started, Operation::Rollback, EventSource::Migration);
        publish_start(&self.ctx, &self.resync, Operation::Rollback, &definitions, started).await
    }

    /// Staged preparation of an UNDEPLOYED instance
    #[instrument(skip(self))]
    pub async fn prepare(&self, instance_id: InstanceId) -> Result<()> {
        self.sub_operation(instance_id, Operation::Prepare, SubState::Preparing)
            .await
    }

    /// Review of a DEPLOYED instance
    #[instrument(skip(self))]
    pub async fn review(&self, instance_id: InstanceId) -> Result<()> {
        self.sub_operation(instance_id, Operation::Review, SubState::Reviewing)
            .await
    }

    async fn sub_operation(
        &self,
        instance_id: InstanceId,
        operation: Operation,
        sub: SubState,
    ) -> Result<()> {
        let ac = self.ctx.load_instance(instance_id).await?.value;
        resolve(operation, ac.composite_state())?;
        self.ctx.verify_online(&ac.participants()).await?;
        let definitions = self.ctx.definitions_for(&ac).await?;

        let started = begin_operation(&self.ctx, instance_id, operation, &definitions, |ac| {
            ac.set_cascaded_sub_state(sub);
            Ok(())
        })
        .await?;
        publish_start(&self.ctx, &self.resync, operation, &definitions, started).await
    }

    fn report(&self, started: &Started, operation: Operation, source: EventSource) {
        if matches!(started.step, Step::Dispatch { .. }) {
            info!(
                instance_id = %started.ac.instance_id,
                %operation,
                elements = started.ac.elements.len(),
                "Staged operation starting"
            );
        }
        if operation == Operation::MigratePrecheck {
            if let Step::Dispatch { slot, .. } = started.step {
                self.ctx.emit(
                    source,
                    AcmEvent::OperationDispatched {
                        instance_id: started.ac.instance_id,
                        operation,
                        phase: slot,
                        revision: started.ac.revision,
                    },
                );
            }
        }
    }
}

fn precheck_updates(
    elements: &BTreeMap<ElementId, Element>,
    definitions: &Definitions,
) -> Vec<ParticipantDeploy> {
    plan::group_by_participant(
        elements
            .values()
            .filter(|e| e.migration_state != ElementState::NotPresent)
            .map(|e| {
                (
                    e.participant_id,
                    plan::element_command(Operation::MigratePrecheck, e, definitions),
                )
            }),
    )
}
