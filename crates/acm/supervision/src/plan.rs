//! Progression rules shared by every instance operation
//!
//! An operation runs in ordered slots. Phased operations (deploy, undeploy,
//! delete, lock, unlock) slot elements by the `startPhase` of their
//! definition; staged operations (migrate, rollback, prepare, review,
//! precheck) slot them by the stage each element waits for. A slot is
//! dispatched only once every element of the previous slot is done.
//!
//! Everything here is pure: callers run it inside a compare-and-swap update
//! and publish whatever [`Step`] comes back after the write lands.

use acm_types::state::{deploy_completed, is_forward, lock_completed};
use acm_types::{
    AcElementDeploy, AutomationComposition, CompositionDefinition, DeployOrder, DeployState,
    Element, ElementDefinition, ElementState, LockOrder, LockState, MessageBody, Operation,
    ParticipantDeploy, ParticipantId, StageKind, SubState,
};
use std::collections::{BTreeMap, BTreeSet};

/// Definitions an instance's elements refer to during an operation
#[derive(Debug, Clone)]
pub(crate) struct Definitions {
    /// Definition named by `composition_id`
    pub current: CompositionDefinition,
    /// Definition named by `composition_target_id`, if any
    pub target: Option<CompositionDefinition>,
}

impl Definitions {
    /// Node template describing `element` under `operation`
    pub fn for_element(&self, operation: Operation, element: &Element) -> Option<&ElementDefinition> {
        let definition = match (operation, element.migration_state) {
            (Operation::Migrate, ElementState::Removed) => Some(&self.current),
            (Operation::Migrate, _) => self.target.as_ref(),
            (Operation::Rollback, ElementState::Removed) => self.target.as_ref(),
            _ => Some(&self.current),
        };
        definition.and_then(|d| d.element(&element.definition))
    }
}

/// What the caller must do after an update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    /// Publish the command for `slot`
    Dispatch { slot: i32, first: bool },
    /// The current slot still has outstanding elements
    Wait,
    /// Every element is done; the instance has settled
    Completed,
    /// A failure was recorded; nothing moves until a new command
    Halted,
}

/// Operation in flight for an instance, if any
pub fn current_operation(ac: &AutomationComposition) -> Option<Operation> {
    match ac.sub_state {
        SubState::Preparing => return Some(Operation::Prepare),
        SubState::Reviewing => return Some(Operation::Review),
        SubState::MigrationPrechecking => return Some(Operation::MigratePrecheck),
        SubState::None => {}
    }
    match ac.deploy_state {
        DeployState::Deploying => Some(Operation::Deploy),
        DeployState::Undeploying => Some(Operation::Undeploy),
        DeployState::Deleting => Some(Operation::Delete),
        DeployState::Updating => Some(Operation::Update),
        DeployState::Migrating => Some(Operation::Migrate),
        DeployState::MigrationReverting => Some(Operation::Rollback),
        _ => match ac.lock_state {
            LockState::Locking => Some(Operation::Lock),
            LockState::Unlocking => Some(Operation::Unlock),
            _ => None,
        },
    }
}

pub(crate) fn is_staged(operation: Operation) -> bool {
    matches!(
        operation,
        Operation::Migrate
            | Operation::Rollback
            | Operation::Prepare
            | Operation::Review
            | Operation::MigratePrecheck
    )
}

pub(crate) fn is_sub_operation(operation: Operation) -> bool {
    matches!(
        operation,
        Operation::Prepare | Operation::Review | Operation::MigratePrecheck
    )
}

/// Whether `element` has reached the end state of `operation`
pub(crate) fn element_done(operation: Operation, element: &Element) -> bool {
    if element.is_deleted() {
        return true;
    }
    match operation {
        Operation::Deploy | Operation::Update => element.deploy_state == DeployState::Deployed,
        Operation::Undeploy => element.deploy_state == DeployState::Undeployed,
        Operation::Delete => element.deploy_state == DeployState::Deleted,
        Operation::Lock => element.lock_state == LockState::Locked,
        Operation::Unlock => element.lock_state == LockState::Unlocked,
        Operation::Migrate | Operation::Rollback => match element.migration_state {
            ElementState::Removed => element.deploy_state == DeployState::Deleted,
            ElementState::NotPresent => true,
            ElementState::Present | ElementState::New => {
                element.deploy_state == DeployState::Deployed
            }
        },
        Operation::Prepare | Operation::Review | Operation::MigratePrecheck => {
            element.sub_state == SubState::None
        }
    }
}

/// Stages an element takes part in
pub(crate) fn element_stages(
    operation: Operation,
    element: &Element,
    definitions: &Definitions,
) -> BTreeSet<i32> {
    let kind = match operation {
        Operation::Migrate | Operation::Rollback => StageKind::Migrate,
        Operation::Prepare => StageKind::Prepare,
        _ => return BTreeSet::from([0]),
    };
    definitions
        .for_element(operation, element)
        .map(|d| d.stages(kind))
        .unwrap_or_else(|| BTreeSet::from([0]))
}

fn element_slot(operation: Operation, element: &Element, definitions: &Definitions) -> i32 {
    if is_staged(operation) {
        return element.stage.unwrap_or(0);
    }
    if operation == Operation::Update {
        return 0;
    }
    definitions
        .for_element(operation, element)
        .map(ElementDefinition::start_phase)
        .unwrap_or(0)
}

fn ascending(operation: Operation, ac: &AutomationComposition) -> bool {
    is_staged(operation)
        || operation == Operation::Update
        || is_forward(ac.deploy_state, ac.lock_state)
}

/// Slot holding the next outstanding elements, None once all are done
pub(crate) fn next_slot(
    operation: Operation,
    ac: &AutomationComposition,
    definitions: &Definitions,
) -> Option<i32> {
    let pending = ac
        .elements
        .values()
        .filter(|e| !element_done(operation, e))
        .map(|e| element_slot(operation, e, definitions));

    if ascending(operation, ac) {
        pending.min()
    } else {
        pending.max()
    }
}

/// Begin `operation` on an instance whose transitional state has been set
pub(crate) fn start(
    operation: Operation,
    ac: &mut AutomationComposition,
    definitions: &Definitions,
) -> Step {
    if is_staged(operation) {
        for element in ac.elements.values_mut() {
            element.stage = if element_done(operation, element) {
                None
            } else {
                element_stages(operation, element, definitions)
                    .first()
                    .copied()
            };
        }
    }

    match next_slot(operation, ac, definitions) {
        Some(slot) => {
            ac.phase = Some(slot);
            Step::Dispatch { slot, first: true }
        }
        None => {
            complete(operation, ac);
            Step::Completed
        }
    }
}

/// Decide what follows an accepted ack
pub(crate) fn advance(
    operation: Operation,
    ac: &mut AutomationComposition,
    definitions: &Definitions,
) -> Step {
    if ac.is_failed() {
        return Step::Halted;
    }
    match next_slot(operation, ac, definitions) {
        None => {
            complete(operation, ac);
            Step::Completed
        }
        Some(slot) if ac.phase == Some(slot) => Step::Wait,
        Some(slot) => {
            ac.phase = Some(slot);
            ac.revision = ac.revision.next();
            Step::Dispatch { slot, first: false }
        }
    }
}

/// Settle an instance whose elements are all done
pub(crate) fn complete(operation: Operation, ac: &mut AutomationComposition) {
    ac.phase = None;

    if is_sub_operation(operation) {
        ac.sub_state = SubState::None;
        for element in ac.elements.values_mut() {
            element.sub_state = SubState::None;
            element.stage = None;
        }
        if operation == Operation::MigratePrecheck {
            ac.precheck = false;
            ac.composition_target_id = None;
        }
        return;
    }

    if matches!(operation, Operation::Migrate | Operation::Rollback) {
        if let (Operation::Migrate, Some(target)) = (operation, ac.composition_target_id) {
            ac.composition_id = target;
        }
        ac.composition_target_id = None;
        ac.rollback = None;
        ac.elements.retain(|_, e| !e.is_deleted());
        for element in ac.elements.values_mut() {
            element.migration_state = ElementState::Present;
            element.stage = None;
        }
    }

    // Undeploying or deleting abandons whatever a failed migration left behind
    if matches!(operation, Operation::Undeploy | Operation::Delete) {
        ac.composition_target_id = None;
        ac.rollback = None;
        if operation == Operation::Undeploy {
            ac.elements.retain(|_, e| !e.is_deleted());
        }
        for element in ac.elements.values_mut().filter(|e| !e.is_deleted()) {
            element.migration_state = ElementState::Present;
            element.stage = None;
        }
    }

    let (deploy, lock) = (ac.deploy_state, ac.lock_state);
    ac.deploy_state = deploy_completed(deploy);
    ac.lock_state = lock_completed(deploy, lock);
    for element in ac.elements.values_mut().filter(|e| !e.is_deleted()) {
        element.lock_state = lock_completed(deploy, element.lock_state);
    }
}

fn deploy_order(operation: Operation) -> DeployOrder {
    match operation {
        Operation::Deploy => DeployOrder::Deploy,
        Operation::Undeploy => DeployOrder::Undeploy,
        Operation::Delete => DeployOrder::Delete,
        Operation::Update => DeployOrder::Update,
        Operation::Migrate | Operation::Rollback | Operation::MigratePrecheck => {
            DeployOrder::Migrate
        }
        Operation::Lock | Operation::Unlock | Operation::Prepare | Operation::Review => {
            DeployOrder::None
        }
    }
}

fn lock_order(operation: Operation) -> LockOrder {
    match operation {
        Operation::Lock => LockOrder::Lock,
        Operation::Unlock => LockOrder::Unlock,
        _ => LockOrder::None,
    }
}

/// Batch elements per participant, ordered by participant ID
pub(crate) fn group_by_participant(
    elements: impl IntoIterator<Item = (ParticipantId, AcElementDeploy)>,
) -> Vec<ParticipantDeploy> {
    let mut grouped: BTreeMap<ParticipantId, Vec<AcElementDeploy>> = BTreeMap::new();
    for (participant_id, element) in elements {
        grouped.entry(participant_id).or_default().push(element);
    }
    grouped
        .into_iter()
        .map(|(participant_id, ac_element_list)| ParticipantDeploy {
            participant_id,
            ac_element_list,
        })
        .collect()
}

/// Wire form of one element
pub(crate) fn element_command(
    operation: Operation,
    element: &Element,
    definitions: &Definitions,
) -> AcElementDeploy {
    let stages = if is_staged(operation) {
        element_stages(operation, element, definitions)
            .into_iter()
            .collect()
    } else {
        Vec::new()
    };
    AcElementDeploy {
        id: element.id,
        definition: element.definition.clone(),
        order: deploy_order(operation),
        properties: element.properties.clone(),
        migration_state: element.migration_state,
        stages,
    }
}

/// Build the command publishing `slot` of `operation`
pub(crate) fn build_command(
    operation: Operation,
    ac: &AutomationComposition,
    definitions: &Definitions,
    slot: i32,
    first: bool,
) -> MessageBody {
    let elements = ac.elements.values().filter(|e| !e.is_deleted()).filter(|e| {
        if is_staged(operation) {
            e.migration_state != ElementState::NotPresent
        } else {
            element_slot(operation, e, definitions) == slot
        }
    });
    let participant_updates = group_by_participant(
        elements.map(|e| (e.participant_id, element_command(operation, e, definitions))),
    );

    let instance_id = ac.instance_id;
    let composition_id = ac.composition_id;
    let revision = ac.revision;
    let target = ac.composition_target_id.unwrap_or(composition_id);

    match operation {
        Operation::Deploy => MessageBody::AutomationCompositionDeploy {
            instance_id,
            composition_id,
            revision,
            start_phase: slot,
            first_start_phase: first,
            participant_updates,
        },
        Operation::Undeploy | Operation::Delete | Operation::Lock | Operation::Unlock => {
            MessageBody::AutomationCompositionStateChange {
                instance_id,
                composition_id,
                revision,
                deploy_order: deploy_order(operation),
                lock_order: lock_order(operation),
                start_phase: slot,
                first_start_phase: first,
                participant_updates,
            }
        }
        Operation::Update => MessageBody::PropertiesUpdate {
            instance_id,
            composition_id,
            revision,
            participant_updates,
        },
        Operation::Migrate | Operation::MigratePrecheck => {
            MessageBody::AutomationCompositionMigration {
                instance_id,
                composition_id,
                composition_target_id: target,
                revision,
                stage: slot,
                first_stage: first,
                precheck: operation == Operation::MigratePrecheck,
                rollback: false,
                participant_updates,
            }
        }
        // Reverting runs the same protocol from the failed target back to
        // the composition the instance still belongs to
        Operation::Rollback => MessageBody::AutomationCompositionMigration {
            instance_id,
            composition_id: target,
            composition_target_id: composition_id,
            revision,
            stage: slot,
            first_stage: first,
            precheck: false,
            rollback: true,
            participant_updates,
        },
        Operation::Prepare | Operation::Review => MessageBody::AutomationCompositionPrepare {
            instance_id,
            composition_id,
            revision,
            stage: slot,
            first_stage: first,
            pre_deploy: operation == Operation::Prepare,
            participant_updates,
        },
    }
}
