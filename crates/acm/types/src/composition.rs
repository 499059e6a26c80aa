//! Automation composition instances and their elements

use crate::ids::{CompositionId, ConceptId, ElementId, InstanceId, ParticipantId, Revision};
use crate::stage::Properties;
use crate::state::{
    DeployState, ElementState, LockState, StateChangeResult, SubState,
};
use crate::transition::CompositeState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One element of an instance, owned by exactly one participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    pub id: ElementId,
    /// Node template this element instantiates
    pub definition: ConceptId,
    pub participant_id: ParticipantId,
    pub deploy_state: DeployState,
    pub lock_state: LockState,
    #[serde(default)]
    pub sub_state: SubState,
    pub operational_state: Option<String>,
    pub use_state: Option<String>,
    /// Next stage the element waits for during a staged operation
    pub stage: Option<i32>,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default)]
    pub out_properties: Properties,
    pub message: Option<String>,
    /// Result of the element's last ack
    #[serde(default)]
    pub state_change_result: StateChangeResult,
    #[serde(default)]
    pub migration_state: ElementState,
}

impl Element {
    pub fn new(definition: ConceptId, participant_id: ParticipantId) -> Self {
        Self {
            id: ElementId::generate(),
            definition,
            participant_id,
            deploy_state: DeployState::Undeployed,
            lock_state: LockState::None,
            sub_state: SubState::None,
            operational_state: None,
            use_state: None,
            stage: None,
            properties: Properties::new(),
            out_properties: Properties::new(),
            message: None,
            state_change_result: StateChangeResult::NoError,
            migration_state: ElementState::Present,
        }
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    /// DELETED elements never change again
    pub fn is_deleted(&self) -> bool {
        self.deploy_state == DeployState::Deleted
    }
}

/// Source side of a migration, kept so the migration can be reverted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackSnapshot {
    pub composition_id: CompositionId,
    pub elements: BTreeMap<ElementId, Element>,
}

/// A running instance of a composition definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationComposition {
    pub instance_id: InstanceId,
    pub name: String,
    pub version: String,
    pub composition_id: CompositionId,
    pub composition_target_id: Option<CompositionId>,
    pub deploy_state: DeployState,
    pub lock_state: LockState,
    pub sub_state: SubState,
    pub state_change_result: StateChangeResult,
    /// Start phase or stage currently dispatched
    pub phase: Option<i32>,
    pub revision: Revision,
    pub precheck: bool,
    pub restarting: bool,
    pub elements: BTreeMap<ElementId, Element>,
    pub rollback: Option<RollbackSnapshot>,
    pub last_msg: DateTime<Utc>,
}

impl AutomationComposition {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        composition_id: CompositionId,
        elements: impl IntoIterator<Item = Element>,
    ) -> Self {
        Self {
            instance_id: InstanceId::generate(),
            name: name.into(),
            version: version.into(),
            composition_id,
            composition_target_id: None,
            deploy_state: DeployState::Undeployed,
            lock_state: LockState::None,
            sub_state: SubState::None,
            state_change_result: StateChangeResult::NoError,
            phase: None,
            revision: Revision::default(),
            precheck: false,
            restarting: false,
            elements: elements.into_iter().map(|e| (e.id, e)).collect(),
            rollback: None,
            last_msg: Utc::now(),
        }
    }

    pub fn composite_state(&self) -> CompositeState {
        CompositeState {
            deploy: self.deploy_state,
            lock: self.lock_state,
            sub: self.sub_state,
            result: self.state_change_result,
        }
    }

    pub fn is_in_transitional_state(&self) -> bool {
        crate::state::is_in_transitional_state(self.deploy_state, self.lock_state, self.sub_state)
    }

    pub fn is_failed(&self) -> bool {
        self.state_change_result == StateChangeResult::Failed
    }

    /// Participants owning at least one element
    pub fn participants(&self) -> BTreeSet<ParticipantId> {
        self.elements.values().map(|e| e.participant_id).collect()
    }

    /// Set deploy and lock state on the instance and every element that is
    /// not DELETED, clearing per-element messages and stages
    pub fn set_cascaded_state(&mut self, deploy: DeployState, lock: LockState) {
        self.deploy_state = deploy;
        self.lock_state = lock;
        for element in self.elements.values_mut().filter(|e| !e.is_deleted()) {
            element.deploy_state = deploy;
            element.lock_state = lock;
            element.message = None;
            element.state_change_result = StateChangeResult::NoError;
            element.stage = None;
        }
    }

    /// Set the sub state on the instance and every element that is not
    /// DELETED
    pub fn set_cascaded_sub_state(&mut self, sub: SubState) {
        self.sub_state = sub;
        for element in self.elements.values_mut().filter(|e| !e.is_deleted()) {
            element.sub_state = sub;
            element.message = None;
            element.state_change_result = StateChangeResult::NoError;
            element.stage = None;
        }
    }

    pub fn all_elements_deployed(&self) -> bool {
        self.elements
            .values()
            .all(|e| e.deploy_state == DeployState::Deployed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> AutomationComposition {
        let participant = ParticipantId::generate();
        AutomationComposition::new(
            "demo",
            "1.0.0",
            CompositionId::generate(),
            [
                Element::new(ConceptId::new("a", "1.0.0"), participant),
                Element::new(ConceptId::new("b", "1.0.0"), ParticipantId::generate()),
            ],
        )
    }

    #[test]
    fn test_new_instance_is_undeployed() {
        let ac = instance();
        assert_eq!(ac.deploy_state, DeployState::Undeployed);
        assert!(!ac.is_in_transitional_state());
        assert_eq!(ac.participants().len(), 2);
    }

    #[test]
    fn test_cascade_reaches_every_element() {
        let mut ac = instance();
        for e in ac.elements.values_mut() {
            e.message = Some("old".into());
            e.stage = Some(3);
        }

        ac.set_cascaded_state(DeployState::Deploying, LockState::None);

        assert!(ac.is_in_transitional_state());
        for e in ac.elements.values() {
            assert_eq!(e.deploy_state, DeployState::Deploying);
            assert!(e.message.is_none());
            assert!(e.stage.is_none());
        }
        assert!(!ac.all_elements_deployed());
    }

    #[test]
    fn test_cascade_skips_deleted_elements() {
        let mut ac = instance();
        let deleted = *ac.elements.keys().next().unwrap();
        {
            let element = ac.elements.get_mut(&deleted).unwrap();
            element.deploy_state = DeployState::Deleted;
            element.message = Some("gone".into());
        }

        ac.set_cascaded_sub_state(SubState::Reviewing);
        ac.set_cascaded_state(DeployState::Undeploying, LockState::Locked);

        let element = &ac.elements[&deleted];
        assert_eq!(element.deploy_state, DeployState::Deleted);
        assert_eq!(element.lock_state, LockState::None);
        assert_eq!(element.sub_state, SubState::None);
        assert_eq!(element.message.as_deref(), Some("gone"));
        assert_eq!(
            ac.elements
                .values()
                .filter(|e| e.deploy_state == DeployState::Undeploying)
                .count(),
            1
        );
    }
}
