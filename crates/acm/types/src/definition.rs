//! Composition definitions and their per-element priming state

use crate::ids::{CompositionId, ConceptId, ParticipantId, Revision};
use crate::stage::{self, Properties, StageKind};
use crate::state::{AcTypeState, StateChangeResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One node template of a composition definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementDefinition {
    /// Node template name and version
    pub id: ConceptId,
    /// Element type the node template instantiates
    pub type_id: ConceptId,
    #[serde(default)]
    pub properties: Properties,
}

impl ElementDefinition {
    pub fn new(id: ConceptId, type_id: ConceptId) -> Self {
        Self {
            id,
            type_id,
            properties: Properties::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn start_phase(&self) -> i32 {
        stage::start_phase(&self.properties)
    }

    pub fn stages(&self, kind: StageKind) -> BTreeSet<i32> {
        stage::stage_set(&self.properties, kind)
    }
}

/// Priming state of one node template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeTemplateState {
    pub state: AcTypeState,
    pub participant_id: Option<ParticipantId>,
    pub message: Option<String>,
    #[serde(default)]
    pub out_properties: Properties,
}

impl NodeTemplateState {
    pub fn commissioned() -> Self {
        Self {
            state: AcTypeState::Commissioned,
            participant_id: None,
            message: None,
            out_properties: Properties::new(),
        }
    }
}

/// A commissioned composition definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositionDefinition {
    pub composition_id: CompositionId,
    pub name: String,
    pub version: String,
    pub state: AcTypeState,
    pub state_change_result: StateChangeResult,
    pub revision: Revision,
    pub elements: BTreeMap<ConceptId, ElementDefinition>,
    pub element_state_map: BTreeMap<ConceptId, NodeTemplateState>,
    pub last_msg: DateTime<Utc>,
}

impl CompositionDefinition {
    /// Build a COMMISSIONED definition from its node templates
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        elements: impl IntoIterator<Item = ElementDefinition>,
    ) -> Self {
        let elements: BTreeMap<_, _> = elements.into_iter().map(|e| (e.id.clone(), e)).collect();
        let element_state_map = elements
            .keys()
            .map(|id| (id.clone(), NodeTemplateState::commissioned()))
            .collect();

        Self {
            composition_id: CompositionId::generate(),
            name: name.into(),
            version: version.into(),
            state: AcTypeState::Commissioned,
            state_change_result: StateChangeResult::NoError,
            revision: Revision::default(),
            elements,
            element_state_map,
            last_msg: Utc::now(),
        }
    }

    pub fn element(&self, id: &ConceptId) -> Option<&ElementDefinition> {
        self.elements.get(id)
    }

    /// Participant assigned to a node template during priming
    pub fn assigned_participant(&self, id: &ConceptId) -> Option<ParticipantId> {
        self.element_state_map.get(id).and_then(|s| s.participant_id)
    }

    /// Participants holding at least one node template of this definition
    pub fn participants(&self) -> BTreeSet<ParticipantId> {
        self.element_state_map
            .values()
            .filter_map(|s| s.participant_id)
            .collect()
    }

    /// True once every node template has reached `target`
    pub fn all_elements_in(&self, target: AcTypeState) -> bool {
        self.element_state_map.values().all(|s| s.state == target)
    }

    pub fn is_primed(&self) -> bool {
        self.state == AcTypeState::Primed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_definition_is_commissioned() {
        let def = CompositionDefinition::new(
            "demo",
            "1.0.0",
            [
                ElementDefinition::new(
                    ConceptId::new("http", "1.0.0"),
                    ConceptId::new("org.acm.Http", "1.0.0"),
                ),
                ElementDefinition::new(
                    ConceptId::new("k8s", "1.0.0"),
                    ConceptId::new("org.acm.K8s", "1.0.0"),
                )
                .with_property("startPhase", json!(1)),
            ],
        );

        assert_eq!(def.state, AcTypeState::Commissioned);
        assert_eq!(def.element_state_map.len(), 2);
        assert!(def.all_elements_in(AcTypeState::Commissioned));
        assert!(def.participants().is_empty());
        assert_eq!(
            def.element(&ConceptId::new("k8s", "1.0.0")).map(|e| e.start_phase()),
            Some(1)
        );
    }
}
