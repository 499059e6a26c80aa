//! Requests accepted by the supervision API

use crate::ids::{CompositionId, ConceptId, ElementId};
use crate::stage::Properties;
use serde::{Deserialize, Serialize};

/// One element of an instantiation or migration request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementRequest {
    pub id: ElementId,
    /// Node template the element instantiates
    pub definition: ConceptId,
    #[serde(default)]
    pub properties: Properties,
}

impl ElementRequest {
    pub fn new(definition: ConceptId) -> Self {
        Self {
            id: ElementId::generate(),
            definition,
            properties: Properties::new(),
        }
    }

    pub fn with_id(mut self, id: ElementId) -> Self {
        self.id = id;
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }
}

/// Create an instance of a primed composition definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRequest {
    pub name: String,
    pub version: String,
    pub composition_id: CompositionId,
    pub elements: Vec<ElementRequest>,
}

/// Move an instance to another composition definition.
///
/// Request elements with a known ID are kept, unknown IDs are added, and
/// instance elements missing from the request are removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRequest {
    pub composition_target_id: CompositionId,
    pub elements: Vec<ElementRequest>,
}
