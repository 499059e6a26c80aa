//! Versioned stores for definitions and instances
//!
//! Every stored value carries a storage version. Writers read a
//! [`Versioned`] snapshot, mutate it, and hand it back with
//! [`DefinitionStore::replace`] / [`InstanceStore::replace`], which fail with
//! `VersionConflict` if anyone wrote in between.

use crate::error::Result;
use acm_types::{AutomationComposition, CompositionDefinition, CompositionId, InstanceId, ParticipantId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A stored value with its optimistic-lock version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

impl<T> Versioned<T> {
    pub fn into_inner(self) -> T {
        self.value
    }
}

/// Storage for composition definitions
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    /// Store a new definition at version 1
    async fn insert(&self, definition: CompositionDefinition) -> Result<Versioned<CompositionDefinition>>;

    /// Get a definition by ID
    async fn get(&self, id: CompositionId) -> Result<Option<Versioned<CompositionDefinition>>>;

    /// List all definitions
    async fn list(&self) -> Result<Vec<Versioned<CompositionDefinition>>>;

    /// Compare-and-swap write; returns the new version
    async fn replace(&self, definition: CompositionDefinition, expected_version: u64) -> Result<u64>;

    /// Compare-and-swap removal
    async fn remove(&self, id: CompositionId, expected_version: u64) -> Result<()>;
}

/// Storage for automation composition instances
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Store a new instance at version 1
    async fn insert(&self, instance: AutomationComposition) -> Result<Versioned<AutomationComposition>>;

    /// Get an instance by ID
    async fn get(&self, id: InstanceId) -> Result<Option<Versioned<AutomationComposition>>>;

    /// List all instances
    async fn list(&self) -> Result<Vec<Versioned<AutomationComposition>>>;

    /// List instances of a composition, including those migrating to it
    async fn list_for_composition(&self, id: CompositionId) -> Result<Vec<Versioned<AutomationComposition>>>;

    /// List instances with at least one element owned by `participant`
    async fn list_for_participant(&self, participant: ParticipantId) -> Result<Vec<Versioned<AutomationComposition>>>;

    /// Compare-and-swap write; returns the new version
    async fn replace(&self, instance: AutomationComposition, expected_version: u64) -> Result<u64>;

    /// Compare-and-swap removal
    async fn remove(&self, id: InstanceId, expected_version: u64) -> Result<()>;
}
