//! Shared dependencies of every supervision component

use crate::bus::MessagePublisher;
use crate::config::SupervisionConfig;
use crate::error::{Result, SupervisionError};
use crate::events::EventEmitter;
use crate::plan::Definitions;
use acm_registry::{
    DefinitionStore, InstanceStore, ParticipantRegistry, RegistryError, Versioned,
};
use acm_types::{
    AcmEvent, AutomationComposition, CompositionDefinition, CompositionId, DeployState, EventSource,
    InstanceId, MessageBody, ParticipantId, ParticipantMessage, Topic,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Result of a successful read-modify-write
#[derive(Debug, Clone)]
pub(crate) struct Updated<V, T> {
    pub value: V,
    pub version: u64,
    pub output: T,
}

/// Stores, registry, bus and event stream shared by all components
pub struct SupervisionContext {
    pub definitions: Arc<dyn DefinitionStore>,
    pub instances: Arc<dyn InstanceStore>,
    pub participants: Arc<dyn ParticipantRegistry>,
    pub publisher: Arc<dyn MessagePublisher>,
    pub events: EventEmitter,
    pub config: SupervisionConfig,
}

impl SupervisionContext {
    pub fn new(
        definitions: Arc<dyn DefinitionStore>,
        instances: Arc<dyn InstanceStore>,
        participants: Arc<dyn ParticipantRegistry>,
        publisher: Arc<dyn MessagePublisher>,
        config: SupervisionConfig,
    ) -> Self {
        Self {
            definitions,
            instances,
            participants,
            publisher,
            events: EventEmitter::new(config.event_channel_capacity),
            config,
        }
    }

    pub(crate) async fn load_definition(
        &self,
        id: CompositionId,
    ) -> Result<Versioned<CompositionDefinition>> {
        self.definitions
            .get(id)
            .await?
            .ok_or(SupervisionError::DefinitionNotFound(id))
    }

    pub(crate) async fn load_instance(
        &self,
        id: InstanceId,
    ) -> Result<Versioned<AutomationComposition>> {
        self.instances
            .get(id)
            .await?
            .ok_or(SupervisionError::InstanceNotFound(id))
    }

    /// Definitions an instance's elements refer to
    pub(crate) async fn definitions_for(&self, ac: &AutomationComposition) -> Result<Definitions> {
        let current = self.load_definition(ac.composition_id).await?.value;
        let target = match ac.composition_target_id {
            Some(id) if id != ac.composition_id => Some(self.load_definition(id).await?.value),
            _ => None,
        };
        Ok(Definitions { current, target })
    }

    /// Read-modify-write an instance, retrying on version conflicts.
    ///
    /// The closure sees a fresh copy on every attempt and returns `None` to
    /// leave the stored instance untouched.
    pub(crate) async fn update_instance<T, F>(
        &self,
        id: InstanceId,
        mut mutate: F,
    ) -> Result<Option<Updated<AutomationComposition, T>>>
    where
        F: FnMut(&mut AutomationComposition) -> Result<Option<T>> + Send,
        T: Send,
    {
        for attempt in 0..self.config.max_update_retries {
            let current = self.load_instance(id).await?;
            let mut ac = current.value;
            let Some(output) = mutate(&mut ac)? else {
                return Ok(None);
            };
            match self.instances.replace(ac.clone(), current.version).await {
                Ok(version) => {
                    return Ok(Some(Updated {
                        value: ac,
                        version,
                        output,
                    }))
                }
                Err(RegistryError::VersionConflict { .. }) => {
                    debug!(instance_id = %id, attempt, "Instance changed underneath, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(SupervisionError::Contention {
            attempts: self.config.max_update_retries,
        })
    }

    /// Read-modify-write a definition, retrying on version conflicts
    pub(crate) async fn update_definition<T, F>(
        &self,
        id: CompositionId,
        mut mutate: F,
    ) -> Result<Option<Updated<CompositionDefinition, T>>>
    where
        F: FnMut(&mut CompositionDefinition) -> Result<Option<T>> + Send,
        T: Send,
    {
        for attempt in 0..self.config.max_update_retries {
            let current = self.load_definition(id).await?;
            let mut definition = current.value;
            let Some(output) = mutate(&mut definition)? else {
                return Ok(None);
            };
            match self
                .definitions
                .replace(definition.clone(), current.version)
                .await
            {
                Ok(version) => {
                    return Ok(Some(Updated {
                        value: definition,
                        version,
                        output,
                    }))
                }
                Err(RegistryError::VersionConflict { .. }) => {
                    debug!(composition_id = %id, attempt, "Definition changed underneath, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(SupervisionError::Contention {
            attempts: self.config.max_update_retries,
        })
    }

    /// Remove an instance that is still DELETED, retrying on version
    /// conflicts. Returns `false` when the instance is gone or no longer
    /// DELETED.
    pub(crate) async fn remove_deleted_instance(&self, id: InstanceId) -> Result<bool> {
        for attempt in 0..self.config.max_update_retries {
            let Some(current) = self.instances.get(id).await? else {
                return Ok(false);
            };
            if current.value.deploy_state != DeployState::Deleted {
                return Ok(false);
            }
            match self.instances.remove(id, current.version).await {
                Ok(()) => return Ok(true),
                Err(RegistryError::VersionConflict { .. }) => {
                    debug!(instance_id = %id, attempt, "Deleted instance changed underneath, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(SupervisionError::Contention {
            attempts: self.config.max_update_retries,
        })
    }

    /// Fail unless every participant is on line
    pub(crate) async fn verify_online(&self, ids: &BTreeSet<ParticipantId>) -> Result<()> {
        for id in ids {
            match self.participants.get(*id).await? {
                Some(p) if p.is_online() => {}
                _ => return Err(SupervisionError::ParticipantOffline(*id)),
            }
        }
        Ok(())
    }

    pub(crate) async fn publish(&self, topic: Topic, body: MessageBody) -> Result<()> {
        self.publisher
            .publish(topic, ParticipantMessage::new(body))
            .await?;
        Ok(())
    }

    pub(crate) fn emit(&self, source: EventSource, event: AcmEvent) {
        self.events.emit(source, event);
    }
}
