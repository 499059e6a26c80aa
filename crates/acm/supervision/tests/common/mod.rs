//! Shared fixtures: a recording bus, a supervisor, and simulated
//! participants pumped by hand so every test controls delivery order.

#![allow(dead_code)]

use acm_supervision::sim::SimParticipant;
use acm_supervision::{Handled, InMemoryBus, SupervisionConfig, Supervisor};
use acm_types::{
    AcTypeState, AutomationComposition, CompositionDefinition, ConceptId, DeployState,
    ElementDefinition, ElementRequest, InstanceRequest, LockState, ParticipantMessage,
    SupportedElementType, Topic,
};
use serde_json::json;
use std::sync::Arc;

pub fn http_type() -> ConceptId {
    ConceptId::new("org.acm.Http", "1.0.0")
}

pub fn k8s_type() -> ConceptId {
    ConceptId::new("org.acm.K8s", "1.0.0")
}

pub fn sim(types: &[ConceptId]) -> SimParticipant {
    SimParticipant::new(
        types
            .iter()
            .map(|t| SupportedElementType {
                type_id: t.clone(),
                participant_type: "test".into(),
            })
            .collect(),
    )
}

pub fn template(name: &str, type_id: ConceptId) -> ElementDefinition {
    ElementDefinition::new(ConceptId::new(name, "1.0.0"), type_id)
}

pub fn phased(name: &str, type_id: ConceptId, phase: i32) -> ElementDefinition {
    template(name, type_id).with_property("startPhase", json!(phase))
}

pub fn staged(name: &str, type_id: ConceptId, stages: &[i32]) -> ElementDefinition {
    template(name, type_id).with_property("stage", json!(stages))
}

pub struct Harness {
    pub bus: Arc<InMemoryBus>,
    pub supervisor: Supervisor,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SupervisionConfig::default())
    }

    pub fn with_config(config: SupervisionConfig) -> Self {
        let bus = Arc::new(InMemoryBus::recording(1024));
        let supervisor = Supervisor::in_memory(bus.clone(), config);
        Self { bus, supervisor }
    }

    /// Register a participant and discard the register ack and sync
    pub async fn register(&self, sim: &SimParticipant) {
        self.supervisor
            .handle_message(sim.register_message())
            .await
            .unwrap();
        self.outbound().await;
    }

    /// Everything the runtime published to participants since the last call
    pub async fn outbound(&self) -> Vec<ParticipantMessage> {
        let mut messages = self.bus.drain(Topic::Participant).await;
        messages.extend(self.bus.drain(Topic::Sync).await);
        messages
    }

    /// Replies of `sims` to everything published since the last call
    pub async fn replies(&self, sims: &[&SimParticipant]) -> Vec<ParticipantMessage> {
        self.outbound()
            .await
            .iter()
            .flat_map(|m| sims.iter().flat_map(move |s| s.respond(m)))
            .collect()
    }

    pub async fn deliver(&self, messages: impl IntoIterator<Item = ParticipantMessage>) -> Vec<Handled> {
        let mut handled = Vec::new();
        for message in messages {
            handled.push(self.supervisor.handle_message(message).await.unwrap());
        }
        handled
    }

    /// Exchange messages until the runtime has nothing more to say
    pub async fn settle(&self, sims: &[&SimParticipant]) {
        for _ in 0..100 {
            let replies = self.replies(sims).await;
            if replies.is_empty() {
                return;
            }
            self.deliver(replies).await;
        }
        panic!("message exchange did not settle");
    }

    /// Commission and prime a definition onto `sims`
    pub async fn primed(
        &self,
        sims: &[&SimParticipant],
        templates: Vec<ElementDefinition>,
    ) -> CompositionDefinition {
        let definition = self
            .supervisor
            .commission(CompositionDefinition::new("demo", "1.0.0", templates))
            .await
            .unwrap();
        self.supervisor
            .prime(definition.composition_id)
            .await
            .unwrap();
        self.settle(sims).await;

        let definition = self
            .supervisor
            .get_definition(definition.composition_id)
            .await
            .unwrap();
        assert_eq!(definition.state, AcTypeState::Primed);
        definition
    }

    /// Instance with one element per node template
    pub async fn instance_of(&self, definition: &CompositionDefinition) -> AutomationComposition {
        self.supervisor
            .instantiate(InstanceRequest {
                name: "demo-instance".into(),
                version: "1.0.0".into(),
                composition_id: definition.composition_id,
                elements: definition
                    .elements
                    .keys()
                    .map(|id| ElementRequest::new(id.clone()))
                    .collect(),
            })
            .await
            .unwrap()
    }

    /// Primed definition with a deployed instance
    pub async fn deployed(
        &self,
        sims: &[&SimParticipant],
        templates: Vec<ElementDefinition>,
    ) -> (CompositionDefinition, AutomationComposition) {
        let definition = self.primed(sims, templates).await;
        let ac = self.instance_of(&definition).await;
        self.outbound().await;

        self.supervisor.deploy(ac.instance_id).await.unwrap();
        self.settle(sims).await;

        let ac = self.supervisor.get_instance(ac.instance_id).await.unwrap();
        assert_eq!(ac.deploy_state, DeployState::Deployed);
        assert_eq!(ac.lock_state, LockState::Locked);
        (definition, ac)
    }

    pub async fn instance(&self, ac: &AutomationComposition) -> AutomationComposition {
        self.supervisor.get_instance(ac.instance_id).await.unwrap()
    }
}
