//! Supervisor facade
//!
//! Wires the coordinators around one shared [`SupervisionContext`] and
//! exposes the operator API: definition lifecycle, instance operations,
//! message intake, the periodic sweep and the event stream.

use crate::bus::MessagePublisher;
use crate::config::SupervisionConfig;
use crate::context::SupervisionContext;
use crate::correlator::AckCorrelator;
use crate::error::Result;
use crate::handler::{Handled, MessageHandler};
use crate::migration::MigrationCoordinator;
use crate::phase::PhaseCoordinator;
use crate::prime::PrimeCoordinator;
use crate::resync::ResyncProtocol;
use crate::scanner::{ScanReport, SupervisionScanner};
use acm_registry::{
    DefinitionStore, InMemoryDefinitionStore, InMemoryInstanceStore,
    InMemoryParticipantRegistry, InstanceStore, ParticipantRegistry,
};
use acm_types::{
    AcmEventEnvelope, AutomationComposition, CompositionDefinition, CompositionId, ElementId,
    InstanceId, InstanceRequest, MigrationRequest, Participant, ParticipantId, ParticipantMessage,
    Properties, SyncSnapshot,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Automation composition supervision engine
pub struct Supervisor {
    ctx: Arc<SupervisionContext>,
    prime: PrimeCoordinator,
    phase: PhaseCoordinator,
    migration: MigrationCoordinator,
    resync: ResyncProtocol,
    handler: Arc<MessageHandler>,
    scanner: Arc<SupervisionScanner>,
}

impl Supervisor {
    pub fn new(
        definitions: Arc<dyn DefinitionStore>,
        instances: Arc<dyn InstanceStore>,
        participants: Arc<dyn ParticipantRegistry>,
        publisher: Arc<dyn MessagePublisher>,
        config: SupervisionConfig,
    ) -> Self {
        let ctx = Arc::new(SupervisionContext::new(
            definitions,
            instances,
            participants,
            publisher,
            config,
        ));
        let resync = ResyncProtocol::new(Arc::clone(&ctx));
        let prime = PrimeCoordinator::new(Arc::clone(&ctx), resync.clone());
        let correlator = AckCorrelator::new(Arc::clone(&ctx), resync.clone());

        Self {
            phase: PhaseCoordinator::new(Arc::clone(&ctx), resync.clone()),
            migration: MigrationCoordinator::new(Arc::clone(&ctx), resync.clone()),
            handler: Arc::new(MessageHandler::new(
                Arc::clone(&ctx),
                correlator,
                prime.clone(),
                resync.clone(),
            )),
            scanner: Arc::new(SupervisionScanner::new(Arc::clone(&ctx))),
            prime,
            resync,
            ctx,
        }
    }

    /// A supervisor over fresh in-memory stores and registry
    pub fn in_memory(publisher: Arc<dyn MessagePublisher>, config: SupervisionConfig) -> Self {
        Self::new(
            Arc::new(InMemoryDefinitionStore::new()),
            Arc::new(InMemoryInstanceStore::new()),
            Arc::new(InMemoryParticipantRegistry::new()),
            publisher,
            config,
        )
    }

    pub fn config(&self) -> &SupervisionConfig {
        &self.ctx.config
    }

    // ═══════════════════════════════════════════════════════════════════
    // Definitions
    // ═══════════════════════════════════════════════════════════════════

    pub async fn commission(&self, definition: CompositionDefinition) -> Result<CompositionDefinition> {
        self.prime.commission(definition).await
    }

    pub async fn decommission(&self, composition_id: CompositionId) -> Result<()> {
        self.prime.decommission(composition_id).await
    }

    pub async fn prime(&self, composition_id: CompositionId) -> Result<()> {
        self.prime.prime(composition_id).await
    }

    pub async fn deprime(&self, composition_id: CompositionId) -> Result<()> {
        self.prime.deprime(composition_id).await
    }

    pub async fn get_definition(&self, composition_id: CompositionId) -> Result<CompositionDefinition> {
        Ok(self.ctx.load_definition(composition_id).await?.value)
    }

    // ═══════════════════════════════════════════════════════════════════
    // Instances
    // ═══════════════════════════════════════════════════════════════════

    pub async fn instantiate(&self, request: InstanceRequest) -> Result<AutomationComposition> {
        self.phase.instantiate(request).await
    }

    pub async fn deploy(&self, instance_id: InstanceId) -> Result<()> {
        self.phase.deploy(instance_id).await
    }

    pub async fn undeploy(&self, instance_id: InstanceId) -> Result<()> {
        self.phase.undeploy(instance_id).await
    }

    pub async fn lock(&self, instance_id: InstanceId) -> Result<()> {
        self.phase.lock(instance_id).await
    }

    pub async fn unlock(&self, instance_id: InstanceId) -> Result<()> {
        self.phase.unlock(instance_id).await
    }

    pub async fn delete(&self, instance_id: InstanceId) -> Result<()> {
        self.phase.delete(instance_id).await
    }

    pub async fn update(
        &self,
        instance_id: InstanceId,
        properties: BTreeMap<ElementId, Properties>,
    ) -> Result<()> {
        self.phase.update(instance_id, properties).await
    }

    pub async fn migrate(&self, instance_id: InstanceId, request: MigrationRequest) -> Result<()> {
        self.migration.migrate(instance_id, request).await
    }

    pub async fn migrate_precheck(
        &self,
        instance_id: InstanceId,
        request: MigrationRequest,
    ) -> Result<()> {
        self.migration.migrate_precheck(instance_id, request).await
    }

    pub async fn rollback(&self, instance_id: InstanceId) -> Result<()> {
        self.migration.rollback(instance_id).await
    }

    pub async fn prepare(&self, instance_id: InstanceId) -> Result<()> {
        self.migration.prepare(instance_id).await
    }

    pub async fn review(&self, instance_id: InstanceId) -> Result<()> {
        self.migration.review(instance_id).await
    }

    pub async fn get_instance(&self, instance_id: InstanceId) -> Result<AutomationComposition> {
        Ok(self.ctx.load_instance(instance_id).await?.value)
    }

    /// Get an instance if it still exists
    pub async fn find_instance(&self, instance_id: InstanceId) -> Result<Option<AutomationComposition>> {
        Ok(self
            .ctx
            .instances
            .get(instance_id)
            .await?
            .map(|v| v.value))
    }

    // ═══════════════════════════════════════════════════════════════════
    // Participants
    // ═══════════════════════════════════════════════════════════════════

    pub async fn get_participant(&self, participant_id: ParticipantId) -> Result<Option<Participant>> {
        Ok(self.ctx.participants.get(participant_id).await?)
    }

    /// Snapshot a participant would receive on restart
    pub async fn snapshot_for(&self, participant_id: ParticipantId) -> Result<SyncSnapshot> {
        self.resync.snapshot_for(participant_id).await
    }

    // ═══════════════════════════════════════════════════════════════════
    // Runtime
    // ═══════════════════════════════════════════════════════════════════

    /// Handle one inbound message inline
    pub async fn handle_message(&self, message: ParticipantMessage) -> Result<Handled> {
        self.handler.handle(message).await
    }

    /// Run one supervision sweep as of `now`
    pub async fn scan(&self, now: DateTime<Utc>) -> Result<ScanReport> {
        self.scanner.scan_at(now).await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<AcmEventEnvelope> {
        self.ctx.events.subscribe()
    }

    /// Spawn the message consumer and the periodic scanner
    pub fn start(
        &self,
        inbound: broadcast::Receiver<ParticipantMessage>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Arc::clone(&self.handler).run(inbound, shutdown.clone())),
            tokio::spawn(Arc::clone(&self.scanner).run(shutdown)),
        ]
    }
}
