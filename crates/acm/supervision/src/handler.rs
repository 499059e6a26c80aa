//! Inbound message dispatch
//!
//! One handler per [`MessageBody`] variant. The consumer loop spawns a task
//! per message, so a slow handler never holds up the rest of the stream;
//! ordering between messages is not relied upon anywhere.

use crate::context::SupervisionContext;
use crate::correlator::{AckCorrelator, AckOutcome, InstanceAck};
use crate::error::Result;
use crate::prime::{PrimeAck, PrimeCoordinator};
use crate::resync::ResyncProtocol;
use acm_registry::{Heartbeat, Registration};
use acm_types::messages::InstanceReport;
use acm_types::{
    AcmEvent, EventSource, MessageBody, ParticipantId, ParticipantMessage, ReplicaId,
    SupportedElementType, Topic,
};
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

/// What handling a message amounted to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// An instance ack, with its correlation outcome
    Ack(AckOutcome),
    /// A prime ack; true if it changed the definition
    PrimeAck(bool),
    /// Registry or resync bookkeeping
    Processed,
    /// Outbound message seen on the inbound side
    Ignored,
}

/// Dispatches participant messages to the supervision components
#[derive(Clone)]
pub struct MessageHandler {
    ctx: Arc<SupervisionContext>,
    correlator: AckCorrelator,
    prime: PrimeCoordinator,
    resync: ResyncProtocol,
}

impl MessageHandler {
    pub fn new(
        ctx: Arc<SupervisionContext>,
        correlator: AckCorrelator,
        prime: PrimeCoordinator,
        resync: ResyncProtocol,
    ) -> Self {
        Self {
            ctx,
            correlator,
            prime,
            resync,
        }
    }

    /// Handle one inbound message
    pub async fn handle(&self, message: ParticipantMessage) -> Result<Handled> {
        debug!(message_id = %message.message_id, kind = message.body.kind(), "Handling message");

        match message.body {
            MessageBody::ParticipantRegister {
                participant_id,
                replica_id,
                supported_element_types,
            } => {
                self.on_register(participant_id, replica_id, supported_element_types)
                    .await
            }
            MessageBody::ParticipantDeregister {
                participant_id,
                replica_id,
            } => self.on_deregister(participant_id, replica_id).await,
            MessageBody::ParticipantStatus {
                participant_id,
                replica_id,
                supported_element_types,
                instance_reports,
                ..
            } => {
                self.on_status(
                    participant_id,
                    replica_id,
                    supported_element_types,
                    instance_reports,
                )
                .await
            }
            ref body @ MessageBody::ParticipantPrimeAck { .. } => match PrimeAck::from_message(body) {
                Some(ack) => Ok(Handled::PrimeAck(self.prime.on_prime_ack(ack).await?)),
                None => Ok(Handled::Ignored),
            },
            ref body @ MessageBody::AutomationCompositionDeployAck { .. } => {
                match InstanceAck::from_message(body) {
                    Some(ack) => Ok(Handled::Ack(self.correlator.on_instance_ack(ack).await?)),
                    None => Ok(Handled::Ignored),
                }
            }
            MessageBody::ParticipantReqSync {
                participant_id,
                replica_id,
                ..
            } => {
                self.resync.sync_replica(participant_id, replica_id).await?;
                Ok(Handled::Processed)
            }
            other => {
                debug!(kind = other.kind(), "Ignoring outbound message");
                Ok(Handled::Ignored)
            }
        }
    }

    async fn on_register(
        &self,
        participant_id: ParticipantId,
        replica_id: ReplicaId,
        supported: Vec<SupportedElementType>,
    ) -> Result<Handled> {
        let registration = self
            .ctx
            .participants
            .register(participant_id, replica_id, supported, Utc::now())
            .await?;
        info!(%participant_id, %replica_id, ?registration, "Participant registered");

        self.ctx
            .publish(
                Topic::Participant,
                MessageBody::ParticipantRegisterAck {
                    participant_id,
                    replica_id,
                    message: None,
                },
            )
            .await?;
        self.ctx.emit(
            EventSource::Participant,
            AcmEvent::ParticipantRegistered {
                participant_id,
                replica_id,
            },
        );

        match registration {
            Registration::Rejoined => self.resync.restart(participant_id, replica_id).await?,
            Registration::NewParticipant | Registration::NewReplica => {
                self.resync.sync_replica(participant_id, replica_id).await?
            }
        }
        Ok(Handled::Processed)
    }

    async fn on_deregister(
        &self,
        participant_id: ParticipantId,
        replica_id: ReplicaId,
    ) -> Result<Handled> {
        let gone = self
            .ctx
            .participants
            .deregister(participant_id, replica_id)
            .await?;
        info!(%participant_id, %replica_id, last_replica = gone, "Participant deregistered");

        self.ctx
            .publish(
                Topic::Participant,
                MessageBody::ParticipantDeregisterAck {
                    participant_id,
                    replica_id,
                },
            )
            .await?;
        self.ctx.emit(
            EventSource::Participant,
            AcmEvent::ParticipantDeregistered {
                participant_id,
                replica_id,
            },
        );
        Ok(Handled::Processed)
    }

    async fn on_status(
        &self,
        participant_id: ParticipantId,
        replica_id: ReplicaId,
        supported: Vec<SupportedElementType>,
        reports: Vec<InstanceReport>,
    ) -> Result<Handled> {
        let now = Utc::now();
        match self
            .ctx
            .participants
            .heartbeat(participant_id, replica_id, now)
            .await?
        {
            Heartbeat::Alive => self.resync.clear_restarting(participant_id).await?,
            Heartbeat::Recovered => {
                info!(%participant_id, %replica_id, "Replica back on line");
                self.resync.restart(participant_id, replica_id).await?;
            }
            Heartbeat::Unknown => {
                info!(%participant_id, %replica_id, "Status from unregistered replica");
                self.ctx
                    .participants
                    .register(participant_id, replica_id, supported, now)
                    .await?;
                self.resync.restart(participant_id, replica_id).await?;
            }
        }

        for report in reports {
            self.apply_report(participant_id, report).await?;
        }
        Ok(Handled::Processed)
    }

    /// Copy participant-reported runtime data onto owned elements
    async fn apply_report(&self, participant_id: ParticipantId, report: InstanceReport) -> Result<()> {
        if self.ctx.instances.get(report.instance_id).await?.is_none() {
            debug!(instance_id = %report.instance_id, "Status for unknown instance");
            return Ok(());
        }

        self.ctx
            .update_instance(report.instance_id, |ac| {
                let mut changed = false;
                for element_report in &report.elements {
                    let Some(element) = ac.elements.get_mut(&element_report.id) else {
                        continue;
                    };
                    if element.participant_id != participant_id || element.is_deleted() {
                        continue;
                    }
                    let before = element.clone();
                    element.operational_state = element_report.operational_state.clone();
                    element.use_state = element_report.use_state.clone();
                    element.out_properties = element_report.out_properties.clone();
                    changed |= *element != before;
                }
                Ok(changed.then_some(()))
            })
            .await?;
        Ok(())
    }

    /// Consume inbound messages until `shutdown` flips to true or the bus
    /// closes, then wait for in-flight handlers
    pub async fn run(
        self: Arc<Self>,
        mut inbound: broadcast::Receiver<ParticipantMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut in_flight = FuturesUnordered::new();
        info!("Message handler started");

        loop {
            tokio::select! {
                received = inbound.recv() => match received {
                    Ok(message) if message.body.is_inbound() => {
                        let handler = Arc::clone(&self);
                        in_flight.push(tokio::spawn(async move {
                            let kind = message.body.kind();
                            if let Err(e) = handler.handle(message).await {
                                error!(kind, error = %e, "Failed to handle message");
                            }
                        }));
                    }
                    Ok(message) => {
                        debug!(kind = message.body.kind(), "Skipping outbound message");
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(lagged = n, "Message handler lagged behind the bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Inbound topic closed");
                        break;
                    }
                },
                Some(joined) = in_flight.next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Message handler task panicked");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        while let Some(joined) = in_flight.next().await {
            if let Err(e) = joined {
                error!(error = %e, "Message handler task panicked");
            }
        }
        info!("Message handler stopped");
    }
}
