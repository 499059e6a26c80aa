//! Runtime wiring and lifecycle

use crate::config::RuntimeConfig;
use crate::demo;
use crate::error::RuntimeResult;
use acm_supervision::sim::SimParticipant;
use acm_supervision::{InMemoryBus, Supervisor};
use acm_types::{
    AcmEventEnvelope, ConceptId, EventSeverity, SupportedElementType, Topic,
};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// ACM runtime: one supervisor on an in-memory bus
pub struct Runtime {
    config: RuntimeConfig,
    bus: Arc<InMemoryBus>,
    supervisor: Arc<Supervisor>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        let bus = Arc::new(InMemoryBus::new(config.bus.capacity));
        let supervisor = Arc::new(Supervisor::in_memory(
            bus.clone(),
            config.supervision.clone(),
        ));
        Self {
            config,
            bus,
            supervisor,
        }
    }

    /// Run until Ctrl+C or SIGTERM, optionally attaching `simulate`
    /// simulated participants and driving a demo composition over them
    pub async fn run(self, simulate: usize) -> RuntimeResult<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut tasks = self
            .supervisor
            .start(self.bus.subscribe(Topic::Runtime), shutdown_rx.clone());
        tasks.push(tokio::spawn(log_events(
            self.supervisor.subscribe_events(),
            shutdown_rx,
        )));

        info!(
            scan_interval_ms = self.config.supervision.scan_interval_ms,
            max_operation_wait_ms = self.config.supervision.max_operation_wait_ms,
            "ACM runtime started"
        );

        let participants = self.attach_simulators(simulate, &mut tasks).await?;

        if !participants.is_empty() {
            let supervisor = Arc::clone(&self.supervisor);
            let types = participants
                .iter()
                .flat_map(|p| p.supported.iter().map(|s| s.type_id.clone()))
                .collect();
            tokio::spawn(async move {
                if let Err(e) = demo::run(&supervisor, types).await {
                    error!(error = %e, "Demo scenario failed");
                }
            });
        }

        shutdown_signal().await;
        info!("ACM runtime shutting down");

        let _ = shutdown_tx.send(true);
        for topic in [Topic::Participant, Topic::Sync, Topic::Runtime] {
            self.bus.close(topic);
        }
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Task ended abnormally");
            }
        }
        Ok(())
    }

    /// Start `count` simulated participants, one element type each, and
    /// register them before returning
    async fn attach_simulators(
        &self,
        count: usize,
        tasks: &mut Vec<JoinHandle<()>>,
    ) -> RuntimeResult<Vec<Arc<SimParticipant>>> {
        let mut participants = Vec::with_capacity(count);
        for i in 0..count {
            let participant = Arc::new(SimParticipant::new(vec![SupportedElementType {
                type_id: ConceptId::new(format!("org.acm.sim.Element{i}"), "1.0.0"),
                participant_type: "simulator".into(),
            }]));
            tasks.push(Arc::clone(&participant).spawn(self.bus.clone()));
            self.supervisor
                .handle_message(participant.register_message())
                .await?;
            info!(participant_id = %participant.participant_id, "Simulated participant attached");
            participants.push(participant);
        }
        Ok(participants)
    }
}

/// Log every supervision event at a level matching its severity
async fn log_events(
    mut events: broadcast::Receiver<AcmEventEnvelope>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(envelope) => match envelope.severity {
                    EventSeverity::Error => error!(source = ?envelope.source, event = ?envelope.event, "ACM event"),
                    EventSeverity::Warning => warn!(source = ?envelope.source, event = ?envelope.event, "ACM event"),
                    EventSeverity::Info => info!(source = ?envelope.source, event = ?envelope.event, "ACM event"),
                    EventSeverity::Debug => debug!(source = ?envelope.source, event = ?envelope.event, "ACM event"),
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(lagged = n, "Event log lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
