//! Demo composition driven over simulated participants

use crate::error::{RuntimeError, RuntimeResult};
use acm_supervision::Supervisor;
use acm_types::{
    AcTypeState, AcmEvent, AcmEventEnvelope, CompositionDefinition, ConceptId, ElementDefinition,
    ElementRequest, InstanceRequest, Operation,
};
use serde_json::json;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

const STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Commission, prime, instantiate and deploy one element per type, each
/// type in its own start phase
pub async fn run(supervisor: &Supervisor, types: Vec<ConceptId>) -> RuntimeResult<()> {
    let mut events = supervisor.subscribe_events();

    let templates = types.into_iter().enumerate().map(|(phase, type_id)| {
        ElementDefinition::new(ConceptId::new(format!("demo.element{phase}"), "1.0.0"), type_id)
            .with_property("startPhase", json!(phase))
    });
    let definition = supervisor
        .commission(CompositionDefinition::new("acm-demo", "1.0.0", templates))
        .await?;
    let composition_id = definition.composition_id;

    supervisor.prime(composition_id).await?;
    wait_for(&mut events, "prime", |event| match event {
        AcmEvent::PrimeCompleted {
            composition_id: id,
            state: AcTypeState::Primed,
        } if *id == composition_id => Some(Ok(())),
        AcmEvent::PrimeFailed {
            composition_id: id,
            reason,
        } if *id == composition_id => Some(Err(reason.clone())),
        _ => None,
    })
    .await?;

    let ac = supervisor
        .instantiate(InstanceRequest {
            name: "acm-demo-instance".into(),
            version: "1.0.0".into(),
            composition_id,
            elements: definition
                .elements
                .keys()
                .map(|id| ElementRequest::new(id.clone()))
                .collect(),
        })
        .await?;
    let instance_id = ac.instance_id;

    supervisor.deploy(instance_id).await?;
    wait_for(&mut events, "deploy", |event| match event {
        AcmEvent::OperationCompleted {
            instance_id: id,
            operation: Operation::Deploy,
        } if *id == instance_id => Some(Ok(())),
        AcmEvent::OperationFailed { instance_id: id, .. }
        | AcmEvent::InstanceTimedOut {
            instance_id: id,
            operation: Some(_),
        } if *id == instance_id => Some(Err(reason_or_timeout(event))),
        _ => None,
    })
    .await?;

    let deployed = supervisor.get_instance(instance_id).await?;
    info!(
        %instance_id,
        deploy_state = %deployed.deploy_state,
        lock_state = %deployed.lock_state,
        elements = deployed.elements.len(),
        "Demo composition deployed"
    );
    Ok(())
}

fn reason_or_timeout(event: &AcmEvent) -> String {
    match event {
        AcmEvent::OperationFailed { reason, .. } => reason.clone(),
        _ => "timed out".into(),
    }
}

/// Wait for the first event `check` decides on
async fn wait_for<F>(
    events: &mut broadcast::Receiver<AcmEventEnvelope>,
    step: &str,
    check: F,
) -> RuntimeResult<()>
where
    F: Fn(&AcmEvent) -> Option<Result<(), String>>,
{
    let outcome = tokio::time::timeout(STEP_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(envelope) => {
                    if let Some(outcome) = check(&envelope.event) {
                        return outcome;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err("event stream closed".to_string())
                }
            }
        }
    })
    .await
    .map_err(|_| RuntimeError::Demo(format!("{step} did not finish in time")))?;

    outcome.map_err(|reason| RuntimeError::Demo(format!("{step} failed: {reason}")))
}
