//! Definition and instance lifecycle end to end

mod common;

use acm_supervision::sim::{SimBehavior, SimOutcome};
use acm_supervision::SupervisionError;
use acm_types::{
    AcTypeState, AcmEvent, CompositionDefinition, CompositionId, ConceptId, DeployState,
    ElementRequest, InstanceRequest, LockState, MessageBody, Operation, PrimeOrder, Properties,
    StateChangeResult,
};
use common::{http_type, k8s_type, sim, template, Harness};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

#[tokio::test]
async fn test_full_lifecycle() {
    let h = Harness::new();
    let http = sim(&[http_type()]);
    h.register(&http).await;
    let mut events = h.supervisor.subscribe_events();

    let definition = h.primed(&[&http], vec![template("web", http_type())]).await;
    assert_eq!(definition.participants().len(), 1);
    assert!(definition.participants().contains(&http.participant_id));

    let ac = h.instance_of(&definition).await;
    assert_eq!(ac.deploy_state, DeployState::Undeployed);
    h.outbound().await;

    h.supervisor.deploy(ac.instance_id).await.unwrap();
    let sent = h.outbound().await;
    assert!(matches!(
        sent[0].body,
        MessageBody::AutomationCompositionDeploy { first_start_phase: true, .. }
    ));
    h.deliver(sent.iter().flat_map(|m| http.respond(m))).await;

    let deployed = h.instance(&ac).await;
    assert_eq!(deployed.deploy_state, DeployState::Deployed);
    assert_eq!(deployed.lock_state, LockState::Locked);
    assert!(deployed
        .elements
        .values()
        .all(|e| e.deploy_state == DeployState::Deployed && e.lock_state == LockState::Locked));

    h.supervisor.unlock(ac.instance_id).await.unwrap();
    h.settle(&[&http]).await;
    assert_eq!(h.instance(&ac).await.lock_state, LockState::Unlocked);

    h.supervisor.lock(ac.instance_id).await.unwrap();
    h.settle(&[&http]).await;
    assert_eq!(h.instance(&ac).await.lock_state, LockState::Locked);

    let element_id = *deployed.elements.keys().next().unwrap();
    let mut changes = Properties::new();
    changes.insert("url".into(), json!("http://example.org"));
    h.supervisor
        .update(ac.instance_id, BTreeMap::from([(element_id, changes)]))
        .await
        .unwrap();
    h.settle(&[&http]).await;
    let updated = h.instance(&ac).await;
    assert_eq!(updated.deploy_state, DeployState::Deployed);
    assert_eq!(updated.elements[&element_id].properties["url"], json!("http://example.org"));

    h.supervisor.undeploy(ac.instance_id).await.unwrap();
    h.settle(&[&http]).await;
    let undeployed = h.instance(&ac).await;
    assert_eq!(undeployed.deploy_state, DeployState::Undeployed);
    assert_eq!(undeployed.lock_state, LockState::None);

    h.supervisor.delete(ac.instance_id).await.unwrap();
    h.settle(&[&http]).await;
    assert!(h.supervisor.find_instance(ac.instance_id).await.unwrap().is_none());

    h.supervisor.deprime(definition.composition_id).await.unwrap();
    h.settle(&[&http]).await;
    let deprimed = h.supervisor.get_definition(definition.composition_id).await.unwrap();
    assert_eq!(deprimed.state, AcTypeState::Commissioned);
    assert!(deprimed.participants().is_empty());

    h.supervisor.decommission(definition.composition_id).await.unwrap();
    assert!(matches!(
        h.supervisor.get_definition(definition.composition_id).await,
        Err(SupervisionError::DefinitionNotFound(_))
    ));

    let mut completed = Vec::new();
    while let Ok(envelope) = events.try_recv() {
        if let AcmEvent::OperationCompleted { operation, .. } = envelope.event {
            completed.push(operation);
        }
    }
    assert_eq!(
        completed,
        vec![
            Operation::Deploy,
            Operation::Unlock,
            Operation::Lock,
            Operation::Update,
            Operation::Undeploy,
            Operation::Delete,
        ]
    );
}

#[tokio::test]
async fn test_rejected_transition_sends_nothing() {
    let h = Harness::new();
    let http = sim(&[http_type()]);
    h.register(&http).await;
    let definition = h.primed(&[&http], vec![template("web", http_type())]).await;
    let ac = h.instance_of(&definition).await;
    h.outbound().await;

    let err = h.supervisor.lock(ac.instance_id).await.unwrap_err();
    assert!(matches!(err, SupervisionError::InvalidTransition(_)));
    assert!(h.outbound().await.is_empty());
    let unchanged = h.instance(&ac).await;
    assert_eq!(unchanged.revision, ac.revision);
    assert_eq!(unchanged.deploy_state, DeployState::Undeployed);
    assert_eq!(unchanged.lock_state, LockState::None);
}

#[tokio::test]
async fn test_prime_with_unsupported_type_fails() {
    let h = Harness::new();
    let http = sim(&[http_type()]);
    h.register(&http).await;
    let mut events = h.supervisor.subscribe_events();

    let definition = h
        .supervisor
        .commission(CompositionDefinition::new(
            "demo",
            "1.0.0",
            [template("web", http_type()), template("cluster", k8s_type())],
        ))
        .await
        .unwrap();

    let err = h.supervisor.prime(definition.composition_id).await.unwrap_err();
    match err {
        SupervisionError::Unassignable { types, .. } => assert_eq!(types, vec![k8s_type()]),
        other => panic!("unexpected error {other}"),
    }
    assert!(h.outbound().await.is_empty());

    let stored = h.supervisor.get_definition(definition.composition_id).await.unwrap();
    assert_eq!(stored.state, AcTypeState::Commissioned);
    assert_eq!(stored.state_change_result, StateChangeResult::Failed);
    assert!(stored.participants().is_empty());

    let failed = std::iter::from_fn(|| events.try_recv().ok())
        .any(|e| matches!(e.event, AcmEvent::PrimeFailed { .. }));
    assert!(failed);
}

#[tokio::test]
async fn test_instantiate_requires_primed_definition() {
    let h = Harness::new();
    let definition = h
        .supervisor
        .commission(CompositionDefinition::new("demo", "1.0.0", [template("web", http_type())]))
        .await
        .unwrap();

    let err = h
        .supervisor
        .instantiate(InstanceRequest {
            name: "early".into(),
            version: "1.0.0".into(),
            composition_id: definition.composition_id,
            elements: vec![ElementRequest::new(ConceptId::new("web", "1.0.0"))],
        })
        .await;
    assert!(matches!(
        err,
        Err(SupervisionError::InvalidDefinitionState {
            state: AcTypeState::Commissioned,
            ..
        })
    ));
    assert!(matches!(
        h.supervisor.prime(CompositionId::generate()).await,
        Err(SupervisionError::DefinitionNotFound(_))
    ));
}

struct RefusePrime;

impl SimBehavior for RefusePrime {
    fn prime(&self, _composition_id: CompositionId, order: PrimeOrder) -> SimOutcome {
        match order {
            PrimeOrder::Prime => SimOutcome::Fail("no capacity".into()),
            PrimeOrder::Deprime => SimOutcome::Succeed,
        }
    }
}

#[tokio::test]
async fn test_failed_prime_can_be_retried() {
    let h = Harness::new();
    let http = sim(&[http_type()]).with_behavior(Arc::new(RefusePrime));
    h.register(&http).await;

    let definition = h
        .supervisor
        .commission(CompositionDefinition::new("demo", "1.0.0", [template("web", http_type())]))
        .await
        .unwrap();
    h.supervisor.prime(definition.composition_id).await.unwrap();
    h.settle(&[&http]).await;

    let stored = h.supervisor.get_definition(definition.composition_id).await.unwrap();
    assert_eq!(stored.state, AcTypeState::Priming);
    assert_eq!(stored.state_change_result, StateChangeResult::Failed);

    // Re-priming keeps the assignment and starts a new revision
    h.supervisor.prime(definition.composition_id).await.unwrap();
    let retried = h.supervisor.get_definition(definition.composition_id).await.unwrap();
    assert_eq!(retried.state_change_result, StateChangeResult::NoError);
    assert!(retried.revision > stored.revision);
    assert!(retried.participants().contains(&http.participant_id));
}

#[tokio::test]
async fn test_deprime_refused_while_instances_exist() {
    let h = Harness::new();
    let http = sim(&[http_type()]);
    h.register(&http).await;
    let definition = h.primed(&[&http], vec![template("web", http_type())]).await;
    h.instance_of(&definition).await;

    assert!(matches!(
        h.supervisor.deprime(definition.composition_id).await,
        Err(SupervisionError::InvalidRequest(_))
    ));
    assert!(matches!(
        h.supervisor.decommission(definition.composition_id).await,
        Err(SupervisionError::InvalidDefinitionState { .. })
    ));
}
