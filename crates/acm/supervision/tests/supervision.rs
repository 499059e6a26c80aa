//! Timeouts, participant liveness and resynchronisation

mod common;

use acm_supervision::{ScanReport, SupervisionConfig, SupervisionError};
use acm_types::{
    AcTypeState, AcmEvent, CompositionDefinition, DeployState, LockState, MessageBody,
    Operation, ParticipantState, StateChangeResult,
};
use chrono::{Duration, Utc};
use common::{http_type, k8s_type, phased, sim, template, Harness};

fn quick_timeouts() -> SupervisionConfig {
    SupervisionConfig {
        max_operation_wait_ms: 100,
        max_status_wait_ms: 1_000,
        ..SupervisionConfig::default()
    }
}

#[tokio::test]
async fn test_stuck_operation_times_out_once() {
    let h = Harness::with_config(quick_timeouts());
    let http = sim(&[http_type()]);
    h.register(&http).await;
    let definition = h.primed(&[&http], vec![template("web", http_type())]).await;
    let ac = h.instance_of(&definition).await;
    let mut events = h.supervisor.subscribe_events();

    h.supervisor.deploy(ac.instance_id).await.unwrap();
    // The participant never answers
    h.outbound().await;
    let dispatched = Utc::now();

    assert_eq!(h.supervisor.scan(dispatched).await.unwrap().instances_timed_out, 0);

    let later = dispatched + Duration::milliseconds(150);
    let report = h.supervisor.scan(later).await.unwrap();
    assert_eq!(report.instances_timed_out, 1);
    assert_eq!(report.definitions_timed_out, 0);

    let timed_out = h.instance(&ac).await;
    assert_eq!(timed_out.deploy_state, DeployState::Deploying);
    assert_eq!(timed_out.state_change_result, StateChangeResult::Failed);

    let again = h.supervisor.scan(later + Duration::milliseconds(150)).await.unwrap();
    assert_eq!(again.instances_timed_out, 0);

    let flagged = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| {
            matches!(
                e.event,
                AcmEvent::InstanceTimedOut {
                    operation: Some(Operation::Deploy),
                    ..
                }
            )
        })
        .count();
    assert_eq!(flagged, 1);
    assert!(h.outbound().await.is_empty());
}

#[tokio::test]
async fn test_unanswered_prime_times_out() {
    let h = Harness::with_config(quick_timeouts());
    let http = sim(&[http_type()]);
    h.register(&http).await;
    let definition = h
        .supervisor
        .commission(CompositionDefinition::new("demo", "1.0.0", [template("web", http_type())]))
        .await
        .unwrap();
    h.supervisor.prime(definition.composition_id).await.unwrap();
    h.outbound().await;

    let report = h
        .supervisor
        .scan(Utc::now() + Duration::milliseconds(150))
        .await
        .unwrap();
    assert_eq!(report.definitions_timed_out, 1);

    let stored = h.supervisor.get_definition(definition.composition_id).await.unwrap();
    assert_eq!(stored.state, AcTypeState::Priming);
    assert_eq!(stored.state_change_result, StateChangeResult::Failed);
}

#[tokio::test]
async fn test_silent_replica_goes_offline_and_recovers() {
    let h = Harness::with_config(quick_timeouts());
    let http = sim(&[http_type()]);
    h.register(&http).await;
    let (_, ac) = h.deployed(&[&http], vec![template("web", http_type())]).await;

    let report = h
        .supervisor
        .scan(Utc::now() + Duration::seconds(2))
        .await
        .unwrap();
    assert_eq!(
        report,
        ScanReport {
            replicas_offline: 1,
            ..ScanReport::default()
        }
    );
    let participant = h
        .supervisor
        .get_participant(http.participant_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(participant.participant_state, ParticipantState::OffLine);

    assert!(matches!(
        h.supervisor.undeploy(ac.instance_id).await,
        Err(SupervisionError::ParticipantOffline(id)) if id == http.participant_id
    ));
    assert!(h.outbound().await.is_empty());

    // The next status message brings it back with a restart snapshot
    h.deliver([http.status_message()]).await;
    let restart = h.outbound().await;
    assert_eq!(restart.len(), 1);
    assert!(matches!(
        restart[0].body,
        MessageBody::ParticipantRestart { replica_id, .. } if replica_id == http.replica_id
    ));
    assert!(h.instance(&ac).await.restarting);

    h.deliver(http.respond(&restart[0])).await;
    assert!(!h.instance(&ac).await.restarting);
    h.supervisor.undeploy(ac.instance_id).await.unwrap();
}

#[tokio::test]
async fn test_restart_snapshot_matches_owned_elements() {
    let h = Harness::new();
    let http = sim(&[http_type()]);
    let k8s = sim(&[k8s_type()]);
    h.register(&http).await;
    h.register(&k8s).await;
    let (definition, ac) = h
        .deployed(
            &[&http, &k8s],
            vec![template("web", http_type()), template("cluster", k8s_type())],
        )
        .await;

    // Registering the same replica again is a rejoin
    h.deliver([http.register_message()]).await;
    let sent = h.outbound().await;
    assert!(sent
        .iter()
        .any(|m| matches!(m.body, MessageBody::ParticipantRegisterAck { .. })));
    let replies: Vec<_> = sent
        .iter()
        .flat_map(|m| [&http, &k8s].into_iter().flat_map(move |s| s.respond(m)))
        .collect();
    assert_eq!(replies.len(), 1);

    let snapshot = http.last_snapshot().unwrap();
    assert!(k8s.last_snapshot().is_none());
    assert_eq!(snapshot, h.supervisor.snapshot_for(http.participant_id).await.unwrap());

    assert_eq!(snapshot.definitions.len(), 1);
    let assigned = &snapshot.definitions[0];
    assert_eq!(assigned.composition_id, definition.composition_id);
    assert_eq!(assigned.element_definitions.len(), 1);
    assert_eq!(assigned.element_definitions[0].definition.id.name, "web");
    assert_eq!(assigned.element_definitions[0].state, AcTypeState::Primed);

    assert_eq!(snapshot.instances.len(), 1);
    let instance = &snapshot.instances[0];
    assert_eq!(instance.instance_id, ac.instance_id);
    assert_eq!(instance.revision, ac.revision);
    assert_eq!(instance.elements.len(), 1);
    let owned = &ac.elements[&instance.elements[0].id];
    assert_eq!(owned.participant_id, http.participant_id);
    assert_eq!(instance.elements[0].deploy_state, owned.deploy_state);
    assert_eq!(instance.elements[0].lock_state, LockState::Locked);

    assert!(h.instance(&ac).await.restarting);
    h.deliver(replies).await;
    assert!(!h.instance(&ac).await.restarting);
}

#[tokio::test]
async fn test_restart_mid_deploy_reports_each_element_as_stored() {
    let h = Harness::new();
    let http = sim(&[http_type()]);
    h.register(&http).await;
    let definition = h
        .primed(
            &[&http],
            vec![phased("db", http_type(), 0), phased("app", http_type(), 1)],
        )
        .await;
    let ac = h.instance_of(&definition).await;
    h.outbound().await;

    // Phase 0 completes, phase 1 is dispatched but never answered
    h.supervisor.deploy(ac.instance_id).await.unwrap();
    let first = h.outbound().await;
    h.deliver(http.respond(&first[0])).await;
    let second = h.outbound().await;
    assert_eq!(second.len(), 1);

    h.deliver([http.register_message()]).await;
    let replies: Vec<_> = h.outbound().await.iter().flat_map(|m| http.respond(m)).collect();
    let snapshot = http.last_snapshot().unwrap();
    let stored = h.instance(&ac).await;
    assert!(stored.restarting);
    assert_eq!(stored.deploy_state, DeployState::Deploying);

    assert_eq!(snapshot.instances.len(), 1);
    let instance = &snapshot.instances[0];
    assert_eq!(instance.deploy_state, DeployState::Deploying);
    assert_eq!(instance.elements.len(), 2);
    for element in &instance.elements {
        let runtime = &stored.elements[&element.id];
        assert_eq!(
            (element.deploy_state, element.lock_state),
            (runtime.deploy_state, runtime.lock_state)
        );
        let expected = if runtime.definition.name == "db" {
            DeployState::Deployed
        } else {
            DeployState::Deploying
        };
        assert_eq!(element.deploy_state, expected);
    }

    // The outstanding phase still completes after the rejoin
    h.deliver(replies).await;
    assert!(!h.instance(&ac).await.restarting);
    h.deliver(http.respond(&second[0])).await;
    assert_eq!(h.instance(&ac).await.deploy_state, DeployState::Deployed);
}

#[tokio::test]
async fn test_new_replica_is_synced_and_kept_current() {
    let h = Harness::new();
    let http = sim(&[http_type()]);
    h.register(&http).await;
    let (_, ac) = h.deployed(&[&http], vec![template("web", http_type())]).await;

    let mut standby = sim(&[http_type()]);
    standby.participant_id = http.participant_id;
    h.deliver([standby.register_message()]).await;
    for message in h.outbound().await {
        assert!(standby.respond(&message).is_empty());
    }
    let synced = standby.last_snapshot().unwrap();
    assert_eq!(synced.instances.len(), 1);
    assert_eq!(synced.instances[0].deploy_state, DeployState::Deployed);

    // Completed operations are pushed to every replica
    h.supervisor.undeploy(ac.instance_id).await.unwrap();
    let command = h.outbound().await;
    h.deliver(command.iter().flat_map(|m| http.respond(m))).await;

    let pushed = h.outbound().await;
    assert_eq!(pushed.len(), 1);
    match &pushed[0].body {
        MessageBody::ParticipantSync {
            replica_id,
            delete,
            snapshot,
            ..
        } => {
            assert_eq!(*replica_id, None);
            assert!(!delete);
            assert_eq!(snapshot.instances[0].deploy_state, DeployState::Undeployed);
        }
        other => panic!("unexpected {}", other.kind()),
    }
    standby.respond(&pushed[0]);
    assert_eq!(
        standby.last_snapshot().unwrap().instances[0].deploy_state,
        DeployState::Undeployed
    );
}
