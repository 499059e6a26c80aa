//! Staged migration, precheck, rollback, prepare and review

mod common;

use acm_supervision::sim::{SimBehavior, SimCommand, SimOutcome, SimParticipant};
use acm_supervision::{AckOutcome, Handled, SupervisionError};
use acm_types::{
    AcElementDeploy, AutomationComposition, CompositionDefinition, DeployState, Element,
    ElementRequest, ElementState, MessageBody, MigrationRequest, ParticipantMessage, SubState,
};
use common::{http_type, staged, sim, template, Harness};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;

struct Fixture {
    h: Harness,
    http: SimParticipant,
    source: CompositionDefinition,
    target: CompositionDefinition,
    ac: AutomationComposition,
}

/// A deployed instance of `web` and `old`, and a primed target replacing
/// `old` with `new`. `web` migrates over stages 0 and 1.
async fn fixture(http: SimParticipant) -> Fixture {
    let h = Harness::new();
    h.register(&http).await;
    let (source, ac) = h
        .deployed(
            &[&http],
            vec![template("web", http_type()), template("old", http_type())],
        )
        .await;
    let target = h
        .primed(
            &[&http],
            vec![staged("web", http_type(), &[0, 1]), template("new", http_type())],
        )
        .await;
    Fixture {
        h,
        http,
        source,
        target,
        ac,
    }
}

fn named<'a>(ac: &'a AutomationComposition, name: &str) -> &'a Element {
    ac.elements
        .values()
        .find(|e| e.definition.name == name)
        .unwrap()
}

fn request(f: &Fixture) -> MigrationRequest {
    let web = named(&f.ac, "web");
    MigrationRequest {
        composition_target_id: f.target.composition_id,
        elements: vec![
            ElementRequest::new(web.definition.clone()).with_id(web.id),
            ElementRequest::new(f.target.elements.keys().find(|k| k.name == "new").unwrap().clone()),
        ],
    }
}

fn deploy_state_of(message: &ParticipantMessage) -> Option<DeployState> {
    match &message.body {
        MessageBody::AutomationCompositionDeployAck {
            element_results, ..
        } => element_results.values().next().and_then(|r| r.deploy_state),
        _ => None,
    }
}

fn acked_element(message: &ParticipantMessage) -> Option<acm_types::ElementId> {
    match &message.body {
        MessageBody::AutomationCompositionDeployAck {
            element_results, ..
        } => element_results.keys().next().copied(),
        _ => None,
    }
}

#[tokio::test]
async fn test_migration_walks_stages_and_adopts_target() {
    let f = fixture(sim(&[http_type()])).await;
    let h = &f.h;
    let web_id = named(&f.ac, "web").id;
    let old_id = named(&f.ac, "old").id;

    h.supervisor.migrate(f.ac.instance_id, request(&f)).await.unwrap();
    let migrating = h.instance(&f.ac).await;
    assert_eq!(migrating.deploy_state, DeployState::Migrating);
    assert_eq!(migrating.composition_target_id, Some(f.target.composition_id));
    let new_id = named(&migrating, "new").id;
    assert_eq!(migrating.elements[&web_id].migration_state, ElementState::Present);
    assert_eq!(migrating.elements[&old_id].migration_state, ElementState::Removed);
    assert_eq!(migrating.elements[&new_id].migration_state, ElementState::New);

    let command = h.outbound().await;
    assert_eq!(command.len(), 1);
    assert!(matches!(
        command[0].body,
        MessageBody::AutomationCompositionMigration {
            stage: 0,
            first_stage: true,
            precheck: false,
            rollback: false,
            ..
        }
    ));
    let acks = f.http.respond(&command[0]);
    let of = |id| -> Vec<ParticipantMessage> {
        acks.iter()
            .filter(|m| acked_element(m) == Some(id))
            .cloned()
            .collect()
    };

    // A stage ack moves the element to its next stage and nothing else
    let before = h.instance(&f.ac).await;
    assert_eq!(h.deliver(of(web_id)).await, vec![Handled::Ack(AckOutcome::Applied)]);
    let after = h.instance(&f.ac).await;
    let (mut web_before, web_after) = (before.elements[&web_id].clone(), &after.elements[&web_id]);
    assert_eq!(web_after.stage, Some(1));
    web_before.stage = Some(1);
    assert_eq!(&web_before, web_after);
    assert_eq!(after.deploy_state, DeployState::Migrating);

    // The removed element is undeployed then deleted; a late UNDEPLOYED is ignored
    let removed = of(old_id);
    assert_eq!(
        removed.iter().map(deploy_state_of).collect::<Vec<_>>(),
        vec![Some(DeployState::Undeployed), Some(DeployState::Deleted)]
    );
    let handled = h.deliver([removed[1].clone(), removed[0].clone()]).await;
    assert_eq!(
        handled,
        vec![
            Handled::Ack(AckOutcome::Applied),
            Handled::Ack(AckOutcome::Duplicate)
        ]
    );
    assert_eq!(h.instance(&f.ac).await.elements[&old_id].deploy_state, DeployState::Deleted);

    h.deliver(of(new_id)).await;
    assert_eq!(h.instance(&f.ac).await.elements[&new_id].deploy_state, DeployState::Deployed);

    // Stage 1 only concerns web
    let next = h.outbound().await;
    assert_eq!(next.len(), 1);
    assert!(matches!(
        next[0].body,
        MessageBody::AutomationCompositionMigration {
            stage: 1,
            first_stage: false,
            ..
        }
    ));
    h.deliver(f.http.respond(&next[0])).await;

    let migrated = h.instance(&f.ac).await;
    assert_eq!(migrated.deploy_state, DeployState::Deployed);
    assert_eq!(migrated.composition_id, f.target.composition_id);
    assert_eq!(migrated.composition_target_id, None);
    assert_eq!(
        migrated.elements.keys().copied().collect::<BTreeSet<_>>(),
        BTreeSet::from([web_id, new_id])
    );
    assert!(migrated
        .elements
        .values()
        .all(|e| e.migration_state == ElementState::Present && e.stage.is_none()));
    // A completed migration has nothing left to revert
    assert_eq!(migrated.rollback, None);
    assert!(matches!(
        h.supervisor.rollback(f.ac.instance_id).await,
        Err(SupervisionError::InvalidTransition(_))
    ));
}

#[tokio::test]
async fn test_element_with_later_stages_waits_for_its_last_stage() {
    let h = Harness::new();
    let http = sim(&[http_type()]);
    h.register(&http).await;
    let (_, ac) = h
        .deployed(
            &[&http],
            vec![
                template("web", http_type()),
                template("old", http_type()),
                template("late", http_type()),
            ],
        )
        .await;
    let target = h
        .primed(
            &[&http],
            vec![
                staged("web", http_type(), &[0, 1]),
                template("new", http_type()),
                staged("late", http_type(), &[1, 2]),
            ],
        )
        .await;
    let (web, late) = (named(&ac, "web"), named(&ac, "late"));
    let late_id = late.id;
    let request = MigrationRequest {
        composition_target_id: target.composition_id,
        elements: vec![
            ElementRequest::new(web.definition.clone()).with_id(web.id),
            ElementRequest::new(late.definition.clone()).with_id(late.id),
            ElementRequest::new(target.elements.keys().find(|k| k.name == "new").unwrap().clone()),
        ],
    };

    h.supervisor.migrate(ac.instance_id, request).await.unwrap();
    assert_eq!(h.instance(&ac).await.elements[&late_id].stage, Some(1));

    let mut dispatched = Vec::new();
    for _ in 0..3 {
        let command = h.outbound().await;
        assert_eq!(command.len(), 1);
        let stage = match command[0].body {
            MessageBody::AutomationCompositionMigration { stage, .. } => stage,
            ref other => panic!("unexpected {}", other.kind()),
        };
        dispatched.push(stage);
        // Stage acks move `late` along without touching its deploy state
        let before = h.instance(&ac).await;
        assert_eq!(before.elements[&late_id].deploy_state, DeployState::Migrating);
        assert_eq!(before.elements[&late_id].stage, Some(stage.max(1)));
        h.deliver(http.respond(&command[0])).await;
    }
    assert_eq!(dispatched, vec![0, 1, 2]);

    let migrated = h.instance(&ac).await;
    assert_eq!(migrated.deploy_state, DeployState::Deployed);
    assert_eq!(migrated.composition_id, target.composition_id);
    assert_eq!(migrated.elements[&late_id].deploy_state, DeployState::Deployed);
    assert_eq!(migrated.elements[&late_id].stage, None);
}

#[tokio::test]
async fn test_precheck_leaves_instance_unchanged() {
    let f = fixture(sim(&[http_type()])).await;
    let h = &f.h;

    h.supervisor
        .migrate_precheck(f.ac.instance_id, request(&f))
        .await
        .unwrap();
    let checking = h.instance(&f.ac).await;
    assert_eq!(checking.sub_state, SubState::MigrationPrechecking);
    assert!(checking.precheck);

    let command = h.outbound().await;
    assert_eq!(command.len(), 1);
    match &command[0].body {
        MessageBody::AutomationCompositionMigration { precheck, .. } => assert!(*precheck),
        other => panic!("unexpected {}", other.kind()),
    }
    // Participants see the classified list, including the element still to be created
    assert_eq!(command[0].body.elements_for(f.http.participant_id).len(), 3);

    h.deliver(f.http.respond(&command[0])).await;
    let checked = h.instance(&f.ac).await;
    assert_eq!(checked.sub_state, SubState::None);
    assert!(!checked.precheck);
    assert_eq!(checked.deploy_state, DeployState::Deployed);
    assert_eq!(checked.composition_id, f.source.composition_id);
    assert_eq!(checked.composition_target_id, None);
    assert_eq!(
        checked.elements.keys().collect::<Vec<_>>(),
        f.ac.elements.keys().collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn test_migration_to_unprimed_or_same_definition_is_refused() {
    let f = fixture(sim(&[http_type()])).await;
    let h = &f.h;

    let mut same = request(&f);
    same.composition_target_id = f.source.composition_id;
    assert!(matches!(
        h.supervisor.migrate(f.ac.instance_id, same).await,
        Err(SupervisionError::InvalidRequest(_))
    ));

    let unprimed = h
        .supervisor
        .commission(CompositionDefinition::new("next", "2.0.0", [template("web", http_type())]))
        .await
        .unwrap();
    let mut to_unprimed = request(&f);
    to_unprimed.composition_target_id = unprimed.composition_id;
    assert!(matches!(
        h.supervisor.migrate(f.ac.instance_id, to_unprimed).await,
        Err(SupervisionError::InvalidDefinitionState { .. })
    ));
    assert!(h.outbound().await.is_empty());
    assert_eq!(h.instance(&f.ac).await.deploy_state, DeployState::Deployed);
}

/// Fails the forward migration of `new`; rollback succeeds
struct RefuseNew;

impl SimBehavior for RefuseNew {
    fn element(&self, command: SimCommand, element: &AcElementDeploy) -> SimOutcome {
        match command {
            SimCommand::Migrate { rollback: false, .. } if element.definition.name == "new" => {
                SimOutcome::Fail("cannot create".into())
            }
            _ => SimOutcome::Succeed,
        }
    }
}

#[tokio::test]
async fn test_undeploy_after_failed_migration_leaves_deleted_elements_alone() {
    let f = fixture(sim(&[http_type()]).with_behavior(Arc::new(RefuseNew))).await;
    let h = &f.h;
    let old_id = named(&f.ac, "old").id;

    h.supervisor.migrate(f.ac.instance_id, request(&f)).await.unwrap();
    h.settle(&[&f.http]).await;
    let failed = h.instance(&f.ac).await;
    assert_eq!(failed.deploy_state, DeployState::Migrating);
    assert!(failed.is_failed());
    let deleted = failed.elements[&old_id].clone();
    assert_eq!(deleted.deploy_state, DeployState::Deleted);

    h.supervisor.undeploy(f.ac.instance_id).await.unwrap();
    assert_eq!(h.instance(&f.ac).await.elements[&old_id], deleted);

    let command = h.outbound().await;
    assert_eq!(command.len(), 1);
    let sent: BTreeSet<_> = command[0]
        .body
        .elements_for(f.http.participant_id)
        .iter()
        .map(|e| e.id)
        .collect();
    assert!(!sent.contains(&old_id));
    assert_eq!(sent.len(), 2);

    h.deliver(f.http.respond(&command[0])).await;
    h.settle(&[&f.http]).await;

    let undeployed = h.instance(&f.ac).await;
    assert_eq!(undeployed.deploy_state, DeployState::Undeployed);
    assert!(!undeployed.is_failed());
    assert!(!undeployed.elements.contains_key(&old_id));
    assert_eq!(undeployed.composition_id, f.source.composition_id);
    assert_eq!(undeployed.composition_target_id, None);
    assert_eq!(undeployed.rollback, None);
    assert!(undeployed
        .elements
        .values()
        .all(|e| e.deploy_state == DeployState::Undeployed
            && e.migration_state == ElementState::Present));
}

#[tokio::test]
async fn test_rollback_restores_source_elements() {
    let f = fixture(sim(&[http_type()]).with_behavior(Arc::new(RefuseNew))).await;
    let h = &f.h;
    let original: BTreeSet<_> = f.ac.elements.keys().copied().collect();

    assert!(matches!(
        h.supervisor.rollback(f.ac.instance_id).await,
        Err(SupervisionError::InvalidTransition(_))
    ));

    h.supervisor.migrate(f.ac.instance_id, request(&f)).await.unwrap();
    h.settle(&[&f.http]).await;
    let failed = h.instance(&f.ac).await;
    assert_eq!(failed.deploy_state, DeployState::Migrating);
    assert!(failed.is_failed());
    assert_eq!(failed.composition_id, f.source.composition_id);

    h.supervisor.rollback(f.ac.instance_id).await.unwrap();
    let reverting = h.instance(&f.ac).await;
    assert_eq!(reverting.deploy_state, DeployState::MigrationReverting);
    assert!(!reverting.is_failed());

    let command = h.outbound().await;
    match &command[0].body {
        MessageBody::AutomationCompositionMigration {
            composition_id,
            composition_target_id,
            rollback,
            ..
        } => {
            assert!(*rollback);
            assert_eq!(*composition_id, f.target.composition_id);
            assert_eq!(*composition_target_id, f.source.composition_id);
        }
        other => panic!("unexpected {}", other.kind()),
    }
    h.deliver(f.http.respond(&command[0])).await;
    h.settle(&[&f.http]).await;

    let restored = h.instance(&f.ac).await;
    assert_eq!(restored.deploy_state, DeployState::Deployed);
    assert_eq!(restored.composition_id, f.source.composition_id);
    assert_eq!(restored.rollback, None);
    assert_eq!(
        restored.elements.keys().copied().collect::<BTreeSet<_>>(),
        original
    );
    assert!(restored.all_elements_deployed());
}

#[tokio::test]
async fn test_prepare_walks_prepare_stages_then_review() {
    let h = Harness::new();
    let http = sim(&[http_type()]);
    h.register(&http).await;
    let definition = h
        .primed(
            &[&http],
            vec![
                template("web", http_type()),
                template("db", http_type()).with_property("stage", json!({ "prepare": [0, 2] })),
            ],
        )
        .await;
    let ac = h.instance_of(&definition).await;
    h.outbound().await;

    h.supervisor.prepare(ac.instance_id).await.unwrap();
    assert_eq!(h.instance(&ac).await.sub_state, SubState::Preparing);

    let first = h.outbound().await;
    assert_eq!(first.len(), 1);
    assert!(matches!(
        first[0].body,
        MessageBody::AutomationCompositionPrepare {
            stage: 0,
            first_stage: true,
            pre_deploy: true,
            ..
        }
    ));
    h.deliver(http.respond(&first[0])).await;

    // Only db has a second prepare stage
    let second = h.outbound().await;
    assert_eq!(second.len(), 1);
    assert!(matches!(
        second[0].body,
        MessageBody::AutomationCompositionPrepare {
            stage: 2,
            first_stage: false,
            ..
        }
    ));
    let replies = http.respond(&second[0]);
    assert_eq!(replies.len(), 1);
    h.deliver(replies).await;

    let prepared = h.instance(&ac).await;
    assert_eq!(prepared.sub_state, SubState::None);
    assert_eq!(prepared.deploy_state, DeployState::Undeployed);
    assert!(prepared
        .elements
        .values()
        .all(|e| e.sub_state == SubState::None && e.stage.is_none()));

    assert!(matches!(
        h.supervisor.review(ac.instance_id).await,
        Err(SupervisionError::InvalidTransition(_))
    ));
    h.supervisor.deploy(ac.instance_id).await.unwrap();
    h.settle(&[&http]).await;

    h.supervisor.review(ac.instance_id).await.unwrap();
    assert_eq!(h.instance(&ac).await.sub_state, SubState::Reviewing);
    let command = h.outbound().await;
    assert_eq!(command.len(), 1);
    assert!(matches!(
        command[0].body,
        MessageBody::AutomationCompositionPrepare {
            pre_deploy: false,
            ..
        }
    ));
    h.deliver(http.respond(&command[0])).await;

    let reviewed = h.instance(&ac).await;
    assert_eq!(reviewed.sub_state, SubState::None);
    assert_eq!(reviewed.deploy_state, DeployState::Deployed);
    assert!(h.outbound().await.is_empty());
}
