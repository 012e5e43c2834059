use std::sync::Arc;

use jointmesh_network::session::Direction;
use jointmesh_network::NetworkEvent;
use jointmesh_network_primitives::frame::{Command, Justsaying, Subject};
use jointmesh_node_primitives::events::NodeEvent;
use jointmesh_node_primitives::validation::ValidationOutcome;
use jointmesh_primitives::id::UnitId;
use jointmesh_store::types::{JointStatus, ValidationState};
use jointmesh_store::JointStore;
use serde_json::{json, Value};

use super::{
    drain, harness, joint, joint_value, notices, requests, responses, settle, GENESIS,
};

#[tokio::test]
async fn accepted_joint_is_saved_forwarded_and_announced() {
    let h = harness();
    let mut events = h.node.subscribe();

    let (sender, mut sender_out) = h.connect(Direction::Inbound, "10.0.0.1");
    let (subscriber, mut subscriber_out) = h.connect(Direction::Inbound, "10.0.0.2");
    subscriber.update_flags(|flags| flags.subscribed = true);

    h.say(&sender, Subject::Joint, joint_value(GENESIS, &[])).await;

    let sent = drain(&mut sender_out);
    assert_eq!(
        notices(&sent, Subject::Result),
        [&json!({ "unit": GENESIS, "result": "accepted" })],
        "sender is told the joint was accepted"
    );
    assert!(
        notices(&sent, Subject::Joint).is_empty(),
        "joint is not echoed to its sender"
    );

    let forwarded = drain(&mut subscriber_out);
    assert_eq!(
        notices(&forwarded, Subject::Joint),
        [&joint_value(GENESIS, &[])],
        "subscribers get the joint"
    );

    assert!(
        h.store.read_joint(&UnitId::from(GENESIS)).await.unwrap().is_some(),
        "joint is saved"
    );

    let event = events.try_recv().unwrap();
    assert!(
        matches!(event, NodeEvent::NewJoint { joint: ref saved } if saved.id().as_str() == GENESIS),
        "new joint is announced, got {event:?}"
    );
}

#[tokio::test]
async fn known_joint_is_reported_as_known() {
    let h = harness();
    let (sender, mut sender_out) = h.connect(Direction::Inbound, "10.0.0.1");

    h.say(&sender, Subject::Joint, joint_value(GENESIS, &[])).await;
    drop(drain(&mut sender_out));

    h.say(&sender, Subject::Joint, joint_value(GENESIS, &[])).await;

    let sent = drain(&mut sender_out);
    assert_eq!(
        notices(&sent, Subject::Result),
        [&json!({ "unit": GENESIS, "result": "known" })],
        "second copy is known"
    );
}

#[tokio::test]
async fn unit_in_work_gets_an_info_notice() {
    let h = harness();
    let (sender, mut sender_out) = h.connect(Direction::Inbound, "10.0.0.1");

    let _guard = h
        .node
        .state()
        .units_in_work
        .try_acquire(&UnitId::from("U1"))
        .unwrap();

    h.say(&sender, Subject::Joint, joint_value("U1", &[GENESIS])).await;

    let sent = drain(&mut sender_out);
    assert_eq!(
        notices(&sent, Subject::Info),
        [&json!({ "unit": "U1", "info": "already handling this unit" })],
        "peer is told the unit is being handled"
    );
    assert!(notices(&sent, Subject::Result).is_empty(), "no result yet");
}

#[tokio::test]
async fn identical_joint_from_two_peers_at_once_is_admitted_once() {
    let h = harness();

    let (first, mut first_out) = h.connect(Direction::Inbound, "10.0.0.1");
    let (second, mut second_out) = h.connect(Direction::Inbound, "10.0.0.2");
    let (subscriber, mut subscriber_out) = h.connect(Direction::Inbound, "10.0.0.3");
    subscriber.update_flags(|flags| flags.subscribed = true);

    let push = |session| NetworkEvent::Justsaying {
        session,
        justsaying: Justsaying::new(Subject::Joint, joint_value(GENESIS, &[])),
    };

    let ((), ()) = tokio::join!(
        h.node.handle_event(push(Arc::clone(&first))),
        h.node.handle_event(push(Arc::clone(&second))),
    );
    settle().await;

    assert_eq!(h.validator.calls(GENESIS), 1, "validated once");

    let first_sent = drain(&mut first_out);
    assert_eq!(
        notices(&first_sent, Subject::Result),
        [&json!({ "unit": GENESIS, "result": "accepted" })],
        "first sender is accepted"
    );

    let second_sent = drain(&mut second_out);
    assert_eq!(
        notices(&second_sent, Subject::Info),
        [&json!({ "unit": GENESIS, "info": "already handling this unit" })],
        "second sender is told the unit is in work"
    );
    assert!(
        notices(&second_sent, Subject::Result).is_empty(),
        "second copy gets no result"
    );

    let forwarded = drain(&mut subscriber_out);
    assert_eq!(
        notices(&forwarded, Subject::Joint).len(),
        1,
        "subscriber gets the joint exactly once"
    );
}

#[tokio::test]
async fn missing_parents_are_requested_and_dependents_admitted_once_they_arrive() {
    let h = harness();
    h.store
        .save_joint(&joint(GENESIS, &[]), &ValidationState::default())
        .await
        .unwrap();

    let (source, mut source_out) = h.source("ws://s:6611");

    h.say(&source, Subject::Joint, joint_value("U2", &["U1"])).await;

    let sent = drain(&mut source_out);
    assert_eq!(
        notices(&sent, Subject::Info),
        [&json!({ "unit": "U2", "info": "unresolved dependencies: U1" })],
        "peer is told what is missing"
    );

    let requested = requests(&sent);
    assert_eq!(requested.len(), 1, "one get_joint for the missing parent");
    assert_eq!(requested[0].command, Command::GetJoint.to_string(), "get_joint");
    assert_eq!(requested[0].params, Some(json!("U1")), "for the parent");

    assert_eq!(
        h.store.check_new_unit(&UnitId::from("U2")).await.unwrap(),
        JointStatus::KnownUnverified,
        "dependent waits as unhandled"
    );

    let request = requested[0].clone();
    h.answer(&source, &request, json!({ "joint": joint_value("U1", &[GENESIS]) }))
        .await;

    let sent = drain(&mut source_out);
    let results: Vec<_> = notices(&sent, Subject::Result)
        .into_iter()
        .filter_map(|result| result.get("unit").and_then(Value::as_str))
        .collect();
    assert_eq!(results, ["U1", "U2"], "parent, then dependent, are accepted");

    for unit in ["U1", "U2"] {
        assert_eq!(
            h.store.check_new_unit(&UnitId::from(unit)).await.unwrap(),
            JointStatus::Known,
            "{unit} is saved"
        );
    }
}

#[tokio::test]
async fn invalid_parent_purges_dependents_and_tells_their_senders() {
    let h = harness();
    h.validator
        .script("U1", || ValidationOutcome::UnitError("bad signature".to_owned()));

    let (first, mut first_out) = h.connect(Direction::Inbound, "10.0.0.1");
    let (second, mut second_out) = h.connect(Direction::Inbound, "10.0.0.2");

    h.say(&first, Subject::Joint, joint_value("U2", &["U1"])).await;
    drop(drain(&mut first_out));

    h.say(&second, Subject::Joint, joint_value("U1", &[GENESIS])).await;

    let sent = drain(&mut second_out);
    assert_eq!(
        notices(&sent, Subject::Result),
        [&json!({ "unit": "U1", "result": "error", "error": "bad signature" })],
        "sender of the bad unit gets the validation error"
    );

    let sent = drain(&mut first_out);
    assert_eq!(
        notices(&sent, Subject::Result),
        [&json!({
            "unit": "U2",
            "result": "error",
            "error": "error on (indirect) parent unit U1: bad signature",
        })],
        "sender of the dependent learns why it was dropped"
    );

    assert_eq!(
        h.store.check_new_unit(&UnitId::from("U1")).await.unwrap(),
        JointStatus::KnownBad,
        "bad unit is remembered"
    );
}

#[tokio::test]
async fn missing_parent_that_does_not_exist_purges_dependents() {
    let h = harness();
    let (source, mut source_out) = h.source("ws://s:6611");

    h.say(&source, Subject::Joint, joint_value("U2", &["U1"])).await;

    let sent = drain(&mut source_out);
    let request = requests(&sent)[0].clone();

    h.answer(&source, &request, json!({ "joint_not_found": "U1" }))
        .await;

    let sent = drain(&mut source_out);
    assert_eq!(
        notices(&sent, Subject::Result),
        [&json!({
            "unit": "U2",
            "result": "error",
            "error": "error on (indirect) parent unit U1: unit U1 does not exist",
        })],
        "dependent is purged"
    );
}

#[tokio::test]
async fn unrequested_joint_in_answer_is_refused() {
    let h = harness();
    let (source, mut source_out) = h.source("ws://s:6611");

    h.say(&source, Subject::Joint, joint_value("U2", &["U1"])).await;

    let sent = drain(&mut source_out);
    let request = requests(&sent)[0].clone();

    h.answer(&source, &request, json!({ "joint": joint_value("U3", &[GENESIS]) }))
        .await;

    let sent = drain(&mut source_out);
    assert_eq!(
        notices(&sent, Subject::Error),
        [&json!("I didn't request this unit from you: U3")],
        "wrong unit is refused"
    );
    assert_eq!(
        h.store.check_new_unit(&UnitId::from("U3")).await.unwrap(),
        JointStatus::New,
        "wrong unit is not saved"
    );
}

#[tokio::test]
async fn pushed_joint_with_a_ball_is_refused() {
    let h = harness();
    let (sender, mut sender_out) = h.connect(Direction::Inbound, "10.0.0.1");

    let mut pushed = joint_value("U1", &[GENESIS]);
    pushed["ball"] = json!("B1");

    h.say(&sender, Subject::Joint, pushed).await;

    let sent = drain(&mut sender_out);
    assert_eq!(
        notices(&sent, Subject::Error),
        [&json!("only requested joint can contain a ball")],
        "balls only come with requested joints"
    );
}

#[tokio::test]
async fn posted_joints_are_answered_with_their_fate() {
    let h = harness();
    let (poster, mut poster_out) = h.connect(Direction::Inbound, "10.0.0.1");

    h.ask(&poster, Command::PostJoint, Some(joint_value("U1", &["X"])))
        .await;
    h.ask(&poster, Command::PostJoint, Some(joint_value(GENESIS, &[])))
        .await;
    h.ask(&poster, Command::PostJoint, Some(joint_value(GENESIS, &[])))
        .await;

    let mut unsigned = joint_value("U3", &[GENESIS]);
    unsigned["unsigned"] = json!(true);
    h.ask(&poster, Command::PostJoint, Some(unsigned)).await;

    h.ask(&poster, Command::PostJoint, Some(json!({ "no": "unit" })))
        .await;

    let sent = drain(&mut poster_out);
    assert_eq!(
        responses(&sent),
        [
            Some(&json!({ "error": "unknown parents" })),
            Some(&json!("accepted")),
            Some(&json!({ "error": "known" })),
            Some(&json!({ "error": "you can't send unsigned units" })),
            Some(&json!({ "error": "no unit" })),
        ],
        "each post is answered"
    );
}
