use std::sync::Arc;

use eyre::eyre;
use jointmesh_network::session::{Direction, Session, CLOSE_NORMAL};
use jointmesh_network::{NetworkConfig, NetworkEvent};
use jointmesh_network_primitives::frame::{Command, Subject, Tag};
use jointmesh_node_primitives::events::NodeEvent;
use jointmesh_primitives::common::unix_secs;
use jointmesh_primitives::constants::{ALT, PROGRAM, PROGRAM_VERSION, PROTOCOL_VERSION};
use jointmesh_store::types::ValidationState;
use jointmesh_store::{JointStore, LightWatchStore, PeerDirectory, WitnessStore};
use serde_json::{json, Value};

use super::{
    closes, drain, harness, harness_with, joint, joint_value, notices, responses, ADDRESS,
    GENESIS,
};
use crate::handlers::request::release_unanswered;

fn light_config() -> NetworkConfig {
    let mut config = NetworkConfig::default();
    config.mode.light = true;
    config.light_vendor_url = Some("ws://vendor:6611".to_owned());
    config
}

#[tokio::test]
async fn subscription_streams_free_joints() {
    let h = harness();
    h.store
        .save_joint(&joint(GENESIS, &[]), &ValidationState::default())
        .await
        .unwrap();

    let (peer, mut peer_out) = h.connect(Direction::Inbound, "10.0.0.1");

    h.ask(&peer, Command::Subscribe, Some(json!({ "subscription_id": "abc" })))
        .await;

    let sent = drain(&mut peer_out);
    assert_eq!(responses(&sent), [Some(&json!("subscribed"))], "subscribed");
    assert_eq!(
        notices(&sent, Subject::Joint),
        [&joint_value(GENESIS, &[])],
        "free joints follow"
    );
    assert_eq!(
        notices(&sent, Subject::FreeJointsEnd).len(),
        1,
        "stream is terminated"
    );
    assert!(peer.flags().subscribed, "session is subscribed");
}

#[tokio::test]
async fn subscription_with_our_own_id_is_a_self_connect() {
    let h = harness();

    let (ours, _ours_out) = h.connect(Direction::Outbound, "ws://me:6611");
    ours.update_flags(|flags| flags.subscription_id = Some("abc".to_owned()));

    let (peer, mut peer_out) = h.connect(Direction::Inbound, "127.0.0.1");

    h.ask(&peer, Command::Subscribe, Some(json!({ "subscription_id": "abc", "last_mci": 0 })))
        .await;

    let sent = drain(&mut peer_out);
    assert_eq!(
        responses(&sent),
        [Some(&json!({ "error": "self-connect" }))],
        "self-connect is refused"
    );
    assert_eq!(closes(&sent), [(CLOSE_NORMAL, "self-connect")], "and closed");
    assert!(!peer.flags().subscribed, "not subscribed");
}

#[tokio::test]
async fn malformed_subscriptions_are_refused() {
    let h = harness();
    let (peer, mut peer_out) = h.connect(Direction::Inbound, "10.0.0.1");

    h.ask(&peer, Command::Subscribe, None).await;
    h.ask(&peer, Command::Subscribe, Some(json!({ "last_mci": 3 })))
        .await;

    let sent = drain(&mut peer_out);
    assert_eq!(
        responses(&sent),
        [
            Some(&json!({ "error": "no params" })),
            Some(&json!({ "error": "no subscription_id" })),
        ],
        "both are refused"
    );
}

#[tokio::test]
async fn incompatible_version_closes_the_connection() {
    let h = harness();
    let (peer, mut peer_out) = h.connect(Direction::Inbound, "10.0.0.1");

    h.say(
        &peer,
        Subject::Version,
        json!({
            "protocol_version": "0.1",
            "alt": ALT,
            "program": PROGRAM,
            "program_version": PROGRAM_VERSION,
        }),
    )
    .await;

    let sent = drain(&mut peer_out);
    assert_eq!(
        notices(&sent, Subject::Error),
        [&json!(format!("Incompatible versions, mine {PROTOCOL_VERSION}, yours 0.1"))],
        "peer is told why"
    );
    assert_eq!(
        closes(&sent),
        [(CLOSE_NORMAL, "incompatible versions")],
        "connection is closed"
    );
}

#[tokio::test]
async fn get_joint_serves_known_and_unknown_units() {
    let h = harness();
    h.store
        .save_joint(&joint(GENESIS, &[]), &ValidationState::default())
        .await
        .unwrap();

    let (peer, mut peer_out) = h.connect(Direction::Inbound, "10.0.0.1");

    h.ask(&peer, Command::GetJoint, Some(json!(GENESIS))).await;
    h.ask(&peer, Command::GetJoint, Some(json!("U404"))).await;

    let sent = drain(&mut peer_out);
    assert_eq!(
        responses(&sent),
        [
            Some(&json!({ "joint": joint_value(GENESIS, &[]) })),
            Some(&json!({ "joint_not_found": "U404" })),
        ],
        "both are answered"
    );
}

#[tokio::test]
async fn peers_and_witnesses_are_served() {
    let h = harness();
    h.store
        .insert_witnesses(&["W1".to_owned(), "W2".to_owned()])
        .await
        .unwrap();

    let _outbound = h.connect(Direction::Outbound, "ws://a:6611");
    let (peer, mut peer_out) = h.connect(Direction::Inbound, "10.0.0.1");

    h.ask(&peer, Command::GetPeers, None).await;
    h.ask(&peer, Command::GetWitnesses, None).await;

    let sent = drain(&mut peer_out);
    assert_eq!(
        responses(&sent),
        [
            Some(&json!(["ws://a:6611"])),
            Some(&json!(["W1", "W2"])),
        ],
        "outbound urls and witnesses"
    );
}

#[tokio::test]
async fn unknown_command_is_answered_with_an_error() {
    let h = harness();
    let (peer, mut peer_out) = h.connect(Direction::Inbound, "10.0.0.1");

    h.node
        .handle_event(NetworkEvent::Request {
            session: Arc::clone(&peer),
            request: serde_json::from_value(json!({ "command": "nope", "tag": "t1" })).unwrap(),
        })
        .await;

    let sent = drain(&mut peer_out);
    assert_eq!(
        responses(&sent),
        [Some(&json!({ "error": "unknown command: nope" }))],
        "unknown command"
    );
}

#[tokio::test]
async fn private_payment_must_be_an_array() {
    let h = harness();
    let mut events = h.node.subscribe();
    let (peer, mut peer_out) = h.connect(Direction::Inbound, "10.0.0.1");

    h.say(&peer, Subject::PrivatePayment, json!({ "not": "array" }))
        .await;
    h.say(&peer, Subject::PrivatePayment, json!([{ "unit": "U1" }]))
        .await;

    let sent = drain(&mut peer_out);
    assert_eq!(
        notices(&sent, Subject::Error),
        [&json!("private_payment content must be array")],
        "object is refused"
    );
    assert!(
        matches!(events.try_recv(), Ok(NodeEvent::PrivatePayment { .. })),
        "array is passed on"
    );
}

#[tokio::test]
async fn hub_messages_need_a_hub() {
    let h = harness();
    let (peer, mut peer_out) = h.connect(Direction::Inbound, "10.0.0.1");

    h.say(&peer, Subject::HubLogin, json!({})).await;
    h.ask(&peer, Command::HubDeliver, Some(json!({}))).await;

    let sent = drain(&mut peer_out);
    assert_eq!(
        notices(&sent, Subject::Error),
        [&json!("I'm not a hub")],
        "notice is refused"
    );
    assert_eq!(
        responses(&sent),
        [Some(&json!({ "error": "I'm not a hub" }))],
        "request is refused"
    );
}

#[tokio::test]
async fn light_requests_are_refused_without_a_vendor_service() {
    let h = harness();
    let (outbound, mut outbound_out) = h.connect(Direction::Outbound, "ws://a:6611");
    let (inbound, mut inbound_out) = h.connect(Direction::Inbound, "10.0.0.1");

    h.ask(&outbound, Command::LightGetHistory, Some(json!({}))).await;
    h.ask(&inbound, Command::LightGetHistory, Some(json!({}))).await;

    assert_eq!(
        responses(&drain(&mut outbound_out)),
        [Some(&json!({ "error": "light clients have to be inbound" }))],
        "light clients dial us"
    );
    assert_eq!(
        responses(&drain(&mut inbound_out)),
        [Some(&json!({ "error": "not a light vendor" }))],
        "no vendor service"
    );
}

#[tokio::test]
async fn light_node_refuses_what_only_full_nodes_do() {
    let h = harness_with(light_config());
    let (vendor, _vendor_out) = h.connect(Direction::Outbound, "ws://vendor:6611");
    vendor.update_flags(|flags| flags.light_vendor = true);

    let (peer, mut peer_out) = h.connect(Direction::Outbound, "ws://other:6611");

    h.ask(&peer, Command::LightGetHistory, Some(json!({}))).await;
    h.ask(&peer, Command::Subscribe, Some(json!({ "subscription_id": "abc" })))
        .await;
    h.say(&peer, Subject::Joint, joint_value(GENESIS, &[])).await;
    h.say(&peer, Subject::LightHaveUpdates, Value::Null).await;

    let sent = drain(&mut peer_out);
    assert_eq!(
        responses(&sent),
        [
            Some(&json!({ "error": "I'm light myself, can't serve you" })),
            Some(&json!({ "error": "I'm light, cannot subscribe you to updates" })),
        ],
        "requests are refused"
    );
    assert_eq!(
        notices(&sent, Subject::Error),
        [
            &json!("I'm a light client and you are not my vendor"),
            &json!("You are not my light vendor"),
        ],
        "notices from strangers are refused"
    );

    let mut events = h.node.subscribe();
    h.say(&vendor, Subject::LightHaveUpdates, Value::Null).await;
    assert!(
        matches!(events.try_recv(), Ok(NodeEvent::MessageForLight { .. })),
        "updates from the vendor are passed on"
    );
}

#[tokio::test]
async fn watched_addresses_get_joints_pushed_until_disconnect() {
    let h = harness();
    let (light, mut light_out) = h.connect(Direction::Inbound, "10.0.0.9");
    let (sender, _sender_out) = h.connect(Direction::Inbound, "10.0.0.1");

    h.say(&light, Subject::LightNewAddressToWatch, json!("not an address"))
        .await;
    h.say(&light, Subject::LightNewAddressToWatch, json!(ADDRESS))
        .await;

    let sent = drain(&mut light_out);
    assert_eq!(
        notices(&sent, Subject::Error),
        [&json!("address not valid")],
        "bad address is refused"
    );
    assert_eq!(
        notices(&sent, Subject::Info),
        [&json!(format!("now watching {ADDRESS}"))],
        "good address is watched"
    );

    h.say(&sender, Subject::Joint, joint_value(GENESIS, &[])).await;

    let sent = drain(&mut light_out);
    let pushed = notices(&sent, Subject::Joint);
    assert_eq!(pushed.len(), 1, "light peer gets the joint");
    let stamped = pushed[0]["unit"]["timestamp"].as_u64().unwrap();
    let now = unix_secs();
    assert!(
        stamped <= now && stamped.saturating_add(60) >= now,
        "pushed joint is stamped in seconds, got {stamped} at {now}"
    );

    h.node
        .handle_event(NetworkEvent::Disconnected {
            session: Arc::clone(&light),
        })
        .await;

    assert!(
        h.store
            .light_peers_watching(&[ADDRESS])
            .await
            .unwrap()
            .is_empty(),
        "watch ends with the connection"
    );
}

#[tokio::test]
async fn local_wallet_hears_about_its_transactions() {
    let h = harness();
    let mut events = h.node.subscribe();
    let (subscriber, mut subscriber_out) = h.connect(Direction::Inbound, "10.0.0.2");
    subscriber.update_flags(|flags| flags.subscribed = true);

    h.node.watch_address(ADDRESS);
    h.node.broadcast_joint(&joint(GENESIS, &[])).await;

    assert_eq!(
        notices(&drain(&mut subscriber_out), Subject::Joint),
        [&joint_value(GENESIS, &[])],
        "joint is broadcast"
    );
    assert!(
        matches!(
            events.try_recv(),
            Ok(NodeEvent::NewMyTransaction { ref units }) if units[0].as_str() == GENESIS
        ),
        "wallet is told"
    );
}

#[tokio::test]
async fn claimed_url_is_echoed_and_verified() {
    let h = harness();

    let (inbound, _inbound_out) = h.connect(Direction::Inbound, "10.0.0.5");
    inbound.update_flags(|flags| flags.claimed_url = Some("ws://10.0.0.5:6611".to_owned()));
    let (_reverse, mut reverse_out) = h.connect(Direction::Outbound, "ws://10.0.0.5:6611");

    h.say(&inbound, Subject::WantEcho, json!("secret")).await;

    assert_eq!(
        notices(&drain(&mut reverse_out), Subject::YourEcho),
        [&json!("secret")],
        "echo goes back over the claimed url"
    );

    inbound.update_flags(|flags| flags.sent_echo_string = Some("expected".to_owned()));

    h.say(&inbound, Subject::YourEcho, json!("wrong")).await;
    assert_eq!(
        h.store.verified_url("10.0.0.5").await.unwrap(),
        None,
        "wrong echo verifies nothing"
    );

    h.say(&inbound, Subject::YourEcho, json!("expected")).await;
    assert_eq!(
        h.store.verified_url("10.0.0.5").await.unwrap().as_deref(),
        Some("ws://10.0.0.5:6611"),
        "right echo verifies the url"
    );
    assert!(
        inbound.flags().sent_echo_string.is_none(),
        "echo string is used up"
    );
}

#[tokio::test]
async fn my_url_is_ignored_when_already_verified() {
    let h = harness();
    h.store
        .set_verified_url("10.0.0.5", "ws://10.0.0.5:6611")
        .await
        .unwrap();

    let (inbound, _inbound_out) = h.connect(Direction::Inbound, "10.0.0.5");

    h.say(&inbound, Subject::MyUrl, json!("ws://10.0.0.5:6611")).await;

    let flags = inbound.flags();
    assert_eq!(
        flags.claimed_url.as_deref(),
        Some("ws://10.0.0.5:6611"),
        "claim is recorded"
    );
    assert!(flags.advertised_own_url, "only once per connection");
    assert!(flags.sent_echo_string.is_none(), "no echo needed");
}

#[test]
fn failure_after_a_response_sends_nothing_more() {
    let (session, mut outgoing) = Session::detached(Direction::Inbound, "1.2.3.4:5");
    let tag = Tag::from("t");
    let failed = Err(eyre!("replay failed"));

    assert!(session.begin_response(&tag), "tag is free");
    session.send_response(&tag, Some(Value::from("subscribed")));
    release_unanswered(&session, &tag, &failed);

    let items = drain(&mut outgoing);
    assert_eq!(
        responses(&items),
        vec![Some(&Value::from("subscribed"))],
        "one response per tag"
    );
}

#[test]
fn failure_before_a_response_releases_the_tag() {
    let (session, mut outgoing) = Session::detached(Direction::Inbound, "1.2.3.4:5");
    let tag = Tag::from("t");
    let failed = Err(eyre!("watch failed"));

    assert!(session.begin_response(&tag), "tag is free");
    release_unanswered(&session, &tag, &failed);

    let items = drain(&mut outgoing);
    assert_eq!(
        responses(&items),
        vec![Some(&json!({ "error": "internal error" }))],
        "fallback error is sent"
    );
    assert!(session.begin_response(&tag), "peer can ask again");
}
