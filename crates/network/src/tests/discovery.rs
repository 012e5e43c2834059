use std::sync::Arc;

use jointmesh_network_primitives::frame::{Command, Frame, Request, Subject};
use jointmesh_primitives::peer::PeerEvent;
use jointmesh_store::memory::MemoryStore;
use jointmesh_store::types::{CandidateOrder, CandidateQuery};
use jointmesh_store::PeerDirectory;
use serde_json::{json, Value};

use crate::client::NetworkClient;
use crate::config::NetworkConfig;
use crate::correlator::Reply;
use crate::session::{Direction, Outgoing, Session};

fn client_with(config: NetworkConfig) -> (NetworkClient, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let (client, _events) = NetworkClient::new(config, Arc::clone(&store) as _);
    (client, store)
}

async fn add_peer_with_stats(store: &MemoryStore, url: &str, good: usize, invalid: usize) {
    store.add_peer(url, None).await.unwrap();

    let host = jointmesh_primitives::peer::host_of(url);
    for _ in 0..good {
        store.record_event(host, PeerEvent::NewGood).await.unwrap();
    }
    for _ in 0..invalid {
        store.record_event(host, PeerEvent::Invalid).await.unwrap();
    }
}

fn all_peers() -> CandidateQuery {
    CandidateQuery {
        max_invalid_ratio: 1_000.0,
        exclude_urls: vec![],
        exclude_hosts: vec![],
        order: CandidateOrder::Random,
        limit: 100,
    }
}

#[tokio::test]
async fn quality_bar_is_relaxed_when_isolated() {
    let (client, store) = client_with(NetworkConfig::default());

    add_peer_with_stats(&store, "ws://shaky:1", 5, 1).await;

    let candidates = client.outbound_candidates(5).await.unwrap();

    assert_eq!(
        candidates,
        vec!["ws://shaky:1".to_owned()],
        "a peer with 20% invalid joints qualifies after relaxing"
    );
}

#[tokio::test]
async fn quality_bar_holds_while_connected() {
    let (client, store) = client_with(NetworkConfig::default());

    add_peer_with_stats(&store, "ws://shaky:1", 5, 1).await;

    let (session, _outgoing) = Session::detached(Direction::Outbound, "ws://good:1");
    client.attach(session);

    let candidates = client.outbound_candidates(5).await.unwrap();

    assert!(candidates.is_empty(), "no relaxation with outbound peers");
}

#[tokio::test]
async fn relaxation_gives_up_on_hopeless_peers() {
    let (client, store) = client_with(NetworkConfig::default());

    add_peer_with_stats(&store, "ws://rotten:1", 1, 10).await;

    let candidates = client.outbound_candidates(5).await.unwrap();

    assert!(candidates.is_empty(), "ratio 10 is beyond every relaxation");
}

#[tokio::test]
async fn connected_peers_are_not_candidates() {
    let (client, store) = client_with(NetworkConfig::default());

    add_peer_with_stats(&store, "ws://a:1", 3, 0).await;
    add_peer_with_stats(&store, "ws://b:1", 1, 0).await;

    let (session, _outgoing) = Session::detached(Direction::Outbound, "ws://a:1");
    client.attach(session);

    let candidates = client.outbound_candidates(5).await.unwrap();

    assert_eq!(candidates, vec!["ws://b:1".to_owned()], "connected url excluded");
}

#[tokio::test]
async fn learnt_peers_are_recorded_except_ourselves() {
    let mut config = NetworkConfig::default();
    config.my_url = Some("ws://ME:6611".to_owned());
    let (client, store) = client_with(config);

    let (session, _outgoing) = Session::detached(Direction::Outbound, "ws://source:1");

    let reply = Reply {
        session,
        request: Request::new(Command::GetPeers, None),
        response: Some(json!(["ws://new:6611", "ws://me:6611"])),
    };

    let added = client.handle_new_peers(&reply).await.unwrap();
    assert_eq!(added, 1, "own url skipped");

    let known = store.outbound_candidates(&all_peers()).await.unwrap();
    assert_eq!(known, vec!["ws://new:6611".to_owned()], "learnt peer is dialable");
}

#[tokio::test]
async fn malformed_peer_lists_are_reported_to_the_sender() {
    let (client, _store) = client_with(NetworkConfig::default());

    let (session, mut outgoing) = Session::detached(Direction::Outbound, "ws://liar:1");

    let reply = Reply {
        session,
        request: Request::new(Command::GetPeers, None),
        response: Some(json!({ "peers": [] })),
    };

    assert!(client.handle_new_peers(&reply).await.is_err(), "not an array");

    let Ok(Outgoing::Frame(Frame::Justsaying(notice))) = outgoing.try_recv() else {
        panic!("expected an error notice");
    };
    assert_eq!(notice.subject, Subject::Error.to_string(), "error subject");
    assert_eq!(notice.body, Value::from("peer urls is not an array"), "error text");
}

#[tokio::test]
async fn good_peers_are_asked_for_more() {
    let (client, store) = client_with(NetworkConfig::default());

    add_peer_with_stats(&store, "ws://good:1", 4, 0).await;
    add_peer_with_stats(&store, "ws://fresh:1", 0, 0).await;

    let (good, mut good_out) = Session::detached(Direction::Outbound, "ws://good:1");
    let (fresh, mut fresh_out) = Session::detached(Direction::Outbound, "ws://fresh:1");
    client.attach(good);
    client.attach(fresh);

    client.check_enough_good_peers().await.unwrap();

    assert!(
        matches!(
            good_out.try_recv(),
            Ok(Outgoing::Frame(Frame::Request(request))) if request.command == "get_peers"
        ),
        "good peer is asked"
    );
    assert!(fresh_out.try_recv().is_err(), "peer without good joints is not asked");
}
