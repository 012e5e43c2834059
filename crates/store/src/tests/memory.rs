use serde_json::json;

use super::*;
use crate::types::Sequence;

fn joint(unit: &str, parents: &[&str]) -> Joint {
    serde_json::from_value(json!({
        "unit": { "unit": unit, "parent_units": parents, "authors": [{ "address": "A" }] }
    }))
    .unwrap()
}

fn id(unit: &str) -> UnitId {
    UnitId::from(unit)
}

const GOOD: ValidationState = ValidationState {
    sequence: Sequence::Good,
};

#[tokio::test]
async fn unit_status_follows_its_lifecycle() {
    let store = MemoryStore::new();
    let a = joint("a", &["g"]);

    assert_eq!(store.check_new_joint(&a).await.unwrap(), JointStatus::New, "fresh");

    store
        .save_unhandled_joint(&a, &[id("g")], Some("peer-1"))
        .await
        .unwrap();
    assert_eq!(
        store.check_new_joint(&a).await.unwrap(),
        JointStatus::KnownUnverified,
        "held as unhandled"
    );

    store.remove_unhandled_joint(a.id()).await.unwrap();
    store.save_joint(&a, &GOOD).await.unwrap();
    assert_eq!(store.check_new_unit(a.id()).await.unwrap(), JointStatus::Known, "saved");
    assert!(store.save_joint(&a, &GOOD).await.is_err(), "saving twice is an error");

    let b = joint("b", &[]);
    store.save_known_bad_joint(&b, "bad sig").await.unwrap();
    assert_eq!(store.check_new_unit(b.id()).await.unwrap(), JointStatus::KnownBad, "bad");
}

#[tokio::test]
async fn dependents_become_ready_once_every_parent_is_saved() {
    let store = MemoryStore::new();
    let child = joint("c", &["p1", "p2"]);

    store
        .save_unhandled_joint(&child, &[id("p1"), id("p2")], Some("peer"))
        .await
        .unwrap();

    store.save_joint(&joint("p1", &[]), &GOOD).await.unwrap();
    assert!(
        store.ready_dependent_joints(Some(&id("p1"))).await.unwrap().is_empty(),
        "p2 is still missing"
    );

    store.save_joint(&joint("p2", &[]), &GOOD).await.unwrap();
    let ready = store.ready_dependent_joints(Some(&id("p2"))).await.unwrap();
    assert_eq!(ready.len(), 1, "child is ready");
    assert_eq!(ready[0].joint.id(), child.id(), "ready joint");
    assert_eq!(ready[0].peer.as_deref(), Some("peer"), "origin peer is kept");

    let all = store.ready_dependent_joints(None).await.unwrap();
    assert_eq!(all.len(), 1, "full scan finds it too");
}

#[tokio::test]
async fn purging_a_bad_joint_takes_its_descendants_along() {
    let store = MemoryStore::new();
    let bad = joint("bad", &["g"]);
    let child = joint("child", &["bad"]);
    let grandchild = joint("grandchild", &["child"]);

    store.save_unhandled_joint(&bad, &[id("g")], None).await.unwrap();
    store
        .save_unhandled_joint(&child, &[id("bad")], Some("peer-1"))
        .await
        .unwrap();
    store
        .save_unhandled_joint(&grandchild, &[id("child")], Some("peer-2"))
        .await
        .unwrap();

    let purged = store
        .purge_joint_and_dependencies(&bad, "invalid")
        .await
        .unwrap();

    assert_eq!(
        purged,
        vec![
            PurgedUnit {
                unit: id("child"),
                peer: Some("peer-1".to_owned()),
            },
            PurgedUnit {
                unit: id("grandchild"),
                peer: Some("peer-2".to_owned()),
            },
        ],
        "descendants are purged with their peers"
    );
    for unit in ["bad", "child", "grandchild"] {
        assert_eq!(
            store.check_new_unit(&id(unit)).await.unwrap(),
            JointStatus::KnownBad,
            "{unit} is known bad"
        );
    }
}

#[tokio::test]
async fn lost_joints_are_missing_parents_nobody_holds() {
    let store = MemoryStore::new();

    store
        .save_unhandled_joint(&joint("c", &["p", "q"]), &[id("p"), id("q")], None)
        .await
        .unwrap();
    store
        .save_unhandled_joint(&joint("q", &["r"]), &[id("r")], None)
        .await
        .unwrap();

    let lost = store.lost_joints(Duration::ZERO).await.unwrap();
    assert_eq!(lost, vec![id("p"), id("r")], "q is held as unhandled");

    let lost = store.lost_joints(Duration::from_secs(60)).await.unwrap();
    assert!(lost.is_empty(), "dependencies are too fresh");

    assert_eq!(
        store.purge_old_unhandled_joints(Duration::ZERO).await.unwrap(),
        2,
        "both unhandled joints are old enough"
    );
    assert!(
        store.lost_joints(Duration::ZERO).await.unwrap().is_empty(),
        "nothing depends on anything anymore"
    );
}

#[tokio::test]
async fn free_joints_and_joints_since_mci() {
    let store = MemoryStore::new();

    store.save_joint(&joint("g", &[]), &GOOD).await.unwrap();
    store.save_joint(&joint("a", &["g"]), &GOOD).await.unwrap();
    store.save_joint(&joint("b", &["g"]), &GOOD).await.unwrap();

    let free: Vec<_> = store
        .read_free_joints()
        .await
        .unwrap()
        .into_iter()
        .map(|joint| joint.id().clone())
        .collect();
    assert_eq!(free, vec![id("a"), id("b")], "g has children");

    let since: Vec<_> = store
        .read_joints_since_mci(2)
        .await
        .unwrap()
        .into_iter()
        .map(|joint| joint.id().clone())
        .collect();
    assert_eq!(since, vec![id("b")], "only b is above mci 2");
    assert_eq!(store.last_main_chain_index().await.unwrap(), 3, "three saves");
}

#[tokio::test]
async fn outbound_candidates_respect_quality_and_exclusions() {
    let store = MemoryStore::new();

    for url in [
        "ws://good.example:1",
        "ws://fresh.example:1",
        "ws://bad.example:1",
        "ws://connected.example:1",
        "ws://me.example:1",
        "ws://inbound.example:1",
    ] {
        store.add_peer(url, None).await.unwrap();
    }

    for _ in 0..3 {
        store.record_event("good.example", PeerEvent::NewGood).await.unwrap();
    }
    store.record_event("bad.example", PeerEvent::NewGood).await.unwrap();
    store.record_event("bad.example", PeerEvent::Invalid).await.unwrap();
    store.mark_self("ws://me.example:1").await.unwrap();
    store
        .set_verified_url("inbound.example", "ws://inbound.example:1")
        .await
        .unwrap();

    let query = CandidateQuery {
        max_invalid_ratio: 0.1,
        exclude_urls: vec!["ws://connected.example:1".to_owned()],
        exclude_hosts: vec!["inbound.example".to_owned()],
        order: CandidateOrder::MostGood,
        limit: 10,
    };

    let candidates = store.outbound_candidates(&query).await.unwrap();
    assert_eq!(
        candidates,
        vec!["ws://good.example:1".to_owned(), "ws://fresh.example:1".to_owned()],
        "good peers first, bad/self/connected/co-located excluded"
    );

    let relaxed = CandidateQuery {
        max_invalid_ratio: 3.2,
        limit: 1,
        ..query
    };
    assert_eq!(
        store.outbound_candidates(&relaxed).await.unwrap(),
        vec!["ws://good.example:1".to_owned()],
        "limit applies after ordering"
    );
}

#[tokio::test]
async fn reversible_inbound_hosts_need_a_verified_url() {
    let store = MemoryStore::new();
    let hosts = vec!["1.1.1.1".to_owned(), "2.2.2.2".to_owned()];

    assert_eq!(
        store.reversible_inbound_host(&hosts, 0.1).await.unwrap(),
        None,
        "no host has a verified url"
    );

    store.set_verified_url("2.2.2.2", "ws://2.2.2.2:6611").await.unwrap();
    assert_eq!(
        store.reversible_inbound_host(&hosts, 0.1).await.unwrap(),
        Some("2.2.2.2".to_owned()),
        "verified host is chosen"
    );

    store.record_event("2.2.2.2", PeerEvent::Invalid).await.unwrap();
    assert_eq!(
        store.reversible_inbound_host(&hosts, 0.1).await.unwrap(),
        None,
        "bad quality host is skipped"
    );
}

#[tokio::test]
async fn verified_url_tracks_the_latest_claim() {
    let store = MemoryStore::new();

    store.set_verified_url("h", "ws://h:1").await.unwrap();
    store.set_verified_url("h", "ws://h:2").await.unwrap();

    assert_eq!(
        store.verified_url("h").await.unwrap().as_deref(),
        Some("ws://h:2"),
        "latest url wins"
    );
    assert_eq!(store.verified_url("other").await.unwrap(), None, "unknown host");
}

#[tokio::test]
async fn recent_events_are_counted_per_host() {
    let store = MemoryStore::new();

    store.record_event("h", PeerEvent::Invalid).await.unwrap();
    store.record_event("h", PeerEvent::KnownGood).await.unwrap();
    store.record_event("other", PeerEvent::Invalid).await.unwrap();

    let counts = store.recent_events("h", Duration::from_secs(3_600)).await.unwrap();

    assert_eq!(counts.invalid, 1, "one invalid event");
    assert_eq!(counts.known_good, 1, "one known good event");
    assert_eq!(counts.new_good, 0, "no new good events");
}

#[tokio::test(start_paused = true)]
async fn events_older_than_the_stats_window_are_dropped() {
    let store = MemoryStore::new();

    store.record_event("h", PeerEvent::Invalid).await.unwrap();

    tokio::time::advance(BAD_STATS_WINDOW + Duration::from_secs(1)).await;

    store.record_event("h", PeerEvent::NewGood).await.unwrap();

    assert_eq!(store.inner.read().events.len(), 1, "stale event is pruned");

    let counts = store
        .recent_events("h", BAD_STATS_WINDOW * 2)
        .await
        .unwrap();
    assert_eq!(counts.invalid, 0, "stale invalid event is gone");
    assert_eq!(counts.new_good, 1, "fresh event is kept");
}

#[tokio::test]
async fn hash_tree_balls_drain_as_units_are_saved() {
    let store = MemoryStore::new();
    let ball = |unit: &str| HashTreeBall {
        unit: id(unit),
        ball: BallHash::from(format!("ball-{unit}")),
        parent_balls: vec![],
        skiplist_balls: None,
        is_nonserial: false,
    };

    store.add_hash_tree_balls(&[ball("x"), ball("y")]).await.unwrap();
    store.add_hash_tree_balls(&[ball("x")]).await.unwrap();
    assert_eq!(
        store.hash_tree_units().await.unwrap(),
        vec![id("x"), id("y")],
        "tree order, no duplicates"
    );

    store.save_joint(&joint("x", &[]), &GOOD).await.unwrap();
    assert_eq!(store.hash_tree_units().await.unwrap(), vec![id("y")], "x is saved");

    store.save_joint(&joint("y", &["x"]), &GOOD).await.unwrap();
    assert!(!store.has_hash_tree_balls().await.unwrap(), "tree is drained");

    store.purge_handled_hash_tree_balls().await.unwrap();
    store.add_hash_tree_balls(&[ball("z")]).await.unwrap();
    assert_eq!(store.hash_tree_units().await.unwrap(), vec![id("z")], "new range");
}

#[tokio::test]
async fn chain_balls_are_consumed_in_order() {
    let store = MemoryStore::new();
    let balls: Vec<BallHash> = ["b1", "b2", "b3"].into_iter().map(BallHash::from).collect();

    store.add_chain_balls(&balls).await.unwrap();
    assert_eq!(
        store.first_chain_balls(2).await.unwrap(),
        balls[..2].to_vec(),
        "first two"
    );

    store.remove_chain_ball(&balls[0]).await.unwrap();
    store.remove_chain_ball(&balls[1]).await.unwrap();
    assert_eq!(
        store.first_chain_balls(2).await.unwrap(),
        vec![balls[2].clone()],
        "one left"
    );
    assert!(store.has_chain_balls().await.unwrap(), "not drained yet");
}

#[tokio::test]
async fn light_watchers_are_found_by_address() {
    let store = MemoryStore::new();

    store.watch_light_address("light-1", "A").await.unwrap();
    store.watch_light_address("light-2", "B").await.unwrap();

    assert_eq!(
        store.light_peers_watching(&["A", "C"]).await.unwrap(),
        vec!["light-1".to_owned()],
        "only the watcher of A"
    );

    store.save_joint(&joint("g", &[]), &GOOD).await.unwrap();
    assert_eq!(
        store.light_peers_with_updates(0, 1).await.unwrap(),
        vec!["light-1".to_owned()],
        "unit g is authored by A"
    );

    store.unwatch_light_peer("light-1").await.unwrap();
    assert!(
        store.light_peers_watching(&["A"]).await.unwrap().is_empty(),
        "watcher left"
    );
}
