use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use jointmesh_network::session::{Direction, Outgoing, Session};
use jointmesh_network::{NetworkClient, NetworkConfig, NetworkEvent};
use jointmesh_network_primitives::codec::encode;
use jointmesh_network_primitives::frame::{
    Command, Frame, Justsaying, Request, Response, Subject,
};
use jointmesh_node_primitives::validation::{ValidationOutcome, Validator};
use jointmesh_primitives::id::UnitId;
use jointmesh_primitives::joint::Joint;
use jointmesh_store::memory::MemoryStore;
use jointmesh_store::PeerDirectory;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::yield_now;

use crate::reference::{BasicCatchup, BasicValidator};
use crate::{Collaborators, Node, NodeConfig};

mod admission;
mod handlers;

const GENESIS: &str = "G";
const ADDRESS: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Parent checks from [`BasicValidator`], unless a verdict was scripted for
/// the unit.
///
/// Every validation yields once, so concurrent admissions interleave.
struct ScriptedValidator {
    basic: BasicValidator,
    verdicts: Mutex<HashMap<UnitId, fn() -> ValidationOutcome>>,
    calls: Mutex<HashMap<UnitId, usize>>,
}

impl ScriptedValidator {
    fn script(&self, unit: &str, verdict: fn() -> ValidationOutcome) {
        drop(self.verdicts.lock().insert(UnitId::from(unit), verdict));
    }

    fn calls(&self, unit: &str) -> usize {
        self.calls
            .lock()
            .get(&UnitId::from(unit))
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Validator for ScriptedValidator {
    async fn validate(&self, joint: &Joint) -> ValidationOutcome {
        {
            let mut calls = self.calls.lock();
            let count = calls.entry(joint.id().clone()).or_default();
            *count = count.saturating_add(1);
        }

        yield_now().await;

        let verdict = self.verdicts.lock().get(joint.id()).copied();

        match verdict {
            Some(verdict) => verdict(),
            None => self.basic.validate(joint).await,
        }
    }
}

struct Harness {
    node: Node,
    store: Arc<MemoryStore>,
    validator: Arc<ScriptedValidator>,
    _events: mpsc::Receiver<NetworkEvent>,
}

fn harness() -> Harness {
    harness_with(NetworkConfig::default())
}

fn harness_with(config: NetworkConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let (network, events) = NetworkClient::new(
        config.clone(),
        Arc::clone(&store) as Arc<dyn PeerDirectory>,
    );

    let validator = Arc::new(ScriptedValidator {
        basic: BasicValidator::new(Arc::clone(&store), Some(UnitId::from(GENESIS))),
        verdicts: Mutex::default(),
        calls: Mutex::default(),
    });
    let catchup = Arc::new(BasicCatchup::new(Arc::clone(&store)));

    let collaborators = Collaborators::new(
        Arc::clone(&store),
        Arc::clone(&validator) as Arc<dyn Validator>,
        catchup,
    );

    let config = NodeConfig::new(config, Vec::new(), Some(UnitId::from(GENESIS)));
    let node = Node::new(&config, network, collaborators);

    Harness {
        node,
        store,
        validator,
        _events: events,
    }
}

impl Harness {
    fn connect(
        &self,
        direction: Direction,
        peer: &str,
    ) -> (Arc<Session>, mpsc::UnboundedReceiver<Outgoing>) {
        let (session, outgoing) = Session::detached(direction, peer);
        self.node.network().attach(Arc::clone(&session));
        (session, outgoing)
    }

    /// An outbound peer we subscribed to.
    fn source(&self, url: &str) -> (Arc<Session>, mpsc::UnboundedReceiver<Outgoing>) {
        let (session, outgoing) = self.connect(Direction::Outbound, url);
        session.update_flags(|flags| flags.source = true);
        (session, outgoing)
    }

    async fn say(&self, session: &Arc<Session>, subject: Subject, body: Value) {
        self.node
            .handle_event(NetworkEvent::Justsaying {
                session: Arc::clone(session),
                justsaying: Justsaying::new(subject, body),
            })
            .await;
        settle().await;
    }

    async fn ask(&self, session: &Arc<Session>, command: Command, params: Option<Value>) {
        let request = Request::new(command, params);
        assert!(session.begin_response(&request.tag), "tag is free");

        self.node
            .handle_event(NetworkEvent::Request {
                session: Arc::clone(session),
                request,
            })
            .await;
        settle().await;
    }

    /// Answers a request we sent as if `session` had replied.
    async fn answer(&self, session: &Arc<Session>, request: &Request, body: Value) {
        let frame = Frame::Response(Response::new(request.tag.clone(), Some(body)));
        let text = encode(&frame).unwrap();
        self.node.network().receive(session, &text).await;
        settle().await;
    }
}

/// Lets spawned reply handlers run to completion.
async fn settle() {
    for _ in 0..50 {
        yield_now().await;
    }
}

fn joint(unit: &str, parents: &[&str]) -> Joint {
    serde_json::from_value(json!({
        "unit": {
            "unit": unit,
            "parent_units": parents,
            "authors": [{ "address": ADDRESS }],
        }
    }))
    .unwrap()
}

fn joint_value(unit: &str, parents: &[&str]) -> Value {
    serde_json::to_value(joint(unit, parents)).unwrap()
}

fn drain(outgoing: &mut mpsc::UnboundedReceiver<Outgoing>) -> Vec<Outgoing> {
    let mut items = Vec::new();

    while let Ok(item) = outgoing.try_recv() {
        items.push(item);
    }

    items
}

fn frames(items: &[Outgoing]) -> Vec<&Frame> {
    items
        .iter()
        .filter_map(|item| match item {
            Outgoing::Frame(frame) => Some(frame),
            Outgoing::Close(..) => None,
        })
        .collect()
}

fn notices<'a>(items: &'a [Outgoing], subject: Subject) -> Vec<&'a Value> {
    let subject = subject.to_string();

    frames(items)
        .into_iter()
        .filter_map(|frame| match frame {
            Frame::Justsaying(justsaying) if justsaying.subject == subject => {
                Some(&justsaying.body)
            }
            _ => None,
        })
        .collect()
}

fn requests(items: &[Outgoing]) -> Vec<&Request> {
    frames(items)
        .into_iter()
        .filter_map(|frame| match frame {
            Frame::Request(request) => Some(request),
            _ => None,
        })
        .collect()
}

fn responses(items: &[Outgoing]) -> Vec<Option<&Value>> {
    frames(items)
        .into_iter()
        .filter_map(|frame| match frame {
            Frame::Response(response) => Some(response.response.as_ref()),
            _ => None,
        })
        .collect()
}

fn closes(items: &[Outgoing]) -> Vec<(u16, &str)> {
    items
        .iter()
        .filter_map(|item| match item {
            Outgoing::Close(code, reason) => Some((*code, reason.as_str())),
            Outgoing::Frame(_) => None,
        })
        .collect()
}
