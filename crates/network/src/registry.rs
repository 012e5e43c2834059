use std::collections::HashMap;
use std::sync::Arc;

use jointmesh_store::PeerDirectory;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use rand::thread_rng;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::session::{Direction, Session, SessionId};

/// Outcome of a connection attempt shared with everyone who asked for the
/// same url while it was in flight.
pub(crate) type DialResult = Result<Arc<Session>, String>;

pub(crate) enum Connecting {
    /// The caller must dial and then call
    /// [`ConnectionRegistry::finish_connecting`].
    Started,
    Waiting(oneshot::Receiver<DialResult>),
}

/// The live set of sessions.
pub(crate) struct ConnectionRegistry {
    directory: Arc<dyn PeerDirectory>,
    max_invalid_ratio: f64,
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, Arc<Session>>,
    /// Outbound sessions in the order they were established.
    outbound: Vec<SessionId>,
    inbound: Vec<SessionId>,
    connecting: HashMap<String, Vec<oneshot::Sender<DialResult>>>,
}

impl ConnectionRegistry {
    pub(crate) fn new(directory: Arc<dyn PeerDirectory>, max_invalid_ratio: f64) -> Self {
        Self {
            directory,
            max_invalid_ratio,
            inner: RwLock::default(),
        }
    }

    pub(crate) fn directory(&self) -> &Arc<dyn PeerDirectory> {
        &self.directory
    }

    pub(crate) fn register(&self, session: Arc<Session>) {
        let mut inner = self.inner.write();

        let id = session.id();
        match session.direction() {
            Direction::Outbound => inner.outbound.push(id),
            Direction::Inbound => inner.inbound.push(id),
        }

        drop(inner.sessions.insert(id, session));
    }

    /// Returns `false` if the session was not registered.
    pub(crate) fn remove(&self, session: &Session) -> bool {
        let mut inner = self.inner.write();

        let id = session.id();
        inner.outbound.retain(|other| *other != id);
        inner.inbound.retain(|other| *other != id);

        inner.sessions.remove(&id).is_some()
    }

    pub(crate) fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.inner.read().sessions.get(&id).cloned()
    }

    pub(crate) fn sessions(&self) -> Vec<Arc<Session>> {
        let inner = self.inner.read();

        let sessions = inner
            .outbound
            .iter()
            .chain(&inner.inbound)
            .filter_map(|id| inner.sessions.get(id).cloned())
            .collect();

        sessions
    }

    pub(crate) fn outbound(&self) -> Vec<Arc<Session>> {
        let inner = self.inner.read();

        let sessions = inner
            .outbound
            .iter()
            .filter_map(|id| inner.sessions.get(id).cloned())
            .collect();

        sessions
    }

    pub(crate) fn inbound(&self) -> Vec<Arc<Session>> {
        let inner = self.inner.read();

        let sessions = inner
            .inbound
            .iter()
            .filter_map(|id| inner.sessions.get(id).cloned())
            .collect();

        sessions
    }

    /// `(inbound, outbound)`.
    pub(crate) fn counts(&self) -> (usize, usize) {
        let inner = self.inner.read();
        (inner.inbound.len(), inner.outbound.len())
    }

    pub(crate) fn outbound_by_url(&self, url: &str) -> Option<Arc<Session>> {
        self.outbound()
            .into_iter()
            .find(|session| session.peer() == url)
    }

    pub(crate) fn by_peer(&self, peer: &str) -> Option<Arc<Session>> {
        self.sessions()
            .into_iter()
            .find(|session| session.peer() == peer)
    }

    pub(crate) fn outbound_urls(&self) -> Vec<String> {
        self.outbound()
            .iter()
            .map(|session| session.peer().to_owned())
            .collect()
    }

    pub(crate) fn inbound_hosts(&self) -> Vec<String> {
        self.inbound()
            .iter()
            .map(|session| session.host().to_owned())
            .collect()
    }

    pub(crate) fn begin_connecting(&self, url: &str) -> Connecting {
        let mut inner = self.inner.write();

        if let Some(waiters) = inner.connecting.get_mut(url) {
            let (sender, receiver) = oneshot::channel();
            waiters.push(sender);
            return Connecting::Waiting(receiver);
        }

        drop(inner.connecting.insert(url.to_owned(), Vec::new()));

        Connecting::Started
    }

    pub(crate) fn finish_connecting(&self, url: &str, result: &DialResult) {
        let waiters = self.inner.write().connecting.remove(url);

        for waiter in waiters.into_iter().flatten() {
            let _ignored = waiter.send(result.clone());
        }
    }

    pub(crate) fn is_connecting(&self, url: &str) -> bool {
        self.inner.read().connecting.contains_key(url)
    }

    /// Picks the peer to ask after `current` failed to answer.
    ///
    /// Outbound gossip sources are rotated round-robin starting after
    /// `current`, or at random if `current` is not one of them. Without
    /// outbound sources an inbound source with acceptable quality is picked.
    pub(crate) async fn select_next_peer(&self, current: Option<&Session>) -> Option<Arc<Session>> {
        let sources: Vec<_> = self
            .outbound()
            .into_iter()
            .filter(|session| session.flags().source && !session.is_closed())
            .collect();

        if !sources.is_empty() {
            let position = current.and_then(|current| {
                sources
                    .iter()
                    .position(|session| session.id() == current.id())
            });

            let next = match position {
                Some(index) => sources.get((index + 1) % sources.len()).cloned(),
                None => sources.choose(&mut thread_rng()).cloned(),
            };

            return next;
        }

        let mut candidates: Vec<_> = self
            .inbound()
            .into_iter()
            .filter(|session| session.flags().source && !session.is_closed())
            .collect();

        if candidates.is_empty() {
            debug!("no peers to select from");
            return None;
        }

        candidates.shuffle(&mut thread_rng());

        let hosts: Vec<_> = candidates
            .iter()
            .map(|session| session.host().to_owned())
            .collect();

        let host = match self
            .directory
            .reversible_inbound_host(&hosts, self.max_invalid_ratio)
            .await
        {
            Ok(host) => host?,
            Err(err) => {
                warn!(?err, "failed to rank inbound peers");
                return None;
            }
        };

        candidates.into_iter().find(|session| session.host() == host)
    }
}

#[cfg(test)]
#[path = "tests/registry.rs"]
mod tests;
