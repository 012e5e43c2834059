//! Tagged request/response exchange over sessions.
//!
//! Every request carries the content hash of its `{command, params}` as tag.
//! Identical requests on one session share one wire request; every caller
//! still gets the answer. Reroutable requests that stall are sent to the
//! next peer as well, and the first answer from any of them completes all
//! callers exactly once.

use std::collections::HashMap;
use std::sync::Arc;

use jointmesh_network_primitives::frame::{response_error, Command, Frame, Request, Response, Tag};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::config::TimeoutConfig;
use crate::registry::ConnectionRegistry;
use crate::session::Session;

pub const RESPONSE_TIMEOUT_ERROR: &str = "[internal] response timeout";
pub const CONNECTION_CLOSED_ERROR: &str = "[internal] connection closed";

/// The answer to a request, or a synthetic error if none came.
#[derive(Clone, Debug)]
pub struct Reply {
    /// The session that answered, or the one the request failed on.
    pub session: Arc<Session>,
    pub request: Request,
    pub response: Option<Value>,
}

impl Reply {
    fn failed(session: &Arc<Session>, request: &Request, error: &str) -> Self {
        Self {
            session: Arc::clone(session),
            request: request.clone(),
            response: Some(json!({ "error": error })),
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<&str> {
        response_error(self.response.as_ref())
    }

    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(self.response.as_ref().unwrap_or(&Value::Null))
    }
}

/// One caller waiting for a reply. Fires at most once no matter how many
/// sessions the request was sent over.
#[derive(Debug)]
pub(crate) struct Waiter {
    sender: Mutex<Option<oneshot::Sender<Reply>>>,
}

impl Waiter {
    fn new() -> (Arc<Self>, oneshot::Receiver<Reply>) {
        let (sender, receiver) = oneshot::channel();

        let waiter = Arc::new(Self {
            sender: Mutex::new(Some(sender)),
        });

        (waiter, receiver)
    }

    fn fire(&self, reply: Reply) {
        if let Some(sender) = self.sender.lock().take() {
            let _ignored = sender.send(reply);
        }
    }

    fn is_fired(&self) -> bool {
        self.sender.lock().is_none()
    }
}

#[derive(Debug)]
pub struct ResponseReceiver {
    session: Arc<Session>,
    request: Request,
    receiver: oneshot::Receiver<Reply>,
}

impl ResponseReceiver {
    pub async fn recv(self) -> Reply {
        match self.receiver.await {
            Ok(reply) => reply,
            Err(_) => Reply::failed(&self.session, &self.request, CONNECTION_CLOSED_ERROR),
        }
    }

    #[must_use]
    pub fn tag(&self) -> &Tag {
        &self.request.tag
    }
}

pub(crate) struct PendingRequest {
    pub(crate) request: Request,
    reroutable: bool,
    rerouted: bool,
    waiters: Vec<Arc<Waiter>>,
    stall_timer: Option<AbortHandle>,
    response_timer: AbortHandle,
}

impl PendingRequest {
    fn cancel_timers(&self) {
        if let Some(timer) = &self.stall_timer {
            timer.abort();
        }
        self.response_timer.abort();
    }
}

fn merge_waiters(into: &mut Vec<Arc<Waiter>>, from: Vec<Arc<Waiter>>) {
    for waiter in from {
        if !into.iter().any(|known| Arc::ptr_eq(known, &waiter)) {
            into.push(waiter);
        }
    }
}

fn fail_waiters(waiters: Vec<Arc<Waiter>>, session: &Arc<Session>, request: &Request, error: &str) {
    let reply = Reply::failed(session, request, error);

    for waiter in waiters {
        waiter.fire(reply.clone());
    }
}

pub(crate) struct RequestCorrelator {
    registry: Arc<ConnectionRegistry>,
    timeouts: TimeoutConfig,
    /// Sessions holding a copy of a rerouted request, by tag.
    links: Mutex<HashMap<Tag, Vec<Arc<Session>>>>,
}

impl RequestCorrelator {
    pub(crate) fn new(registry: Arc<ConnectionRegistry>, timeouts: TimeoutConfig) -> Self {
        Self {
            registry,
            timeouts,
            links: Mutex::default(),
        }
    }

    pub(crate) fn send(
        self: &Arc<Self>,
        session: &Arc<Session>,
        command: Command,
        params: Option<Value>,
        reroutable: bool,
    ) -> ResponseReceiver {
        let request = Request::new(command, params);
        let (waiter, receiver) = Waiter::new();

        self.dispatch(session, request.clone(), reroutable, vec![waiter]);

        ResponseReceiver {
            session: Arc::clone(session),
            request,
            receiver,
        }
    }

    fn dispatch(
        self: &Arc<Self>,
        session: &Arc<Session>,
        request: Request,
        reroutable: bool,
        waiters: Vec<Arc<Waiter>>,
    ) {
        let tag = request.tag.clone();

        {
            let mut state = session.state.lock();

            if state.closed {
                drop(state);
                fail_waiters(waiters, session, &request, CONNECTION_CLOSED_ERROR);
                return;
            }

            if let Some(pending) = state.pending.get_mut(&tag) {
                debug!(peer = %session.peer(), %tag, command = %request.command, "joining pending request");
                merge_waiters(&mut pending.waiters, waiters);
                return;
            }

            let stall_timer = reroutable.then(|| {
                tokio::spawn(Arc::clone(self).stall_after(Arc::clone(session), tag.clone()))
                    .abort_handle()
            });

            let response_timer =
                tokio::spawn(Arc::clone(self).expire_after(Arc::clone(session), tag.clone()))
                    .abort_handle();

            drop(state.pending.insert(
                tag,
                PendingRequest {
                    request: request.clone(),
                    reroutable,
                    rerouted: false,
                    waiters,
                    stall_timer,
                    response_timer,
                },
            ));
        }

        debug!(peer = %session.peer(), command = %request.command, tag = %request.tag, "sending request");

        session.send(Frame::Request(request));
    }

    async fn stall_after(self: Arc<Self>, session: Arc<Session>, tag: Tag) {
        sleep(self.timeouts.stall).await;

        self.reroute(&session, &tag).await;
    }

    async fn reroute(self: &Arc<Self>, session: &Arc<Session>, tag: &Tag) {
        let Some(next) = self.registry.select_next_peer(Some(session.as_ref())).await else {
            debug!(peer = %session.peer(), %tag, "stalled request has nowhere to go");
            return;
        };

        if next.id() == session.id() || self.is_linked(tag, &next) {
            debug!(peer = %session.peer(), %tag, "stalled request already went to the next peer");
            return;
        }

        let Some((request, waiters)) = self.mark_rerouted(session, tag, &next) else {
            return;
        };

        info!(from = %session.peer(), to = %next.peer(), command = %request.command, "rerouting stalled request");

        self.dispatch(&next, request, true, waiters);
    }

    /// Flags the pending request as rerouted and links it to `next` under
    /// the same lock, so a close in between hands its waiters over instead
    /// of failing them.
    fn mark_rerouted(
        &self,
        session: &Arc<Session>,
        tag: &Tag,
        next: &Arc<Session>,
    ) -> Option<(Request, Vec<Arc<Waiter>>)> {
        let mut state = session.state.lock();

        let pending = state.pending.get_mut(tag)?;

        if pending.rerouted {
            return None;
        }
        pending.rerouted = true;

        self.link(tag, session, next);

        Some((pending.request.clone(), pending.waiters.clone()))
    }

    async fn expire_after(self: Arc<Self>, session: Arc<Session>, tag: Tag) {
        sleep(self.timeouts.response).await;

        let Some(pending) = session.state.lock().pending.remove(&tag) else {
            return;
        };

        if let Some(timer) = &pending.stall_timer {
            timer.abort();
        }

        debug!(peer = %session.peer(), %tag, command = %pending.request.command, "request timed out");

        self.unlink(&tag, &session);

        fail_waiters(pending.waiters, &session, &pending.request, RESPONSE_TIMEOUT_ERROR);
    }

    /// Delivers a response to everyone waiting for it and cancels the copies
    /// of the request on other sessions.
    pub(crate) fn complete(&self, session: &Arc<Session>, response: Response) {
        let tag = response.tag.clone();

        let Some(pending) = session.state.lock().pending.remove(&tag) else {
            debug!(peer = %session.peer(), %tag, "no request by tag, answered elsewhere or timed out");
            return;
        };

        pending.cancel_timers();

        let reply = Reply {
            session: Arc::clone(session),
            request: pending.request,
            response: response.response,
        };

        for waiter in pending.waiters {
            waiter.fire(reply.clone());
        }

        let linked = self.links.lock().remove(&tag);

        for other in linked.into_iter().flatten() {
            if other.id() == session.id() {
                continue;
            }

            let Some(mirror) = other.state.lock().pending.remove(&tag) else {
                continue;
            };

            mirror.cancel_timers();

            for waiter in mirror.waiters {
                waiter.fire(reply.clone());
            }
        }
    }

    /// Fails or reroutes everything pending on a session that went away.
    pub(crate) async fn on_session_closed(self: &Arc<Self>, session: &Arc<Session>) {
        let drained: Vec<_> = {
            let mut state = session.state.lock();
            state.closed = true;
            state.preparing.clear();
            state.pending.drain().map(|(_, pending)| pending).collect()
        };

        for pending in &drained {
            pending.cancel_timers();
        }

        for pending in drained {
            let tag = pending.request.tag.clone();

            if pending.rerouted {
                let orphans = self.hand_over(&tag, session, pending.waiters);
                fail_waiters(orphans, session, &pending.request, CONNECTION_CLOSED_ERROR);
                continue;
            }

            if pending.reroutable {
                let next = self.registry.select_next_peer(Some(session.as_ref())).await;

                if let Some(next) = next.filter(|next| next.id() != session.id()) {
                    debug!(from = %session.peer(), to = %next.peer(), %tag, "rerouting request of closed session");

                    self.link(&tag, session, &next);
                    self.dispatch(&next, pending.request, true, pending.waiters);
                    continue;
                }
            }

            fail_waiters(pending.waiters, session, &pending.request, CONNECTION_CLOSED_ERROR);
        }

        self.links.lock().retain(|_, sessions| {
            sessions.retain(|other| other.id() != session.id());
            sessions.len() > 1
        });
    }

    /// Moves the waiters of a closed session's rerouted request to a live
    /// copy of it. Returns the waiters nobody took over.
    ///
    /// A linked live session without a pending copy is still being
    /// dispatched to, and that copy already carries these waiters.
    fn hand_over(&self, tag: &Tag, closed: &Session, waiters: Vec<Arc<Waiter>>) -> Vec<Arc<Waiter>> {
        let linked = self.links.lock().get(tag).cloned().unwrap_or_default();
        let mut in_flight = false;

        for other in linked.iter().filter(|other| other.id() != closed.id()) {
            let mut state = other.state.lock();

            if state.closed {
                continue;
            }

            if let Some(mirror) = state.pending.get_mut(tag) {
                merge_waiters(&mut mirror.waiters, waiters);
                return Vec::new();
            }

            in_flight = true;
        }

        if in_flight {
            return Vec::new();
        }

        waiters.into_iter().filter(|waiter| !waiter.is_fired()).collect()
    }

    fn link(&self, tag: &Tag, from: &Arc<Session>, to: &Arc<Session>) {
        let mut links = self.links.lock();
        let sessions = links.entry(tag.clone()).or_default();

        for session in [from, to] {
            if !sessions.iter().any(|other| other.id() == session.id()) {
                sessions.push(Arc::clone(session));
            }
        }
    }

    fn unlink(&self, tag: &Tag, session: &Session) {
        let mut links = self.links.lock();

        let Some(sessions) = links.get_mut(tag) else {
            return;
        };

        sessions.retain(|other| other.id() != session.id());

        if sessions.len() < 2 {
            drop(links.remove(tag));
        }
    }

    fn is_linked(&self, tag: &Tag, session: &Session) -> bool {
        self.links
            .lock()
            .get(tag)
            .is_some_and(|sessions| sessions.iter().any(|other| other.id() == session.id()))
    }
}

#[cfg(test)]
#[path = "tests/correlator.rs"]
mod tests;
