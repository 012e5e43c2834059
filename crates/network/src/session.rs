//! One live connection to a peer.
//!
//! A session is owned by the connection registry for as long as the socket
//! is open. Sending never blocks: frames are queued for the writer task and
//! silently dropped once the session is closed.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use jointmesh_network_primitives::frame::{
    Command, Frame, Justsaying, Response, Subject, Tag,
};
use jointmesh_network_primitives::payloads::{JointResult, VersionInfo};
use jointmesh_primitives::id::UnitId;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::correlator::PendingRequest;

pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Work for a session's writer task.
#[derive(Debug)]
pub enum Outgoing {
    Frame(Frame),
    Close(u16, String),
}

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

#[derive(Clone, Debug, Default)]
pub struct SessionFlags {
    /// The peer subscribed to our joints.
    pub subscribed: bool,
    /// The peer accepted our subscription, so it is a source of joints.
    pub source: bool,
    pub waiting_for_catchup_chain: bool,
    pub light_vendor: bool,
    /// Our own subscription id while the subscription is being answered.
    pub subscription_id: Option<String>,
    /// The peer already sent `my_url` on this connection.
    pub advertised_own_url: bool,
    /// Url an inbound peer claims to be reachable at, not yet verified.
    pub claimed_url: Option<String>,
    /// Echo string sent to verify a claimed url.
    pub sent_echo_string: Option<String>,
    pub challenge: Option<String>,
}

pub struct Session {
    id: SessionId,
    direction: Direction,
    peer: String,
    host: String,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    last_activity: Mutex<Instant>,
    pub(crate) state: Mutex<SessionState>,
}

#[derive(Default)]
pub(crate) struct SessionState {
    pub(crate) flags: SessionFlags,
    pub(crate) pending: HashMap<Tag, PendingRequest>,
    /// Tags of incoming requests we are still answering.
    pub(crate) preparing: HashSet<Tag>,
    pub(crate) closed: bool,
}

impl Session {
    pub(crate) fn new(
        direction: Direction,
        peer: String,
        host: String,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outgoing>) {
        let (outgoing, receiver) = mpsc::unbounded_channel();

        let session = Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            direction,
            peer,
            host,
            outgoing,
            last_activity: Mutex::new(Instant::now()),
            state: Mutex::default(),
        });

        (session, receiver)
    }

    /// A session without a socket; everything it sends lands in the
    /// returned receiver.
    #[cfg(any(test, feature = "testing"))]
    #[must_use]
    pub fn detached(
        direction: Direction,
        peer: &str,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outgoing>) {
        let host = jointmesh_primitives::peer::host_of(peer).to_owned();
        Self::new(direction, peer.to_owned(), host)
    }

    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    #[must_use]
    pub fn is_inbound(&self) -> bool {
        self.direction == Direction::Inbound
    }

    #[must_use]
    pub fn is_outbound(&self) -> bool {
        self.direction == Direction::Outbound
    }

    /// Url for outbound sessions, `ip:port` for inbound ones.
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn flags(&self) -> SessionFlags {
        self.state.lock().flags.clone()
    }

    pub fn update_flags<R>(&self, f: impl FnOnce(&mut SessionFlags) -> R) -> R {
        f(&mut self.state.lock().flags)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_activity.lock())
    }

    /// Whether a request for `command` is waiting for an answer on this
    /// session.
    #[must_use]
    pub fn has_pending_command(&self, command: Command) -> bool {
        self.state
            .lock()
            .pending
            .values()
            .any(|pending| pending.request.command == command.as_ref())
    }

    #[must_use]
    pub fn has_pending_tag(&self, tag: &Tag) -> bool {
        self.state.lock().pending.contains_key(tag)
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Marks an incoming request as being answered. Returns `false` if an
    /// identical request is already being answered.
    #[must_use]
    pub fn begin_response(&self, tag: &Tag) -> bool {
        self.state.lock().preparing.insert(tag.clone())
    }

    /// Whether an incoming request is still waiting for its response.
    #[must_use]
    pub fn is_answering(&self, tag: &Tag) -> bool {
        self.state.lock().preparing.contains(tag)
    }

    pub fn send(&self, frame: Frame) {
        if self.is_closed() {
            debug!(peer = %self.peer, "dropping frame for closed session");
            return;
        }

        if self.outgoing.send(Outgoing::Frame(frame)).is_err() {
            debug!(peer = %self.peer, "writer is gone");
        }
    }

    pub fn send_justsaying(&self, subject: Subject, body: Value) {
        self.send(Frame::Justsaying(Justsaying::new(subject, body)));
    }

    pub fn send_justsaying_as<T: Serialize>(&self, subject: Subject, body: &T) {
        match serde_json::to_value(body) {
            Ok(body) => self.send_justsaying(subject, body),
            Err(err) => warn!(%err, %subject, "failed to encode notice"),
        }
    }

    pub fn send_version(&self) {
        self.send_justsaying_as(Subject::Version, &VersionInfo::current());
    }

    pub fn send_error(&self, error: &str) {
        self.send_justsaying(Subject::Error, Value::from(error));
    }

    pub fn send_info(&self, info: Value) {
        self.send_justsaying(Subject::Info, info);
    }

    pub fn send_result(&self, result: &JointResult) {
        self.send_justsaying_as(Subject::Result, result);
    }

    pub fn send_error_result(&self, unit: &UnitId, error: String) {
        self.send_result(&JointResult::error(unit.clone(), error));
    }

    /// Answers an incoming request and releases its tag for new identical
    /// requests.
    pub fn send_response(&self, tag: &Tag, response: Option<Value>) {
        let _removed = self.state.lock().preparing.remove(tag);
        self.send(Frame::Response(Response::new(tag.clone(), response)));
    }

    pub fn send_response_as<T: Serialize>(&self, tag: &Tag, response: &T) {
        match serde_json::to_value(response) {
            Ok(response) => self.send_response(tag, Some(response)),
            Err(err) => {
                warn!(%err, %tag, "failed to encode response");
                self.send_error_response(tag, "internal error");
            }
        }
    }

    pub fn send_error_response(&self, tag: &Tag, error: &str) {
        self.send_response(tag, Some(json!({ "error": error })));
    }

    /// Asks the writer to close the socket. Pending requests are dealt with
    /// once the reader observes the closure.
    pub fn close(&self, code: u16, reason: &str) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }

        debug!(peer = %self.peer, code, reason, "closing session");

        let _ignored = self.outgoing.send(Outgoing::Close(code, reason.to_owned()));
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}
