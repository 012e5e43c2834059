use core::fmt;
use std::sync::Arc;

use jointmesh_network_primitives::frame::{Command, Tag};
use jointmesh_store::PeerDirectory;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::NetworkConfig;
use crate::correlator::{RequestCorrelator, ResponseReceiver};
use crate::registry::ConnectionRegistry;
use crate::session::Session;
use crate::types::NetworkEvent;

const EVENT_CHANNEL_SIZE: usize = 256;

/// Handle to the network layer. Cheap to clone.
#[derive(Clone)]
pub struct NetworkClient {
    pub(crate) inner: Arc<Shared>,
}

pub(crate) struct Shared {
    pub(crate) config: NetworkConfig,
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) correlator: Arc<RequestCorrelator>,
    pub(crate) events: mpsc::Sender<NetworkEvent>,
}

impl NetworkClient {
    /// Builds the client without listening, dialing or starting any
    /// background job. See [`crate::run`] for a running network.
    #[must_use]
    pub fn new(
        config: NetworkConfig,
        directory: Arc<dyn PeerDirectory>,
    ) -> (Self, mpsc::Receiver<NetworkEvent>) {
        let (events, receiver) = mpsc::channel(EVENT_CHANNEL_SIZE);

        let registry = Arc::new(ConnectionRegistry::new(
            directory,
            config.quality.max_tolerated_invalid_ratio,
        ));

        let correlator = Arc::new(RequestCorrelator::new(
            Arc::clone(&registry),
            config.timeouts,
        ));

        let client = Self {
            inner: Arc::new(Shared {
                config,
                registry,
                correlator,
                events,
            }),
        };

        (client, receiver)
    }

    #[must_use]
    pub fn config(&self) -> &NetworkConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn directory(&self) -> &Arc<dyn PeerDirectory> {
        self.inner.registry.directory()
    }

    #[must_use]
    pub fn is_light(&self) -> bool {
        self.inner.config.mode.light
    }

    #[must_use]
    pub fn is_hub(&self) -> bool {
        self.inner.config.mode.hub
    }

    /// Sends a request and returns a handle to await its reply. Identical
    /// requests pending on the same session are sent only once.
    pub fn request(
        &self,
        session: &Arc<Session>,
        command: Command,
        params: Option<Value>,
        reroutable: bool,
    ) -> ResponseReceiver {
        self.inner
            .correlator
            .send(session, command, params, reroutable)
    }

    pub fn request_as<T: Serialize>(
        &self,
        session: &Arc<Session>,
        command: Command,
        params: &T,
        reroutable: bool,
    ) -> ResponseReceiver {
        let params = serde_json::to_value(params)
            .inspect_err(|err| warn!(%err, %command, "failed to encode request params"))
            .ok();

        self.request(session, command, params, reroutable)
    }

    pub async fn select_next_peer(&self, current: Option<&Session>) -> Option<Arc<Session>> {
        self.inner.registry.select_next_peer(current).await
    }

    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner.registry.sessions()
    }

    #[must_use]
    pub fn outbound(&self) -> Vec<Arc<Session>> {
        self.inner.registry.outbound()
    }

    #[must_use]
    pub fn inbound(&self) -> Vec<Arc<Session>> {
        self.inner.registry.inbound()
    }

    /// `(inbound, outbound)`.
    #[must_use]
    pub fn connection_counts(&self) -> (usize, usize) {
        self.inner.registry.counts()
    }

    #[must_use]
    pub fn session_by_peer(&self, peer: &str) -> Option<Arc<Session>> {
        self.inner.registry.by_peer(peer)
    }

    #[must_use]
    pub fn outbound_by_url(&self, url: &str) -> Option<Arc<Session>> {
        self.inner.registry.outbound_by_url(url)
    }

    /// Whether an identical request is waiting for an answer on any session.
    #[must_use]
    pub fn has_pending_request(&self, command: Command, params: Option<&Value>) -> bool {
        let tag = Tag::of(command.as_ref(), params);

        self.inner
            .registry
            .sessions()
            .iter()
            .any(|session| session.has_pending_tag(&tag))
    }

    /// Registers a session created with [`Session::detached`] as if it had
    /// just connected.
    #[cfg(any(test, feature = "testing"))]
    pub fn attach(&self, session: Arc<Session>) {
        self.inner.registry.register(session);
    }

    /// Feeds a wire frame to the network layer as if `session` had received
    /// it.
    #[cfg(any(test, feature = "testing"))]
    pub async fn receive(&self, session: &Arc<Session>, text: &str) {
        self.dispatch_frame(session, text).await;
    }

    /// Tears a session down as if its socket had closed.
    #[cfg(any(test, feature = "testing"))]
    pub async fn detach(&self, session: &Arc<Session>) {
        self.session_closed(session).await;
    }
}

impl fmt::Debug for NetworkClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (inbound, outbound) = self.connection_counts();

        f.debug_struct("NetworkClient")
            .field("inbound", &inbound)
            .field("outbound", &outbound)
            .finish_non_exhaustive()
    }
}
