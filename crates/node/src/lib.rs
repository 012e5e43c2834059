//! Joint admission, catch-up and message handling on top of
//! [`jointmesh_network`].
//!
//! [`start`] runs a node until its network shuts down. [`Node`] is the
//! handle everything else goes through: it owns the collaborators the sync
//! layer delegates to and the state shared by all sessions.

#![allow(clippy::multiple_inherent_impl, reason = "better readability")]

use core::fmt;
use core::future::Future;
use core::pin::Pin;
use std::sync::Arc;

use eyre::{Result as EyreResult, WrapErr};
use jointmesh_network::{NetworkClient, NetworkConfig};
use jointmesh_node_primitives::catchup::CatchupValidator;
use jointmesh_node_primitives::events::NodeEvent;
use jointmesh_node_primitives::services::{
    HubService, IdleProbe, LightVendorService, NoopIdleProbe,
};
use jointmesh_node_primitives::validation::Validator;
use jointmesh_primitives::id::UnitId;
use jointmesh_store::{PeerDirectory, Store};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

use crate::queue::SessionQueues;
use crate::state::NodeState;

mod admission;
mod catchup;
mod handlers;
mod jobs;
mod light;
mod queue;
pub mod reference;
mod state;

#[cfg(test)]
#[path = "tests/mod.rs"]
mod tests;

type BoxedFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

const EVENT_CHANNEL_SIZE: usize = 256;

#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct NodeConfig {
    pub network: NetworkConfig,
    /// Seeded into the witness store when it is empty.
    pub witnesses: Vec<String>,
    /// The only unit that may be pushed with a ball.
    pub genesis_unit: Option<UnitId>,
}

impl NodeConfig {
    #[must_use]
    pub const fn new(
        network: NetworkConfig,
        witnesses: Vec<String>,
        genesis_unit: Option<UnitId>,
    ) -> Self {
        Self {
            network,
            witnesses,
            genesis_unit,
        }
    }
}

/// The subsystems the sync layer relies on without implementing them.
#[derive(Clone)]
pub struct Collaborators {
    store: Arc<dyn Store>,
    directory: Arc<dyn PeerDirectory>,
    validator: Arc<dyn Validator>,
    catchup: Arc<dyn CatchupValidator>,
    idle: Arc<dyn IdleProbe>,
    hub: Option<Arc<dyn HubService>>,
    light_vendor: Option<Arc<dyn LightVendorService>>,
}

impl Collaborators {
    pub fn new<S: Store + 'static>(
        store: Arc<S>,
        validator: Arc<dyn Validator>,
        catchup: Arc<dyn CatchupValidator>,
    ) -> Self {
        let directory: Arc<dyn PeerDirectory> = Arc::<S>::clone(&store);

        Self {
            store,
            directory,
            validator,
            catchup,
            idle: Arc::new(NoopIdleProbe),
            hub: None,
            light_vendor: None,
        }
    }

    #[must_use]
    pub fn with_idle_probe(mut self, idle: Arc<dyn IdleProbe>) -> Self {
        self.idle = idle;
        self
    }

    #[must_use]
    pub fn with_hub(mut self, hub: Arc<dyn HubService>) -> Self {
        self.hub = Some(hub);
        self
    }

    #[must_use]
    pub fn with_light_vendor(mut self, light_vendor: Arc<dyn LightVendorService>) -> Self {
        self.light_vendor = Some(light_vendor);
        self
    }

    #[must_use]
    pub fn directory(&self) -> &Arc<dyn PeerDirectory> {
        &self.directory
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("hub", &self.hub.is_some())
            .field("light_vendor", &self.light_vendor.is_some())
            .finish_non_exhaustive()
    }
}

/// Handle to a running node. Cheap to clone.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    network: NetworkClient,
    collaborators: Collaborators,
    genesis_unit: Option<UnitId>,
    events: broadcast::Sender<NodeEvent>,
    state: NodeState,
    serving_catchup: Mutex<()>,
    serving_hash_tree: Mutex<()>,
}

pub async fn start(config: NodeConfig, collaborators: Collaborators) -> EyreResult<()> {
    let (network, mut network_events) =
        jointmesh_network::run(config.network.clone(), Arc::clone(collaborators.directory()))
            .await?;

    let node = Node::new(&config, network, collaborators);

    node.seed_witnesses(&config.witnesses)
        .await
        .wrap_err("failed to seed witnesses")?;

    node.spawn_background_jobs();

    if node.network().is_light() {
        node.spawn_light_vendor_connection();
    }

    info!("node started");

    let mut queues = SessionQueues::new();

    while let Some(event) = network_events.recv().await {
        queues.push(&node, event);
    }

    info!("network shut down, stopping node");

    Ok(())
}

impl Node {
    #[must_use]
    pub fn new(config: &NodeConfig, network: NetworkClient, collaborators: Collaborators) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        Self {
            inner: Arc::new(NodeInner {
                network,
                collaborators,
                genesis_unit: config.genesis_unit.clone(),
                events,
                state: NodeState::new(),
                serving_catchup: Mutex::new(()),
                serving_hash_tree: Mutex::new(()),
            }),
        }
    }

    #[must_use]
    pub fn network(&self) -> &NetworkClient {
        &self.inner.network
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    #[must_use]
    pub fn is_catching_up(&self) -> bool {
        self.state().is_catching_up()
    }

    fn store(&self) -> &Arc<dyn Store> {
        &self.inner.collaborators.store
    }

    fn validator(&self) -> &Arc<dyn Validator> {
        &self.inner.collaborators.validator
    }

    fn catchup_validator(&self) -> &Arc<dyn CatchupValidator> {
        &self.inner.collaborators.catchup
    }

    /// The hub service, if this node runs as a hub.
    fn hub(&self) -> Option<&Arc<dyn HubService>> {
        self.inner
            .collaborators
            .hub
            .as_ref()
            .filter(|_| self.network().is_hub())
    }

    fn state(&self) -> &NodeState {
        &self.inner.state
    }

    fn emit(&self, event: NodeEvent) {
        // nobody listening is fine
        let _ignored = self.inner.events.send(event);
    }

    fn is_genesis(&self, unit: &UnitId) -> bool {
        self.inner.genesis_unit.as_ref() == Some(unit)
    }

    async fn seed_witnesses(&self, witnesses: &[String]) -> EyreResult<()> {
        if witnesses.is_empty() || !self.store().my_witnesses().await?.is_empty() {
            return Ok(());
        }

        debug!(count = witnesses.len(), "seeding witnesses from config");

        self.store().insert_witnesses(witnesses).await
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("network", &self.inner.network)
            .field("catching_up", &self.state().is_catching_up())
            .finish_non_exhaustive()
    }
}
