//! Persistent state consumed by the network layer.
//!
//! The traits describe the narrow interface the sync layer needs from the
//! storage and query engine. [`memory::MemoryStore`] implements all of them
//! in process memory.

use std::time::Duration;

use async_trait::async_trait;
use eyre::Result as EyreResult;
use jointmesh_primitives::ball::HashTreeBall;
use jointmesh_primitives::id::{BallHash, UnitId};
use jointmesh_primitives::joint::Joint;
use jointmesh_primitives::peer::PeerEvent;

pub mod memory;
pub mod types;

use types::{
    CandidateQuery, EventCounts, JointStatus, PurgedUnit, UnhandledJoint, ValidationState,
};

/// Known peers and their reputation, keyed by host.
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    async fn add_peer_host(&self, host: &str) -> EyreResult<()>;

    /// Records a dialable url. `learnt_from` is the host that told us about
    /// it, if any.
    async fn add_peer(&self, url: &str, learnt_from: Option<&str>) -> EyreResult<()>;

    async fn record_event(&self, host: &str, event: PeerEvent) -> EyreResult<()>;

    async fn recent_events(&self, host: &str, window: Duration) -> EyreResult<EventCounts>;

    async fn outbound_candidates(&self, query: &CandidateQuery) -> EyreResult<Vec<String>>;

    /// Picks one of `hosts` that has a verified url and acceptable quality,
    /// preferring hosts that sent good joints.
    async fn reversible_inbound_host(
        &self,
        hosts: &[String],
        max_invalid_ratio: f64,
    ) -> EyreResult<Option<String>>;

    /// The subset of `urls` with good joints and acceptable quality.
    async fn good_peers(&self, urls: &[String], max_invalid_ratio: f64)
        -> EyreResult<Vec<String>>;

    async fn mark_self(&self, url: &str) -> EyreResult<()>;

    async fn verified_url(&self, host: &str) -> EyreResult<Option<String>>;

    /// Makes `url` the only active verified url of `host`.
    async fn set_verified_url(&self, host: &str, url: &str) -> EyreResult<()>;
}

#[async_trait]
pub trait JointStore: Send + Sync {
    async fn check_new_unit(&self, unit: &UnitId) -> EyreResult<JointStatus>;

    async fn check_new_joint(&self, joint: &Joint) -> EyreResult<JointStatus>;

    async fn save_joint(&self, joint: &Joint, state: &ValidationState) -> EyreResult<()>;

    async fn save_known_bad_joint(&self, joint: &Joint, error: &str) -> EyreResult<()>;

    async fn read_joint(&self, unit: &UnitId) -> EyreResult<Option<Joint>>;

    /// Joints without children.
    async fn read_free_joints(&self) -> EyreResult<Vec<Joint>>;

    async fn read_joints_since_mci(&self, mci: u64) -> EyreResult<Vec<Joint>>;

    async fn last_main_chain_index(&self) -> EyreResult<u64>;

    async fn last_stable_mci(&self) -> EyreResult<u64>;

    async fn save_unhandled_joint(
        &self,
        joint: &Joint,
        missing_parents: &[UnitId],
        peer: Option<&str>,
    ) -> EyreResult<()>;

    async fn remove_unhandled_joint(&self, unit: &UnitId) -> EyreResult<()>;

    /// Unhandled joints all of whose dependencies are now saved. With a
    /// unit, only joints that depended on it are considered.
    async fn ready_dependent_joints(&self, unit: Option<&UnitId>)
        -> EyreResult<Vec<UnhandledJoint>>;

    /// Marks `joint` bad and removes it and everything depending on it from
    /// the unhandled set.
    async fn purge_joint_and_dependencies(
        &self,
        joint: &Joint,
        error: &str,
    ) -> EyreResult<Vec<PurgedUnit>>;

    /// Like [`Self::purge_joint_and_dependencies`] for a unit that does not
    /// exist.
    async fn purge_dependencies(&self, unit: &UnitId, error: &str) -> EyreResult<Vec<PurgedUnit>>;

    /// Missing parents nobody is holding, depended upon for longer than
    /// `older_than`.
    async fn lost_joints(&self, older_than: Duration) -> EyreResult<Vec<UnitId>>;

    async fn purge_old_unhandled_joints(&self, older_than: Duration) -> EyreResult<usize>;
}

#[async_trait]
pub trait CatchupStore: Send + Sync {
    /// Drops hash-tree balls whose units have been saved.
    async fn purge_handled_hash_tree_balls(&self) -> EyreResult<()>;

    /// Units of hash-tree balls that are not saved yet, in tree order.
    async fn hash_tree_units(&self) -> EyreResult<Vec<UnitId>>;

    async fn has_hash_tree_balls(&self) -> EyreResult<bool>;

    async fn add_hash_tree_balls(&self, balls: &[HashTreeBall]) -> EyreResult<()>;

    async fn first_chain_balls(&self, limit: usize) -> EyreResult<Vec<BallHash>>;

    async fn has_chain_balls(&self) -> EyreResult<bool>;

    async fn add_chain_balls(&self, balls: &[BallHash]) -> EyreResult<()>;

    async fn remove_chain_ball(&self, ball: &BallHash) -> EyreResult<()>;
}

#[async_trait]
pub trait WitnessStore: Send + Sync {
    async fn my_witnesses(&self) -> EyreResult<Vec<String>>;

    async fn insert_witnesses(&self, witnesses: &[String]) -> EyreResult<()>;
}

/// Addresses light clients asked us to watch.
#[async_trait]
pub trait LightWatchStore: Send + Sync {
    async fn watch_light_address(&self, peer: &str, address: &str) -> EyreResult<()>;

    async fn unwatch_light_peer(&self, peer: &str) -> EyreResult<()>;

    async fn light_peers_watching(&self, addresses: &[&str]) -> EyreResult<Vec<String>>;

    /// Light peers watching an address touched by a unit whose mci lies in
    /// `(from_mci, to_mci]`.
    async fn light_peers_with_updates(&self, from_mci: u64, to_mci: u64)
        -> EyreResult<Vec<String>>;

    async fn last_ball_mci_of_mci(&self, mci: u64) -> EyreResult<Option<u64>>;

    async fn joints_at_mci(&self, mci: u64) -> EyreResult<Vec<Joint>>;
}

pub trait Store: PeerDirectory + JointStore + CatchupStore + WitnessStore + LightWatchStore {}

impl<T> Store for T where T: PeerDirectory + JointStore + CatchupStore + WitnessStore + LightWatchStore
{}
