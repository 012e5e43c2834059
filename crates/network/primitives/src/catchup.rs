use jointmesh_primitives::ball::HashTreeBall;
use jointmesh_primitives::id::BallHash;
use jointmesh_primitives::joint::Joint;
use serde::{Deserialize, Serialize};

/// Params of the `catchup` request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchupRequest {
    pub witnesses: Vec<String>,
    pub last_stable_mci: u64,
    pub last_known_mci: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    /// The requester already knows everything the server has stabilized.
    Current,
}

/// Answer to `catchup`: proof of the main chain between the requester's
/// last stable point and the server's.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CatchupChain {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ChainStatus>,
    #[serde(default)]
    pub unstable_mc_joints: Vec<Joint>,
    #[serde(default)]
    pub stable_last_ball_joints: Vec<Joint>,
    #[serde(default)]
    pub witness_change_and_definition_joints: Vec<Joint>,
}

impl CatchupChain {
    #[must_use]
    pub fn current() -> Self {
        Self {
            status: Some(ChainStatus::Current),
            ..Self::default()
        }
    }
}

/// Params of the `get_hash_tree` request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashTreeRequest {
    pub from_ball: BallHash,
    pub to_ball: BallHash,
}

/// Answer to `get_hash_tree`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashTree {
    pub balls: Vec<HashTreeBall>,
}
