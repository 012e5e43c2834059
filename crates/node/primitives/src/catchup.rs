use async_trait::async_trait;
use jointmesh_network_primitives::catchup::{CatchupChain, CatchupRequest, HashTreeRequest};
use jointmesh_primitives::ball::HashTreeBall;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CatchupOutcome {
    Error(String),
    /// The chain was accepted and its balls queued for hash-tree requests.
    Ok,
    /// We already know everything the chain proves.
    Current,
}

/// Builds and checks the proofs exchanged while catching up.
#[async_trait]
pub trait CatchupValidator: Send + Sync {
    async fn prepare_catchup_chain(&self, request: &CatchupRequest)
        -> Result<CatchupChain, String>;

    async fn process_catchup_chain(&self, chain: &CatchupChain, peer: &str) -> CatchupOutcome;

    async fn read_hash_tree(&self, request: &HashTreeRequest)
        -> Result<Vec<HashTreeBall>, String>;

    /// Verifies the balls against the chain and queues them.
    async fn process_hash_tree(&self, balls: &[HashTreeBall]) -> Result<(), String>;
}
