//! Minimal collaborators over [`MemoryStore`], good enough to run a node
//! that relays and catches up without judging units on their merits.

use std::sync::Arc;

use async_trait::async_trait;
use jointmesh_network_primitives::catchup::{CatchupChain, CatchupRequest, HashTreeRequest};
use jointmesh_node_primitives::catchup::{CatchupOutcome, CatchupValidator};
use jointmesh_node_primitives::validation::{ValidationLock, ValidationOutcome, Validator};
use jointmesh_primitives::ball::HashTreeBall;
use jointmesh_primitives::id::UnitId;
use jointmesh_primitives::joint::Joint;
use jointmesh_store::memory::MemoryStore;
use jointmesh_store::types::{JointStatus, ValidationState};
use jointmesh_store::{CatchupStore, JointStore};

/// Accepts a unit once all of its parents are saved. Only the genesis unit
/// may have no parents.
#[derive(Debug)]
pub struct BasicValidator {
    store: Arc<MemoryStore>,
    genesis: Option<UnitId>,
}

impl BasicValidator {
    #[must_use]
    pub const fn new(store: Arc<MemoryStore>, genesis: Option<UnitId>) -> Self {
        Self { store, genesis }
    }
}

#[async_trait]
impl Validator for BasicValidator {
    async fn validate(&self, joint: &Joint) -> ValidationOutcome {
        let parents = joint.parents();

        if parents.is_empty() {
            if self.genesis.as_ref() != Some(joint.id()) {
                return ValidationOutcome::UnitError("unit has no parents".to_owned());
            }
        } else {
            let mut missing = Vec::new();

            for parent in parents {
                match self.store.check_new_unit(parent).await {
                    Ok(JointStatus::Known) => {}
                    Ok(JointStatus::KnownBad) => {
                        return ValidationOutcome::UnitError(format!(
                            "parent unit {parent} is known bad"
                        ));
                    }
                    Ok(JointStatus::New | JointStatus::KnownUnverified) => {
                        missing.push(parent.clone());
                    }
                    Err(err) => return ValidationOutcome::TransientError(format!("{err:#}")),
                }
            }

            if !missing.is_empty() {
                return ValidationOutcome::NeedParentUnits(missing);
            }
        }

        if joint.is_unsigned() {
            return ValidationOutcome::OkUnsigned { serial: true };
        }

        ValidationOutcome::Ok {
            state: ValidationState::default(),
            lock: ValidationLock::none(),
        }
    }
}

/// Serves and follows catch-up chains made of the stable balls in the
/// store. Main chain indexes are local save order, so this only lines up
/// between nodes that saved the same units in the same order.
#[derive(Debug)]
pub struct BasicCatchup {
    store: Arc<MemoryStore>,
}

impl BasicCatchup {
    #[must_use]
    pub const fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CatchupValidator for BasicCatchup {
    async fn prepare_catchup_chain(
        &self,
        request: &CatchupRequest,
    ) -> Result<CatchupChain, String> {
        let last_stable_mci = self
            .store
            .last_stable_mci()
            .await
            .map_err(|err| format!("{err:#}"))?;

        if request.last_known_mci >= last_stable_mci {
            return Ok(CatchupChain::current());
        }

        Ok(CatchupChain {
            stable_last_ball_joints: self
                .store
                .stable_ball_joints_after(request.last_stable_mci),
            ..CatchupChain::default()
        })
    }

    async fn process_catchup_chain(&self, chain: &CatchupChain, _peer: &str) -> CatchupOutcome {
        if chain.status.is_some() {
            return CatchupOutcome::Current;
        }

        let Some(balls) = chain
            .stable_last_ball_joints
            .iter()
            .map(|joint| joint.ball.clone())
            .collect::<Option<Vec<_>>>()
        else {
            return CatchupOutcome::Error("stable last ball joint without a ball".to_owned());
        };

        if balls.is_empty() {
            return CatchupOutcome::Current;
        }

        match self.store.add_chain_balls(&balls).await {
            Ok(()) => CatchupOutcome::Ok,
            Err(err) => CatchupOutcome::Error(format!("{err:#}")),
        }
    }

    async fn read_hash_tree(&self, request: &HashTreeRequest) -> Result<Vec<HashTreeBall>, String> {
        self.store
            .hash_tree_between(&request.from_ball, &request.to_ball)
            .ok_or_else(|| "some balls not found".to_owned())
    }

    async fn process_hash_tree(&self, balls: &[HashTreeBall]) -> Result<(), String> {
        let chain = self
            .store
            .first_chain_balls(2)
            .await
            .map_err(|err| format!("{err:#}"))?;

        let [from_ball, to_ball] = chain.as_slice() else {
            return Err("no hash tree expected".to_owned());
        };

        if balls.last().map(|ball| &ball.ball) != Some(to_ball) {
            return Err("hash tree doesn't end with the next chain ball".to_owned());
        }

        self.store
            .add_hash_tree_balls(balls)
            .await
            .map_err(|err| format!("{err:#}"))?;

        self.store
            .remove_chain_ball(from_ball)
            .await
            .map_err(|err| format!("{err:#}"))
    }
}
