//! Catching up with the network when we are too far behind to resolve new
//! units parent by parent.
//!
//! The catch-up chain proves a sequence of checkpoint balls. Each pair of
//! consecutive checkpoints is then expanded into a hash tree whose units
//! are requested one by one. Both are persisted, so a restarted node picks
//! up where it stopped.

use core::time::Duration;
use std::sync::Arc;

use eyre::Result as EyreResult;
use jointmesh_network::correlator::Reply;
use jointmesh_network::session::Session;
use jointmesh_network_primitives::catchup::{
    CatchupChain, CatchupRequest, HashTree, HashTreeRequest,
};
use jointmesh_network_primitives::frame::{Command, Subject};
use jointmesh_node_primitives::catchup::CatchupOutcome;
use jointmesh_node_primitives::events::NodeEvent;
use serde_json::Value;
use tokio::spawn;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::handlers::Awaiting;
use crate::{BoxedFuture, Node};

/// How often to check whether the units of a hash tree have all arrived.
pub(crate) const HASH_TREE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How often to check whether the node is idle after catching up.
pub(crate) const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

impl Node {
    pub(crate) async fn request_catchup(&self, session: &Arc<Session>) -> EyreResult<()> {
        info!(peer = session.peer(), "will request catchup");

        self.emit(NodeEvent::CatchingUpStarted);

        let store = self.store();

        store.purge_handled_hash_tree_balls().await?;

        let leftover_units = store.hash_tree_units().await?;

        if !leftover_units.is_empty() {
            info!(count = leftover_units.len(), "resuming with units of the stored hash tree");

            self.state().set_catching_up(true);
            self.request_new_missing_joints(session, &leftover_units)
                .await?;
            self.wait_till_hash_tree_processed(Arc::clone(session));

            return Ok(());
        }

        if store.has_chain_balls().await? {
            info!("resuming with the stored catchup chain");

            self.state().set_catching_up(true);

            return self.request_next_hash_tree(session).await;
        }

        let params = CatchupRequest {
            witnesses: store.my_witnesses().await?,
            last_stable_mci: store.last_stable_mci().await?,
            last_known_mci: store.last_main_chain_index().await?,
        };

        self.set_waiting_for_catchup_chain(session, true);

        let receiver = self
            .network()
            .request_as(session, Command::Catchup, &params, true);

        self.spawn_reply_handler(receiver, Awaiting::CatchupChain(Arc::clone(session)));

        Ok(())
    }

    fn set_waiting_for_catchup_chain(&self, session: &Session, waiting: bool) {
        self.state().set_waiting_for_catchup_chain(waiting);
        session.update_flags(|flags| flags.waiting_for_catchup_chain = waiting);
    }

    /// The waiting flag belongs to `asked`, which need not be the session
    /// that answered once the request was rerouted.
    pub(crate) async fn handle_catchup_chain(
        &self,
        asked: &Session,
        reply: Reply,
    ) -> EyreResult<()> {
        let session = &reply.session;

        if let Some(error) = reply.error() {
            info!(peer = session.peer(), error, "catchup request failed");
            self.set_waiting_for_catchup_chain(asked, false);
            return Ok(());
        }

        let chain = match reply.parse::<CatchupChain>() {
            Ok(chain) => chain,
            Err(err) => {
                self.set_waiting_for_catchup_chain(asked, false);
                session.send_error(&format!("malformed catchup chain: {err}"));
                return Ok(());
            }
        };

        let outcome = self
            .catchup_validator()
            .process_catchup_chain(&chain, session.peer())
            .await;

        self.set_waiting_for_catchup_chain(asked, false);

        match outcome {
            CatchupOutcome::Error(error) => {
                warn!(peer = session.peer(), %error, "rejected catchup chain");
                session.send_error(&error);
            }
            CatchupOutcome::Ok => {
                info!(peer = session.peer(), "accepted catchup chain");
                self.state().set_catching_up(true);
                self.request_next_hash_tree(session).await?;
            }
            CatchupOutcome::Current => {
                info!(peer = session.peer(), "already caught up");
            }
        }

        Ok(())
    }

    pub(crate) async fn request_next_hash_tree(&self, session: &Arc<Session>) -> EyreResult<()> {
        let balls = self.store().first_chain_balls(2).await?;

        let (from_ball, to_ball) = match balls.as_slice() {
            [] => {
                self.come_online();
                return Ok(());
            }
            [last] => {
                self.store().remove_chain_ball(last).await?;
                self.come_online();
                return Ok(());
            }
            [from_ball, to_ball, ..] => (from_ball.clone(), to_ball.clone()),
        };

        if session.has_pending_command(Command::GetHashTree) {
            debug!(peer = session.peer(), "already requested a hash tree from this peer");
            return Ok(());
        }

        debug!(peer = session.peer(), %from_ball, %to_ball, "requesting hash tree");

        let params = HashTreeRequest { from_ball, to_ball };
        let receiver = self
            .network()
            .request_as(session, Command::GetHashTree, &params, true);

        self.spawn_reply_handler(receiver, Awaiting::HashTree);

        Ok(())
    }

    pub(crate) async fn handle_hash_tree(&self, reply: Reply) -> EyreResult<()> {
        let session = Arc::clone(&reply.session);

        if let Some(error) = reply.error() {
            info!(peer = session.peer(), error, "hash tree request failed");
            self.wait_till_hash_tree_processed(session);
            return Ok(());
        }

        let balls = match reply.parse::<HashTree>() {
            Ok(tree) => tree.balls,
            Err(err) => {
                session.send_error(&format!("malformed hash tree: {err}"));
                self.wait_till_hash_tree_processed(session);
                return Ok(());
            }
        };

        match self.catchup_validator().process_hash_tree(&balls).await {
            Ok(()) => {
                let units: Vec<_> = balls.into_iter().map(|ball| ball.unit).collect();
                debug!(peer = session.peer(), count = units.len(), "accepted hash tree");

                self.request_new_missing_joints(&session, &units).await?;
            }
            Err(error) => {
                warn!(peer = session.peer(), %error, "rejected hash tree");
                session.send_error(&error);
            }
        }

        self.wait_till_hash_tree_processed(session);

        Ok(())
    }

    /// Polls until every unit of the stored hash tree is saved, then asks
    /// the next peer for the next hash tree.
    pub(crate) fn wait_till_hash_tree_processed(&self, session: Arc<Session>) {
        if !self.state().begin_draining_hash_tree() {
            debug!("already waiting for the hash tree to be processed");
            return;
        }

        let node = self.clone();
        let task: BoxedFuture<'static, ()> = Box::pin(async move {
            loop {
                sleep(HASH_TREE_POLL_INTERVAL).await;

                match node.hash_tree_drained().await {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(err) => error!(?err, "failed to check hash tree progress"),
                }
            }

            let next = loop {
                if let Some(next) = node
                    .network()
                    .select_next_peer(Some(session.as_ref()))
                    .await
                {
                    break next;
                }

                debug!("no peer to continue catching up with");
                sleep(HASH_TREE_POLL_INTERVAL).await;
            };

            node.state().end_draining_hash_tree();

            if let Err(err) = node.request_next_hash_tree(&next).await {
                warn!(?err, "failed to request next hash tree");
            }
        });

        drop(spawn(task));
    }

    async fn hash_tree_drained(&self) -> EyreResult<bool> {
        self.store().purge_handled_hash_tree_balls().await?;

        Ok(!self.store().has_hash_tree_balls().await?)
    }

    fn come_online(&self) {
        self.state().set_catching_up(false);
        self.state().came_online();

        info!("caught up");

        self.emit(NodeEvent::CatchingUpDone);

        self.wait_till_idle_and_refresh();
    }

    pub(crate) fn is_idle(&self) -> bool {
        let idle = &self.inner.collaborators.idle;

        idle.used_connections() == 0
            && idle.queued_jobs() == 0
            && idle.held_locks() == 0
            && self.state().units_in_work.is_empty()
    }

    /// Once nothing is in flight, asks every outbound peer for its free
    /// joints.
    fn wait_till_idle_and_refresh(&self) {
        if !self.state().begin_waiting_till_idle() {
            return;
        }

        let node = self.clone();
        let task: BoxedFuture<'static, ()> = Box::pin(async move {
            while !node.is_idle() {
                sleep(IDLE_POLL_INTERVAL).await;
            }

            node.state().end_waiting_till_idle();

            for session in node.network().outbound() {
                debug!(peer = session.peer(), "requesting free joints");
                session.send_justsaying(Subject::Refresh, Value::Null);
            }
        });

        drop(spawn(task));
    }

    /// Answers a `catchup` request.
    pub(crate) async fn serve_catchup(
        &self,
        request: &CatchupRequest,
    ) -> Result<CatchupChain, String> {
        let _serving = self.inner.serving_catchup.lock().await;

        self.catchup_validator().prepare_catchup_chain(request).await
    }

    /// Answers a `get_hash_tree` request.
    pub(crate) async fn serve_hash_tree(&self, request: &HashTreeRequest) -> Result<HashTree, String> {
        let _serving = self.inner.serving_hash_tree.lock().await;

        let balls = self.catchup_validator().read_hash_tree(request).await?;

        Ok(HashTree { balls })
    }
}
