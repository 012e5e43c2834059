//! Network events and replies to our own requests.

use std::sync::Arc;

use eyre::Result as EyreResult;
use jointmesh_network::correlator::{Reply, ResponseReceiver};
use jointmesh_network::session::Session;
use jointmesh_network::NetworkEvent;
use jointmesh_network_primitives::frame::{Command, Subject};
use jointmesh_network_primitives::payloads::SubscribeParams;
use jointmesh_primitives::common::random_token;
use jointmesh_primitives::id::UnitId;
use serde_json::Value;
use tokio::spawn;
use tracing::{debug, error, info, warn};

use crate::{BoxedFuture, Node};

mod justsaying;
pub(crate) mod request;

const SUBSCRIPTION_ID_LENGTH: usize = 30;

/// What a reply we are waiting for answers.
#[derive(Debug)]
pub(crate) enum Awaiting {
    Joint(UnitId),
    /// Carries the session the chain was asked from.
    CatchupChain(Arc<Session>),
    HashTree,
    Subscription,
    Witnesses,
}

impl Node {
    pub async fn handle_event(&self, event: NetworkEvent) {
        let result = match event {
            NetworkEvent::Connected { session } => self.handle_connected(&session).await,
            NetworkEvent::Justsaying {
                session,
                justsaying,
            } => {
                self.handle_justsaying(&session, &justsaying.subject, justsaying.body)
                    .await
            }
            NetworkEvent::Request { session, request } => {
                self.handle_request(&session, request).await
            }
            NetworkEvent::Disconnected { session } => self.handle_disconnected(&session).await,
            _ => {
                debug!(?event, "ignoring network event");
                Ok(())
            }
        };

        if let Err(err) = result {
            error!(?err, "failed to handle network event");
        }
    }

    async fn handle_connected(&self, session: &Arc<Session>) -> EyreResult<()> {
        info!(peer = session.peer(), direction = ?session.direction(), "peer connected");

        if session.is_outbound() {
            self.init_witnesses_if_necessary(session).await?;
        }

        if self.network().is_light() {
            let is_vendor = self
                .network()
                .config()
                .light_vendor_url
                .as_deref()
                .is_some_and(|url| session.is_outbound() && session.peer().eq_ignore_ascii_case(url));

            if is_vendor {
                debug!(peer = session.peer(), "connected to light vendor");
                session.update_flags(|flags| flags.light_vendor = true);
            }

            return Ok(());
        }

        let subscription_id = random_token(SUBSCRIPTION_ID_LENGTH);
        session.update_flags(|flags| flags.subscription_id = Some(subscription_id.clone()));

        let params = SubscribeParams {
            subscription_id,
            last_mci: Some(self.store().last_main_chain_index().await?),
        };

        let receiver = self
            .network()
            .request_as(session, Command::Subscribe, &params, false);

        self.spawn_reply_handler(receiver, Awaiting::Subscription);

        Ok(())
    }

    async fn handle_disconnected(&self, session: &Arc<Session>) -> EyreResult<()> {
        info!(peer = session.peer(), "peer disconnected");

        if session.is_inbound() {
            self.store().unwatch_light_peer(session.peer()).await?;
        }

        Ok(())
    }

    fn handle_subscription_reply(&self, reply: &Reply) {
        let error = reply.error();

        reply.session.update_flags(|flags| {
            flags.subscription_id = None;
            flags.source |= error.is_none();
        });

        match error {
            Some(error) => debug!(peer = reply.session.peer(), error, "subscription refused"),
            None => debug!(peer = reply.session.peer(), "subscribed to peer"),
        }
    }

    /// Handles the reply to one of our requests once it arrives.
    pub(crate) fn spawn_reply_handler(&self, receiver: ResponseReceiver, awaiting: Awaiting) {
        let node = self.clone();

        let task: BoxedFuture<'static, ()> = Box::pin(async move {
            let reply = receiver.recv().await;
            let peer = reply.session.peer().to_owned();

            let result = match &awaiting {
                Awaiting::Joint(unit) => {
                    node.handle_response_to_joint_request(
                        &reply.session,
                        unit,
                        reply.response.as_ref(),
                    )
                    .await
                }
                Awaiting::CatchupChain(asked) => node.handle_catchup_chain(&asked, reply).await,
                Awaiting::HashTree => node.handle_hash_tree(reply).await,
                Awaiting::Subscription => {
                    node.handle_subscription_reply(&reply);
                    Ok(())
                }
                Awaiting::Witnesses => node.handle_witnesses(reply).await,
            };

            if let Err(err) = result {
                warn!(%peer, ?awaiting, ?err, "failed to handle reply");
            }
        });

        drop(spawn(task));
    }

    /// Asks `session` for witnesses if we have none yet.
    pub async fn init_witnesses_if_necessary(&self, session: &Arc<Session>) -> EyreResult<()> {
        if !self.store().my_witnesses().await?.is_empty() {
            return Ok(());
        }

        let receiver = self
            .network()
            .request(session, Command::GetWitnesses, None, false);

        self.spawn_reply_handler(receiver, Awaiting::Witnesses);

        Ok(())
    }

    async fn handle_witnesses(&self, reply: Reply) -> EyreResult<()> {
        if let Some(error) = reply.error() {
            warn!(peer = reply.session.peer(), error, "failed to get witnesses");
            return Ok(());
        }

        let witnesses: Vec<String> = match reply.parse() {
            Ok(witnesses) => witnesses,
            Err(err) => {
                reply.session.send_error(&format!("malformed witness list: {err}"));
                return Ok(());
            }
        };

        if !self.store().my_witnesses().await?.is_empty() {
            debug!("witnesses were set in the meantime");
            return Ok(());
        }

        info!(peer = reply.session.peer(), count = witnesses.len(), "got witnesses");

        self.store().insert_witnesses(&witnesses).await
    }

    pub(crate) async fn send_free_joints(&self, session: &Session) -> EyreResult<()> {
        let joints = self.store().read_free_joints().await?;

        debug!(peer = session.peer(), count = joints.len(), "sending free joints");

        for joint in &joints {
            session.send_justsaying_as(Subject::Joint, joint);
        }

        session.send_justsaying(Subject::FreeJointsEnd, Value::Null);

        Ok(())
    }

    pub(crate) async fn send_joints_since_mci(&self, session: &Session, mci: u64) -> EyreResult<()> {
        let joints = self.store().read_joints_since_mci(mci).await?;

        debug!(peer = session.peer(), mci, count = joints.len(), "sending joints since mci");

        for joint in &joints {
            session.send_justsaying_as(Subject::Joint, joint);
        }

        session.send_justsaying(Subject::FreeJointsEnd, Value::Null);

        Ok(())
    }
}
