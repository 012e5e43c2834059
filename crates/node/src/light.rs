//! Light clients on both ends: pushing updates to the light peers that
//! watch an address, and talking to our own vendor when we are light.

use std::sync::Arc;

use eyre::{eyre, Result as EyreResult, WrapErr};
use jointmesh_network::correlator::Reply;
use jointmesh_network::session::Session;
use jointmesh_network_primitives::frame::{Command, Subject};
use jointmesh_node_primitives::events::NodeEvent;
use jointmesh_primitives::common::unix_secs;
use jointmesh_primitives::id::UnitId;
use jointmesh_primitives::joint::Joint;
use serde_json::Value;
use tokio::spawn;
use tracing::{debug, info, warn};

use crate::{BoxedFuture, Node};

impl Node {
    /// Tells local wallets and watching light peers about a saved joint.
    pub(crate) async fn notify_watchers(&self, joint: &Joint) {
        let addresses: Vec<&str> = joint.unit.addresses().into_iter().collect();

        if self.state().watches_any(addresses.iter().copied()) {
            self.emit(NodeEvent::NewMyTransaction {
                units: vec![joint.id().clone()],
            });
        }

        if self.network().is_light() || addresses.is_empty() {
            return;
        }

        let peers = match self.store().light_peers_watching(&addresses).await {
            Ok(peers) => peers,
            Err(err) => {
                warn!(unit = %joint.id(), ?err, "failed to look up watching light peers");
                return;
            }
        };

        if peers.is_empty() {
            return;
        }

        let mut joint = joint.clone();
        joint.unit.timestamp = Some(unix_secs());

        for peer in peers {
            if let Some(session) = self.network().session_by_peer(&peer) {
                debug!(%peer, unit = %joint.id(), "pushing joint to light peer");
                session.send_justsaying_as(Subject::Joint, &joint);
            }
        }
    }

    /// Registers an address of a local wallet.
    pub fn watch_address(&self, address: &str) {
        self.state().watch_addresses([address.to_owned()]);
    }

    /// Sends a joint composed locally to every subscribed peer.
    pub async fn broadcast_joint(&self, joint: &Joint) {
        if self.network().is_light() {
            debug!(unit = %joint.id(), "light clients post joints to their vendor instead");
            return;
        }

        self.forward_joint(None, joint);
        self.notify_watchers(joint).await;
    }

    /// Called once the main chain index `mci` becomes stable.
    pub async fn on_mci_became_stable(&self, mci: u64) -> EyreResult<()> {
        let watched = self.state().watched_addresses();

        if !watched.is_empty() {
            let units: Vec<UnitId> = self
                .store()
                .joints_at_mci(mci)
                .await?
                .iter()
                .filter(|joint| {
                    joint
                        .unit
                        .addresses()
                        .iter()
                        .any(|address| watched.iter().any(|watched| watched == address))
                })
                .map(|joint| joint.id().clone())
                .collect();

            if !units.is_empty() {
                self.emit(NodeEvent::MyTransactionBecameStable { units });
            }
        }

        if self.network().is_light() || mci <= 1 {
            return Ok(());
        }

        let store = self.store();

        let (Some(last_ball_mci), Some(prev_last_ball_mci)) = (
            store.last_ball_mci_of_mci(mci).await?,
            store.last_ball_mci_of_mci(mci - 1).await?,
        ) else {
            return Ok(());
        };

        if last_ball_mci == prev_last_ball_mci {
            return Ok(());
        }

        for peer in store
            .light_peers_with_updates(prev_last_ball_mci, last_ball_mci)
            .await?
        {
            if let Some(session) = self.network().session_by_peer(&peer) {
                debug!(%peer, mci, "light peer has updates");
                session.send_justsaying(Subject::LightHaveUpdates, Value::Null);
            }
        }

        Ok(())
    }

    pub(crate) fn spawn_light_vendor_connection(&self) {
        let node = self.clone();

        let task: BoxedFuture<'static, ()> = Box::pin(async move {
            match node.light_vendor_session().await {
                Ok(session) => info!(peer = session.peer(), "connected to light vendor"),
                Err(err) => warn!(?err, "failed to connect to light vendor"),
            }
        });

        drop(spawn(task));
    }

    async fn light_vendor_session(&self) -> EyreResult<Arc<Session>> {
        let url = self
            .network()
            .config()
            .light_vendor_url
            .clone()
            .ok_or_else(|| eyre!("no light vendor configured"))?;

        let session = self
            .network()
            .connect(&url)
            .await
            .wrap_err_with(|| format!("failed to connect to light vendor {url}"))?;

        session.update_flags(|flags| flags.light_vendor = true);

        Ok(session)
    }

    /// Sends a request to our light vendor, dialing it first if needed.
    pub async fn request_from_light_vendor(
        &self,
        command: Command,
        params: Option<Value>,
    ) -> EyreResult<Reply> {
        let session = self.light_vendor_session().await?;

        Ok(self
            .network()
            .request(&session, command, params, false)
            .recv()
            .await)
    }

    /// Posts a joint composed by a light wallet. The inner result carries the
    /// vendor's refusal.
    pub async fn post_joint_to_light_vendor(&self, joint: &Joint) -> EyreResult<Result<(), String>> {
        let params = serde_json::to_value(joint).wrap_err("failed to encode joint")?;

        let reply = self
            .request_from_light_vendor(Command::PostJoint, Some(params))
            .await?;

        Ok(match reply.error() {
            Some(error) => Err(error.to_owned()),
            None => Ok(()),
        })
    }
}
