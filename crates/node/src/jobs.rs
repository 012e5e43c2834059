//! Periodic upkeep of the unhandled joint store.

use core::time::Duration;

use eyre::Result as EyreResult;
use tokio::spawn;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::Node;

pub(crate) const LOST_JOINTS_INTERVAL: Duration = Duration::from_secs(8);
pub(crate) const READY_JOINTS_INTERVAL: Duration = Duration::from_secs(5);
pub(crate) const JUNK_PURGE_INTERVAL: Duration = Duration::from_secs(30 * 60);
/// Unhandled joints older than this are junk, and so is everything while we
/// have been online for less.
pub(crate) const JUNK_AGE: Duration = Duration::from_secs(60 * 60);

impl Node {
    pub(crate) fn spawn_background_jobs(&self) {
        drop(spawn(rerequest_lost_joints_loop(self.clone())));
        drop(spawn(handle_ready_joints_loop(self.clone())));
        drop(spawn(purge_junk_loop(self.clone())));
    }

    /// Re-requests dependencies that have been missing for longer than the
    /// stall timeout.
    pub(crate) async fn rerequest_lost_joints(&self) -> EyreResult<()> {
        if self.state().is_catching_up() {
            return Ok(());
        }

        let stall = self.network().config().timeouts.stall;
        let lost = self.store().lost_joints(stall).await?;

        if lost.is_empty() {
            return Ok(());
        }

        let Some(session) = self.network().select_next_peer(None).await else {
            debug!(count = lost.len(), "no peer to re-request lost joints from");
            return Ok(());
        };

        debug!(peer = session.peer(), count = lost.len(), "re-requesting lost joints");

        self.request_new_missing_joints(&session, &lost).await
    }

    pub(crate) async fn purge_junk(&self) -> EyreResult<()> {
        if self.state().is_catching_up() || self.state().online_for() < JUNK_AGE {
            return Ok(());
        }

        let purged = self.store().purge_old_unhandled_joints(JUNK_AGE).await?;

        if purged > 0 {
            info!(purged, "purged old unhandled joints");
        }

        Ok(())
    }
}

async fn rerequest_lost_joints_loop(node: Node) {
    let mut ticker = interval(LOST_JOINTS_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let _instant = ticker.tick().await;

        if let Err(err) = node.rerequest_lost_joints().await {
            error!(?err, "failed to re-request lost joints");
        }
    }
}

async fn handle_ready_joints_loop(node: Node) {
    let mut ticker = interval(READY_JOINTS_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let _instant = ticker.tick().await;

        if let Err(err) = node.find_and_handle_joints_that_are_ready(None).await {
            error!(?err, "failed to handle ready joints");
        }
    }
}

async fn purge_junk_loop(node: Node) {
    let mut ticker = interval(JUNK_PURGE_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let _instant = ticker.tick().await;

        if let Err(err) = node.purge_junk().await {
            error!(?err, "failed to purge junk");
        }
    }
}
