//! Heartbeats for quiet connections.

use jointmesh_network_primitives::frame::Command;
use rand::{thread_rng, Rng};
use tokio::time::{interval, sleep, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::client::NetworkClient;
use crate::session::CLOSE_NORMAL;

pub(crate) const HEARTBEAT_TICK: Duration = Duration::from_secs(3);
const HEARTBEAT_JITTER_MS: u64 = 1_000;
pub(crate) const STATUS_INTERVAL: Duration = Duration::from_secs(6);

/// What a heartbeat tick did.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct HeartbeatReport {
    pub probed: usize,
    pub closed: usize,
}

impl NetworkClient {
    /// Sessions silent for the heartbeat timeout are probed; silent for
    /// twice that, they are closed.
    pub fn heartbeat_tick(&self) -> HeartbeatReport {
        let timeout = self.config().timeouts.heartbeat;
        let now = Instant::now();

        let mut report = HeartbeatReport::default();

        for session in self.sessions() {
            let idle = session.idle_for(now);

            if idle < timeout {
                continue;
            }

            if idle < timeout.saturating_mul(2) {
                drop(self.request(&session, Command::Heartbeat, None, false));
                report.probed = report.probed.saturating_add(1);
                continue;
            }

            info!(peer = %session.peer(), ?idle, "peer went silent, disconnecting");
            session.close(CLOSE_NORMAL, "lost connection");
            report.closed = report.closed.saturating_add(1);
        }

        report
    }
}

pub(crate) async fn heartbeat_loop(client: NetworkClient) {
    loop {
        let jitter = Duration::from_millis(thread_rng().gen_range(0..=HEARTBEAT_JITTER_MS));
        sleep(HEARTBEAT_TICK.saturating_add(jitter)).await;

        let report = client.heartbeat_tick();
        if report != HeartbeatReport::default() {
            debug!(probed = report.probed, closed = report.closed, "heartbeat");
        }
    }
}

pub(crate) async fn status_loop(client: NetworkClient) {
    let mut ticker = interval(STATUS_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let _instant = ticker.tick().await;

        let (inbound, outbound) = client.connection_counts();
        let urls: Vec<_> = client
            .outbound()
            .iter()
            .map(|session| session.peer().to_owned())
            .collect();

        debug!(inbound, outbound, ?urls, "connections");
    }
}

#[cfg(test)]
#[path = "tests/liveness.rs"]
mod tests;
