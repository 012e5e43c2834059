//! Keeping enough outbound peers, and learning new ones from them.

use eyre::{bail, Result as EyreResult, WrapErr};
use jointmesh_network_primitives::frame::Command;
use jointmesh_store::types::{CandidateOrder, CandidateQuery};
use tokio::spawn;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::client::NetworkClient;
use crate::correlator::Reply;

/// The invalid ratio is doubled on every pass that finds nothing, while
/// it stays below this multiple of the configured ratio.
const MAX_RELAXATION: u32 = 32;
/// Relaxed passes above this multiplier pick peers at random.
const MAX_RANKED_RELAXATION: u32 = 4;
/// Dials opened per top-up at most.
const MAX_NEW_OUTBOUND_PER_PASS: usize = 5;

pub(crate) const OUTBOUND_TOP_UP_INTERVAL: Duration = Duration::from_secs(60);
pub(crate) const GOOD_PEERS_CHECK_DELAY: Duration = Duration::from_secs(30);

impl NetworkClient {
    /// Dials peers until the outbound target is reached. Returns how many
    /// dials were started.
    pub async fn ensure_outbound_target(&self) -> EyreResult<usize> {
        let (_, outbound) = self.connection_counts();

        let limit = self
            .config()
            .max_outbound
            .saturating_sub(outbound)
            .min(MAX_NEW_OUTBOUND_PER_PASS);

        if limit == 0 {
            return Ok(0);
        }

        let candidates = self.outbound_candidates(limit).await?;

        for url in &candidates {
            let client = self.clone();
            let url = url.clone();

            drop(spawn(async move {
                if let Err(err) = client.connect(&url).await {
                    debug!(%url, ?err, "failed to connect to candidate peer");
                }
            }));
        }

        Ok(candidates.len())
    }

    /// Candidates of acceptable quality not connected yet. When nothing
    /// qualifies and there are no outbound peers at all, the quality bar is
    /// lowered pass by pass.
    pub(crate) async fn outbound_candidates(&self, limit: usize) -> EyreResult<Vec<String>> {
        let ratio = self.config().quality.max_tolerated_invalid_ratio;
        let mut multiplier = 1_u32;

        loop {
            let exclude_urls = self.inner.registry.outbound_urls();
            let no_outbound = exclude_urls.is_empty();

            let query = CandidateQuery {
                max_invalid_ratio: ratio * f64::from(multiplier),
                exclude_urls,
                exclude_hosts: self.inner.registry.inbound_hosts(),
                order: if multiplier <= MAX_RANKED_RELAXATION {
                    CandidateOrder::MostGood
                } else {
                    CandidateOrder::Random
                },
                limit,
            };

            let candidates = self
                .directory()
                .outbound_candidates(&query)
                .await
                .wrap_err("failed to query outbound candidates")?;

            multiplier = multiplier.saturating_mul(2);

            if !candidates.is_empty() || !no_outbound || multiplier >= MAX_RELAXATION {
                return Ok(candidates);
            }

            debug!(multiplier, "no outbound candidates, relaxing quality requirements");
        }
    }

    /// Asks good outbound peers for more peers when we know too few good
    /// ones.
    pub async fn check_enough_good_peers(&self) -> EyreResult<()> {
        let quality = self.config().quality;
        let urls = self.inner.registry.outbound_urls();

        let good = self
            .directory()
            .good_peers(&urls, quality.max_tolerated_invalid_ratio)
            .await
            .wrap_err("failed to rank outbound peers")?;

        if good.len() >= quality.min_count_good_peers {
            return Ok(());
        }

        if good.is_empty() {
            debug!("no good outbound peers to ask for more peers");
            return Ok(());
        }

        info!(count = good.len(), "too few good peers, asking them for more");

        for session in self.outbound() {
            if good.iter().any(|url| url == session.peer()) {
                let receiver = self.request(&session, Command::GetPeers, None, false);
                let client = self.clone();

                drop(spawn(async move {
                    let reply = receiver.recv().await;

                    if let Err(err) = client.handle_new_peers(&reply).await {
                        warn!(peer = %reply.session.peer(), ?err, "failed to handle new peers");
                    }
                }));
            }
        }

        Ok(())
    }

    /// Records the urls a peer answered `get_peers` with.
    pub async fn handle_new_peers(&self, reply: &Reply) -> EyreResult<usize> {
        if let Some(error) = reply.error() {
            debug!(peer = %reply.session.peer(), error, "get_peers failed");
            return Ok(0);
        }

        let Some(urls) = reply.response.as_ref().and_then(|value| value.as_array()) else {
            reply.session.send_error("peer urls is not an array");
            bail!("peer urls is not an array");
        };

        let my_url = self.config().my_url.as_deref().map(str::to_lowercase);
        let learnt_from = reply.session.host();

        let mut added = 0_usize;

        for url in urls.iter().filter_map(|url| url.as_str()) {
            if my_url.as_deref() == Some(url.to_lowercase().as_str()) {
                continue;
            }

            self.directory()
                .add_peer(url, Some(learnt_from))
                .await
                .wrap_err("failed to record learnt peer")?;

            added = added.saturating_add(1);
        }

        debug!(peer = %reply.session.peer(), added, "learnt new peers");

        Ok(added)
    }
}

pub(crate) async fn maintain_outbound(client: NetworkClient) {
    let mut ticker = interval(OUTBOUND_TOP_UP_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let _instant = ticker.tick().await;

        if let Err(err) = client.ensure_outbound_target().await {
            warn!(?err, "failed to top up outbound peers");
        }
    }
}

pub(crate) async fn check_good_peers_after_start(client: NetworkClient) {
    sleep(GOOD_PEERS_CHECK_DELAY).await;

    if let Err(err) = client.check_enough_good_peers().await {
        warn!(?err, "failed to check for good peers");
    }
}

#[cfg(test)]
#[path = "tests/discovery.rs"]
mod tests;
