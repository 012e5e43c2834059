//! In-process implementation of every store trait.
//!
//! Main chain indexes are assigned in save order and stability is advanced
//! explicitly with [`MemoryStore::mark_stable`]; consensus is not computed
//! here.

#[cfg(test)]
#[path = "tests/memory.rs"]
mod tests;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use eyre::Result as EyreResult;
use jointmesh_primitives::ball::HashTreeBall;
use jointmesh_primitives::common::unix_millis;
use jointmesh_primitives::id::{BallHash, UnitId};
use jointmesh_primitives::joint::Joint;
use jointmesh_primitives::peer::{host_of, PeerEvent};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use tokio::time::Instant;

use crate::types::{
    CandidateOrder, CandidateQuery, EventCounts, JointStatus, PurgedUnit, UnhandledJoint,
    ValidationState, BAD_STATS_WINDOW,
};
use crate::{CatchupStore, JointStore, LightWatchStore, PeerDirectory, WitnessStore};

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    hosts: HashMap<String, HostStats>,
    peers: BTreeMap<String, PeerEntry>,
    host_urls: Vec<HostUrl>,
    /// Oldest first, nothing older than [`BAD_STATS_WINDOW`].
    events: VecDeque<EventEntry>,

    units: HashMap<UnitId, SavedUnit>,
    by_mci: BTreeMap<u64, Vec<UnitId>>,
    last_mci: u64,
    stable_mci: u64,
    known_bad: HashMap<UnitId, String>,
    unhandled: HashMap<UnitId, UnhandledEntry>,
    dependencies: Vec<Dependency>,

    hash_tree: BTreeMap<u64, HashTreeBall>,
    next_ball_index: u64,
    chain_balls: VecDeque<BallHash>,

    witnesses: Vec<String>,
    watched: BTreeSet<(String, String)>,
}

#[derive(Clone, Copy, Debug, Default)]
struct HostStats {
    new_good: u64,
    invalid: u64,
    nonserial: u64,
}

impl HostStats {
    #[expect(clippy::cast_precision_loss, reason = "joint counts stay far below 2^52")]
    fn is_acceptable(&self, max_invalid_ratio: f64) -> bool {
        if self.new_good == 0 {
            return self.invalid == 0 && self.nonserial == 0;
        }

        (self.invalid as f64) / (self.new_good as f64) < max_invalid_ratio
    }
}

#[derive(Clone, Debug)]
struct PeerEntry {
    host: String,
    #[expect(dead_code, reason = "kept for peer provenance in debug output")]
    learnt_from: Option<String>,
    is_self: bool,
}

#[derive(Clone, Debug)]
struct HostUrl {
    host: String,
    url: String,
    active: bool,
}

#[derive(Clone, Debug)]
struct EventEntry {
    host: String,
    event: PeerEvent,
    at: Instant,
}

#[derive(Clone, Debug)]
struct SavedUnit {
    joint: Joint,
    mci: u64,
    #[expect(dead_code, reason = "kept for debug output")]
    state: ValidationState,
}

#[derive(Clone, Debug)]
struct UnhandledEntry {
    joint: Joint,
    received_at: u64,
    received: Instant,
    peer: Option<String>,
}

#[derive(Clone, Debug)]
struct Dependency {
    unit: UnitId,
    depends_on: UnitId,
    since: Instant,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares every unit up to `mci` stable.
    pub fn mark_stable(&self, mci: u64) {
        let mut inner = self.inner.write();
        inner.stable_mci = inner.stable_mci.max(mci.min(inner.last_mci));
    }

    /// Stable joints carrying a ball with an mci above `mci`, oldest first.
    #[must_use]
    pub fn stable_ball_joints_after(&self, mci: u64) -> Vec<Joint> {
        let inner = self.inner.read();
        let stable = inner.stable_mci;

        let joints = inner
            .joints_in(mci.saturating_add(1), stable)
            .filter(|joint| joint.has_ball())
            .collect();

        joints
    }

    /// The balls of stable units between two checkpoint balls, excluding
    /// `from` and including `to`.
    #[must_use]
    pub fn hash_tree_between(&self, from: &BallHash, to: &BallHash) -> Option<Vec<HashTreeBall>> {
        let inner = self.inner.read();

        let from_mci = inner.mci_of_ball(from)?;
        let to_mci = inner.mci_of_ball(to)?;

        if from_mci >= to_mci || to_mci > inner.stable_mci {
            return None;
        }

        let balls = inner
            .joints_in(from_mci.saturating_add(1), to_mci)
            .filter_map(|joint| {
                let ball = joint.ball.clone()?;
                let parent_balls = joint
                    .parents()
                    .iter()
                    .filter_map(|parent| inner.units.get(parent)?.joint.ball.clone())
                    .collect();

                Some(HashTreeBall {
                    unit: joint.id().clone(),
                    ball,
                    parent_balls,
                    skiplist_balls: None,
                    is_nonserial: false,
                })
            })
            .collect();

        Some(balls)
    }
}

impl Inner {
    fn stats(&self, host: &str) -> HostStats {
        self.hosts.get(host).copied().unwrap_or_default()
    }

    fn active_host_of_url(&self, url: &str) -> Option<&str> {
        self.host_urls
            .iter()
            .find(|record| record.active && record.url == url)
            .map(|record| record.host.as_str())
    }

    fn status_of(&self, unit: &UnitId) -> JointStatus {
        if self.units.contains_key(unit) {
            JointStatus::Known
        } else if self.known_bad.contains_key(unit) {
            JointStatus::KnownBad
        } else if self.unhandled.contains_key(unit) {
            JointStatus::KnownUnverified
        } else {
            JointStatus::New
        }
    }

    fn joints_in(&self, from_mci: u64, to_mci: u64) -> impl Iterator<Item = Joint> + '_ {
        self.by_mci
            .range(from_mci..=to_mci.max(from_mci))
            .filter(move |(mci, _)| **mci <= to_mci)
            .flat_map(|(_, units)| units.iter())
            .filter_map(|unit| self.read(unit))
    }

    fn read(&self, unit: &UnitId) -> Option<Joint> {
        let saved = self.units.get(unit)?;
        let mut joint = saved.joint.clone();
        if saved.mci <= self.stable_mci {
            joint.unit.main_chain_index = Some(saved.mci);
        }
        Some(joint)
    }

    fn mci_of_ball(&self, ball: &BallHash) -> Option<u64> {
        self.units
            .values()
            .find(|saved| saved.joint.ball.as_ref() == Some(ball))
            .map(|saved| saved.mci)
    }

    fn remove_unhandled(&mut self, unit: &UnitId) -> Option<UnhandledEntry> {
        self.dependencies.retain(|dependency| &dependency.unit != unit);
        self.unhandled.remove(unit)
    }

    fn purge_dependents(&mut self, unit: &UnitId, error: &str) -> Vec<PurgedUnit> {
        let mut purged = Vec::new();
        let mut queue = vec![unit.clone()];

        while let Some(parent) = queue.pop() {
            let dependents: BTreeSet<UnitId> = self
                .dependencies
                .iter()
                .filter(|dependency| dependency.depends_on == parent)
                .map(|dependency| dependency.unit.clone())
                .collect();

            for dependent in dependents {
                let peer = self.remove_unhandled(&dependent).and_then(|entry| entry.peer);
                drop(self.known_bad.insert(dependent.clone(), error.to_owned()));

                purged.push(PurgedUnit {
                    unit: dependent.clone(),
                    peer,
                });
                queue.push(dependent);
            }
        }

        purged
    }
}

#[async_trait]
impl PeerDirectory for MemoryStore {
    async fn add_peer_host(&self, host: &str) -> EyreResult<()> {
        let mut inner = self.inner.write();
        let _ignored = inner.hosts.entry(host.to_owned()).or_default();
        Ok(())
    }

    async fn add_peer(&self, url: &str, learnt_from: Option<&str>) -> EyreResult<()> {
        let host = host_of(url).to_owned();
        let mut inner = self.inner.write();

        let _ignored = inner.hosts.entry(host.clone()).or_default();
        let _ignored = inner.peers.entry(url.to_owned()).or_insert(PeerEntry {
            host,
            learnt_from: learnt_from.map(ToOwned::to_owned),
            is_self: false,
        });

        Ok(())
    }

    async fn record_event(&self, host: &str, event: PeerEvent) -> EyreResult<()> {
        let mut inner = self.inner.write();

        while inner
            .events
            .front()
            .is_some_and(|entry| entry.at.elapsed() > BAD_STATS_WINDOW)
        {
            drop(inner.events.pop_front());
        }

        inner.events.push_back(EventEntry {
            host: host.to_owned(),
            event,
            at: Instant::now(),
        });

        let stats = inner.hosts.entry(host.to_owned()).or_default();
        match event {
            PeerEvent::NewGood => stats.new_good = stats.new_good.saturating_add(1),
            PeerEvent::Invalid => stats.invalid = stats.invalid.saturating_add(1),
            PeerEvent::Nonserial => stats.nonserial = stats.nonserial.saturating_add(1),
            PeerEvent::KnownGood | PeerEvent::KnownBad => {}
        }

        Ok(())
    }

    async fn recent_events(&self, host: &str, window: Duration) -> EyreResult<EventCounts> {
        let inner = self.inner.read();
        let mut counts = EventCounts::default();

        for entry in inner
            .events
            .iter()
            .filter(|entry| entry.host == host && entry.at.elapsed() <= window)
        {
            let counter = match entry.event {
                PeerEvent::NewGood => &mut counts.new_good,
                PeerEvent::Invalid => &mut counts.invalid,
                PeerEvent::Nonserial => &mut counts.nonserial,
                PeerEvent::KnownGood => &mut counts.known_good,
                PeerEvent::KnownBad => &mut counts.known_bad,
            };
            *counter = counter.saturating_add(1);
        }

        Ok(counts)
    }

    async fn outbound_candidates(&self, query: &CandidateQuery) -> EyreResult<Vec<String>> {
        let inner = self.inner.read();

        let mut candidates: Vec<(&String, u64)> = inner
            .peers
            .iter()
            .filter(|(url, peer)| {
                !peer.is_self
                    && !query.exclude_urls.contains(*url)
                    && inner.stats(&peer.host).is_acceptable(query.max_invalid_ratio)
                    && !inner
                        .active_host_of_url(url)
                        .is_some_and(|host| query.exclude_hosts.iter().any(|h| h == host))
            })
            .map(|(url, peer)| (url, inner.stats(&peer.host).new_good))
            .collect();

        match query.order {
            CandidateOrder::MostGood => candidates.sort_by(|a, b| b.1.cmp(&a.1)),
            CandidateOrder::Random => candidates.shuffle(&mut rand::thread_rng()),
        }

        Ok(candidates
            .into_iter()
            .take(query.limit)
            .map(|(url, _)| url.clone())
            .collect())
    }

    async fn reversible_inbound_host(
        &self,
        hosts: &[String],
        max_invalid_ratio: f64,
    ) -> EyreResult<Option<String>> {
        let inner = self.inner.read();

        let mut eligible: Vec<(&String, bool)> = hosts
            .iter()
            .filter(|host| {
                inner
                    .host_urls
                    .iter()
                    .any(|record| record.active && &record.host == *host)
            })
            .map(|host| (host, inner.stats(host)))
            .filter(|(_, stats)| stats.is_acceptable(max_invalid_ratio))
            .map(|(host, stats)| (host, stats.new_good > 0))
            .collect();

        eligible.shuffle(&mut rand::thread_rng());
        eligible.sort_by_key(|(_, has_good)| !*has_good);

        Ok(eligible.first().map(|(host, _)| (*host).clone()))
    }

    async fn good_peers(
        &self,
        urls: &[String],
        max_invalid_ratio: f64,
    ) -> EyreResult<Vec<String>> {
        let inner = self.inner.read();

        Ok(urls
            .iter()
            .filter(|url| {
                inner.peers.get(*url).is_some_and(|peer| {
                    let stats = inner.stats(&peer.host);
                    stats.new_good > 0 && stats.is_acceptable(max_invalid_ratio)
                })
            })
            .cloned()
            .collect())
    }

    async fn mark_self(&self, url: &str) -> EyreResult<()> {
        if let Some(peer) = self.inner.write().peers.get_mut(url) {
            peer.is_self = true;
        }
        Ok(())
    }

    async fn verified_url(&self, host: &str) -> EyreResult<Option<String>> {
        Ok(self
            .inner
            .read()
            .host_urls
            .iter()
            .rev()
            .find(|record| record.host == host)
            .map(|record| record.url.clone()))
    }

    async fn set_verified_url(&self, host: &str, url: &str) -> EyreResult<()> {
        let mut inner = self.inner.write();

        for record in inner.host_urls.iter_mut().filter(|r| r.host == host) {
            record.active = false;
        }
        inner.host_urls.push(HostUrl {
            host: host.to_owned(),
            url: url.to_owned(),
            active: true,
        });

        Ok(())
    }
}

#[async_trait]
impl JointStore for MemoryStore {
    async fn check_new_unit(&self, unit: &UnitId) -> EyreResult<JointStatus> {
        Ok(self.inner.read().status_of(unit))
    }

    async fn check_new_joint(&self, joint: &Joint) -> EyreResult<JointStatus> {
        Ok(self.inner.read().status_of(joint.id()))
    }

    async fn save_joint(&self, joint: &Joint, state: &ValidationState) -> EyreResult<()> {
        let mut inner = self.inner.write();

        if inner.units.contains_key(joint.id()) {
            eyre::bail!("unit {} is already saved", joint.id());
        }

        inner.last_mci = inner.last_mci.saturating_add(1);
        let mci = inner.last_mci;

        let mut joint = joint.clone();
        joint.unit.main_chain_index = None;

        inner.by_mci.entry(mci).or_default().push(joint.id().clone());
        drop(inner.units.insert(
            joint.id().clone(),
            SavedUnit {
                joint,
                mci,
                state: *state,
            },
        ));

        Ok(())
    }

    async fn save_known_bad_joint(&self, joint: &Joint, error: &str) -> EyreResult<()> {
        let mut inner = self.inner.write();

        drop(inner.remove_unhandled(joint.id()));
        drop(inner.known_bad.insert(joint.id().clone(), error.to_owned()));

        Ok(())
    }

    async fn read_joint(&self, unit: &UnitId) -> EyreResult<Option<Joint>> {
        Ok(self.inner.read().read(unit))
    }

    async fn read_free_joints(&self) -> EyreResult<Vec<Joint>> {
        let inner = self.inner.read();

        let parents: BTreeSet<&UnitId> = inner
            .units
            .values()
            .flat_map(|saved| saved.joint.parents())
            .collect();

        let free = inner
            .joints_in(0, inner.last_mci)
            .filter(|joint| !parents.contains(joint.id()))
            .collect();

        Ok(free)
    }

    async fn read_joints_since_mci(&self, mci: u64) -> EyreResult<Vec<Joint>> {
        let inner = self.inner.read();

        let joints = inner.joints_in(mci.saturating_add(1), inner.last_mci).collect();

        Ok(joints)
    }

    async fn last_main_chain_index(&self) -> EyreResult<u64> {
        Ok(self.inner.read().last_mci)
    }

    async fn last_stable_mci(&self) -> EyreResult<u64> {
        Ok(self.inner.read().stable_mci)
    }

    async fn save_unhandled_joint(
        &self,
        joint: &Joint,
        missing_parents: &[UnitId],
        peer: Option<&str>,
    ) -> EyreResult<()> {
        let mut inner = self.inner.write();
        let now = Instant::now();

        drop(inner.unhandled.insert(
            joint.id().clone(),
            UnhandledEntry {
                joint: joint.clone(),
                received_at: unix_millis(),
                received: now,
                peer: peer.map(ToOwned::to_owned),
            },
        ));

        for missing in missing_parents {
            let exists = inner
                .dependencies
                .iter()
                .any(|d| &d.unit == joint.id() && &d.depends_on == missing);

            if !exists {
                inner.dependencies.push(Dependency {
                    unit: joint.id().clone(),
                    depends_on: missing.clone(),
                    since: now,
                });
            }
        }

        Ok(())
    }

    async fn remove_unhandled_joint(&self, unit: &UnitId) -> EyreResult<()> {
        drop(self.inner.write().remove_unhandled(unit));
        Ok(())
    }

    async fn ready_dependent_joints(
        &self,
        unit: Option<&UnitId>,
    ) -> EyreResult<Vec<UnhandledJoint>> {
        let inner = self.inner.read();

        let candidates: BTreeSet<&UnitId> = match unit {
            Some(unit) => inner
                .dependencies
                .iter()
                .filter(|dependency| &dependency.depends_on == unit)
                .map(|dependency| &dependency.unit)
                .collect(),
            None => inner.unhandled.keys().collect(),
        };

        Ok(candidates
            .into_iter()
            .filter(|candidate| {
                inner
                    .dependencies
                    .iter()
                    .filter(|dependency| &dependency.unit == *candidate)
                    .all(|dependency| inner.units.contains_key(&dependency.depends_on))
            })
            .filter_map(|candidate| inner.unhandled.get(candidate))
            .map(|entry| UnhandledJoint {
                joint: entry.joint.clone(),
                received_at: entry.received_at,
                peer: entry.peer.clone(),
            })
            .collect())
    }

    async fn purge_joint_and_dependencies(
        &self,
        joint: &Joint,
        error: &str,
    ) -> EyreResult<Vec<PurgedUnit>> {
        let mut inner = self.inner.write();

        drop(inner.remove_unhandled(joint.id()));
        drop(inner.known_bad.insert(joint.id().clone(), error.to_owned()));

        Ok(inner.purge_dependents(joint.id(), error))
    }

    async fn purge_dependencies(&self, unit: &UnitId, error: &str) -> EyreResult<Vec<PurgedUnit>> {
        Ok(self.inner.write().purge_dependents(unit, error))
    }

    async fn lost_joints(&self, older_than: Duration) -> EyreResult<Vec<UnitId>> {
        let inner = self.inner.read();

        let lost: BTreeSet<&UnitId> = inner
            .dependencies
            .iter()
            .filter(|dependency| dependency.since.elapsed() >= older_than)
            .map(|dependency| &dependency.depends_on)
            .filter(|unit| !inner.units.contains_key(*unit) && !inner.unhandled.contains_key(*unit))
            .collect();

        Ok(lost.into_iter().cloned().collect())
    }

    async fn purge_old_unhandled_joints(&self, older_than: Duration) -> EyreResult<usize> {
        let mut inner = self.inner.write();

        let old: Vec<UnitId> = inner
            .unhandled
            .iter()
            .filter(|(_, entry)| entry.received.elapsed() >= older_than)
            .map(|(unit, _)| unit.clone())
            .collect();

        for unit in &old {
            drop(inner.remove_unhandled(unit));
        }

        Ok(old.len())
    }
}

#[async_trait]
impl CatchupStore for MemoryStore {
    async fn purge_handled_hash_tree_balls(&self) -> EyreResult<()> {
        let mut inner = self.inner.write();
        let Inner {
            hash_tree, units, ..
        } = &mut *inner;

        hash_tree.retain(|_, ball| !units.contains_key(&ball.unit));

        Ok(())
    }

    async fn hash_tree_units(&self) -> EyreResult<Vec<UnitId>> {
        let inner = self.inner.read();

        Ok(inner
            .hash_tree
            .values()
            .filter(|ball| !inner.units.contains_key(&ball.unit))
            .map(|ball| ball.unit.clone())
            .collect())
    }

    async fn has_hash_tree_balls(&self) -> EyreResult<bool> {
        let inner = self.inner.read();

        Ok(inner
            .hash_tree
            .values()
            .any(|ball| !inner.units.contains_key(&ball.unit)))
    }

    async fn add_hash_tree_balls(&self, balls: &[HashTreeBall]) -> EyreResult<()> {
        let mut inner = self.inner.write();

        for ball in balls {
            if inner.hash_tree.values().any(|known| known.ball == ball.ball) {
                continue;
            }
            let index = inner.next_ball_index;
            inner.next_ball_index = index.saturating_add(1);
            drop(inner.hash_tree.insert(index, ball.clone()));
        }

        Ok(())
    }

    async fn first_chain_balls(&self, limit: usize) -> EyreResult<Vec<BallHash>> {
        Ok(self
            .inner
            .read()
            .chain_balls
            .iter()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn has_chain_balls(&self) -> EyreResult<bool> {
        Ok(!self.inner.read().chain_balls.is_empty())
    }

    async fn add_chain_balls(&self, balls: &[BallHash]) -> EyreResult<()> {
        let mut inner = self.inner.write();

        for ball in balls {
            if !inner.chain_balls.contains(ball) {
                inner.chain_balls.push_back(ball.clone());
            }
        }

        Ok(())
    }

    async fn remove_chain_ball(&self, ball: &BallHash) -> EyreResult<()> {
        self.inner.write().chain_balls.retain(|known| known != ball);
        Ok(())
    }
}

#[async_trait]
impl WitnessStore for MemoryStore {
    async fn my_witnesses(&self) -> EyreResult<Vec<String>> {
        Ok(self.inner.read().witnesses.clone())
    }

    async fn insert_witnesses(&self, witnesses: &[String]) -> EyreResult<()> {
        let mut inner = self.inner.write();

        if !inner.witnesses.is_empty() {
            eyre::bail!("witnesses are already set");
        }
        inner.witnesses = witnesses.to_vec();

        Ok(())
    }
}

#[async_trait]
impl LightWatchStore for MemoryStore {
    async fn watch_light_address(&self, peer: &str, address: &str) -> EyreResult<()> {
        let _ignored = self
            .inner
            .write()
            .watched
            .insert((peer.to_owned(), address.to_owned()));
        Ok(())
    }

    async fn unwatch_light_peer(&self, peer: &str) -> EyreResult<()> {
        self.inner.write().watched.retain(|(watcher, _)| watcher != peer);
        Ok(())
    }

    async fn light_peers_watching(&self, addresses: &[&str]) -> EyreResult<Vec<String>> {
        let inner = self.inner.read();

        let peers: BTreeSet<&String> = inner
            .watched
            .iter()
            .filter(|(_, address)| addresses.contains(&address.as_str()))
            .map(|(peer, _)| peer)
            .collect();

        Ok(peers.into_iter().cloned().collect())
    }

    async fn light_peers_with_updates(
        &self,
        from_mci: u64,
        to_mci: u64,
    ) -> EyreResult<Vec<String>> {
        let inner = self.inner.read();

        let joints: Vec<Joint> = inner.joints_in(from_mci.saturating_add(1), to_mci).collect();
        let addresses: BTreeSet<&str> = joints
            .iter()
            .flat_map(|joint| joint.unit.addresses())
            .collect();

        let peers: BTreeSet<&String> = inner
            .watched
            .iter()
            .filter(|(_, address)| addresses.contains(address.as_str()))
            .map(|(peer, _)| peer)
            .collect();

        Ok(peers.into_iter().cloned().collect())
    }

    async fn last_ball_mci_of_mci(&self, mci: u64) -> EyreResult<Option<u64>> {
        let inner = self.inner.read();

        let last_ball_mci = inner
            .by_mci
            .get(&mci)
            .and_then(|units| units.first())
            .and_then(|unit| inner.units.get(unit)?.joint.unit.last_ball_unit.clone())
            .and_then(|last_ball_unit| inner.units.get(&last_ball_unit).map(|saved| saved.mci));

        Ok(last_ball_mci)
    }

    async fn joints_at_mci(&self, mci: u64) -> EyreResult<Vec<Joint>> {
        let inner = self.inner.read();
        let joints = inner.joints_in(mci, mci).collect();

        Ok(joints)
    }
}
