use std::time::Duration;

use jointmesh_primitives::id::UnitId;
use jointmesh_primitives::joint::Joint;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

/// Outcome of checking a joint against everything the store has seen.
#[derive(AsRefStr, Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum JointStatus {
    New,
    Known,
    KnownBad,
    /// Held as unhandled until its missing parents arrive.
    KnownUnverified,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sequence {
    #[default]
    Good,
    TempBad,
    FinalBad,
}

/// What the validator learned about a unit, persisted along with it.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ValidationState {
    pub sequence: Sequence,
}

impl ValidationState {
    #[must_use]
    pub const fn is_serial(&self) -> bool {
        matches!(self.sequence, Sequence::Good)
    }
}

/// A joint waiting for its missing parents.
#[derive(Clone, Debug, PartialEq)]
pub struct UnhandledJoint {
    pub joint: Joint,
    /// Milliseconds since the unix epoch when it was first received.
    pub received_at: u64,
    pub peer: Option<String>,
}

/// A dependent joint removed together with a bad parent, and the peer that
/// sent it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PurgedUnit {
    pub unit: UnitId,
    pub peer: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct EventCounts {
    pub new_good: u64,
    pub invalid: u64,
    pub nonserial: u64,
    pub known_good: u64,
    pub known_bad: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CandidateOrder {
    /// Peers that sent the most new good joints first.
    MostGood,
    Random,
}

/// Filter for peers worth dialing.
#[derive(Clone, Debug, PartialEq)]
pub struct CandidateQuery {
    pub max_invalid_ratio: f64,
    /// Urls of peers we are already connected to.
    pub exclude_urls: Vec<String>,
    /// Hosts that are already connected inbound; their verified urls are
    /// skipped.
    pub exclude_hosts: Vec<String>,
    pub order: CandidateOrder,
    pub limit: usize,
}

/// Window within which invalid joints from a host refuse its inbound
/// connections.
pub const BAD_STATS_WINDOW: Duration = Duration::from_secs(3_600);
