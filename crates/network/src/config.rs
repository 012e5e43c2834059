use core::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 6611;

pub const DEFAULT_MAX_INBOUND: usize = 10;
pub const DEFAULT_MAX_OUTBOUND: usize = 10;

/// How long a reroutable request may go unanswered before it is also sent
/// to another peer.
pub const DEFAULT_STALL_TIMEOUT_MS: u64 = 5_000;
/// How long a request may go unanswered before its callers get a timeout
/// error.
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 300_000;
/// Silence after which a peer is probed with a heartbeat. Twice this and
/// the connection is dropped.
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
/// Joints woken up from the unhandled set are only forwarded if they were
/// received at most this long ago.
pub const DEFAULT_FORWARDING_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

pub const DEFAULT_MAX_TOLERATED_INVALID_RATIO: f64 = 0.1;
pub const DEFAULT_MIN_COUNT_GOOD_PEERS: usize = 10;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct NetworkConfig {
    /// Port to accept peers on. Light nodes never listen.
    #[serde(default = "default_port")]
    pub port: Option<u16>,
    #[serde(default = "default_max_inbound")]
    pub max_inbound: usize,
    #[serde(default = "default_max_outbound")]
    pub max_outbound: usize,
    /// Our externally reachable url, announced to outbound peers.
    #[serde(default)]
    pub my_url: Option<String>,
    #[serde(default)]
    pub light_vendor_url: Option<String>,
    #[serde(default)]
    pub mode: ModeConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            max_inbound: DEFAULT_MAX_INBOUND,
            max_outbound: DEFAULT_MAX_OUTBOUND,
            my_url: None,
            light_vendor_url: None,
            mode: ModeConfig::default(),
            timeouts: TimeoutConfig::default(),
            quality: QualityConfig::default(),
            bootstrap: BootstrapConfig::default(),
        }
    }
}

#[expect(clippy::unnecessary_wraps, reason = "serde default")]
const fn default_port() -> Option<u16> {
    Some(DEFAULT_PORT)
}

const fn default_max_inbound() -> usize {
    DEFAULT_MAX_INBOUND
}

const fn default_max_outbound() -> usize {
    DEFAULT_MAX_OUTBOUND
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct ModeConfig {
    /// Relay device messages for wallets.
    #[serde(default)]
    pub hub: bool,
    /// Rely on a light vendor instead of validating full history.
    #[serde(default)]
    pub light: bool,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    #[serde(rename = "stall_ms", with = "serde_duration")]
    pub stall: Duration,
    #[serde(rename = "response_ms", with = "serde_duration")]
    pub response: Duration,
    #[serde(rename = "heartbeat_ms", with = "serde_duration")]
    pub heartbeat: Duration,
    #[serde(rename = "forwarding_ms", with = "serde_duration")]
    pub forwarding: Duration,
    #[serde(rename = "connect_ms", with = "serde_duration")]
    pub connect: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            stall: Duration::from_millis(DEFAULT_STALL_TIMEOUT_MS),
            response: Duration::from_millis(DEFAULT_RESPONSE_TIMEOUT_MS),
            heartbeat: Duration::from_millis(DEFAULT_HEARTBEAT_TIMEOUT_MS),
            forwarding: Duration::from_millis(DEFAULT_FORWARDING_TIMEOUT_MS),
            connect: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Peers whose invalid to new-good joint ratio reaches this are not
    /// dialed or rotated to.
    pub max_tolerated_invalid_ratio: f64,
    /// Below this many good outbound peers we ask them for more.
    pub min_count_good_peers: usize,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            max_tolerated_invalid_ratio: DEFAULT_MAX_TOLERATED_INVALID_RATIO,
            min_count_good_peers: DEFAULT_MIN_COUNT_GOOD_PEERS,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub peers: Vec<String>,
}

mod serde_duration {
    use core::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
