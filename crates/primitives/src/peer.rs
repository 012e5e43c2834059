#[cfg(test)]
#[path = "tests/peer.rs"]
mod tests;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Peer-quality event recorded against a host.
#[derive(
    AsRefStr, Clone, Copy, Debug, Display, EnumString, Eq, Hash, PartialEq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PeerEvent {
    NewGood,
    Invalid,
    Nonserial,
    KnownGood,
    KnownBad,
}

/// The host part of a peer address: the scheme is dropped, then everything
/// from the first `:` or `/` on.
///
/// `ws://example.org:6611/path` and `example.org/x` both yield
/// `example.org`; an inbound `1.2.3.4:5678` yields `1.2.3.4`.
#[must_use]
pub fn host_of(peer: &str) -> &str {
    let rest = ["wss://", "ws://"]
        .into_iter()
        .find_map(|scheme| {
            peer.get(..scheme.len())
                .filter(|prefix| prefix.eq_ignore_ascii_case(scheme))
                .map(|_| &peer[scheme.len()..])
        })
        .unwrap_or(peer);

    rest.find(|c| c == ':' || c == '/')
        .map_or(rest, |end| &rest[..end])
}
