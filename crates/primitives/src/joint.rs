#[cfg(test)]
#[path = "tests/joint.rs"]
mod tests;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::common::is_false;
use crate::id::{BallHash, UnitId};

/// A unit together with its envelope.
///
/// `ball` is only present on joints that were served in answer to a
/// `get_joint` request for a stable unit. `unsigned` marks joints composed
/// locally that have not been signed and broadcast yet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Joint {
    pub unit: Unit,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ball: Option<BallHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skiplist_units: Option<Vec<UnitId>>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unsigned: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub unit: UnitId,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub alt: String,
    #[serde(default)]
    pub parent_units: Vec<UnitId>,
    #[serde(default)]
    pub authors: Vec<Author>,
    #[serde(default)]
    pub messages: Vec<UnitMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_ball: Option<BallHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_ball_unit: Option<UnitId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_chain_index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    /// Fields this layer does not interpret, kept so that forwarded units
    /// are byte-for-byte what the author signed.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Author {
    pub address: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnitMessage {
    pub app: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Joint {
    #[must_use]
    pub const fn id(&self) -> &UnitId {
        &self.unit.unit
    }

    #[must_use]
    pub fn parents(&self) -> &[UnitId] {
        &self.unit.parent_units
    }

    #[must_use]
    pub const fn is_unsigned(&self) -> bool {
        self.unsigned
    }

    #[must_use]
    pub const fn has_ball(&self) -> bool {
        self.ball.is_some()
    }
}

impl Unit {
    /// Authors plus the recipients of payment outputs, deduplicated and
    /// sorted.
    #[must_use]
    pub fn addresses(&self) -> BTreeSet<&str> {
        let mut addresses: BTreeSet<&str> = self
            .authors
            .iter()
            .map(|author| author.address.as_str())
            .collect();

        let outputs = self
            .messages
            .iter()
            .filter(|message| message.app == "payment")
            .filter_map(|message| message.payload.as_ref()?.get("outputs")?.as_array())
            .flatten();

        for output in outputs {
            if let Some(address) = output.get("address").and_then(Value::as_str) {
                let _ignored = addresses.insert(address);
            }
        }

        addresses
    }
}
