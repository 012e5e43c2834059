#[cfg(test)]
#[path = "tests/frame.rs"]
mod tests;

use core::fmt;

use jointmesh_primitives::hash::json_hash;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};
use strum::{AsRefStr, Display, EnumString};

/// A wire frame: a two element array `[type, content]`.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Justsaying(Justsaying),
    Request(Request),
    Response(Response),
}

const FRAME_TYPES: &[&str] = &["justsaying", "request", "response"];

impl Serialize for Frame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Justsaying(content) => ("justsaying", content).serialize(serializer),
            Self::Request(content) => ("request", content).serialize(serializer),
            Self::Response(content) => ("response", content).serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Frame {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (kind, content) = <(String, Value)>::deserialize(deserializer)?;

        let frame = match kind.as_str() {
            "justsaying" => serde_json::from_value(content).map(Self::Justsaying),
            "request" => serde_json::from_value(content).map(Self::Request),
            "response" => serde_json::from_value(content).map(Self::Response),
            other => return Err(D::Error::unknown_variant(other, FRAME_TYPES)),
        };

        frame.map_err(D::Error::custom)
    }
}

/// One-way notice.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Justsaying {
    pub subject: String,
    #[serde(default)]
    pub body: Value,
}

impl Justsaying {
    #[must_use]
    pub fn new(subject: Subject, body: Value) -> Self {
        Self {
            subject: subject.to_string(),
            body,
        }
    }
}

#[derive(AsRefStr, Clone, Copy, Debug, Display, EnumString, Eq, Hash, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum Subject {
    Version,
    Refresh,
    Joint,
    FreeJointsEnd,
    Result,
    Info,
    Error,
    PrivatePayment,
    MyUrl,
    WantEcho,
    YourEcho,
    Bugreport,
    #[strum(serialize = "hub/challenge")]
    HubChallenge,
    #[strum(serialize = "hub/message")]
    HubMessage,
    #[strum(serialize = "hub/login")]
    HubLogin,
    #[strum(serialize = "hub/refresh")]
    HubRefresh,
    #[strum(serialize = "hub/delete")]
    HubDelete,
    #[strum(serialize = "light/have_updates")]
    LightHaveUpdates,
    #[strum(serialize = "light/new_address_to_watch")]
    LightNewAddressToWatch,
}

#[derive(AsRefStr, Clone, Copy, Debug, Display, EnumString, Eq, Hash, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum Command {
    Heartbeat,
    Subscribe,
    GetJoint,
    PostJoint,
    Catchup,
    GetHashTree,
    GetPeers,
    GetWitnesses,
    #[strum(serialize = "hub/deliver")]
    HubDeliver,
    #[strum(serialize = "hub/get_temp_pubkey")]
    HubGetTempPubkey,
    #[strum(serialize = "hub/temp_pubkey")]
    HubTempPubkey,
    #[strum(serialize = "light/get_history")]
    LightGetHistory,
    #[strum(serialize = "light/get_link_proofs")]
    LightGetLinkProofs,
    #[strum(serialize = "light/get_parents_and_last_ball_and_witness_list_unit")]
    LightGetParentsAndLastBallAndWitnessListUnit,
}

impl Command {
    #[must_use]
    pub fn is_hub(self) -> bool {
        self.as_ref().starts_with("hub/")
    }

    #[must_use]
    pub fn is_light(self) -> bool {
        self.as_ref().starts_with("light/")
    }
}

/// Content hash of a request's `{command, params}`.
///
/// Identical requests share a tag, which is how the correlator collapses
/// them onto one wire request.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(String);

impl Tag {
    #[must_use]
    pub fn of(command: &str, params: Option<&Value>) -> Self {
        let mut body = Map::new();
        drop(body.insert("command".to_owned(), Value::from(command)));
        if let Some(params) = params {
            drop(body.insert("params".to_owned(), params.clone()));
        }

        Self(json_hash(&Value::Object(body)))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Tag {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Tag").field(&self.0).finish()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    pub tag: Tag,
}

impl Request {
    #[must_use]
    pub fn new(command: Command, params: Option<Value>) -> Self {
        let tag = Tag::of(command.as_ref(), params.as_ref());

        Self {
            command: command.to_string(),
            params,
            tag,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub tag: Tag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
}

impl Response {
    #[must_use]
    pub const fn new(tag: Tag, response: Option<Value>) -> Self {
        Self { tag, response }
    }

    #[must_use]
    pub fn error(tag: Tag, error: &str) -> Self {
        Self::new(tag, Some(json!({ "error": error })))
    }
}

/// The `error` member of a response payload, if any.
#[must_use]
pub fn response_error(response: Option<&Value>) -> Option<&str> {
    response?.get("error")?.as_str()
}
