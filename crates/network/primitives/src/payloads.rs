use jointmesh_primitives::constants::{ALT, PROGRAM, PROGRAM_VERSION, PROTOCOL_VERSION};
use jointmesh_primitives::id::UnitId;
use jointmesh_primitives::joint::Joint;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub protocol_version: String,
    pub alt: String,
    #[serde(default)]
    pub program: String,
    #[serde(default)]
    pub program_version: String,
}

impl VersionInfo {
    #[must_use]
    pub fn current() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_owned(),
            alt: ALT.to_owned(),
            program: PROGRAM.to_owned(),
            program_version: PROGRAM_VERSION.to_owned(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeParams {
    pub subscription_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_mci: Option<u64>,
}

/// Answer to `get_joint`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JointResponse {
    Found { joint: Box<Joint> },
    NotFound { joint_not_found: UnitId },
}

/// Body of the `result` notice sent back to the peer that pushed a joint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JointResult {
    pub unit: UnitId,
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JointResult {
    #[must_use]
    pub fn new(unit: UnitId, result: &str) -> Self {
        Self {
            unit,
            result: result.to_owned(),
            error: None,
        }
    }

    #[must_use]
    pub fn error(unit: UnitId, error: String) -> Self {
        Self {
            unit,
            result: "error".to_owned(),
            error: Some(error),
        }
    }
}
