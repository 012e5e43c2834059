use jointmesh_primitives::id::UnitId;
use jointmesh_primitives::joint::Joint;
use serde::Serialize;
use serde_json::Value;

/// Notifications for the rest of the node and for wallets.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
#[non_exhaustive]
pub enum NodeEvent {
    NewJoint {
        joint: Box<Joint>,
    },
    Validated {
        unit: UnitId,
        serial: bool,
    },
    /// A saved joint touches one of our watched addresses.
    NewMyTransaction {
        units: Vec<UnitId>,
    },
    MyTransactionBecameStable {
        units: Vec<UnitId>,
    },
    CatchingUpStarted,
    CatchingUpDone,
    MessageFromHub {
        peer: String,
        subject: String,
        body: Value,
    },
    MessageForLight {
        peer: String,
        subject: String,
        body: Value,
    },
    PrivatePayment {
        peer: String,
        body: Value,
    },
    BugReport {
        peer: String,
        body: Value,
    },
}
