use serde::{Deserialize, Serialize};

use crate::common::is_false;
use crate::id::{BallHash, UnitId};

/// One entry of a hash tree: the ball of a stable unit and the balls it
/// builds on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashTreeBall {
    pub unit: UnitId,
    pub ball: BallHash,
    #[serde(default)]
    pub parent_balls: Vec<BallHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skiplist_balls: Option<Vec<BallHash>>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_nonserial: bool,
}
