use core::fmt;

use async_trait::async_trait;
use jointmesh_primitives::id::UnitId;
use jointmesh_primitives::joint::Joint;
use jointmesh_store::types::ValidationState;

/// Everything validation can conclude about a joint.
#[derive(Debug)]
pub enum ValidationOutcome {
    /// The unit itself is invalid. It is stored as known bad.
    UnitError(String),
    /// The envelope is invalid, e.g. a wrong ball. The unit may still be
    /// good if it arrives in another joint.
    JointError(String),
    /// Validation could not complete right now; try again later.
    TransientError(String),
    /// The joint is too far ahead of us to resolve its ancestry unit by
    /// unit.
    NeedHashTree,
    NeedParentUnits(Vec<UnitId>),
    Ok {
        state: ValidationState,
        lock: ValidationLock,
    },
    /// A locally composed joint that is not signed yet.
    OkUnsigned {
        serial: bool,
    },
}

/// Held by the caller until an accepted joint is saved. Dropping it
/// releases whatever the validator locked for that joint.
#[derive(Default)]
pub struct ValidationLock(Option<Box<dyn Send + Sync>>);

impl ValidationLock {
    #[must_use]
    pub fn new<T: Send + Sync + 'static>(guard: T) -> Self {
        Self(Some(Box::new(guard)))
    }

    #[must_use]
    pub const fn none() -> Self {
        Self(None)
    }
}

impl fmt::Debug for ValidationLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ValidationLock")
            .field(&self.0.is_some())
            .finish()
    }
}

#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, joint: &Joint) -> ValidationOutcome;
}
