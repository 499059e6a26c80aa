//! State enums for definitions, instances, elements and participants

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a composition definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AcTypeState {
    Commissioned,
    Priming,
    Primed,
    Depriming,
}

impl AcTypeState {
    /// Whether a prime/deprime operation is in flight
    pub fn is_transitional(&self) -> bool {
        matches!(self, AcTypeState::Priming | AcTypeState::Depriming)
    }

    /// State every element must reach for the transitional state to complete
    pub fn completion_target(&self) -> AcTypeState {
        match self {
            AcTypeState::Priming | AcTypeState::Primed => AcTypeState::Primed,
            AcTypeState::Depriming | AcTypeState::Commissioned => AcTypeState::Commissioned,
        }
    }
}

/// Deployment state of an instance or an element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeployState {
    Undeployed,
    Deploying,
    Deployed,
    Undeploying,
    Deleting,
    Deleted,
    Updating,
    Migrating,
    MigrationReverting,
}

impl DeployState {
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            DeployState::Deploying
                | DeployState::Undeploying
                | DeployState::Deleting
                | DeployState::Updating
                | DeployState::Migrating
                | DeployState::MigrationReverting
        )
    }

    pub fn is_migrating(&self) -> bool {
        matches!(
            self,
            DeployState::Migrating | DeployState::MigrationReverting
        )
    }
}

/// Lock state, only meaningful while deployed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockState {
    None,
    Unlocked,
    Locking,
    Locked,
    Unlocking,
}

impl LockState {
    pub fn is_transitional(&self) -> bool {
        matches!(self, LockState::Locking | LockState::Unlocking)
    }
}

/// In-flight marker for compound operations that leave deploy and lock
/// state untouched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubState {
    #[default]
    None,
    Preparing,
    Reviewing,
    MigrationPrechecking,
}

/// Outcome recorded for the last state change
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateChangeResult {
    #[default]
    NoError,
    Failed,
}

/// Liveness of a participant or one of its replicas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantState {
    OnLine,
    OffLine,
}

/// Classification of an element during migration or rollback
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ElementState {
    /// Present before and after; updated in place
    #[default]
    Present,
    /// Added by the migration
    New,
    /// Removed by the migration
    Removed,
    /// Unknown to both source and target definitions; left untouched
    NotPresent,
}

/// Deploy-level command carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeployOrder {
    None,
    Deploy,
    Undeploy,
    Delete,
    Update,
    Migrate,
}

/// Lock-level command carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockOrder {
    None,
    Lock,
    Unlock,
}

macro_rules! display_via_serde {
    ($($ty:ty),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    match serde_json::to_value(self) {
                        Ok(serde_json::Value::String(s)) => f.write_str(&s),
                        _ => write!(f, "{:?}", self),
                    }
                }
            }
        )*
    };
}

display_via_serde!(
    AcTypeState,
    DeployState,
    LockState,
    SubState,
    StateChangeResult,
    ParticipantState,
    ElementState
);

/// State an element or instance settles in once its deploy transition
/// completes. Non-transitional states map to themselves.
pub fn deploy_completed(state: DeployState) -> DeployState {
    match state {
        DeployState::Migrating
        | DeployState::MigrationReverting
        | DeployState::Updating
        | DeployState::Deploying => DeployState::Deployed,
        DeployState::Undeploying => DeployState::Undeployed,
        DeployState::Deleting => DeployState::Deleted,
        other => other,
    }
}

/// Lock state that accompanies a completed transition
pub fn lock_completed(deploy: DeployState, lock: LockState) -> LockState {
    if matches!(lock, LockState::Locking) || deploy == DeployState::Deploying {
        return LockState::Locked;
    }
    if matches!(lock, LockState::Unlocking) {
        return LockState::Unlocked;
    }
    if deploy == DeployState::Undeploying {
        return LockState::None;
    }
    lock
}

/// Forward operations run start phases in ascending order, all others in
/// descending order.
pub fn is_forward(deploy: DeployState, lock: LockState) -> bool {
    deploy == DeployState::Deploying || lock == LockState::Unlocking
}

/// Whether any operation is in flight for the given composite state
pub fn is_in_transitional_state(deploy: DeployState, lock: LockState, sub: SubState) -> bool {
    deploy.is_transitional() || lock.is_transitional() || sub != SubState::None
}
