//! Transition legality for instance operations
//!
//! An operation is legal from a settled state, or from the transitional state
//! of a FAILED operation it retries or reverses. Everything else is rejected
//! before any message is sent.

use crate::state::{DeployState, LockState, StateChangeResult, SubState};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Operation requested on an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Deploy,
    Undeploy,
    Delete,
    Lock,
    Unlock,
    Update,
    Migrate,
    MigratePrecheck,
    Rollback,
    Prepare,
    Review,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Deploy => "deploy",
            Operation::Undeploy => "undeploy",
            Operation::Delete => "delete",
            Operation::Lock => "lock",
            Operation::Unlock => "unlock",
            Operation::Update => "update",
            Operation::Migrate => "migrate",
            Operation::MigratePrecheck => "migrate-precheck",
            Operation::Rollback => "rollback",
            Operation::Prepare => "prepare",
            Operation::Review => "review",
        };
        f.write_str(name)
    }
}

/// Composite state of an instance as seen by the resolver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompositeState {
    pub deploy: DeployState,
    pub lock: LockState,
    pub sub: SubState,
    pub result: StateChangeResult,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{operation} not allowed while {deploy}/{lock}/{sub} ({result})")]
pub struct TransitionRejected {
    pub operation: Operation,
    pub deploy: DeployState,
    pub lock: LockState,
    pub sub: SubState,
    pub result: StateChangeResult,
}

/// Check whether `operation` may start from `state`
pub fn resolve(operation: Operation, state: CompositeState) -> Result<(), TransitionRejected> {
    use DeployState as D;
    use LockState as L;
    use SubState as S;

    let failed = state.result == StateChangeResult::Failed;
    // A failed sub operation leaves deploy-level operations free to run
    let settled_sub = state.sub == S::None || failed;
    let deployed_locked = state.deploy == D::Deployed && state.lock == L::Locked;

    let allowed = match operation {
        Operation::Deploy => {
            (state.deploy == D::Undeployed && settled_sub)
                || (matches!(state.deploy, D::Deploying | D::Undeploying) && failed)
        }
        Operation::Undeploy => {
            (deployed_locked && settled_sub)
                || (matches!(
                    state.deploy,
                    D::Deploying | D::Undeploying | D::Updating | D::Migrating | D::MigrationReverting
                ) && failed)
        }
        Operation::Delete => {
            (state.deploy == D::Undeployed && settled_sub)
                || (state.deploy == D::Deployed && !state.lock.is_transitional() && settled_sub)
                || (state.deploy == D::Deleting && failed)
        }
        Operation::Lock => {
            state.deploy == D::Deployed
                && settled_sub
                && (state.lock == L::Unlocked || (state.lock.is_transitional() && failed))
        }
        Operation::Unlock => {
            state.deploy == D::Deployed
                && settled_sub
                && (state.lock == L::Locked || (state.lock.is_transitional() && failed))
        }
        Operation::Update => {
            (deployed_locked && settled_sub) || (state.deploy == D::Updating && failed)
        }
        Operation::Migrate => deployed_locked && settled_sub,
        Operation::MigratePrecheck => {
            deployed_locked && (settled_sub || (state.sub == S::MigrationPrechecking && failed))
        }
        Operation::Rollback => state.deploy.is_migrating() && failed,
        Operation::Prepare => {
            state.deploy == D::Undeployed
                && (settled_sub || (state.sub == S::Preparing && failed))
        }
        Operation::Review => {
            deployed_locked && (settled_sub || (state.sub == S::Reviewing && failed))
        }
    };

    if allowed {
        Ok(())
    } else {
        Err(TransitionRejected {
            operation,
            deploy: state.deploy,
            lock: state.lock,
            sub: state.sub,
            result: state.result,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(deploy: DeployState, lock: LockState) -> CompositeState {
        CompositeState {
            deploy,
            lock,
            sub: SubState::None,
            result: StateChangeResult::NoError,
        }
    }

    fn failed(mut s: CompositeState) -> CompositeState {
        s.result = StateChangeResult::Failed;
        s
    }

    #[test]
    fn test_deploy_from_undeployed() {
        assert!(resolve(Operation::Deploy, state(DeployState::Undeployed, LockState::None)).is_ok());
        assert!(resolve(Operation::Deploy, state(DeployState::Deployed, LockState::Locked)).is_err());
    }

    #[test]
    fn test_inflight_operation_rejects_new_commands() {
        let deploying = state(DeployState::Deploying, LockState::None);
        assert!(resolve(Operation::Deploy, deploying).is_err());
        assert!(resolve(Operation::Undeploy, deploying).is_err());
        assert!(resolve(Operation::Delete, deploying).is_err());
    }

    #[test]
    fn test_failed_operation_can_be_retried_or_reversed() {
        let deploying = failed(state(DeployState::Deploying, LockState::None));
        assert!(resolve(Operation::Deploy, deploying).is_ok());
        assert!(resolve(Operation::Undeploy, deploying).is_ok());
    }

    #[test]
    fn test_lock_requires_deployed() {
        assert!(resolve(Operation::Lock, state(DeployState::Undeployed, LockState::None)).is_err());
        assert!(resolve(Operation::Lock, state(DeployState::Deployed, LockState::Unlocked)).is_ok());
        assert!(resolve(Operation::Unlock, state(DeployState::Deployed, LockState::Locked)).is_ok());
        assert!(resolve(Operation::Unlock, state(DeployState::Deployed, LockState::Unlocked)).is_err());
    }

    #[test]
    fn test_rollback_only_after_failed_migration() {
        let migrating = state(DeployState::Migrating, LockState::Locked);
        assert!(resolve(Operation::Rollback, migrating).is_err());
        assert!(resolve(Operation::Rollback, failed(migrating)).is_ok());
        assert!(resolve(Operation::Migrate, migrating).is_err());
    }

    #[test]
    fn test_sub_state_blocks_deploy_operations() {
        let mut reviewing = state(DeployState::Deployed, LockState::Locked);
        reviewing.sub = SubState::Reviewing;
        assert!(resolve(Operation::Undeploy, reviewing).is_err());
        assert!(resolve(Operation::Review, reviewing).is_err());
        assert!(resolve(Operation::Review, failed(reviewing)).is_ok());
        assert!(resolve(Operation::Undeploy, failed(reviewing)).is_ok());
    }

    #[test]
    fn test_rejection_message() {
        let err = resolve(Operation::Lock, state(DeployState::Undeployed, LockState::None))
            .unwrap_err();
        assert_eq!(err.to_string(), "lock not allowed while UNDEPLOYED/NONE/NONE (NO_ERROR)");
    }
}
