//! Error taxonomy for the instance manager.
//!
//! The split matters more than the variants: contention (`ClaimConflict`) and
//! outage (`RegistryUnavailable`) are retried inside the manager with a
//! bounded budget, exhausted budgets surface as `ClaimFailed` or
//! `RegistryUnavailable`, and capability failures (`Load` / `Unload` /
//! `Transfer`) are never retried by the core at all.

use crate::capability::{LoadError, TransferError, UnloadError};
use thiserror::Error;
use waygate_registry::{InstanceId, RegistryError, ShardId};

/// Failures surfaced by the lifecycle manager and resolver.
#[derive(Debug, Error)]
pub enum WorldError {
    /// The shared registry is unreachable. Transient; the caller may retry
    /// after a backoff, but nothing was committed on its behalf.
    #[error("registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// A concurrent writer won the race for the record. Expected contention;
    /// re-request to retry against the updated record.
    #[error("claim lost to a concurrent writer")]
    ClaimConflict,

    /// The claim retry budget ran out under sustained contention.
    #[error("claim retries exhausted after {attempts} attempts")]
    ClaimFailed { attempts: u32 },

    /// This shard already hosts its configured maximum of instances.
    #[error("shard {shard} is at capacity ({capacity} instances)")]
    ShardAtCapacity { shard: ShardId, capacity: usize },

    /// The instance exists but is not in a state that permits the requested
    /// mutation. Caller error; not retried.
    #[error("instance {0} is not ready")]
    InstanceNotReady(InstanceId),

    /// No record exists for the instance.
    #[error("unknown instance {0}")]
    UnknownInstance(InstanceId),

    /// The world-loading capability failed. The instance is marked `Failed`
    /// and recreation is an operator or policy decision.
    #[error("world load failed: {0}")]
    Load(#[from] LoadError),

    /// The world-unloading capability failed. The instance stays `Draining`
    /// and is visible to operators; the core never retries the unload.
    #[error("world unload failed: {0}")]
    Unload(#[from] UnloadError),

    /// The player-transfer capability failed.
    #[error("player transfer failed: {0}")]
    Transfer(#[from] TransferError),

    /// The caller cancelled the request. If a claim had already committed,
    /// the instance was released through the normal drain path.
    #[error("request cancelled")]
    RequestCancelled,

    /// A bug or a corrupt record. Not recoverable by retrying.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<RegistryError> for WorldError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::Unavailable(message) => WorldError::RegistryUnavailable(message),
            other => WorldError::Internal(other.to_string()),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type WorldResult<T> = Result<T, WorldError>;
