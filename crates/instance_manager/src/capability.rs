//! # External Capabilities
//!
//! The plugin-facing boundary of the core: the things a surrounding server
//! must provide for instances to become real. The core invokes these traits
//! and never reimplements them; physical template copying, engine world
//! loading, and proxy-side player moves all live behind them.
//!
//! Both world operations are expected to be idempotent on repeat calls for
//! the same instance, which is what lets release stay idempotent and lets
//! concurrent teardown paths race safely.

use async_trait::async_trait;
use thiserror::Error;
use waygate_registry::{InstanceId, PlayerId, TemplateId};

/// Opaque handle to a world physically loaded in this process.
///
/// Returned by [`WorldLoader::load_world`] and held by the instance store
/// until teardown; dropping it without `unload_world` leaks the world.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorldHandle {
    pub instance_id: InstanceId,
    pub template_id: TemplateId,
}

/// Failure to materialize a world from its template.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("template {0} does not exist")]
    TemplateMissing(TemplateId),

    #[error("world load failed: {0}")]
    Failed(String),
}

/// Failure to tear a loaded world down.
#[derive(Debug, Error)]
pub enum UnloadError {
    #[error("world unload failed: {0}")]
    Failed(String),
}

/// Failure to move a player to another shard.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("shard at {0} is unreachable")]
    ShardUnreachable(String),

    #[error("player transfer failed: {0}")]
    Failed(String),
}

/// Loads and unloads world instances inside this server process.
#[async_trait]
pub trait WorldLoader: Send + Sync {
    /// Materializes an instance of `template_id` for `instance_id` and
    /// returns a handle to it. Calling again for an already-loaded instance
    /// returns the same handle rather than failing.
    async fn load_world(
        &self,
        template_id: &TemplateId,
        instance_id: InstanceId,
    ) -> Result<WorldHandle, LoadError>;

    /// Tears the world down and releases its resources. A repeat call for an
    /// already-unloaded instance is a no-op.
    async fn unload_world(&self, handle: &WorldHandle) -> Result<(), UnloadError>;
}

/// Moves a connected player to a shard, invoked once the resolver has
/// produced a target.
#[async_trait]
pub trait PlayerTransfer: Send + Sync {
    async fn transfer_player(
        &self,
        player_id: PlayerId,
        shard_address: &str,
        instance_id: InstanceId,
    ) -> Result<(), TransferError>;
}
