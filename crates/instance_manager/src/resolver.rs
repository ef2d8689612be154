//! # Routing Resolver
//!
//! Answers "which shard currently hosts instance X" so the proxy layer can
//! move a connecting player there. Reads are served from the instance-store
//! mirror while it is within the configured staleness bound, and re-fetched
//! from the registry otherwise; either way the answer is advisory, for
//! routing only. Ownership changes always re-verify at the lifecycle
//! manager, so a stale route costs a redirect, never a safety violation.
//!
//! An unresolvable instance is not a failure: the proxy reacts to
//! [`RouteOutcome::NeedsInstance`] by asking the lifecycle manager for an
//! instance and routing again.

use crate::capability::PlayerTransfer;
use crate::error::WorldResult;
use crate::store::InstanceStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use waygate_registry::{InstanceId, InstanceRecord, PlayerId, ShardId};

/// A registry-confirmed routing answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    pub instance_id: InstanceId,
    pub shard_id: ShardId,
    /// Proxy-visible endpoint of the owning shard.
    pub address: String,
    /// Instance generation the answer was derived from, for diagnostics and
    /// staleness reasoning downstream.
    pub generation: u64,
}

/// What happened to a player routing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// The player was handed to the owning shard.
    Transferred(RouteTarget),
    /// No routable instance exists; the caller should request one and retry.
    NeedsInstance,
}

/// Proxy-side resolver over the shared registry and the local mirror.
pub struct RoutingResolver {
    store: Arc<InstanceStore>,
    transfer: Arc<dyn PlayerTransfer>,
    staleness: Duration,
}

impl RoutingResolver {
    pub fn new(
        store: Arc<InstanceStore>,
        transfer: Arc<dyn PlayerTransfer>,
        staleness: Duration,
    ) -> Self {
        Self {
            store,
            transfer,
            staleness,
        }
    }

    /// Resolves the current owner of an instance, accepting mirror answers
    /// no older than the staleness bound.
    pub async fn resolve(&self, instance_id: &InstanceId) -> WorldResult<Option<RouteTarget>> {
        if let Some(snapshot) = self.store.instance(instance_id) {
            if snapshot.age() <= self.staleness {
                return self.target_for(snapshot.generation, &snapshot.record).await;
            }
        }
        self.resolve_fresh(instance_id).await
    }

    /// Resolves against the registry, bypassing the mirror. The answer is
    /// still advisory, but it is as fresh as an answer can be.
    pub async fn resolve_fresh(
        &self,
        instance_id: &InstanceId,
    ) -> WorldResult<Option<RouteTarget>> {
        match self.store.refresh_instance(instance_id).await? {
            Some(snapshot) => self.target_for(snapshot.generation, &snapshot.record).await,
            None => Ok(None),
        }
    }

    async fn target_for(
        &self,
        generation: u64,
        record: &InstanceRecord,
    ) -> WorldResult<Option<RouteTarget>> {
        if !record.state.is_routable() {
            return Ok(None);
        }
        let Some(owner) = record.owner_shard.clone() else {
            return Ok(None);
        };

        // The shard's address changes rarely; take the mirror's copy and
        // fall back to the registry when the shard is not mirrored yet.
        let shard = match self.store.shard(&owner) {
            Some(snapshot) => Some(snapshot),
            None => self.store.refresh_shard(&owner).await?,
        };
        let Some(shard) = shard else {
            debug!(instance = %record.instance_id, owner = %owner,
                "owner shard has no record, not routing");
            return Ok(None);
        };

        Ok(Some(RouteTarget {
            instance_id: record.instance_id,
            shard_id: owner,
            address: shard.record.address.clone(),
            generation,
        }))
    }

    /// Resolves an instance and hands the player to its owner.
    pub async fn route_player(
        &self,
        player_id: PlayerId,
        instance_id: &InstanceId,
    ) -> WorldResult<RouteOutcome> {
        match self.resolve(instance_id).await? {
            None => Ok(RouteOutcome::NeedsInstance),
            Some(target) => {
                self.transfer
                    .transfer_player(player_id, &target.address, *instance_id)
                    .await?;
                debug!(player = %player_id, instance = %instance_id,
                    shard = %target.shard_id, "player routed");
                Ok(RouteOutcome::Transferred(target))
            }
        }
    }
}
