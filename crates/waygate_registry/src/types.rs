//! # Record Types
//!
//! The replicated record schema shared by every process in a Waygate cluster.
//! These types are the wire-visible truth about instances and shards; every
//! other component works on copies of them obtained through the registry.
//!
//! ## Key Types
//!
//! - [`InstanceId`] / [`PlayerId`] / [`ShardId`] / [`TemplateId`] - typed
//!   identifiers
//! - [`InstanceState`] - the lifecycle state machine
//! - [`InstanceRecord`] - one ephemeral world instance
//! - [`ShardRecord`] - one game-server process and its heartbeat
//!
//! ## Design Principles
//!
//! - **Type Safety**: Wrapper types prevent ID confusion (a `PlayerId` can
//!   never be passed where a `ShardId` is expected)
//! - **Serialization**: All records serialize to JSON for registry storage
//! - **Fencing**: Every record carries the `generation` it was committed at,
//!   so stale writers are rejected by compare-and-set

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for one ephemeral world instance.
///
/// Instance identity is deterministic: the instance occupying slot `n` of a
/// template always has the same id on every process, derived with UUIDv5.
/// That determinism is what makes concurrent creation race on a single
/// registry key instead of silently producing duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    /// Derives the identifier for a given `(template, slot)` pair.
    ///
    /// Every process computes the same id for the same pair, so two shards
    /// creating "the next instance of dungeon-1" collide on one registry key
    /// and exactly one of them wins the create.
    pub fn for_slot(template: &TemplateId, slot: u32) -> Self {
        let name = format!("{}/{}", template.0, slot);
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()))
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlayerId(pub Uuid);

impl PlayerId {
    /// Creates a new random player ID using UUID v4.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PlayerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Operator-assigned name of one game-server process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(pub String);

impl ShardId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a world template that instances are stamped out from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TemplateId(pub String);

impl TemplateId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl std::fmt::Display for TemplateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Instance State Machine
// ============================================================================

/// Lifecycle state of one instance.
///
/// Transitions are `Pending -> Loading -> Active -> Draining -> Unloaded`,
/// with `Failed` reachable from `Loading` or `Active` on unrecoverable error
/// and `Unloaded -> Pending` permitted when a slot is recycled for reuse.
/// Nothing mutates a record's state except through a registry
/// compare-and-set that respects this table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    /// Record exists, no world loaded anywhere, claimable.
    Pending,
    /// A shard has claimed the instance and is loading the world.
    Loading,
    /// World is loaded and accepting players.
    Active,
    /// Winding down; no new players, teardown once empty.
    Draining,
    /// World torn down, ownership cleared, slot recyclable.
    Unloaded,
    /// Unrecoverable load or shard failure; operator policy decides recreation.
    Failed,
}

impl InstanceState {
    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Pending, Loading)
                | (Loading, Active)
                | (Loading, Failed)
                | (Active, Draining)
                | (Active, Failed)
                | (Draining, Unloaded)
                | (Unloaded, Pending)
        )
    }

    /// States a claim may start from. `Unloaded` records are recycled back
    /// through `Pending` before the claim commits.
    pub fn is_reusable(self) -> bool {
        matches!(self, InstanceState::Pending | InstanceState::Unloaded)
    }

    /// States in which players can be routed to the instance.
    pub fn is_routable(self) -> bool {
        matches!(self, InstanceState::Active)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            InstanceState::Pending => "pending",
            InstanceState::Loading => "loading",
            InstanceState::Active => "active",
            InstanceState::Draining => "draining",
            InstanceState::Unloaded => "unloaded",
            InstanceState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

// ============================================================================
// Records
// ============================================================================

/// One ephemeral world instance as stored in the registry.
///
/// At most one shard holds `Active` ownership of an instance at any time.
/// Every committed write increments `generation` by exactly one; a writer
/// presenting a stale generation is rejected by the registry, which is the
/// only defense against two processes mutating the same instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: InstanceId,
    pub template_id: TemplateId,
    /// Which numbered copy of the template this is. Slot plus template fully
    /// determine [`InstanceId`].
    pub slot: u32,
    /// Shard currently hosting the loaded world, if any.
    pub owner_shard: Option<ShardId>,
    pub state: InstanceState,
    /// Players currently assigned to the instance. Empty when idle.
    pub occupants: HashSet<PlayerId>,
    /// Creation time, epoch milliseconds.
    pub created_at: u64,
    /// Time of the last committed write, epoch milliseconds. Drives the
    /// retention purge for `Unloaded` records.
    pub last_write_at: u64,
    /// Fencing token; equals the registry generation this copy was committed
    /// at. Zero only before the first commit.
    pub generation: u64,
}

impl InstanceRecord {
    /// Builds a fresh, unowned `Pending` record for a template slot.
    pub fn new(template_id: TemplateId, slot: u32, now: u64) -> Self {
        Self {
            instance_id: InstanceId::for_slot(&template_id, slot),
            template_id,
            slot,
            owner_shard: None,
            state: InstanceState::Pending,
            occupants: HashSet::new(),
            created_at: now,
            last_write_at: now,
            generation: 0,
        }
    }

    /// True when the record can be claimed by a shard: reusable state and
    /// nobody owns it.
    pub fn is_claimable(&self) -> bool {
        self.state.is_reusable() && self.owner_shard.is_none()
    }

    /// True when `shard` currently owns this record.
    pub fn is_owned_by(&self, shard: &ShardId) -> bool {
        self.owner_shard.as_ref() == Some(shard)
    }
}

/// One game-server process as stored in the registry.
///
/// Refreshed by periodic heartbeats; a shard whose `last_heartbeat_at` lapses
/// past the liveness threshold has its instances force-reclaimed, and past
/// the eviction threshold the record itself is removed.
///
/// Invariant: `loaded_instance_ids` is always a subset of the instances whose
/// `owner_shard` is this shard. Writers preserve it by ordering their
/// commits: add to the set only after ownership is committed, remove from it
/// before ownership is released.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRecord {
    pub shard_id: ShardId,
    /// Proxy-visible endpoint players are transferred to.
    pub address: String,
    /// Maximum number of concurrently hosted instances.
    pub capacity: usize,
    pub loaded_instance_ids: HashSet<InstanceId>,
    /// Epoch milliseconds of the last heartbeat upsert.
    pub last_heartbeat_at: u64,
    /// Fencing token, same contract as [`InstanceRecord::generation`].
    pub generation: u64,
}

impl ShardRecord {
    pub fn new(shard_id: ShardId, address: impl Into<String>, capacity: usize, now: u64) -> Self {
        Self {
            shard_id,
            address: address.into(),
            capacity,
            loaded_instance_ids: HashSet::new(),
            last_heartbeat_at: now,
            generation: 0,
        }
    }

    /// Milliseconds since the last heartbeat, saturating at zero for clock
    /// skew between writer and reader.
    pub fn heartbeat_age(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_heartbeat_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_id_is_deterministic_per_slot() {
        let template = TemplateId::new("dungeon-1");
        let a = InstanceId::for_slot(&template, 0);
        let b = InstanceId::for_slot(&template, 0);
        let c = InstanceId::for_slot(&template, 1);
        let other = InstanceId::for_slot(&TemplateId::new("dungeon-2"), 0);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, other);
    }

    #[test]
    fn test_state_machine_permits_the_documented_path() {
        use InstanceState::*;
        assert!(Pending.can_transition_to(Loading));
        assert!(Loading.can_transition_to(Active));
        assert!(Active.can_transition_to(Draining));
        assert!(Draining.can_transition_to(Unloaded));
        assert!(Unloaded.can_transition_to(Pending));
        assert!(Loading.can_transition_to(Failed));
        assert!(Active.can_transition_to(Failed));
    }

    #[test]
    fn test_state_machine_rejects_shortcuts() {
        use InstanceState::*;
        assert!(!Pending.can_transition_to(Active));
        assert!(!Loading.can_transition_to(Draining));
        assert!(!Draining.can_transition_to(Active));
        assert!(!Unloaded.can_transition_to(Loading));
        assert!(!Failed.can_transition_to(Active));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Active.can_transition_to(Active));
    }

    #[test]
    fn test_new_record_is_claimable() {
        let record = InstanceRecord::new(TemplateId::new("arena"), 3, 1_000);
        assert!(record.is_claimable());
        assert_eq!(record.state, InstanceState::Pending);
        assert_eq!(record.slot, 3);
        assert!(record.occupants.is_empty());
        assert_eq!(record.generation, 0);
    }

    #[test]
    fn test_owned_record_is_not_claimable() {
        let mut record = InstanceRecord::new(TemplateId::new("arena"), 0, 1_000);
        record.owner_shard = Some(ShardId::new("shard-a"));
        assert!(!record.is_claimable());
        assert!(record.is_owned_by(&ShardId::new("shard-a")));
        assert!(!record.is_owned_by(&ShardId::new("shard-b")));
    }

    #[test]
    fn test_record_serde_round_trip() {
        let mut record = InstanceRecord::new(TemplateId::new("dungeon-1"), 1, 42);
        record.occupants.insert(PlayerId::new());
        record.owner_shard = Some(ShardId::new("shard-a"));
        record.state = InstanceState::Active;
        let json = serde_json::to_value(&record).unwrap();
        let back: InstanceRecord = serde_json::from_value(json).unwrap();
        assert_eq!(record, back);
    }

    #[test]
    fn test_heartbeat_age_saturates() {
        let record = ShardRecord::new(ShardId::new("shard-a"), "10.0.0.1:25565", 4, 5_000);
        assert_eq!(record.heartbeat_age(7_500), 2_500);
        assert_eq!(record.heartbeat_age(4_000), 0);
    }
}
