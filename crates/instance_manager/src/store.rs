//! # Instance Store
//!
//! The per-process mirror of registry state plus local bookkeeping of worlds
//! physically loaded in this process.
//!
//! The mirror is eventually consistent and read-only outside its own watch
//! task: reads answer routing queries within a bounded staleness window,
//! while anything that writes re-verifies against the registry. Convergence
//! relies on the generation contract - a watcher applies an event only when
//! its generation is exactly one greater than the locally known value, and
//! anything else forces a re-fetch of that key. A lapsed watch (lagged or
//! closed subscription) forces a full re-scan.

use crate::capability::WorldHandle;
use crate::error::WorldResult;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};
use waygate_registry::{
    ChangeEvent, InstanceId, InstanceRecord, KeyPrefix, Registry, RegistryKey, ShardId,
    ShardRecord, Versioned,
};

/// How long the watch loop waits before retrying after a failed re-scan.
const RESYNC_RETRY: Duration = Duration::from_millis(500);

struct MirrorEntry<T> {
    generation: u64,
    record: T,
    refreshed_at: Instant,
}

/// A copy of a mirrored record plus how fresh it is.
#[derive(Debug, Clone)]
pub struct MirrorSnapshot<T> {
    pub generation: u64,
    pub record: T,
    refreshed_at: Instant,
}

impl<T> MirrorSnapshot<T> {
    /// Time since this entry was last confirmed against the registry.
    pub fn age(&self) -> Duration {
        self.refreshed_at.elapsed()
    }
}

/// Per-process cache of registry state and locally loaded worlds.
pub struct InstanceStore {
    registry: Arc<dyn Registry>,
    instances: DashMap<InstanceId, MirrorEntry<InstanceRecord>>,
    shards: DashMap<ShardId, MirrorEntry<ShardRecord>>,
    worlds: DashMap<InstanceId, WorldHandle>,
}

impl InstanceStore {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            instances: DashMap::new(),
            shards: DashMap::new(),
            worlds: DashMap::new(),
        }
    }

    // ------------------------------------------------------------------
    // Mirror reads
    // ------------------------------------------------------------------

    /// Mirror copy of an instance record, if one is cached.
    pub fn instance(&self, id: &InstanceId) -> Option<MirrorSnapshot<InstanceRecord>> {
        self.instances.get(id).map(|entry| MirrorSnapshot {
            generation: entry.generation,
            record: entry.record.clone(),
            refreshed_at: entry.refreshed_at,
        })
    }

    /// Mirror copy of a shard record, if one is cached.
    pub fn shard(&self, id: &ShardId) -> Option<MirrorSnapshot<ShardRecord>> {
        self.shards.get(id).map(|entry| MirrorSnapshot {
            generation: entry.generation,
            record: entry.record.clone(),
            refreshed_at: entry.refreshed_at,
        })
    }

    // ------------------------------------------------------------------
    // Mirror writes (watch task and targeted refresh only)
    // ------------------------------------------------------------------

    /// Re-reads one instance from the registry and updates the mirror.
    pub async fn refresh_instance(
        &self,
        id: &InstanceId,
    ) -> WorldResult<Option<MirrorSnapshot<InstanceRecord>>> {
        let key = RegistryKey::Instance(*id);
        match self.registry.get(&key).await? {
            Some(versioned) => {
                let decoded: Versioned<InstanceRecord> = versioned.decode()?;
                let snapshot = MirrorSnapshot {
                    generation: decoded.generation,
                    record: decoded.value.clone(),
                    refreshed_at: Instant::now(),
                };
                self.instances.insert(
                    *id,
                    MirrorEntry {
                        generation: decoded.generation,
                        record: decoded.value,
                        refreshed_at: snapshot.refreshed_at,
                    },
                );
                Ok(Some(snapshot))
            }
            None => {
                self.instances.remove(id);
                Ok(None)
            }
        }
    }

    /// Re-reads one shard from the registry and updates the mirror.
    pub async fn refresh_shard(
        &self,
        id: &ShardId,
    ) -> WorldResult<Option<MirrorSnapshot<ShardRecord>>> {
        let key = RegistryKey::Shard(id.clone());
        match self.registry.get(&key).await? {
            Some(versioned) => {
                let decoded: Versioned<ShardRecord> = versioned.decode()?;
                let snapshot = MirrorSnapshot {
                    generation: decoded.generation,
                    record: decoded.value.clone(),
                    refreshed_at: Instant::now(),
                };
                self.shards.insert(
                    id.clone(),
                    MirrorEntry {
                        generation: decoded.generation,
                        record: decoded.value,
                        refreshed_at: snapshot.refreshed_at,
                    },
                );
                Ok(Some(snapshot))
            }
            None => {
                self.shards.remove(id);
                Ok(None)
            }
        }
    }

    /// Replaces both mirrors with a full registry scan.
    pub async fn resync(&self) -> WorldResult<()> {
        let now = Instant::now();

        let instances = self.registry.scan(KeyPrefix::Instances).await?;
        let mut seen_instances = HashSet::new();
        for (key, versioned) in instances {
            if let RegistryKey::Instance(id) = key {
                let decoded: Versioned<InstanceRecord> = versioned.decode()?;
                seen_instances.insert(id);
                self.instances.insert(
                    id,
                    MirrorEntry {
                        generation: decoded.generation,
                        record: decoded.value,
                        refreshed_at: now,
                    },
                );
            }
        }
        self.instances.retain(|id, _| seen_instances.contains(id));

        let shards = self.registry.scan(KeyPrefix::Shards).await?;
        let mut seen_shards = HashSet::new();
        for (key, versioned) in shards {
            if let RegistryKey::Shard(id) = key {
                let decoded: Versioned<ShardRecord> = versioned.decode()?;
                seen_shards.insert(id.clone());
                self.shards.insert(
                    id,
                    MirrorEntry {
                        generation: decoded.generation,
                        record: decoded.value,
                        refreshed_at: now,
                    },
                );
            }
        }
        self.shards.retain(|id, _| seen_shards.contains(id));

        debug!(
            instances = self.instances.len(),
            shards = self.shards.len(),
            "mirror resynced"
        );
        Ok(())
    }

    /// Applies one change event, enforcing the generation-ordering rule.
    async fn apply_event(&self, event: ChangeEvent) {
        match &event.key {
            RegistryKey::Instance(id) => {
                let known = self.instances.get(id).map(|entry| entry.generation);
                match Self::classify(known, &event) {
                    EventAction::Apply => {
                        if let Some(record) = Self::decode_event::<InstanceRecord>(&event) {
                            self.instances.insert(
                                *id,
                                MirrorEntry {
                                    generation: event.generation,
                                    record,
                                    refreshed_at: Instant::now(),
                                },
                            );
                        }
                    }
                    EventAction::Remove => {
                        self.instances.remove(id);
                    }
                    EventAction::Drop => trace!(instance = %id, "dropped stale event"),
                    EventAction::Refetch => {
                        debug!(instance = %id, generation = event.generation, "generation gap, re-fetching");
                        if let Err(error) = self.refresh_instance(id).await {
                            warn!(instance = %id, %error, "re-fetch after generation gap failed");
                        }
                    }
                }
            }
            RegistryKey::Shard(id) => {
                let known = self.shards.get(id).map(|entry| entry.generation);
                match Self::classify(known, &event) {
                    EventAction::Apply => {
                        if let Some(record) = Self::decode_event::<ShardRecord>(&event) {
                            self.shards.insert(
                                id.clone(),
                                MirrorEntry {
                                    generation: event.generation,
                                    record,
                                    refreshed_at: Instant::now(),
                                },
                            );
                        }
                    }
                    EventAction::Remove => {
                        self.shards.remove(id);
                    }
                    EventAction::Drop => trace!(shard = %id, "dropped stale event"),
                    EventAction::Refetch => {
                        debug!(shard = %id, generation = event.generation, "generation gap, re-fetching");
                        if let Err(error) = self.refresh_shard(id).await {
                            warn!(shard = %id, %error, "re-fetch after generation gap failed");
                        }
                    }
                }
            }
        }
    }

    fn classify(known: Option<u64>, event: &ChangeEvent) -> EventAction {
        if event.value.is_none() {
            return EventAction::Remove;
        }
        match known {
            Some(generation) if event.generation == generation + 1 => EventAction::Apply,
            Some(generation) if event.generation <= generation => EventAction::Drop,
            None if event.generation == 1 => EventAction::Apply,
            _ => EventAction::Refetch,
        }
    }

    fn decode_event<T: DeserializeOwned>(event: &ChangeEvent) -> Option<T> {
        let value = event.value.clone()?;
        match serde_json::from_value(value) {
            Ok(record) => Some(record),
            Err(error) => {
                warn!(key = %event.key, %error, "undecodable change event");
                None
            }
        }
    }

    /// Consumes the registry watch streams until shutdown.
    ///
    /// Performs an initial resync, then applies events in generation order.
    /// Any lapse restarts the watch and re-scans; a closed registry ends the
    /// task.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        if let Err(error) = self.resync().await {
            warn!(%error, "initial mirror sync failed, continuing from watch events");
        }
        let mut instances = self.registry.watch(KeyPrefix::Instances);
        let mut shards = self.registry.watch(KeyPrefix::Shards);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("instance store shutting down");
                    break;
                }
                event = instances.next() => match event {
                    Ok(event) => self.apply_event(event).await,
                    Err(lapse) => {
                        warn!(?lapse, "instance watch lapsed, re-scanning");
                        instances = self.registry.watch(KeyPrefix::Instances);
                        if self.resync().await.is_err() {
                            tokio::time::sleep(RESYNC_RETRY).await;
                        }
                    }
                },
                event = shards.next() => match event {
                    Ok(event) => self.apply_event(event).await,
                    Err(lapse) => {
                        warn!(?lapse, "shard watch lapsed, re-scanning");
                        shards = self.registry.watch(KeyPrefix::Shards);
                        if self.resync().await.is_err() {
                            tokio::time::sleep(RESYNC_RETRY).await;
                        }
                    }
                },
            }
        }
    }

    // ------------------------------------------------------------------
    // Local world bookkeeping
    // ------------------------------------------------------------------

    /// Records a world this process now physically hosts.
    pub fn record_loaded(&self, handle: WorldHandle) {
        self.worlds.insert(handle.instance_id, handle);
    }

    /// Handle of a locally loaded world, if present.
    pub fn loaded(&self, id: &InstanceId) -> Option<WorldHandle> {
        self.worlds.get(id).map(|entry| entry.value().clone())
    }

    /// Removes and returns the local handle once the world is torn down.
    pub fn take_loaded(&self, id: &InstanceId) -> Option<WorldHandle> {
        self.worlds.remove(id).map(|(_, handle)| handle)
    }

    /// Number of worlds physically loaded in this process.
    pub fn loaded_count(&self) -> usize {
        self.worlds.len()
    }

    /// Ids of all locally loaded worlds, for the shard heartbeat record.
    pub fn loaded_ids(&self) -> HashSet<InstanceId> {
        self.worlds.iter().map(|entry| *entry.key()).collect()
    }
}

enum EventAction {
    Apply,
    Remove,
    Drop,
    Refetch,
}
