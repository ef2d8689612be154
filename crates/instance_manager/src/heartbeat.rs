//! # Heartbeat & Liveness Monitor
//!
//! Each shard periodically upserts its own `ShardRecord`; the monitor scans
//! for shards whose heartbeat has lapsed and force-reclaims every instance
//! they owned. This is the only mechanism that recovers instances after an
//! unclean shard crash.
//!
//! The monitor is leaderless: any process may run it, every reclaim is a
//! generation-fenced compare-and-set, and a conflict just means another
//! monitor (or the returning shard) got there first. Redundant execution is
//! harmless, so there is nothing to elect.

use crate::config::{ManagerConfig, ShardConfig};
use crate::error::{WorldError, WorldResult};
use crate::store::InstanceStore;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use waygate_registry::{
    current_timestamp_millis, encode, CasOutcome, InstanceRecord, InstanceState, KeyPrefix,
    Registry, RegistryKey, ShardId, ShardRecord, Versioned,
};

/// What one monitor scan did, for logging and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Shards whose heartbeat exceeded the liveness threshold.
    pub stale_shards: usize,
    /// Instances force-reclaimed from stale shards.
    pub reclaimed_instances: usize,
    /// Shard records removed past the eviction threshold.
    pub evicted_shards: usize,
    /// `Unloaded` records deleted past the retention window.
    pub purged_records: usize,
}

impl ScanReport {
    pub fn any_action(&self) -> bool {
        self.stale_shards > 0
            || self.reclaimed_instances > 0
            || self.evicted_shards > 0
            || self.purged_records > 0
    }
}

/// Heartbeat writer for this shard plus the cluster-wide liveness scan.
pub struct HeartbeatMonitor {
    registry: Arc<dyn Registry>,
    store: Arc<InstanceStore>,
    shard: ShardConfig,
    config: ManagerConfig,
}

impl HeartbeatMonitor {
    pub fn new(
        registry: Arc<dyn Registry>,
        store: Arc<InstanceStore>,
        shard: ShardConfig,
        config: ManagerConfig,
    ) -> Self {
        Self {
            registry,
            store,
            shard,
            config,
        }
    }

    fn shard_id(&self) -> ShardId {
        ShardId::new(self.shard.shard_id.clone())
    }

    // ------------------------------------------------------------------
    // Heartbeats
    // ------------------------------------------------------------------

    /// Creates or refreshes this shard's record on startup.
    pub async fn register_shard(&self) -> WorldResult<()> {
        let key = RegistryKey::Shard(self.shard_id());
        for _ in 0..self.config.claim_attempts {
            let now = current_timestamp_millis();
            match self.registry.get(&key).await? {
                None => {
                    let mut record = ShardRecord::new(
                        self.shard_id(),
                        self.shard.address.clone(),
                        self.shard.capacity,
                        now,
                    );
                    record.generation = 1;
                    let outcome = self
                        .registry
                        .compare_and_set(&key, None, encode(&record)?)
                        .await?;
                    if outcome.is_committed() {
                        info!(shard = %self.shard_id(), address = %self.shard.address,
                            "shard registered");
                        return Ok(());
                    }
                }
                Some(versioned) => {
                    // A restart with an existing record: adopt it, refreshing
                    // identity fields that may have changed in config.
                    let decoded: Versioned<ShardRecord> = versioned.decode()?;
                    let mut record = decoded.value;
                    record.address = self.shard.address.clone();
                    record.capacity = self.shard.capacity;
                    record.loaded_instance_ids = self.store.loaded_ids();
                    record.last_heartbeat_at = now;
                    record.generation = decoded.generation + 1;
                    let outcome = self
                        .registry
                        .compare_and_set(&key, Some(decoded.generation), encode(&record)?)
                        .await?;
                    if outcome.is_committed() {
                        info!(shard = %self.shard_id(), "shard record refreshed on startup");
                        return Ok(());
                    }
                }
            }
        }
        Err(WorldError::ClaimFailed {
            attempts: self.config.claim_attempts,
        })
    }

    /// One heartbeat upsert: refreshes `last_heartbeat_at` and rewrites the
    /// loaded set from local truth, repairing any missed eager update.
    pub async fn beat_once(&self) -> WorldResult<()> {
        let key = RegistryKey::Shard(self.shard_id());
        for _ in 0..self.config.claim_attempts {
            match self.registry.get(&key).await? {
                None => {
                    // Evicted while alive (e.g. a long pause); re-register.
                    warn!(shard = %self.shard_id(), "own shard record missing, re-registering");
                    return self.register_shard().await;
                }
                Some(versioned) => {
                    let decoded: Versioned<ShardRecord> = versioned.decode()?;
                    let mut record = decoded.value;
                    record.last_heartbeat_at = current_timestamp_millis();
                    record.loaded_instance_ids = self.store.loaded_ids();
                    record.generation = decoded.generation + 1;
                    let outcome = self
                        .registry
                        .compare_and_set(&key, Some(decoded.generation), encode(&record)?)
                        .await?;
                    if outcome.is_committed() {
                        return Ok(());
                    }
                }
            }
        }
        Err(WorldError::ClaimFailed {
            attempts: self.config.claim_attempts,
        })
    }

    // ------------------------------------------------------------------
    // Liveness scan
    // ------------------------------------------------------------------

    /// One monitor scan at time `now` (epoch milliseconds).
    ///
    /// Reclaims every instance owned by a shard whose heartbeat exceeds the
    /// liveness threshold, evicts shard records past the eviction threshold,
    /// and purges `Unloaded` records past the retention window. Safe to run
    /// concurrently from any number of processes: every write is fenced, and
    /// a conflict means someone else already acted.
    pub async fn scan_once(&self, now: u64) -> WorldResult<ScanReport> {
        let mut report = ScanReport::default();
        let self_id = self.shard_id();

        let mut instances: Vec<Versioned<InstanceRecord>> = Vec::new();
        for (_, versioned) in self.registry.scan(KeyPrefix::Instances).await? {
            instances.push(versioned.decode()?);
        }

        for (key, versioned) in self.registry.scan(KeyPrefix::Shards).await? {
            let RegistryKey::Shard(shard_id) = key else {
                continue;
            };
            if shard_id == self_id {
                continue;
            }
            let decoded: Versioned<ShardRecord> = versioned.decode()?;
            let age = decoded.value.heartbeat_age(now);
            if age <= self.config.liveness_threshold_ms {
                continue;
            }

            report.stale_shards += 1;
            warn!(shard = %shard_id, age_ms = age, "shard heartbeat lapsed, reclaiming instances");

            let mut reclaims: FuturesUnordered<_> = instances
                .iter()
                .filter(|v| v.value.is_owned_by(&shard_id))
                .map(|v| self.reclaim_instance(v, now))
                .collect();
            while let Some(reclaimed) = reclaims.next().await {
                if reclaimed? {
                    report.reclaimed_instances += 1;
                }
            }

            let shard_key = RegistryKey::Shard(shard_id.clone());
            if age > self.config.eviction_threshold_ms {
                let outcome = self
                    .registry
                    .compare_and_remove(&shard_key, decoded.generation)
                    .await?;
                if outcome.is_committed() {
                    info!(shard = %shard_id, "evicted unresponsive shard record");
                    report.evicted_shards += 1;
                }
            } else if !decoded.value.loaded_instance_ids.is_empty() {
                // Its instances no longer point at it; the loaded set must
                // not either.
                let mut record = decoded.value.clone();
                record.loaded_instance_ids.clear();
                record.generation = decoded.generation + 1;
                let _ = self
                    .registry
                    .compare_and_set(&shard_key, Some(decoded.generation), encode(&record)?)
                    .await?;
            }
        }

        for versioned in &instances {
            let record = &versioned.value;
            let expired = now.saturating_sub(record.last_write_at) > self.config.retention_ms;
            if record.state == InstanceState::Unloaded && record.owner_shard.is_none() && expired {
                let key = RegistryKey::Instance(record.instance_id);
                let outcome = self
                    .registry
                    .compare_and_remove(&key, versioned.generation)
                    .await?;
                if outcome.is_committed() {
                    debug!(instance = %record.instance_id, "purged retired instance record");
                    report.purged_records += 1;
                }
            }
        }

        Ok(report)
    }

    /// Force-reclaims one instance of a dead shard. `Active`/`Loading`
    /// become `Failed`, `Draining` becomes `Unloaded`, ownership is cleared.
    /// Returns false when the record was not reclaimable or another writer
    /// won the fence.
    async fn reclaim_instance(
        &self,
        versioned: &Versioned<InstanceRecord>,
        now: u64,
    ) -> WorldResult<bool> {
        let mut record = versioned.value.clone();
        let next = match record.state {
            InstanceState::Loading | InstanceState::Active => InstanceState::Failed,
            InstanceState::Draining => InstanceState::Unloaded,
            _ => return Ok(false),
        };
        record.state = next;
        record.owner_shard = None;
        if next == InstanceState::Unloaded {
            record.occupants.clear();
        }
        record.generation = versioned.generation + 1;
        record.last_write_at = now;

        let key = RegistryKey::Instance(record.instance_id);
        let outcome = self
            .registry
            .compare_and_set(&key, Some(versioned.generation), encode(&record)?)
            .await?;
        match outcome {
            CasOutcome::Committed { .. } => {
                warn!(instance = %record.instance_id, state = %next, "instance force-reclaimed");
                Ok(true)
            }
            // Another monitor or the returning shard got there first.
            CasOutcome::Conflict { .. } => Ok(false),
        }
    }

    /// Periodic heartbeat plus scan loop, until shutdown.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut beat = tokio::time::interval(Duration::from_millis(
            self.config.heartbeat_interval_ms,
        ));
        let mut scan =
            tokio::time::interval(Duration::from_millis(self.config.scan_interval_ms));
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("heartbeat monitor shutting down");
                    break;
                }
                _ = beat.tick() => {
                    if let Err(beat_error) = self.beat_once().await {
                        warn!(%beat_error, "heartbeat upsert failed");
                    }
                }
                _ = scan.tick() => {
                    match self.scan_once(current_timestamp_millis()).await {
                        Ok(report) if report.any_action() => {
                            info!(stale = report.stale_shards,
                                reclaimed = report.reclaimed_instances,
                                evicted = report.evicted_shards,
                                purged = report.purged_records,
                                "monitor scan acted");
                        }
                        Ok(_) => {}
                        Err(scan_error) => warn!(%scan_error, "monitor scan failed"),
                    }
                }
            }
        }
    }
}
