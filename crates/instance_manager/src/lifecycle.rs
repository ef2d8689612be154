//! # Instance Lifecycle Manager
//!
//! Creates, claims, transitions, and reclaims world instances. Owns the
//! state machine `Pending -> Loading -> Active -> Draining -> Unloaded`
//! (with `Failed` off the load path and `Unloaded -> Pending` on recycle)
//! and is the only component that commits instance transitions.
//!
//! ## Claim Protocol
//!
//! Every transition is a registry compare-and-set fenced by the record's
//! generation: local state is optimistic, the registry is the truth. A claim
//! pass either claims a reusable record, discovers the instance is already
//! hosted elsewhere (and says where), or creates the template's next slot -
//! and because slot ids are deterministic, two shards creating "the next
//! instance" collide on one key and exactly one wins. Losers surface
//! [`WorldError::ClaimConflict`] and retry with bounded exponential backoff
//! against the updated record, possibly landing on a different instance or
//! shard.
//!
//! ## Failure Semantics
//!
//! Contention and outages are retried up to the configured budget;
//! exhaustion surfaces `ClaimFailed` or `RegistryUnavailable`. World
//! load/unload failures are never retried by the core: a failed load marks
//! the instance `Failed` and releases ownership, a failed unload leaves it
//! `Draining` for operator policy.

use crate::capability::WorldLoader;
use crate::config::{ManagerConfig, ShardConfig};
use crate::error::{WorldError, WorldResult};
use crate::store::InstanceStore;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use waygate_registry::{
    current_timestamp_millis, encode, CasOutcome, InstanceId, InstanceRecord, InstanceState,
    KeyPrefix, PlayerId, Registry, RegistryKey, ShardId, ShardRecord, TemplateId, Versioned,
};

/// Outcome of a successful instance request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceGrant {
    /// This shard claimed the instance and now hosts it `Active`.
    Hosted { instance_id: InstanceId },
    /// The instance is already `Active` on another shard; route the player
    /// there instead of loading a second copy.
    Remote {
        instance_id: InstanceId,
        owner: ShardId,
    },
}

impl InstanceGrant {
    pub fn instance_id(&self) -> InstanceId {
        match self {
            InstanceGrant::Hosted { instance_id } => *instance_id,
            InstanceGrant::Remote { instance_id, .. } => *instance_id,
        }
    }
}

/// Per-shard lifecycle manager. Cheap to share behind an `Arc`; the drain
/// grace timer spawns from it.
pub struct LifecycleManager {
    registry: Arc<dyn Registry>,
    store: Arc<InstanceStore>,
    loader: Arc<dyn WorldLoader>,
    shard: ShardConfig,
    config: ManagerConfig,
}

impl LifecycleManager {
    pub fn new(
        registry: Arc<dyn Registry>,
        store: Arc<InstanceStore>,
        loader: Arc<dyn WorldLoader>,
        shard: ShardConfig,
        config: ManagerConfig,
    ) -> Self {
        Self {
            registry,
            store,
            loader,
            shard,
            config,
        }
    }

    fn shard_id(&self) -> ShardId {
        ShardId::new(self.shard.shard_id.clone())
    }

    // ------------------------------------------------------------------
    // Requesting instances
    // ------------------------------------------------------------------

    /// Obtains an instance of `template` for a player to enter, retrying
    /// contention and outages up to the configured budget.
    pub async fn request_instance(&self, template: &TemplateId) -> WorldResult<InstanceGrant> {
        self.request_inner(template, None).await
    }

    /// Like [`request_instance`](Self::request_instance), but abandons the
    /// request when `cancel` fires. A cancellation that races a committed
    /// claim does not leak the instance: the claim completes and is then
    /// released through the normal drain path.
    pub async fn request_instance_with_cancel(
        &self,
        template: &TemplateId,
        cancel: oneshot::Receiver<()>,
    ) -> WorldResult<InstanceGrant> {
        self.request_inner(template, Some(cancel)).await
    }

    async fn request_inner(
        &self,
        template: &TemplateId,
        mut cancel: Option<oneshot::Receiver<()>>,
    ) -> WorldResult<InstanceGrant> {
        let attempts = self.config.claim_attempts;
        let mut backoff = self.config.claim_backoff();
        let mut last: Option<WorldError> = None;

        for attempt in 1..=attempts {
            if cancel_requested(&mut cancel) {
                return Err(WorldError::RequestCancelled);
            }
            match self.try_request_instance(template).await {
                Ok(grant) => {
                    // The claim pass always runs to completion, so a cancel
                    // racing the commit lands here: claimed, then abandoned.
                    if cancel_requested(&mut cancel) {
                        if let InstanceGrant::Hosted { instance_id } = grant {
                            info!(instance = %instance_id, "request cancelled after claim, abandoning");
                            if let Err(release_error) = self.release_instance(instance_id).await {
                                warn!(instance = %instance_id, %release_error,
                                    "failed to abandon cancelled claim");
                            }
                        }
                        return Err(WorldError::RequestCancelled);
                    }
                    return Ok(grant);
                }
                Err(retryable @ (WorldError::ClaimConflict | WorldError::RegistryUnavailable(_))) => {
                    debug!(template = %template, attempt, error = %retryable, "claim attempt failed");
                    last = Some(retryable);
                    if attempt < attempts {
                        if let Some(receiver) = cancel.as_mut() {
                            let sender_gone = tokio::select! {
                                outcome = receiver => {
                                    if outcome.is_ok() {
                                        return Err(WorldError::RequestCancelled);
                                    }
                                    true
                                }
                                _ = tokio::time::sleep(backoff) => false,
                            };
                            if sender_gone {
                                cancel = None;
                                tokio::time::sleep(backoff).await;
                            }
                        } else {
                            tokio::time::sleep(backoff).await;
                        }
                        backoff = (backoff * 2).min(self.config.claim_backoff_cap());
                    }
                }
                Err(other) => return Err(other),
            }
        }

        match last {
            Some(WorldError::RegistryUnavailable(message)) => {
                Err(WorldError::RegistryUnavailable(message))
            }
            _ => Err(WorldError::ClaimFailed { attempts }),
        }
    }

    /// One claim pass, no retries. Exposed for callers that manage their own
    /// retry policy.
    pub async fn try_request_instance(&self, template: &TemplateId) -> WorldResult<InstanceGrant> {
        if self.store.loaded_count() >= self.shard.capacity {
            return Err(WorldError::ShardAtCapacity {
                shard: self.shard_id(),
                capacity: self.shard.capacity,
            });
        }

        let shard = self.shard_id();
        let records = self.fetch_template_records(template).await?;

        // Already hosting an instance of this template: entry is idempotent.
        if let Some(hosted) = records
            .iter()
            .find(|v| v.value.state == InstanceState::Active && v.value.is_owned_by(&shard))
        {
            return Ok(InstanceGrant::Hosted {
                instance_id: hosted.value.instance_id,
            });
        }

        // Claim a reusable record if one exists.
        if let Some(reusable) = records.iter().find(|v| v.value.is_claimable()) {
            return self
                .claim_and_load(reusable.value.clone(), reusable.generation)
                .await;
        }

        // Active elsewhere: the resolver can route the player to the owner.
        for versioned in &records {
            if versioned.value.state == InstanceState::Active {
                if let Some(owner) = versioned.value.owner_shard.clone() {
                    return Ok(InstanceGrant::Remote {
                        instance_id: versioned.value.instance_id,
                        owner,
                    });
                }
            }
        }

        // Someone else is mid-claim; retry until their load resolves.
        if records
            .iter()
            .any(|v| v.value.state == InstanceState::Loading)
        {
            return Err(WorldError::ClaimConflict);
        }

        // Nothing usable (no records, or only Draining/Failed ones): create
        // the template's next slot. The deterministic id makes concurrent
        // creators collide, and exactly one of them commits.
        let slot = lowest_free_slot(&records);
        let mut record = InstanceRecord::new(template.clone(), slot, current_timestamp_millis());
        match self.commit_instance(&mut record, None).await? {
            CasOutcome::Committed { generation } => self.claim_and_load(record, generation).await,
            CasOutcome::Conflict { .. } => Err(WorldError::ClaimConflict),
        }
    }

    /// Claims a reusable record for this shard and drives it to `Active`.
    async fn claim_and_load(
        &self,
        mut record: InstanceRecord,
        mut generation: u64,
    ) -> WorldResult<InstanceGrant> {
        let shard = self.shard_id();

        // Recycle an unloaded slot through Pending first; occupants from the
        // previous cycle must not leak into this one.
        if record.state == InstanceState::Unloaded {
            record.state = InstanceState::Pending;
            record.owner_shard = None;
            record.occupants.clear();
            match self.commit_instance(&mut record, Some(generation)).await? {
                CasOutcome::Committed { generation: next } => generation = next,
                CasOutcome::Conflict { .. } => return Err(WorldError::ClaimConflict),
            }
        }

        record.state = InstanceState::Loading;
        record.owner_shard = Some(shard);
        match self.commit_instance(&mut record, Some(generation)).await? {
            CasOutcome::Committed { generation: next } => generation = next,
            CasOutcome::Conflict { .. } => return Err(WorldError::ClaimConflict),
        }
        debug!(instance = %record.instance_id, template = %record.template_id,
            "claim committed, loading world");

        match self
            .loader
            .load_world(&record.template_id, record.instance_id)
            .await
        {
            Ok(handle) => {
                record.state = InstanceState::Active;
                match self.commit_instance(&mut record, Some(generation)).await? {
                    CasOutcome::Committed { .. } => {}
                    CasOutcome::Conflict { .. } => {
                        // Ownership was fenced away mid-load, most likely by
                        // the liveness monitor. Tear the world back down.
                        warn!(instance = %record.instance_id,
                            "lost ownership while loading, unloading world");
                        if let Err(unload_error) = self.loader.unload_world(&handle).await {
                            warn!(instance = %record.instance_id, %unload_error,
                                "failed to unload fenced-away world");
                        }
                        return Err(WorldError::ClaimConflict);
                    }
                }
                self.store.record_loaded(handle);
                self.update_shard_record(|shard_record| {
                    shard_record.loaded_instance_ids.insert(record.instance_id);
                })
                .await;
                info!(instance = %record.instance_id, template = %record.template_id,
                    "instance active");
                Ok(InstanceGrant::Hosted {
                    instance_id: record.instance_id,
                })
            }
            Err(load_error) => {
                error!(instance = %record.instance_id, %load_error,
                    "world load failed, marking instance failed");
                record.state = InstanceState::Failed;
                record.owner_shard = None;
                match self.commit_instance(&mut record, Some(generation)).await {
                    Ok(CasOutcome::Committed { .. }) => {}
                    Ok(CasOutcome::Conflict { .. }) => {
                        warn!(instance = %record.instance_id,
                            "failed-state commit fenced away by a newer writer");
                    }
                    Err(commit_error) => {
                        warn!(instance = %record.instance_id, %commit_error,
                            "could not record load failure");
                    }
                }
                Err(WorldError::Load(load_error))
            }
        }
    }

    // ------------------------------------------------------------------
    // Releasing instances
    // ------------------------------------------------------------------

    /// Releases a hosted instance: `Active -> Draining`, then `-> Unloaded`
    /// once empty and the world capability confirms teardown.
    ///
    /// Idempotent: releasing an already-`Unloaded` instance is a no-op. An
    /// instance released with occupants still inside stays `Draining` and
    /// finishes when the last occupant is removed.
    pub async fn release_instance(&self, instance_id: InstanceId) -> WorldResult<()> {
        let shard = self.shard_id();
        for _ in 0..self.config.claim_attempts {
            let Some(versioned) = self.registry.get(&RegistryKey::Instance(instance_id)).await?
            else {
                return Err(WorldError::UnknownInstance(instance_id));
            };
            let decoded: Versioned<InstanceRecord> = versioned.decode()?;
            let generation = decoded.generation;
            let mut record = decoded.value;

            match record.state {
                InstanceState::Unloaded => return Ok(()),
                InstanceState::Active => {
                    if !record.is_owned_by(&shard) {
                        return Err(WorldError::InstanceNotReady(instance_id));
                    }
                    record.state = InstanceState::Draining;
                    match self.commit_instance(&mut record, Some(generation)).await? {
                        CasOutcome::Committed { generation: next } => {
                            info!(instance = %instance_id, occupants = record.occupants.len(),
                                "instance draining");
                            if record.occupants.is_empty() {
                                return self.finish_drain(record, next).await;
                            }
                            return Ok(());
                        }
                        CasOutcome::Conflict { .. } => continue,
                    }
                }
                InstanceState::Draining => {
                    if !record.is_owned_by(&shard) {
                        return Err(WorldError::InstanceNotReady(instance_id));
                    }
                    if record.occupants.is_empty() {
                        return self.finish_drain(record, generation).await;
                    }
                    return Ok(());
                }
                _ => return Err(WorldError::InstanceNotReady(instance_id)),
            }
        }
        Err(WorldError::ClaimFailed {
            attempts: self.config.claim_attempts,
        })
    }

    /// Tears down an empty `Draining` instance and commits `Unloaded`.
    async fn finish_drain(&self, mut record: InstanceRecord, generation: u64) -> WorldResult<()> {
        let instance_id = record.instance_id;

        // Tear the world down before committing Unloaded. A failed unload
        // leaves the record Draining and operator-visible; the capability's
        // idempotence covers a repeated or concurrent call.
        if let Some(handle) = self.store.loaded(&instance_id) {
            self.loader.unload_world(&handle).await?;
            self.store.take_loaded(&instance_id);
        }

        // Keep loaded_instance_ids a subset of owned instances: remove from
        // the shard record before ownership is cleared.
        self.update_shard_record(|shard_record| {
            shard_record.loaded_instance_ids.remove(&instance_id);
        })
        .await;

        record.state = InstanceState::Unloaded;
        record.owner_shard = None;
        record.occupants.clear();
        match self.commit_instance(&mut record, Some(generation)).await? {
            CasOutcome::Committed { .. } => {
                info!(instance = %instance_id, "instance unloaded");
                Ok(())
            }
            CasOutcome::Conflict { .. } => {
                // A concurrent release or the monitor finished first; agree
                // with whatever the registry now says.
                match self.registry.get(&RegistryKey::Instance(instance_id)).await? {
                    None => Ok(()),
                    Some(current) => {
                        let current: Versioned<InstanceRecord> = current.decode()?;
                        if current.value.state == InstanceState::Unloaded {
                            Ok(())
                        } else {
                            Err(WorldError::ClaimConflict)
                        }
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Occupants
    // ------------------------------------------------------------------

    /// Adds a player to an instance this shard hosts. Fails with
    /// [`WorldError::InstanceNotReady`] unless the instance is `Active` here.
    pub async fn add_occupant(&self, instance_id: InstanceId, player: PlayerId) -> WorldResult<()> {
        let shard = self.shard_id();
        for _ in 0..self.config.claim_attempts {
            let Some(versioned) = self.registry.get(&RegistryKey::Instance(instance_id)).await?
            else {
                return Err(WorldError::UnknownInstance(instance_id));
            };
            let decoded: Versioned<InstanceRecord> = versioned.decode()?;
            let generation = decoded.generation;
            let mut record = decoded.value;

            if record.state != InstanceState::Active || !record.is_owned_by(&shard) {
                return Err(WorldError::InstanceNotReady(instance_id));
            }
            if !record.occupants.insert(player) {
                return Ok(());
            }
            match self.commit_instance(&mut record, Some(generation)).await? {
                CasOutcome::Committed { .. } => {
                    debug!(instance = %instance_id, player = %player,
                        occupants = record.occupants.len(), "occupant added");
                    return Ok(());
                }
                CasOutcome::Conflict { .. } => continue,
            }
        }
        Err(WorldError::ClaimFailed {
            attempts: self.config.claim_attempts,
        })
    }

    /// Removes a player from an instance this shard hosts. The removal that
    /// empties an `Active` instance schedules a drain after the configured
    /// grace period; emptying a `Draining` instance tears it down at once.
    pub async fn remove_occupant(
        self: &Arc<Self>,
        instance_id: InstanceId,
        player: PlayerId,
    ) -> WorldResult<()> {
        let shard = self.shard_id();
        for _ in 0..self.config.claim_attempts {
            let Some(versioned) = self.registry.get(&RegistryKey::Instance(instance_id)).await?
            else {
                return Err(WorldError::UnknownInstance(instance_id));
            };
            let decoded: Versioned<InstanceRecord> = versioned.decode()?;
            let generation = decoded.generation;
            let mut record = decoded.value;

            if !matches!(
                record.state,
                InstanceState::Active | InstanceState::Draining
            ) || !record.is_owned_by(&shard)
            {
                return Err(WorldError::InstanceNotReady(instance_id));
            }
            if !record.occupants.remove(&player) {
                return Ok(());
            }
            match self.commit_instance(&mut record, Some(generation)).await? {
                CasOutcome::Committed { generation: next } => {
                    debug!(instance = %instance_id, player = %player,
                        occupants = record.occupants.len(), "occupant removed");
                    if record.occupants.is_empty() {
                        match record.state {
                            InstanceState::Draining => {
                                return self.finish_drain(record, next).await;
                            }
                            InstanceState::Active => self.schedule_drain(instance_id, next),
                            _ => {}
                        }
                    }
                    return Ok(());
                }
                CasOutcome::Conflict { .. } => continue,
            }
        }
        Err(WorldError::ClaimFailed {
            attempts: self.config.claim_attempts,
        })
    }

    fn schedule_drain(self: &Arc<Self>, instance_id: InstanceId, empty_generation: u64) {
        let manager = self.clone();
        let grace = self.config.drain_grace();
        debug!(instance = %instance_id, grace_ms = self.config.drain_grace_ms,
            "instance empty, drain scheduled");
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Err(drain_error) = manager
                .drain_if_still_empty(instance_id, empty_generation)
                .await
            {
                warn!(instance = %instance_id, %drain_error, "deferred drain failed");
            }
        });
    }

    /// Grace-timer body: drains only if nothing touched the record since it
    /// emptied. Any committed write (a rejoin, a release, a reclaim) bumps
    /// the generation and cancels the drain.
    async fn drain_if_still_empty(
        &self,
        instance_id: InstanceId,
        empty_generation: u64,
    ) -> WorldResult<()> {
        let Some(versioned) = self.registry.get(&RegistryKey::Instance(instance_id)).await? else {
            return Ok(());
        };
        let decoded: Versioned<InstanceRecord> = versioned.decode()?;
        if decoded.generation != empty_generation {
            debug!(instance = %instance_id, "drain cancelled, record changed during grace");
            return Ok(());
        }
        let mut record = decoded.value;
        if record.state != InstanceState::Active
            || !record.occupants.is_empty()
            || !record.is_owned_by(&self.shard_id())
        {
            return Ok(());
        }
        record.state = InstanceState::Draining;
        match self
            .commit_instance(&mut record, Some(empty_generation))
            .await?
        {
            CasOutcome::Committed { generation } => self.finish_drain(record, generation).await,
            CasOutcome::Conflict { .. } => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Commit plumbing
    // ------------------------------------------------------------------

    /// Commits a record copy at the next generation. The embedded generation
    /// always matches the registry generation the write lands at.
    async fn commit_instance(
        &self,
        record: &mut InstanceRecord,
        expected: Option<u64>,
    ) -> WorldResult<CasOutcome> {
        record.generation = expected.map_or(1, |generation| generation + 1);
        record.last_write_at = current_timestamp_millis();
        let value = encode(record)?;
        let key = RegistryKey::Instance(record.instance_id);
        Ok(self.registry.compare_and_set(&key, expected, value).await?)
    }

    /// Best-effort CAS update of this shard's own record. Failures are
    /// logged, not surfaced: the heartbeat rewrites the loaded set from
    /// local truth on its next beat anyway.
    async fn update_shard_record<F: FnMut(&mut ShardRecord)>(&self, mut apply: F) {
        let key = RegistryKey::Shard(self.shard_id());
        for _ in 0..self.config.claim_attempts {
            let current = match self.registry.get(&key).await {
                Ok(Some(versioned)) => versioned,
                Ok(None) => return,
                Err(get_error) => {
                    warn!(%get_error, "could not read own shard record");
                    return;
                }
            };
            let decoded: Versioned<ShardRecord> = match current.decode() {
                Ok(decoded) => decoded,
                Err(decode_error) => {
                    warn!(%decode_error, "own shard record is undecodable");
                    return;
                }
            };
            let mut record = decoded.value;
            apply(&mut record);
            record.generation = decoded.generation + 1;
            let value = match encode(&record) {
                Ok(value) => value,
                Err(encode_error) => {
                    warn!(%encode_error, "could not encode shard record");
                    return;
                }
            };
            match self
                .registry
                .compare_and_set(&key, Some(decoded.generation), value)
                .await
            {
                Ok(CasOutcome::Committed { .. }) => return,
                Ok(CasOutcome::Conflict { .. }) => continue,
                Err(cas_error) => {
                    warn!(%cas_error, "could not update shard record");
                    return;
                }
            }
        }
        warn!(shard = %self.shard_id(), "gave up updating shard record after repeated conflicts");
    }

    async fn fetch_template_records(
        &self,
        template: &TemplateId,
    ) -> WorldResult<Vec<Versioned<InstanceRecord>>> {
        let mut records = Vec::new();
        for (_, versioned) in self.registry.scan(KeyPrefix::Instances).await? {
            let decoded: Versioned<InstanceRecord> = versioned.decode()?;
            if decoded.value.template_id == *template {
                records.push(decoded);
            }
        }
        records.sort_by_key(|versioned| versioned.value.slot);
        Ok(records)
    }
}

fn lowest_free_slot(records: &[Versioned<InstanceRecord>]) -> u32 {
    let used: std::collections::HashSet<u32> =
        records.iter().map(|versioned| versioned.value.slot).collect();
    (0..).find(|slot| !used.contains(slot)).unwrap_or(0)
}

fn cancel_requested(cancel: &mut Option<oneshot::Receiver<()>>) -> bool {
    use tokio::sync::oneshot::error::TryRecvError;
    match cancel.as_mut() {
        None => false,
        Some(receiver) => match receiver.try_recv() {
            Ok(()) => true,
            Err(TryRecvError::Empty) => false,
            Err(TryRecvError::Closed) => {
                *cancel = None;
                false
            }
        },
    }
}
