//! # Instance Pregeneration Pool
//!
//! Keeps a floor of claimable instance records per template so that entry is
//! fast and claim races have targets instead of racing on record creation.
//! Only registry records are pre-created here; physical world staging stays
//! behind the world capability until a shard actually claims and loads an
//! instance.
//!
//! Templates are filled least-complete first, and a failing template is
//! progressively deprioritized by its failure count so the others keep
//! filling. A template that fails its whole sequential budget is paused
//! until the pool restarts; the same budget counted back-to-back across
//! templates aborts the pool run entirely.

use crate::config::PregenConfig;
use crate::error::WorldResult;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use waygate_registry::{
    current_timestamp_millis, encode, InstanceRecord, KeyPrefix, Registry, RegistryKey,
    TemplateId, Versioned,
};

/// Result of one pool step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PregenStep {
    /// A record was created (or a racing creator beat us to the same slot).
    Created,
    /// Every floor is met; nothing to do until something is claimed.
    Idle,
}

struct TemplateState {
    target: usize,
    /// Claimable records observed by the last survey.
    available: usize,
    retry_count: u32,
    paused: bool,
}

impl TemplateState {
    /// 0.0 means not started, 1.0 means the floor is met or the failure
    /// budget is spent. Failure count bleeds into the score so a failing
    /// template yields to healthy ones instead of starving them.
    fn fraction_done(&self, max_failures: u32) -> f32 {
        if self.target == 0 || self.paused {
            return 1.0;
        }
        let remaining =
            1.0 - (self.available.min(self.target) as f32) / (self.target as f32);
        let error_delay =
            1.0 - (self.retry_count as f32) / (max_failures.max(1) as f32);
        1.0 - remaining * error_delay.max(0.0)
    }
}

/// Background filler of per-template instance floors.
pub struct PregenPool {
    registry: Arc<dyn Registry>,
    config: PregenConfig,
    states: DashMap<TemplateId, TemplateState>,
}

impl PregenPool {
    pub fn new(registry: Arc<dyn Registry>, config: PregenConfig) -> Self {
        let states = DashMap::new();
        for (name, &target) in &config.targets {
            states.insert(
                TemplateId::new(name.clone()),
                TemplateState {
                    target,
                    available: 0,
                    retry_count: 0,
                    paused: false,
                },
            );
        }
        Self {
            registry,
            config,
            states,
        }
    }

    /// Overall fill fraction across all templates, `1.0` when every floor is
    /// met (or nothing is configured).
    pub fn progress(&self) -> f32 {
        let mut completed = 0usize;
        let mut limit = 0usize;
        for state in self.states.iter() {
            if state.target == 0 {
                continue;
            }
            completed += state.available.min(state.target);
            limit += state.target;
        }
        if limit == 0 {
            return 1.0;
        }
        completed as f32 / limit as f32
    }

    /// Claimable records observed for a template by the last survey.
    pub fn available(&self, template: &TemplateId) -> usize {
        self.states
            .get(template)
            .map(|state| state.available)
            .unwrap_or(0)
    }

    /// One pool step: surveys the registry and creates at most one record
    /// for the least-complete template.
    pub async fn generate_next(&self) -> WorldResult<PregenStep> {
        let survey = self.survey().await?;

        let mut chosen: Option<(TemplateId, f32)> = None;
        for entry in self.states.iter() {
            let fraction = entry.fraction_done(self.config.max_sequential_failures);
            let better = match &chosen {
                Some((_, best)) => fraction < *best,
                None => true,
            };
            if better {
                chosen = Some((entry.key().clone(), fraction));
            }
        }
        let Some((template, fraction)) = chosen else {
            return Ok(PregenStep::Idle);
        };
        if fraction >= 1.0 {
            return Ok(PregenStep::Idle);
        }

        let used_slots = survey
            .get(&template)
            .map(|counts| counts.used_slots.clone())
            .unwrap_or_default();
        let slot = (0..).find(|slot| !used_slots.contains(slot)).unwrap_or(0);

        let mut record =
            InstanceRecord::new(template.clone(), slot, current_timestamp_millis());
        record.generation = 1;
        let key = RegistryKey::Instance(record.instance_id);
        match self
            .registry
            .compare_and_set(&key, None, encode(&record)?)
            .await
        {
            Ok(outcome) => {
                if let Some(mut state) = self.states.get_mut(&template) {
                    state.retry_count = 0;
                    if outcome.is_committed() {
                        state.available += 1;
                    }
                }
                if outcome.is_committed() {
                    info!(template = %template, slot,
                        available = self.available(&template), "pregenerated instance record");
                } else {
                    // A shard or another pool created the slot concurrently;
                    // the next survey sees it either way.
                    debug!(template = %template, slot, "pregen slot created elsewhere");
                }
                Ok(PregenStep::Created)
            }
            Err(create_error) => {
                if let Some(mut state) = self.states.get_mut(&template) {
                    state.retry_count += 1;
                    warn!(template = %template, retries = state.retry_count,
                        error = %create_error, "pregeneration failed");
                    if state.retry_count >= self.config.max_sequential_failures {
                        error!(template = %template,
                            "pregeneration failure budget spent, pausing template until restart");
                        state.paused = true;
                    }
                }
                Err(create_error.into())
            }
        }
    }

    /// Counts claimable records and used slots per configured template.
    async fn survey(&self) -> WorldResult<HashMap<TemplateId, TemplateCounts>> {
        let mut counts: HashMap<TemplateId, TemplateCounts> = HashMap::new();
        for (_, versioned) in self.registry.scan(KeyPrefix::Instances).await? {
            let decoded: Versioned<InstanceRecord> = versioned.decode()?;
            let record = decoded.value;
            if !self.states.contains_key(&record.template_id) {
                continue;
            }
            let entry = counts.entry(record.template_id.clone()).or_default();
            entry.used_slots.insert(record.slot);
            if record.is_claimable() {
                entry.available += 1;
            }
        }
        for mut state in self.states.iter_mut() {
            let template = state.key().clone();
            state.available = counts
                .get(&template)
                .map(|entry| entry.available)
                .unwrap_or(0);
        }
        Ok(counts)
    }

    /// Fills floors until shutdown. Aborts after the configured number of
    /// back-to-back failures; a restart resumes with fresh budgets.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        use tokio::sync::broadcast::error::TryRecvError;

        if self.states.is_empty() {
            info!("no template pregeneration configured, pool not running");
            return;
        }
        info!(templates = self.states.len(), "pregeneration pool started");

        let idle = Duration::from_millis(self.config.idle_interval_ms.max(1));
        let mut consecutive_failures = 0u32;
        loop {
            match shutdown.try_recv() {
                Err(TryRecvError::Empty) => {}
                _ => break,
            }
            match self.generate_next().await {
                Ok(PregenStep::Created) => {
                    consecutive_failures = 0;
                }
                Ok(PregenStep::Idle) => {
                    consecutive_failures = 0;
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(idle) => {}
                    }
                }
                Err(step_error) => {
                    consecutive_failures += 1;
                    warn!(error = %step_error, failures = consecutive_failures,
                        "pregeneration step failed");
                    if consecutive_failures >= self.config.max_sequential_failures.max(1) {
                        error!(failures = consecutive_failures,
                            "back-to-back pregeneration failures, aborting pool run");
                        break;
                    }
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(idle) => {}
                    }
                }
            }
        }
        debug!("pregeneration pool stopped");
    }
}

#[derive(Default)]
struct TemplateCounts {
    available: usize,
    used_slots: HashSet<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};
    use waygate_registry::{
        CasOutcome, InMemoryRegistry, RegistryError, RegistryWatch,
    };

    fn pool_config(targets: &[(&str, usize)]) -> PregenConfig {
        PregenConfig {
            targets: targets
                .iter()
                .map(|(name, target)| (name.to_string(), *target))
                .collect(),
            max_sequential_failures: 5,
            idle_interval_ms: 10,
        }
    }

    #[tokio::test]
    async fn test_pool_fills_the_floor_then_idles() {
        let registry = Arc::new(InMemoryRegistry::new());
        let pool = PregenPool::new(registry.clone(), pool_config(&[("dungeon-1", 3)]));

        let mut created = 0;
        loop {
            match pool.generate_next().await.unwrap() {
                PregenStep::Created => created += 1,
                PregenStep::Idle => break,
            }
            assert!(created <= 3, "pool overfilled its floor");
        }
        assert_eq!(created, 3);
        assert_eq!(pool.available(&TemplateId::new("dungeon-1")), 3);
        assert!((pool.progress() - 1.0).abs() < f32::EPSILON);

        let records = registry.scan(KeyPrefix::Instances).await.unwrap();
        assert_eq!(records.len(), 3);
        for (_, versioned) in records {
            let record: Versioned<InstanceRecord> = versioned.decode().unwrap();
            assert!(record.value.is_claimable());
        }
    }

    #[tokio::test]
    async fn test_least_complete_template_fills_first() {
        let registry = Arc::new(InMemoryRegistry::new());
        let pool = PregenPool::new(
            registry.clone(),
            pool_config(&[("dungeon-1", 2), ("arena", 2)]),
        );

        // dungeon-1 already has one record; arena has none and must go first.
        let mut seeded = InstanceRecord::new(TemplateId::new("dungeon-1"), 0, 1_000);
        seeded.generation = 1;
        registry
            .compare_and_set(
                &RegistryKey::Instance(seeded.instance_id),
                None,
                encode(&seeded).unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(pool.generate_next().await.unwrap(), PregenStep::Created);
        assert_eq!(pool.available(&TemplateId::new("arena")), 1);
        assert_eq!(pool.available(&TemplateId::new("dungeon-1")), 1);
    }

    /// Registry wrapper whose writes can be made to fail while reads and
    /// scans keep working, isolating the per-template failure budget.
    struct WriteFailingRegistry {
        inner: InMemoryRegistry,
        fail_writes: AtomicBool,
    }

    #[async_trait]
    impl Registry for WriteFailingRegistry {
        async fn get(
            &self,
            key: &RegistryKey,
        ) -> Result<Option<Versioned<Value>>, RegistryError> {
            self.inner.get(key).await
        }

        async fn compare_and_set(
            &self,
            key: &RegistryKey,
            expected: Option<u64>,
            value: Value,
        ) -> Result<CasOutcome, RegistryError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(RegistryError::Unavailable("write path down".to_string()));
            }
            self.inner.compare_and_set(key, expected, value).await
        }

        async fn compare_and_remove(
            &self,
            key: &RegistryKey,
            expected: u64,
        ) -> Result<CasOutcome, RegistryError> {
            self.inner.compare_and_remove(key, expected).await
        }

        async fn scan(
            &self,
            prefix: KeyPrefix,
        ) -> Result<Vec<(RegistryKey, Versioned<Value>)>, RegistryError> {
            self.inner.scan(prefix).await
        }

        fn watch(&self, prefix: KeyPrefix) -> RegistryWatch {
            self.inner.watch(prefix)
        }
    }

    #[tokio::test]
    async fn test_failure_budget_pauses_the_template() {
        let registry = Arc::new(WriteFailingRegistry {
            inner: InMemoryRegistry::new(),
            fail_writes: AtomicBool::new(true),
        });
        let pool = PregenPool::new(registry.clone(), pool_config(&[("dungeon-1", 2)]));

        // Budget of 5: five consecutive failures pause the template.
        for _ in 0..5 {
            assert!(pool.generate_next().await.is_err());
        }
        assert_eq!(pool.generate_next().await.unwrap(), PregenStep::Idle);

        // Recovery alone does not resume a paused template; a restart does.
        registry.fail_writes.store(false, Ordering::SeqCst);
        assert_eq!(pool.generate_next().await.unwrap(), PregenStep::Idle);

        let restarted = PregenPool::new(registry, pool_config(&[("dungeon-1", 2)]));
        assert_eq!(restarted.generate_next().await.unwrap(), PregenStep::Created);
    }

    #[tokio::test]
    async fn test_claimed_records_do_not_count_toward_the_floor() {
        let registry = Arc::new(InMemoryRegistry::new());
        let pool = PregenPool::new(registry.clone(), pool_config(&[("dungeon-1", 1)]));

        assert_eq!(pool.generate_next().await.unwrap(), PregenStep::Created);
        assert_eq!(pool.generate_next().await.unwrap(), PregenStep::Idle);

        // A shard claims the pregenerated record; the floor is open again.
        let (key, versioned) = registry
            .scan(KeyPrefix::Instances)
            .await
            .unwrap()
            .pop()
            .unwrap();
        let mut record: InstanceRecord = versioned.decode::<InstanceRecord>().unwrap().value;
        record.state = waygate_registry::InstanceState::Loading;
        record.owner_shard = Some(waygate_registry::ShardId::new("shard-a"));
        record.generation = versioned.generation + 1;
        registry
            .compare_and_set(&key, Some(versioned.generation), encode(&record).unwrap())
            .await
            .unwrap();

        assert_eq!(pool.generate_next().await.unwrap(), PregenStep::Created);
        assert_eq!(pool.available(&TemplateId::new("dungeon-1")), 1);
    }
}
