//! Multi-shard integration scenarios against a shared in-process registry.
//!
//! These tests run whole claim/route/drain/reclaim flows end-to-end across
//! two or more shard-side component stacks, verifying the cross-process
//! properties: single-winner claims, fencing-token monotonicity, idempotent
//! release, grace-period draining, and leaderless reclamation.

use instance_manager::{
    HeartbeatMonitor, InstanceGrant, InstanceHost, InstanceStore, LifecycleManager, LoadError,
    ManagerConfig, PlayerTransfer, PregenConfig, RouteOutcome, RoutingResolver, ShardConfig,
    TransferError, UnloadError, WorldError, WorldHandle, WorldLoader,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{timeout, Duration};
use waygate_registry::{
    current_timestamp_millis, InMemoryRegistry, InstanceId, InstanceRecord, InstanceState,
    KeyPrefix, PlayerId, Registry, RegistryKey, ShardId, ShardRecord, TemplateId, Versioned,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("instance_manager=debug,waygate_registry=debug")
        .with_test_writer()
        .try_init();
}

/// Fast-cycling configuration so the scenarios finish in milliseconds.
fn test_config() -> ManagerConfig {
    ManagerConfig {
        claim_attempts: 5,
        claim_backoff_ms: 1,
        claim_backoff_cap_ms: 10,
        drain_grace_ms: 80,
        retention_ms: 10_000,
        heartbeat_interval_ms: 25,
        liveness_threshold_ms: 200,
        eviction_threshold_ms: 1_000,
        scan_interval_ms: 50,
        mirror_staleness_ms: 200,
        pregen: PregenConfig {
            targets: HashMap::new(),
            max_sequential_failures: 5,
            idle_interval_ms: 10,
        },
    }
}

struct TestLoader {
    loads: AtomicUsize,
    unloads: AtomicUsize,
    fail_loads: AtomicBool,
}

impl TestLoader {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            loads: AtomicUsize::new(0),
            unloads: AtomicUsize::new(0),
            fail_loads: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl WorldLoader for TestLoader {
    async fn load_world(
        &self,
        template_id: &TemplateId,
        instance_id: InstanceId,
    ) -> Result<WorldHandle, LoadError> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(LoadError::Failed("copy process exited 1".to_string()));
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(WorldHandle {
            instance_id,
            template_id: template_id.clone(),
        })
    }

    async fn unload_world(&self, _handle: &WorldHandle) -> Result<(), UnloadError> {
        self.unloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct TestTransfer {
    transfers: Mutex<Vec<(PlayerId, String, InstanceId)>>,
}

impl TestTransfer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            transfers: Mutex::new(Vec::new()),
        })
    }

    fn count(&self) -> usize {
        self.transfers.lock().unwrap().len()
    }
}

#[async_trait]
impl PlayerTransfer for TestTransfer {
    async fn transfer_player(
        &self,
        player_id: PlayerId,
        shard_address: &str,
        instance_id: InstanceId,
    ) -> Result<(), TransferError> {
        self.transfers
            .lock()
            .unwrap()
            .push((player_id, shard_address.to_string(), instance_id));
        Ok(())
    }
}

struct TestShard {
    manager: Arc<LifecycleManager>,
    monitor: Arc<HeartbeatMonitor>,
    store: Arc<InstanceStore>,
}

fn build_shard(
    registry: &Arc<InMemoryRegistry>,
    loader: &Arc<TestLoader>,
    name: &str,
    capacity: usize,
) -> TestShard {
    let shard = ShardConfig {
        shard_id: name.to_string(),
        address: format!("{}.internal:25565", name),
        capacity,
    };
    let store = Arc::new(InstanceStore::new(registry.clone()));
    let manager = Arc::new(LifecycleManager::new(
        registry.clone(),
        store.clone(),
        loader.clone(),
        shard.clone(),
        test_config(),
    ));
    let monitor = Arc::new(HeartbeatMonitor::new(
        registry.clone(),
        store.clone(),
        shard,
        test_config(),
    ));
    TestShard {
        manager,
        monitor,
        store,
    }
}

async fn read_instance(registry: &InMemoryRegistry, instance_id: InstanceId) -> InstanceRecord {
    registry
        .get(&RegistryKey::Instance(instance_id))
        .await
        .unwrap()
        .unwrap()
        .decode::<InstanceRecord>()
        .unwrap()
        .value
}

async fn wait_for_state(
    registry: &InMemoryRegistry,
    instance_id: InstanceId,
    state: InstanceState,
) -> InstanceRecord {
    timeout(Duration::from_secs(2), async {
        loop {
            let record = read_instance(registry, instance_id).await;
            if record.state == state {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("instance never reached {:?}", state))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_requests_exactly_one_creates_and_claims() {
    init_tracing();
    let registry = Arc::new(InMemoryRegistry::new());
    let loader = TestLoader::new();
    let shard_a = build_shard(&registry, &loader, "shard-a", 4);
    let shard_b = build_shard(&registry, &loader, "shard-b", 4);
    shard_a.monitor.register_shard().await.unwrap();
    shard_b.monitor.register_shard().await.unwrap();

    let template = TemplateId::new("dungeon-1");
    let (grant_a, grant_b) = tokio::join!(
        shard_a.manager.request_instance(&template),
        shard_b.manager.request_instance(&template),
    );
    let grants = vec![
        ("shard-a", grant_a.unwrap()),
        ("shard-b", grant_b.unwrap()),
    ];

    let hosted: Vec<_> = grants
        .iter()
        .filter(|(_, grant)| matches!(grant, InstanceGrant::Hosted { .. }))
        .collect();
    let remote: Vec<_> = grants
        .iter()
        .filter(|(_, grant)| matches!(grant, InstanceGrant::Remote { .. }))
        .collect();
    assert_eq!(hosted.len(), 1, "exactly one shard must win the claim");
    assert_eq!(remote.len(), 1, "the loser must be routed to the winner");

    let (winner_name, winner_grant) = hosted[0];
    let (_, loser_grant) = remote[0];
    let InstanceGrant::Remote { instance_id, owner } = loser_grant else {
        unreachable!();
    };
    assert_eq!(*instance_id, winner_grant.instance_id());
    assert_eq!(owner, &ShardId::new(*winner_name));

    // One record, one physical load, owner is the winner.
    assert_eq!(registry.scan(KeyPrefix::Instances).await.unwrap().len(), 1);
    assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    let record = read_instance(&registry, winner_grant.instance_id()).await;
    assert_eq!(record.state, InstanceState::Active);
    assert_eq!(record.owner_shard, Some(ShardId::new(*winner_name)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_claim_race_over_a_pregenerated_record() {
    init_tracing();
    let registry = Arc::new(InMemoryRegistry::new());
    let loader = TestLoader::new();
    let shard_a = build_shard(&registry, &loader, "shard-a", 4);
    let shard_b = build_shard(&registry, &loader, "shard-b", 4);
    shard_a.monitor.register_shard().await.unwrap();
    shard_b.monitor.register_shard().await.unwrap();

    let template = TemplateId::new("dungeon-1");
    let mut seeded = InstanceRecord::new(template.clone(), 0, current_timestamp_millis());
    seeded.generation = 1;
    registry
        .compare_and_set(
            &RegistryKey::Instance(seeded.instance_id),
            None,
            waygate_registry::encode(&seeded).unwrap(),
        )
        .await
        .unwrap();

    let (grant_a, grant_b) = tokio::join!(
        shard_a.manager.request_instance(&template),
        shard_b.manager.request_instance(&template),
    );
    let grant_a = grant_a.unwrap();
    let grant_b = grant_b.unwrap();

    let hosted_count = [&grant_a, &grant_b]
        .iter()
        .filter(|grant| matches!(grant, InstanceGrant::Hosted { .. }))
        .count();
    assert_eq!(hosted_count, 1);
    assert_eq!(grant_a.instance_id(), grant_b.instance_id());
    assert_eq!(grant_a.instance_id(), seeded.instance_id);

    // Nobody created a second slot; the loser converged on the seeded one.
    assert_eq!(registry.scan(KeyPrefix::Instances).await.unwrap().len(), 1);
    assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_registry_outage_fails_fast_with_nothing_half_created() {
    init_tracing();
    let registry = Arc::new(InMemoryRegistry::new());
    let loader = TestLoader::new();
    let shard_a = build_shard(&registry, &loader, "shard-a", 4);

    registry.set_unavailable(true);
    let result = shard_a
        .manager
        .request_instance(&TemplateId::new("dungeon-1"))
        .await;
    assert!(matches!(result, Err(WorldError::RegistryUnavailable(_))));

    registry.set_unavailable(false);
    assert!(registry
        .scan(KeyPrefix::Instances)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(loader.loads.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_release_with_occupants_drains_then_unloads_once() {
    init_tracing();
    let registry = Arc::new(InMemoryRegistry::new());
    let loader = TestLoader::new();
    let shard_a = build_shard(&registry, &loader, "shard-a", 4);
    shard_a.monitor.register_shard().await.unwrap();

    let template = TemplateId::new("dungeon-1");
    let grant = shard_a.manager.request_instance(&template).await.unwrap();
    let instance_id = grant.instance_id();
    let player = PlayerId::new();
    shard_a.manager.add_occupant(instance_id, player).await.unwrap();

    // Release with an occupant still inside: drains, but no teardown yet.
    shard_a.manager.release_instance(instance_id).await.unwrap();
    let record = read_instance(&registry, instance_id).await;
    assert_eq!(record.state, InstanceState::Draining);
    assert_eq!(loader.unloads.load(Ordering::SeqCst), 0);

    // The last occupant leaving finishes the drain immediately.
    shard_a
        .manager
        .remove_occupant(instance_id, player)
        .await
        .unwrap();
    let record = read_instance(&registry, instance_id).await;
    assert_eq!(record.state, InstanceState::Unloaded);
    assert_eq!(record.owner_shard, None);
    assert!(record.occupants.is_empty());
    assert_eq!(loader.unloads.load(Ordering::SeqCst), 1);

    // Releasing again is a no-op, not a second teardown, and nothing is
    // left in the local world bookkeeping.
    shard_a.manager.release_instance(instance_id).await.unwrap();
    assert_eq!(loader.unloads.load(Ordering::SeqCst), 1);
    assert_eq!(shard_a.store.loaded_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_emptied_instance_drains_after_the_grace_period() {
    init_tracing();
    let registry = Arc::new(InMemoryRegistry::new());
    let loader = TestLoader::new();
    let shard_a = build_shard(&registry, &loader, "shard-a", 4);
    shard_a.monitor.register_shard().await.unwrap();

    let grant = shard_a
        .manager
        .request_instance(&TemplateId::new("dungeon-1"))
        .await
        .unwrap();
    let instance_id = grant.instance_id();
    let player = PlayerId::new();
    shard_a.manager.add_occupant(instance_id, player).await.unwrap();
    shard_a
        .manager
        .remove_occupant(instance_id, player)
        .await
        .unwrap();

    // Still active right after the disconnect; the grace period is running.
    let record = read_instance(&registry, instance_id).await;
    assert_eq!(record.state, InstanceState::Active);

    let record = wait_for_state(&registry, instance_id, InstanceState::Unloaded).await;
    assert_eq!(record.owner_shard, None);
    assert_eq!(loader.unloads.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rejoin_within_grace_cancels_the_drain() {
    init_tracing();
    let registry = Arc::new(InMemoryRegistry::new());
    let loader = TestLoader::new();
    let shard_a = build_shard(&registry, &loader, "shard-a", 4);
    shard_a.monitor.register_shard().await.unwrap();

    let grant = shard_a
        .manager
        .request_instance(&TemplateId::new("dungeon-1"))
        .await
        .unwrap();
    let instance_id = grant.instance_id();
    let first = PlayerId::new();
    shard_a.manager.add_occupant(instance_id, first).await.unwrap();
    shard_a
        .manager
        .remove_occupant(instance_id, first)
        .await
        .unwrap();

    // A rejoin inside the grace period bumps the generation, which cancels
    // the pending drain timer.
    let second = PlayerId::new();
    shard_a.manager.add_occupant(instance_id, second).await.unwrap();
    tokio::time::sleep(Duration::from_millis(test_config().drain_grace_ms * 3)).await;

    let record = read_instance(&registry, instance_id).await;
    assert_eq!(record.state, InstanceState::Active);
    assert!(record.occupants.contains(&second));
    assert_eq!(loader.unloads.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dead_shard_instances_are_reclaimed_and_record_evicted() {
    init_tracing();
    let registry = Arc::new(InMemoryRegistry::new());
    let loader = TestLoader::new();
    let shard_a = build_shard(&registry, &loader, "shard-a", 4);
    let shard_b = build_shard(&registry, &loader, "shard-b", 4);
    shard_a.monitor.register_shard().await.unwrap();
    shard_b.monitor.register_shard().await.unwrap();

    let grant = shard_a
        .manager
        .request_instance(&TemplateId::new("dungeon-1"))
        .await
        .unwrap();
    let instance_id = grant.instance_id();
    shard_a
        .manager
        .add_occupant(instance_id, PlayerId::new())
        .await
        .unwrap();

    // Shard A goes silent; shard B's monitor notices one scan later.
    let config = test_config();
    let lapsed = current_timestamp_millis() + config.liveness_threshold_ms + 1;
    let report = shard_b.monitor.scan_once(lapsed).await.unwrap();
    assert_eq!(report.stale_shards, 1);
    assert_eq!(report.reclaimed_instances, 1);

    let record = read_instance(&registry, instance_id).await;
    assert_eq!(record.state, InstanceState::Failed);
    assert_eq!(record.owner_shard, None);

    // The dead shard's loaded set was cleared with its ownership.
    let shard_record = registry
        .get(&RegistryKey::Shard(ShardId::new("shard-a")))
        .await
        .unwrap()
        .unwrap()
        .decode::<ShardRecord>()
        .unwrap()
        .value;
    assert!(shard_record.loaded_instance_ids.is_empty());

    // Past the eviction threshold the record itself goes away.
    let evicted = current_timestamp_millis() + config.eviction_threshold_ms + 1;
    let report = shard_b.monitor.scan_once(evicted).await.unwrap();
    assert_eq!(report.evicted_shards, 1);
    assert!(registry
        .get(&RegistryKey::Shard(ShardId::new("shard-a")))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_monitors_reclaim_each_instance_once() {
    init_tracing();
    let registry = Arc::new(InMemoryRegistry::new());
    let loader = TestLoader::new();
    let shard_a = build_shard(&registry, &loader, "shard-a", 4);
    shard_a.monitor.register_shard().await.unwrap();
    let grant = shard_a
        .manager
        .request_instance(&TemplateId::new("dungeon-1"))
        .await
        .unwrap();

    let monitor_1 = build_shard(&registry, &loader, "monitor-1", 0);
    let monitor_2 = build_shard(&registry, &loader, "monitor-2", 0);

    let lapsed = current_timestamp_millis() + test_config().liveness_threshold_ms + 1;
    let (one, two) = tokio::join!(
        monitor_1.monitor.scan_once(lapsed),
        monitor_2.monitor.scan_once(lapsed),
    );
    let total = one.unwrap().reclaimed_instances + two.unwrap().reclaimed_instances;
    assert_eq!(total, 1, "redundant monitors must not double-reclaim");

    let record = read_instance(&registry, grant.instance_id()).await;
    assert_eq!(record.state, InstanceState::Failed);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_recycled_slot_starts_with_a_fresh_occupant_set() {
    init_tracing();
    let registry = Arc::new(InMemoryRegistry::new());
    let loader = TestLoader::new();
    let shard_a = build_shard(&registry, &loader, "shard-a", 4);
    shard_a.monitor.register_shard().await.unwrap();

    let template = TemplateId::new("dungeon-1");
    let grant = shard_a.manager.request_instance(&template).await.unwrap();
    let instance_id = grant.instance_id();
    let player = PlayerId::new();
    shard_a.manager.add_occupant(instance_id, player).await.unwrap();
    shard_a
        .manager
        .remove_occupant(instance_id, player)
        .await
        .unwrap();
    let before = wait_for_state(&registry, instance_id, InstanceState::Unloaded).await;

    // The same slot is recycled for the next request, with nothing leaking
    // across the cycle.
    let regrant = shard_a.manager.request_instance(&template).await.unwrap();
    assert_eq!(regrant.instance_id(), instance_id);
    let record = read_instance(&registry, instance_id).await;
    assert_eq!(record.state, InstanceState::Active);
    assert!(record.occupants.is_empty());
    assert!(record.generation > before.generation);
    assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_generations_are_strictly_increasing_and_gap_free() {
    init_tracing();
    let registry = Arc::new(InMemoryRegistry::new());
    let loader = TestLoader::new();
    let shard_a = build_shard(&registry, &loader, "shard-a", 4);
    shard_a.monitor.register_shard().await.unwrap();
    let mut watch = registry.watch(KeyPrefix::Instances);

    let grant = shard_a
        .manager
        .request_instance(&TemplateId::new("dungeon-1"))
        .await
        .unwrap();
    let instance_id = grant.instance_id();
    let player = PlayerId::new();
    shard_a.manager.add_occupant(instance_id, player).await.unwrap();
    shard_a
        .manager
        .remove_occupant(instance_id, player)
        .await
        .unwrap();
    wait_for_state(&registry, instance_id, InstanceState::Unloaded).await;

    let mut generations = Vec::new();
    while let Ok(Ok(event)) = timeout(Duration::from_millis(50), watch.next()).await {
        if event.key == RegistryKey::Instance(instance_id) {
            generations.push(event.generation);
        }
    }

    // create, claim, activate, add, remove, drain, unload
    let expected: Vec<u64> = (1..=generations.len() as u64).collect();
    assert_eq!(generations, expected);
    assert_eq!(generations.len(), 7);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resolver_routes_players_to_the_owning_shard() {
    init_tracing();
    let registry = Arc::new(InMemoryRegistry::new());
    let loader = TestLoader::new();
    let shard_a = build_shard(&registry, &loader, "shard-a", 4);
    shard_a.monitor.register_shard().await.unwrap();
    let grant = shard_a
        .manager
        .request_instance(&TemplateId::new("dungeon-1"))
        .await
        .unwrap();
    let instance_id = grant.instance_id();

    // Proxy-side resolver with its own (cold) store.
    let transfer = TestTransfer::new();
    let proxy_store = Arc::new(InstanceStore::new(registry.clone()));
    let resolver = RoutingResolver::new(
        proxy_store,
        transfer.clone(),
        test_config().mirror_staleness(),
    );

    let outcome = resolver
        .route_player(PlayerId::new(), &instance_id)
        .await
        .unwrap();
    let RouteOutcome::Transferred(target) = outcome else {
        panic!("expected a transfer");
    };
    assert_eq!(target.shard_id, ShardId::new("shard-a"));
    assert_eq!(transfer.count(), 1);

    // An unknown instance is a "request one" signal, not an error.
    let missing = InstanceId::for_slot(&TemplateId::new("dungeon-9"), 0);
    let outcome = resolver
        .route_player(PlayerId::new(), &missing)
        .await
        .unwrap();
    assert_eq!(outcome, RouteOutcome::NeedsInstance);
    assert_eq!(transfer.count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shard_at_capacity_refuses_new_claims() {
    init_tracing();
    let registry = Arc::new(InMemoryRegistry::new());
    let loader = TestLoader::new();
    let shard_a = build_shard(&registry, &loader, "shard-a", 1);
    shard_a.monitor.register_shard().await.unwrap();

    shard_a
        .manager
        .request_instance(&TemplateId::new("dungeon-1"))
        .await
        .unwrap();
    let result = shard_a
        .manager
        .request_instance(&TemplateId::new("arena"))
        .await;
    assert!(matches!(
        result,
        Err(WorldError::ShardAtCapacity { capacity: 1, .. })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_host_runs_pregen_and_serves_requests_end_to_end() {
    init_tracing();
    let registry = Arc::new(InMemoryRegistry::new());
    let loader = TestLoader::new();
    let transfer = TestTransfer::new();

    let mut config = test_config();
    config.pregen.targets.insert("dungeon-1".to_string(), 2);
    let host = InstanceHost::start(
        registry.clone(),
        loader.clone(),
        transfer.clone(),
        ShardConfig {
            shard_id: "shard-a".to_string(),
            address: "10.0.0.1:25565".to_string(),
            capacity: 4,
        },
        config,
    )
    .await
    .unwrap();

    // The pool pre-creates the configured floor of claimable records.
    timeout(Duration::from_secs(2), async {
        loop {
            let records = registry.scan(KeyPrefix::Instances).await.unwrap();
            if records.len() >= 2 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("pregeneration never filled its floor");

    let template = TemplateId::new("dungeon-1");
    let grant = host.lifecycle.request_instance(&template).await.unwrap();
    let InstanceGrant::Hosted { instance_id } = grant else {
        panic!("expected to host a pregenerated instance");
    };

    // The store mirror converges through the watch stream, and the resolver
    // serves the route from it.
    let snapshot = timeout(Duration::from_secs(2), async {
        loop {
            if let Some(snapshot) = host.store.instance(&instance_id) {
                if snapshot.record.state == InstanceState::Active {
                    return snapshot;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("mirror never converged");
    assert_eq!(
        snapshot.record.owner_shard,
        Some(ShardId::new("shard-a"))
    );

    let outcome = host
        .resolver
        .route_player(PlayerId::new(), &instance_id)
        .await
        .unwrap();
    assert!(matches!(outcome, RouteOutcome::Transferred(_)));
    assert_eq!(transfer.count(), 1);

    timeout(Duration::from_secs(2), host.shutdown())
        .await
        .expect("host shutdown hung");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_decoded_records_round_trip_through_the_registry() {
    init_tracing();
    let registry = Arc::new(InMemoryRegistry::new());
    let loader = TestLoader::new();
    let shard_a = build_shard(&registry, &loader, "shard-a", 4);
    shard_a.monitor.register_shard().await.unwrap();

    let grant = shard_a
        .manager
        .request_instance(&TemplateId::new("dungeon-1"))
        .await
        .unwrap();

    // Every stored value decodes with its embedded generation matching the
    // registry generation it was committed at.
    for (key, versioned) in registry.scan(KeyPrefix::Instances).await.unwrap() {
        let decoded: Versioned<InstanceRecord> = versioned.decode().unwrap();
        assert_eq!(decoded.generation, decoded.value.generation);
        assert_eq!(key, RegistryKey::Instance(decoded.value.instance_id));
    }
    let record = read_instance(&registry, grant.instance_id()).await;
    assert_eq!(record.generation, 3);
}
