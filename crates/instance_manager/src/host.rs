//! Wiring for one shard process: builds the store, lifecycle manager,
//! resolver, heartbeat monitor, and pregeneration pool against a shared
//! registry, registers the shard, and runs the background tasks until
//! shutdown.

use crate::capability::{PlayerTransfer, WorldLoader};
use crate::config::{ManagerConfig, ShardConfig};
use crate::error::{WorldError, WorldResult};
use crate::heartbeat::HeartbeatMonitor;
use crate::lifecycle::LifecycleManager;
use crate::pregen::PregenPool;
use crate::resolver::RoutingResolver;
use crate::store::InstanceStore;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;
use waygate_registry::Registry;

/// A running shard-side instance host.
///
/// The components are public so the surrounding server can call straight
/// into them: `lifecycle` for claims and occupancy, `resolver` for routing,
/// `monitor` and `pregen` mostly for diagnostics.
pub struct InstanceHost {
    pub store: Arc<InstanceStore>,
    pub lifecycle: Arc<LifecycleManager>,
    pub resolver: Arc<RoutingResolver>,
    pub monitor: Arc<HeartbeatMonitor>,
    pub pregen: Arc<PregenPool>,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl InstanceHost {
    /// Validates the configuration, registers the shard, and spawns the
    /// background tasks (mirror watch, heartbeat/scan loop, and the
    /// pregeneration pool when floors are configured).
    pub async fn start(
        registry: Arc<dyn Registry>,
        loader: Arc<dyn WorldLoader>,
        transfer: Arc<dyn PlayerTransfer>,
        shard: ShardConfig,
        config: ManagerConfig,
    ) -> WorldResult<Self> {
        config.validate().map_err(WorldError::Internal)?;
        info!(shard = %shard.shard_id, address = %shard.address,
            capacity = shard.capacity, "⚡ starting instance host");

        let store = Arc::new(InstanceStore::new(registry.clone()));
        let lifecycle = Arc::new(LifecycleManager::new(
            registry.clone(),
            store.clone(),
            loader,
            shard.clone(),
            config.clone(),
        ));
        let resolver = Arc::new(RoutingResolver::new(
            store.clone(),
            transfer,
            config.mirror_staleness(),
        ));
        let monitor = Arc::new(HeartbeatMonitor::new(
            registry.clone(),
            store.clone(),
            shard,
            config.clone(),
        ));
        let pregen = Arc::new(PregenPool::new(registry, config.pregen.clone()));

        monitor.register_shard().await?;

        let (shutdown, _) = broadcast::channel(4);
        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(store.clone().run(shutdown.subscribe())));
        {
            let monitor = monitor.clone();
            let receiver = shutdown.subscribe();
            tasks.push(tokio::spawn(async move { monitor.run(receiver).await }));
        }
        if !config.pregen.targets.is_empty() {
            let pregen = pregen.clone();
            let receiver = shutdown.subscribe();
            tasks.push(tokio::spawn(async move { pregen.run(receiver).await }));
        }

        info!("✅ instance host ready");
        Ok(Self {
            store,
            lifecycle,
            resolver,
            monitor,
            pregen,
            shutdown,
            tasks,
        })
    }

    /// Signals every background task and waits for them to stop.
    pub async fn shutdown(self) {
        info!("🛑 instance host shutting down");
        let _ = self.shutdown.send(());
        for task in self.tasks {
            let _ = task.await;
        }
        info!("instance host stopped");
    }
}
