//! # Instance Manager
//!
//! Shard-side core of the Waygate world-instancing system: claims and hosts
//! ephemeral world instances, resolves which shard owns an instance so the
//! proxy can route players to it, and recovers instances when a shard dies.
//!
//! ## Components
//!
//! - [`LifecycleManager`] - claim/load/drain/unload state machine, the only
//!   writer of instance transitions
//! - [`InstanceStore`] - per-process registry mirror plus local world
//!   bookkeeping
//! - [`RoutingResolver`] - advisory "who hosts instance X" answers for the
//!   proxy layer
//! - [`HeartbeatMonitor`] - shard liveness and leaderless reclamation
//! - [`PregenPool`] - keeps per-template floors of claimable records
//! - [`InstanceHost`] - wires the above together for one shard process
//!
//! ## Design Principles
//!
//! - **Local optimism, global pessimism**: every transition is prepared
//!   against a cached copy but only real once the registry's
//!   compare-and-set commits it
//! - **Reads may be stale, writes never are**: routing answers tolerate a
//!   bounded staleness window; ownership changes always re-verify
//! - **Capabilities, not engines**: world loading/unloading and player
//!   transfer stay behind traits the surrounding server implements

pub use capability::{LoadError, PlayerTransfer, TransferError, UnloadError, WorldHandle, WorldLoader};
pub use config::{ManagerConfig, PregenConfig, ShardConfig};
pub use error::{WorldError, WorldResult};
pub use heartbeat::{HeartbeatMonitor, ScanReport};
pub use host::InstanceHost;
pub use lifecycle::{InstanceGrant, LifecycleManager};
pub use pregen::{PregenPool, PregenStep};
pub use resolver::{RouteOutcome, RouteTarget, RoutingResolver};
pub use store::{InstanceStore, MirrorSnapshot};

pub mod capability;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod host;
pub mod lifecycle;
pub mod pregen;
pub mod resolver;
pub mod store;
