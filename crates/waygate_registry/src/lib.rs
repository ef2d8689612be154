//! # Waygate Registry
//!
//! Shared record schema and registry contract for the Waygate world-instancing
//! system. Every shard process and every proxy-side resolver shares one view of
//! "which instances exist and who owns them" through this crate.
//!
//! ## Key Pieces
//!
//! - [`InstanceRecord`] / [`ShardRecord`] - the replicated record schema
//! - [`Registry`] - get / compare-and-set / watch contract with generation
//!   fencing
//! - [`InMemoryRegistry`] - in-process implementation used by tests and
//!   single-host clusters
//!
//! ## Design Principles
//!
//! - **Optimistic concurrency**: all mutation goes through
//!   [`Registry::compare_and_set`] with the record's `generation` as the
//!   fencing token. There are no cross-process locks.
//! - **Convergence**: every committed write increments the generation by
//!   exactly one, so watchers can detect gaps and re-fetch.
//! - **Fail fast**: an unreachable registry surfaces
//!   [`RegistryError::Unavailable`] instead of letting callers assume
//!   ownership during an outage.

pub use memory::InMemoryRegistry;
pub use registry::{
    encode, CasOutcome, ChangeEvent, KeyPrefix, Registry, RegistryError, RegistryKey,
    RegistryWatch, Versioned, WatchLapse,
};
pub use types::{
    InstanceId, InstanceRecord, InstanceState, PlayerId, ShardId, ShardRecord, TemplateId,
};
pub use utils::current_timestamp_millis;

pub mod memory;
pub mod registry;
pub mod types;
pub mod utils;
