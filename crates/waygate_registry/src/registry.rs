//! # Registry Contract
//!
//! The coordination surface every Waygate process shares: a keyed store with
//! `get` / `compare_and_set` / `watch` semantics and generation fencing. Any
//! networked store with optimistic locking can implement [`Registry`]; the
//! record schema and the fencing contract are what the rest of the system
//! depends on, not the transport.
//!
//! ## Key Pieces
//!
//! - [`RegistryKey`] / [`KeyPrefix`] - the keyspace (instances and shards)
//! - [`Versioned`] - a value paired with the generation it was committed at
//! - [`CasOutcome`] - committed vs. conflict; conflict is a normal outcome
//! - [`RegistryWatch`] - restartable change-event subscription
//!
//! ## Design Principles
//!
//! - **No long-held locks**: a conflict tells the caller to re-read and
//!   retry, never to wait
//! - **Fail fast**: an unreachable registry is an error, not a retry loop at
//!   this layer; callers own their retry budgets

use crate::types::{InstanceId, ShardId};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// Keys
// ============================================================================

/// Key of one record in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegistryKey {
    Instance(InstanceId),
    Shard(ShardId),
}

impl RegistryKey {
    /// The prefix this key lives under, used for scans and watches.
    pub fn prefix(&self) -> KeyPrefix {
        match self {
            RegistryKey::Instance(_) => KeyPrefix::Instances,
            RegistryKey::Shard(_) => KeyPrefix::Shards,
        }
    }
}

impl std::fmt::Display for RegistryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryKey::Instance(id) => write!(f, "instances/{}", id),
            RegistryKey::Shard(id) => write!(f, "shards/{}", id),
        }
    }
}

/// One of the two top-level keyspaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPrefix {
    Instances,
    Shards,
}

// ============================================================================
// Values
// ============================================================================

/// A registry value paired with the generation it was committed at.
///
/// Generations start at 1 on create and increase by exactly 1 per committed
/// write, so `generation` doubles as the fencing token for the next write
/// against this key.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub generation: u64,
    pub value: T,
}

impl Versioned<Value> {
    /// Decodes the raw JSON value into a typed record, carrying the
    /// generation across.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Versioned<T>, RegistryError> {
        let value = serde_json::from_value(self.value.clone()).map_err(RegistryError::Decode)?;
        Ok(Versioned {
            generation: self.generation,
            value,
        })
    }
}

/// Encodes a record for storage.
pub fn encode<T: Serialize>(value: &T) -> Result<Value, RegistryError> {
    serde_json::to_value(value).map_err(RegistryError::Encode)
}

/// Result of a compare-and-set or compare-and-remove.
///
/// A conflict is expected contention, not an error: the caller re-reads the
/// key and decides whether to retry against the newer generation.
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    /// The write committed at this generation.
    Committed { generation: u64 },
    /// Another writer got there first. `current` is the generation now in
    /// the registry, or `None` if the key is absent.
    Conflict { current: Option<u64> },
}

impl CasOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, CasOutcome::Committed { .. })
    }
}

// ============================================================================
// Change Events
// ============================================================================

/// One committed change, broadcast to all watchers of the key's prefix.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub key: RegistryKey,
    /// Generation the change committed at. For removals, the generation the
    /// removed value held.
    pub generation: u64,
    /// The new value, or `None` when the key was removed.
    pub value: Option<Value>,
}

/// Why a watch subscription lapsed. Either way the watcher's view can no
/// longer be trusted incrementally and it must re-scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchLapse {
    /// The subscriber fell behind and `missed` events were dropped.
    Lagged(u64),
    /// The registry side of the channel is gone.
    Closed,
}

/// A live subscription to change events under one prefix.
///
/// Restartable by construction: on [`WatchLapse`] the caller re-scans the
/// prefix and asks the registry for a fresh watch.
pub struct RegistryWatch {
    prefix: KeyPrefix,
    receiver: broadcast::Receiver<ChangeEvent>,
}

impl RegistryWatch {
    pub fn new(prefix: KeyPrefix, receiver: broadcast::Receiver<ChangeEvent>) -> Self {
        Self { prefix, receiver }
    }

    /// Waits for the next change under this watch's prefix.
    pub async fn next(&mut self) -> Result<ChangeEvent, WatchLapse> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.key.prefix() == self.prefix => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    return Err(WatchLapse::Lagged(missed))
                }
                Err(broadcast::error::RecvError::Closed) => return Err(WatchLapse::Closed),
            }
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Failures at the registry boundary.
///
/// `Unavailable` models an outage of the shared store; callers fail fast and
/// must never assume ownership while it lasts.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("failed to encode record: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode record: {0}")]
    Decode(#[source] serde_json::Error),
}

// ============================================================================
// Contract
// ============================================================================

/// The shared registry contract.
///
/// All mutation of [`crate::InstanceRecord`] / [`crate::ShardRecord`] goes
/// through [`Registry::compare_and_set`] with the record's generation as the
/// fencing token. Implementations must guarantee that for any key, committed
/// generations are strictly increasing with no gaps, and that every commit
/// and removal is broadcast to watchers of the key's prefix.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Reads one key. `None` means absent, which is a normal answer.
    async fn get(&self, key: &RegistryKey) -> Result<Option<Versioned<Value>>, RegistryError>;

    /// Atomically writes `value` if the key's current generation matches
    /// `expected`. `expected = None` means create-if-absent.
    async fn compare_and_set(
        &self,
        key: &RegistryKey,
        expected: Option<u64>,
        value: Value,
    ) -> Result<CasOutcome, RegistryError>;

    /// Atomically removes the key if its current generation matches
    /// `expected`.
    async fn compare_and_remove(
        &self,
        key: &RegistryKey,
        expected: u64,
    ) -> Result<CasOutcome, RegistryError>;

    /// Reads every record under a prefix.
    async fn scan(
        &self,
        prefix: KeyPrefix,
    ) -> Result<Vec<(RegistryKey, Versioned<Value>)>, RegistryError>;

    /// Subscribes to change events under a prefix. Events observed after a
    /// scan of the same prefix are complete from that point on; a
    /// [`WatchLapse`] means the subscriber must re-scan.
    fn watch(&self, prefix: KeyPrefix) -> RegistryWatch;
}
