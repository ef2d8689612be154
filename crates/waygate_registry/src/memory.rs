//! # In-Memory Registry
//!
//! A process-local [`Registry`] implementation backed by a concurrent map and
//! a broadcast channel. Used by tests and single-host clusters, and as the
//! reference for what any networked implementation must guarantee: atomic
//! generation-fenced writes and complete change broadcasts.
//!
//! The registry also carries a failure-injection switch so outage semantics
//! (`RegistryError::Unavailable`) are testable in-process.

use crate::registry::{
    CasOutcome, ChangeEvent, KeyPrefix, Registry, RegistryError, RegistryKey, RegistryWatch,
    Versioned,
};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::trace;

/// Capacity of the change-event channel. A watcher that falls further behind
/// than this observes a lapse and re-scans.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// In-process registry with compare-and-set fencing and change broadcasts.
pub struct InMemoryRegistry {
    entries: DashMap<RegistryKey, Versioned<Value>>,
    events: broadcast::Sender<ChangeEvent>,
    unavailable: AtomicBool,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            entries: DashMap::new(),
            events,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Failure injection: while set, every operation fails with
    /// [`RegistryError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), RegistryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(RegistryError::Unavailable(
                "connection refused (injected outage)".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    fn broadcast(&self, event: ChangeEvent) {
        // Send fails only when nobody is subscribed, which is fine.
        let _ = self.events.send(event);
    }
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn get(&self, key: &RegistryKey) -> Result<Option<Versioned<Value>>, RegistryError> {
        self.check_available()?;
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn compare_and_set(
        &self,
        key: &RegistryKey,
        expected: Option<u64>,
        value: Value,
    ) -> Result<CasOutcome, RegistryError> {
        self.check_available()?;

        let outcome = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get().generation;
                if expected == Some(current) {
                    let generation = current + 1;
                    occupied.insert(Versioned {
                        generation,
                        value: value.clone(),
                    });
                    CasOutcome::Committed { generation }
                } else {
                    CasOutcome::Conflict {
                        current: Some(current),
                    }
                }
            }
            Entry::Vacant(vacant) => {
                if expected.is_none() {
                    vacant.insert(Versioned {
                        generation: 1,
                        value: value.clone(),
                    });
                    CasOutcome::Committed { generation: 1 }
                } else {
                    CasOutcome::Conflict { current: None }
                }
            }
        };

        if let CasOutcome::Committed { generation } = outcome {
            trace!(key = %key, generation, "committed write");
            self.broadcast(ChangeEvent {
                key: key.clone(),
                generation,
                value: Some(value),
            });
        }
        Ok(outcome)
    }

    async fn compare_and_remove(
        &self,
        key: &RegistryKey,
        expected: u64,
    ) -> Result<CasOutcome, RegistryError> {
        self.check_available()?;

        let outcome = match self.entries.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                let current = occupied.get().generation;
                if current == expected {
                    occupied.remove();
                    CasOutcome::Committed {
                        generation: current,
                    }
                } else {
                    CasOutcome::Conflict {
                        current: Some(current),
                    }
                }
            }
            Entry::Vacant(_) => CasOutcome::Conflict { current: None },
        };

        if let CasOutcome::Committed { generation } = outcome {
            trace!(key = %key, generation, "removed key");
            self.broadcast(ChangeEvent {
                key: key.clone(),
                generation,
                value: None,
            });
        }
        Ok(outcome)
    }

    async fn scan(
        &self,
        prefix: KeyPrefix,
    ) -> Result<Vec<(RegistryKey, Versioned<Value>)>, RegistryError> {
        self.check_available()?;
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().prefix() == prefix)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect())
    }

    fn watch(&self, prefix: KeyPrefix) -> RegistryWatch {
        RegistryWatch::new(prefix, self.events.subscribe())
    }
}
