//! Configuration structures for a shard process.
//!
//! All policy constants live here rather than in code: retry budgets, the
//! drain grace period, the retention window, liveness thresholds, and the
//! pregeneration floors. No file or CLI surface belongs to this crate; the
//! surrounding glue builds these structs however it likes (they serialize
//! cleanly to TOML) and passes them in.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Identity and capacity of this shard process.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ShardConfig {
    /// Operator-assigned name, unique across the cluster.
    pub shard_id: String,

    /// Proxy-visible endpoint players are transferred to.
    ///
    /// Format: "IP:PORT" or a hostname the proxy layer understands.
    pub address: String,

    /// Maximum number of instances this shard will host concurrently.
    pub capacity: usize,
}

/// Tuning for the lifecycle manager, instance store, resolver, and
/// heartbeat monitor.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ManagerConfig {
    /// Attempts per claim before surfacing `ClaimFailed` /
    /// `RegistryUnavailable`.
    pub claim_attempts: u32,

    /// Initial backoff between claim attempts, in milliseconds. Doubles per
    /// attempt up to `claim_backoff_cap_ms`.
    pub claim_backoff_ms: u64,

    /// Upper bound on the claim backoff, in milliseconds.
    pub claim_backoff_cap_ms: u64,

    /// How long an emptied `Active` instance waits before draining, in
    /// milliseconds. Absorbs brief disconnects so a rejoining party does not
    /// pay a full teardown/reload cycle.
    pub drain_grace_ms: u64,

    /// How long an `Unloaded`, ownerless record is kept for reuse before the
    /// monitor deletes it, in milliseconds.
    pub retention_ms: u64,

    /// Interval between heartbeat upserts, in milliseconds.
    pub heartbeat_interval_ms: u64,

    /// Heartbeat age past which a shard is considered dead and its instances
    /// are reclaimed, in milliseconds.
    pub liveness_threshold_ms: u64,

    /// Heartbeat age past which the shard record itself is removed, in
    /// milliseconds. Must be at least `liveness_threshold_ms`.
    pub eviction_threshold_ms: u64,

    /// Interval between monitor scans, in milliseconds.
    pub scan_interval_ms: u64,

    /// How old a mirror entry may be before the resolver re-fetches from the
    /// registry, in milliseconds. Bounds routing staleness; writes always
    /// re-verify regardless.
    pub mirror_staleness_ms: u64,

    /// Instance pregeneration, keyed by template.
    pub pregen: PregenConfig,
}

/// Pregeneration pool settings.
///
/// The pool keeps a floor of claimable records per template so entry is fast
/// and claim races have targets. An empty `targets` map disables the pool.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct PregenConfig {
    /// Desired number of claimable instances per template.
    pub targets: HashMap<String, usize>,

    /// Back-to-back failures on one template before it is paused until the
    /// pool restarts. The same budget, counted across templates, aborts the
    /// whole pool run.
    pub max_sequential_failures: u32,

    /// How long the pool sleeps once every floor is met, in milliseconds.
    pub idle_interval_ms: u64,
}

impl ManagerConfig {
    /// Rejects configurations the runtime cannot honor.
    pub fn validate(&self) -> Result<(), String> {
        if self.claim_attempts == 0 {
            return Err("claim_attempts must be at least 1".to_string());
        }
        if self.claim_backoff_cap_ms < self.claim_backoff_ms {
            return Err("claim_backoff_cap_ms must be >= claim_backoff_ms".to_string());
        }
        if self.eviction_threshold_ms < self.liveness_threshold_ms {
            return Err("eviction_threshold_ms must be >= liveness_threshold_ms".to_string());
        }
        if self.heartbeat_interval_ms == 0 || self.scan_interval_ms == 0 {
            return Err("heartbeat_interval_ms and scan_interval_ms must be nonzero".to_string());
        }
        if self.heartbeat_interval_ms >= self.liveness_threshold_ms {
            return Err("liveness_threshold_ms must exceed heartbeat_interval_ms".to_string());
        }
        Ok(())
    }

    pub fn claim_backoff(&self) -> Duration {
        Duration::from_millis(self.claim_backoff_ms)
    }

    pub fn claim_backoff_cap(&self) -> Duration {
        Duration::from_millis(self.claim_backoff_cap_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub fn mirror_staleness(&self) -> Duration {
        Duration::from_millis(self.mirror_staleness_ms)
    }
}

impl Default for ManagerConfig {
    /// Defaults suitable for development and tests. The grace and retention
    /// values are policy, not protocol; production deployments are expected
    /// to override them.
    fn default() -> Self {
        Self {
            claim_attempts: 5,
            claim_backoff_ms: 50,
            claim_backoff_cap_ms: 2_000,
            drain_grace_ms: 30_000,
            retention_ms: 600_000,
            heartbeat_interval_ms: 5_000,
            liveness_threshold_ms: 30_000,
            eviction_threshold_ms: 120_000,
            scan_interval_ms: 10_000,
            mirror_staleness_ms: 2_000,
            pregen: PregenConfig {
                targets: HashMap::new(),
                max_sequential_failures: 5,
                idle_interval_ms: 10_000,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ManagerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.claim_attempts, 5);
        assert_eq!(config.drain_grace_ms, 30_000);
        assert_eq!(config.retention_ms, 600_000);
        assert_eq!(config.pregen.max_sequential_failures, 5);
        assert!(config.pregen.targets.is_empty());
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let config = ManagerConfig {
            claim_attempts: 0,
            ..ManagerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_eviction_before_liveness() {
        let config = ManagerConfig {
            liveness_threshold_ms: 60_000,
            eviction_threshold_ms: 30_000,
            ..ManagerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_heartbeat_slower_than_liveness() {
        let config = ManagerConfig {
            heartbeat_interval_ms: 30_000,
            liveness_threshold_ms: 30_000,
            ..ManagerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_toml_round_trip() {
        let mut config = ManagerConfig::default();
        config
            .pregen
            .targets
            .insert("dungeon-1".to_string(), 3);

        let toml_str = toml::to_string(&config).unwrap();
        let back: ManagerConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.claim_attempts, back.claim_attempts);
        assert_eq!(config.drain_grace_ms, back.drain_grace_ms);
        assert_eq!(config.retention_ms, back.retention_ms);
        assert_eq!(config.pregen.targets, back.pregen.targets);
    }

    #[test]
    fn test_shard_config_toml_parsing() {
        let toml_str = r#"
shard_id = "dungeon-shard-1"
address = "10.0.3.7:25565"
capacity = 8
        "#;
        let config: ShardConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.shard_id, "dungeon-shard-1");
        assert_eq!(config.capacity, 8);
    }
}
