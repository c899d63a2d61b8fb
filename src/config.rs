//! Tunables for shard allocation and pipeline execution.
//!
//! Allocation behavior is configuration, not derivation: the write-volume
//! threshold and the clock-skew tolerance window are deployment decisions
//! and must never be hardcoded at use sites.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

// ── Cache Config ───────────────────────────────────────────────────

/// Configuration for the shard cache and allocator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheConfig {
    /// Approximate writes per shard before a new shard is considered.
    /// Advisory: the counter that drives it tolerates lost updates.
    pub shard_write_threshold: u64,

    /// Maximum tolerated writer clock skew / shard visibility delay, in
    /// milliseconds. A freshly allocated shard starts no earlier than
    /// `now + 2 * skew_window_ms` so in-flight writes with stale clocks
    /// still route to a shard every node has observed.
    pub skew_window_ms: u64,

    /// How many times an allocation conflict is re-read before it
    /// escalates to a cache-unavailable error.
    pub allocation_retries: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            shard_write_threshold: 500_000,
            skew_window_ms: 30_000,
            allocation_retries: 3,
        }
    }
}

impl CacheConfig {
    /// Read config from a JSON file. Returns None if the file doesn't exist.
    pub fn read_from(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        Ok(Some(config))
    }

    /// Write config to a JSON file.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

// ── Pipeline Config ────────────────────────────────────────────────

/// Configuration for pipeline filter execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Per-query timeout against the secondary index, in milliseconds.
    /// Exceeding it surfaces as a typed timeout error, distinct from a
    /// generic query failure.
    pub query_timeout_ms: u64,

    /// Bound on the output channel of each filter stage. The bound is the
    /// backpressure contract: a producer blocks on send until the consumer
    /// drains, so no stage reads ahead of what downstream will accept.
    pub channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: 10_000,
            channel_capacity: 4,
        }
    }
}

impl PipelineConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cache = CacheConfig::default();
        assert!(cache.shard_write_threshold > 0);
        assert!(cache.skew_window_ms > 0);
        assert!(cache.allocation_retries > 0);

        let pipeline = PipelineConfig::default();
        assert!(pipeline.query_timeout() > Duration::ZERO);
        assert!(pipeline.channel_capacity > 0);
    }

    #[test]
    fn test_cache_config_file_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cache_config.json");

        assert_eq!(CacheConfig::read_from(&path).unwrap(), None);

        let config = CacheConfig {
            shard_write_threshold: 1000,
            skew_window_ms: 250,
            allocation_retries: 5,
        };
        config.write_to(&path).unwrap();

        let back = CacheConfig::read_from(&path).unwrap().unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_pipeline_config_serde_roundtrip() {
        let config = PipelineConfig {
            query_timeout_ms: 50,
            channel_capacity: 2,
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: PipelineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
