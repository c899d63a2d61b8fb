//! Shard and shard group data entities.
//!
//! A shard is an immutable descriptor of one physical partition: it owns
//! every edge of its coordinate with version >= its start version and
//! < the next shard's start version (unbounded for the newest shard).
//! A shard group is the ordered set of shards currently valid for one
//! coordinate. Shards are never mutated or deleted here, only superseded
//! by newer shards.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};
use crate::types::Version;

// ── Shard ──────────────────────────────────────────────────────────

/// Immutable descriptor of a physical partition.
///
/// `shard_id` doubles as the shard selector returned by the cache: it is
/// the millisecond component of the start version, so selector order is
/// start-version order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub shard_id: u64,
    pub start_version: Version,
    pub created_at_ms: u64,
}

impl Shard {
    /// The implicit shard covering version 0 upward, present for every
    /// coordinate before any explicit allocation.
    pub fn default_shard() -> Self {
        Self {
            shard_id: 0,
            start_version: Version::ZERO,
            created_at_ms: 0,
        }
    }

    pub fn new(start_version: Version, created_at_ms: u64) -> Self {
        Self {
            shard_id: start_version.timestamp_ms,
            start_version,
            created_at_ms,
        }
    }
}

// ── Shard Group ────────────────────────────────────────────────────

/// Ordered set of shards for one coordinate, ascending by start version.
///
/// Invariants: start versions strictly increase; the group always contains
/// the default shard, so routing any version >= 0 succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardGroup {
    shards: BTreeMap<Version, Shard>,
}

impl ShardGroup {
    /// Group holding only the implicit default shard.
    pub fn new() -> Self {
        let mut shards = BTreeMap::new();
        let default = Shard::default_shard();
        shards.insert(default.start_version, default);
        Self { shards }
    }

    /// Rebuild a group from persisted shards. The default shard is added
    /// if the persisted set doesn't include it.
    pub fn from_shards(persisted: Vec<Shard>) -> Result<Self> {
        let mut group = Self::new();
        for shard in persisted {
            if shard.start_version == Version::ZERO {
                continue; // the implicit default, already present
            }
            group.insert(shard)?;
        }
        Ok(group)
    }

    /// Insert a newly allocated shard. Rejects a duplicate start version:
    /// two shards with the same start would make routing ambiguous.
    pub fn insert(&mut self, shard: Shard) -> Result<()> {
        if self.shards.contains_key(&shard.start_version) {
            return Err(GraphError::AllocationConflict {
                start_version: shard.start_version.timestamp_ms,
            });
        }
        self.shards.insert(shard.start_version, shard);
        Ok(())
    }

    /// The shard owning the given version: greatest start <= version.
    /// Always succeeds because the default shard starts at zero.
    pub fn shard_for(&self, version: Version) -> &Shard {
        self.shards
            .range(..=version)
            .next_back()
            .map(|(_, shard)| shard)
            .expect("group invariant: default shard covers version zero")
    }

    /// The newest shard (greatest start version).
    pub fn latest(&self) -> &Shard {
        self.shards
            .values()
            .next_back()
            .expect("group invariant: never empty")
    }

    /// Look up a shard by selector.
    pub fn get(&self, shard_id: u64) -> Option<&Shard> {
        self.shards.values().find(|s| s.shard_id == shard_id)
    }

    /// Shards whose range can hold versions <= `max_version`, newest first.
    /// Used to span a descending version scan across partitions.
    pub fn covering_descending(&self, max_version: Version) -> impl Iterator<Item = &Shard> {
        self.shards.range(..=max_version).rev().map(|(_, s)| s)
    }

    /// All shards, ascending by start version.
    pub fn iter(&self) -> impl Iterator<Item = &Shard> {
        self.shards.values()
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

impl Default for ShardGroup {
    fn default() -> Self {
        Self::new()
    }
}
