//! Storage-substrate interface for shard groups and edge scans.
//!
//! The substrate is an external collaborator: a column-family store with
//! range scans. Shard group records persist keyed by coordinate row key,
//! each shard keyed additionally by start version, ascending, so the
//! "greatest start <= V" lookup is one bounded scan. This module defines
//! the trait the cache consumes plus an in-memory implementation used by
//! tests and ephemeral deployments.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use crate::error::{GraphError, Result};
use crate::shard::group::{Shard, ShardGroup};
use crate::types::{Coordinate, NodeId, Version};

// ── Stored Edge ────────────────────────────────────────────────────

/// One persisted edge row as seen by a range scan: the far node and the
/// write version. Edge payloads live outside this subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredEdge {
    pub target: NodeId,
    pub version: Version,
}

// ── Substrate Interface ────────────────────────────────────────────

/// Read/write primitives the shard cache needs from the substrate.
///
/// `create_shard_if_absent` must be safe under concurrent callers:
/// racing creations for the same start version converge on one winning
/// shard. An unresolvable race surfaces as an allocation conflict.
pub trait ShardStore: Send + Sync + 'static {
    /// Read the persisted shard group for a coordinate. A coordinate with
    /// no persisted shards yields the implicit default group.
    fn read_shard_group(&self, coordinate: &Coordinate) -> Result<ShardGroup>;

    /// Idempotently create a shard starting at `start_version`. Returns
    /// the winning shard, whether created by this call or a racing one.
    fn create_shard_if_absent(
        &self,
        coordinate: &Coordinate,
        start_version: Version,
        created_at_ms: u64,
    ) -> Result<Shard>;

    /// Scan the given shard's owned slice of the coordinate for edges with
    /// version in `[from, to]`, descending by version.
    fn range_scan(
        &self,
        coordinate: &Coordinate,
        shard: &Shard,
        from: Version,
        to: Version,
    ) -> Result<Vec<StoredEdge>>;
}

// ── In-Memory Store ────────────────────────────────────────────────

#[derive(Default)]
struct StoredGroup {
    /// Explicitly allocated shards, keyed by start version.
    shards: BTreeMap<Version, Shard>,
    /// All edges of the coordinate, keyed by version. Shard ownership is
    /// resolved at scan time from the shard set.
    edges: BTreeMap<Version, NodeId>,
}

/// In-memory substrate for tests and ephemeral deployments.
///
/// Supports failure injection: reads can be forced to fail (unavailability
/// paths) and creates can be forced to conflict a bounded number of times
/// (allocation retry paths).
pub struct MemoryShardStore {
    groups: Mutex<HashMap<u128, StoredGroup>>,
    fail_reads: AtomicBool,
    create_conflicts: AtomicU32,
}

impl MemoryShardStore {
    pub fn new() -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            fail_reads: AtomicBool::new(false),
            create_conflicts: AtomicU32::new(0),
        }
    }

    /// Force all subsequent reads to fail until cleared.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make the next `n` create calls report an allocation conflict.
    pub fn inject_create_conflicts(&self, n: u32) {
        self.create_conflicts.store(n, Ordering::SeqCst);
    }

    /// Seed an edge row (test setup; the write path proper is external).
    pub fn insert_edge(&self, coordinate: &Coordinate, target: NodeId, version: Version) {
        let mut groups = self.lock_groups();
        let group = groups.entry(coordinate.row_key()).or_default();
        group.edges.insert(version, target);
    }

    /// Number of explicitly allocated shards for a coordinate.
    pub fn allocated_shard_count(&self, coordinate: &Coordinate) -> usize {
        let groups = self.lock_groups();
        groups
            .get(&coordinate.row_key())
            .map(|g| g.shards.len())
            .unwrap_or(0)
    }

    fn lock_groups(&self) -> std::sync::MutexGuard<'_, HashMap<u128, StoredGroup>> {
        match self.groups.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn check_reads(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(GraphError::CacheUnavailable(
                "substrate read failure (injected)".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for MemoryShardStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardStore for MemoryShardStore {
    fn read_shard_group(&self, coordinate: &Coordinate) -> Result<ShardGroup> {
        self.check_reads()?;
        let groups = self.lock_groups();
        match groups.get(&coordinate.row_key()) {
            Some(stored) => ShardGroup::from_shards(stored.shards.values().copied().collect()),
            None => Ok(ShardGroup::new()),
        }
    }

    fn create_shard_if_absent(
        &self,
        coordinate: &Coordinate,
        start_version: Version,
        created_at_ms: u64,
    ) -> Result<Shard> {
        if self
            .create_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(GraphError::AllocationConflict {
                start_version: start_version.timestamp_ms,
            });
        }

        let mut groups = self.lock_groups();
        let group = groups.entry(coordinate.row_key()).or_default();
        // Unique-creation guarantee: an existing shard at this start wins.
        let shard = group
            .shards
            .entry(start_version)
            .or_insert_with(|| Shard::new(start_version, created_at_ms));
        Ok(*shard)
    }

    fn range_scan(
        &self,
        coordinate: &Coordinate,
        shard: &Shard,
        from: Version,
        to: Version,
    ) -> Result<Vec<StoredEdge>> {
        self.check_reads()?;
        let groups = self.lock_groups();
        let Some(stored) = groups.get(&coordinate.row_key()) else {
            return Ok(Vec::new());
        };

        // Clamp the scan to the shard's owned slice: [start, next start).
        let low = shard.start_version.max(from);
        if low > to {
            return Ok(Vec::new());
        }
        let next_start = stored
            .shards
            .range((
                std::ops::Bound::Excluded(shard.start_version),
                std::ops::Bound::Unbounded,
            ))
            .next()
            .map(|(v, _)| *v);

        let mut out: Vec<StoredEdge> = stored
            .edges
            .range(low..=to)
            .filter(|(v, _)| next_start.map_or(true, |ns| **v < ns))
            .map(|(v, target)| StoredEdge {
                target: *target,
                version: *v,
            })
            .collect();
        out.reverse();
        Ok(out)
    }
}
