//! Node shard cache: routes (node, edge type, version) coordinates to the
//! physical shards holding their data.
//!
//! Read-through on miss, write-through on allocation. Tracks approximate
//! per-shard write volume and signals the allocator when a shard's count
//! crosses the configured threshold. Groups returned by the cache may be
//! latent relative to the substrate; allocation start versions absorb that
//! (see `ShardAllocator`), so a slightly stale group never misroutes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::{GraphError, Result};
use crate::metrics::{Metrics, QueryOp};
use crate::shard::allocator::ShardAllocator;
use crate::shard::group::{Shard, ShardGroup};
use crate::store::ShardStore;
use crate::types::{now_ms, Coordinate, NodeId, ScopeKey, Version};

// ── Cache Entry ────────────────────────────────────────────────────

/// Cached state for one coordinate: the shard group plus per-shard write
/// counters. Counters live only here, never persisted verbatim, and
/// tolerate lost updates by design; they gate allocation timing only.
struct CacheEntry {
    coordinate: Coordinate,
    group: RwLock<ShardGroup>,
    counters: Mutex<HashMap<u64, Arc<AtomicU64>>>,
    /// Damps concurrent allocation audits for the same coordinate.
    allocating: AtomicBool,
}

impl CacheEntry {
    fn new(coordinate: Coordinate, group: ShardGroup) -> Self {
        Self {
            coordinate,
            group: RwLock::new(group),
            counters: Mutex::new(HashMap::new()),
            allocating: AtomicBool::new(false),
        }
    }

    fn counter(&self, shard_id: u64) -> Arc<AtomicU64> {
        let mut counters = lock(&self.counters);
        counters
            .entry(shard_id)
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }

    fn read_group(&self) -> ShardGroup {
        match self.group.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ── Node Shard Cache ───────────────────────────────────────────────

/// Maps logical (scope, node, edge type, version) coordinates to physical
/// shards, allocating new shards as write volume grows.
pub struct NodeShardCache {
    store: Arc<dyn ShardStore>,
    allocator: ShardAllocator,
    metrics: Arc<Metrics>,
    entries: RwLock<HashMap<u128, Arc<CacheEntry>>>,
}

impl NodeShardCache {
    pub fn new(store: Arc<dyn ShardStore>, config: CacheConfig) -> Self {
        Self::with_metrics(store, config, Arc::new(Metrics::new()))
    }

    pub fn with_metrics(
        store: Arc<dyn ShardStore>,
        config: CacheConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            allocator: ShardAllocator::new(config),
            metrics,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Shard selector owning the coordinate at `version`.
    ///
    /// Monotone: for a fixed coordinate, a later version never selects an
    /// earlier shard. Never fails on a cold cache: a miss falls through
    /// to the substrate and populates the entry; a substrate failure
    /// surfaces as cache-unavailable, never as "no shard".
    pub fn get_slice(
        &self,
        scope: &ScopeKey,
        node: NodeId,
        version: Version,
        edge_types: &[&str],
    ) -> Result<u64> {
        let coordinate = Coordinate::new(scope.clone(), node, edge_types);
        let entry = self.entry(&coordinate)?;
        let group = entry.read_group();
        Ok(group.shard_for(version).shard_id)
    }

    /// All versions known at or below `max_version` for the coordinate,
    /// in descending order, spanning shard boundaries transparently.
    ///
    /// The iterator is forward-only and not restartable mid-iteration: to
    /// resume, make a fresh call with the last yielded version as the new
    /// `max_version`.
    pub fn get_versions(
        &self,
        scope: &ScopeKey,
        node: NodeId,
        max_version: Version,
        edge_types: &[&str],
    ) -> Result<VersionIter> {
        let coordinate = Coordinate::new(scope.clone(), node, edge_types);
        let entry = self.entry(&coordinate)?;
        let group = entry.read_group();

        // Snapshot the covering shards newest-first; the scan walks them
        // lazily, one substrate range scan per shard.
        let shards = group.covering_descending(max_version).copied().collect();
        Ok(VersionIter::new(
            Arc::clone(&self.store),
            Arc::clone(&self.metrics),
            coordinate,
            shards,
            max_version,
        ))
    }

    /// Add `count` to the in-memory counter of the named shard, returning
    /// the updated local count.
    ///
    /// Best-effort by contract: never fails, may under- or over-count
    /// under concurrency, and never gates correctness. Crossing the
    /// configured threshold signals the allocator to evaluate cutting a
    /// new shard for the coordinate.
    pub fn increment(
        &self,
        scope: &ScopeKey,
        node: NodeId,
        shard_id: u64,
        count: u64,
        edge_types: &[&str],
    ) -> u64 {
        let coordinate = Coordinate::new(scope.clone(), node, edge_types);
        let entry = match self.entry(&coordinate) {
            Ok(entry) => entry,
            Err(err) => {
                // Counting is advisory; a population failure must not
                // bubble into the write path.
                warn!(coordinate = %coordinate, error = %err, "increment skipped cache population");
                return count;
            }
        };

        let counter = entry.counter(shard_id);
        let updated = counter.fetch_add(count, Ordering::Relaxed) + count;

        if self.allocator.should_allocate(updated) {
            self.audit_allocation(&entry, shard_id, updated, &counter);
        }
        updated
    }

    // -- Internals ------------------------------------------------------------

    /// Read-through entry lookup.
    fn entry(&self, coordinate: &Coordinate) -> Result<Arc<CacheEntry>> {
        let key = coordinate.row_key();
        {
            let entries = match self.entries.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(entry) = entries.get(&key) {
                return Ok(Arc::clone(entry));
            }
        }

        let timer = self.metrics.start_timer(QueryOp::CacheRead);
        let group = self.store.read_shard_group(coordinate).map_err(|err| {
            warn!(coordinate = %coordinate, error = %err, "shard group read failed");
            match err {
                GraphError::CacheUnavailable(_) => err,
                other => GraphError::CacheUnavailable(other.to_string()),
            }
        })?;
        self.metrics.record(timer);
        debug!(coordinate = %coordinate, shards = group.len(), "populated shard cache entry");

        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = entries
            .entry(key)
            .or_insert_with(|| Arc::new(CacheEntry::new(coordinate.clone(), group)));
        Ok(Arc::clone(entry))
    }

    /// Evaluate whether a new shard must be cut after a counter crossed
    /// the threshold. Failures are logged, not propagated: allocation
    /// timing is a heuristic, edge storage correctness never depends on it.
    fn audit_allocation(
        &self,
        entry: &CacheEntry,
        shard_id: u64,
        observed: u64,
        counter: &AtomicU64,
    ) {
        if entry
            .allocating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return; // an audit for this coordinate is already in flight
        }

        // Re-read under the guard: only the newest shard grows, and a
        // just-finished audit may have sealed the shard this counter
        // belongs to.
        let group = entry.read_group();
        if group.latest().shard_id != shard_id {
            entry.allocating.store(false, Ordering::Release);
            return;
        }

        let timer = self.metrics.start_timer(QueryOp::ShardAllocate);
        let outcome = self
            .allocator
            .allocate(self.store.as_ref(), &entry.coordinate, now_ms(), &group);
        self.metrics.record(timer);

        match outcome {
            Ok(shard) => {
                info!(
                    coordinate = %entry.coordinate,
                    shard_id = shard.shard_id,
                    observed,
                    "write volume threshold crossed, shard allocated"
                );
                let mut group = match entry.group.write() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                // Write-through; a duplicate start means a racing audit
                // already installed the same winner.
                let _ = group.insert(shard);
                // The sealed shard stops accumulating toward re-triggering.
                counter.store(0, Ordering::Relaxed);
            }
            Err(err) => {
                warn!(coordinate = %entry.coordinate, error = %err, "shard allocation audit failed");
            }
        }
        entry.allocating.store(false, Ordering::Release);
    }
}

// ── Version Iterator ───────────────────────────────────────────────

/// Lazy descending scan of versions across a coordinate's shards.
///
/// Yields versions bounded above by `max_version`, strictly descending,
/// duplicate-free across shard boundaries. One substrate range scan is
/// issued per shard, on demand. A failed scan yields one terminal error.
pub struct VersionIter {
    store: Arc<dyn ShardStore>,
    metrics: Arc<Metrics>,
    coordinate: Coordinate,
    /// Remaining shards to scan, newest first.
    shards: Vec<Shard>,
    next_shard: usize,
    max_version: Version,
    buffer: std::vec::IntoIter<Version>,
    last_yielded: Option<Version>,
    done: bool,
}

impl VersionIter {
    fn new(
        store: Arc<dyn ShardStore>,
        metrics: Arc<Metrics>,
        coordinate: Coordinate,
        shards: Vec<Shard>,
        max_version: Version,
    ) -> Self {
        Self {
            store,
            metrics,
            coordinate,
            shards,
            next_shard: 0,
            max_version,
            buffer: Vec::new().into_iter(),
            last_yielded: None,
            done: false,
        }
    }
}

impl Iterator for VersionIter {
    type Item = Result<Version>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }

            for version in self.buffer.by_ref() {
                // Dedup across boundaries: drop anything at or above what
                // we already yielded.
                if self.last_yielded.map_or(false, |last| version >= last) {
                    continue;
                }
                self.last_yielded = Some(version);
                return Some(Ok(version));
            }

            if self.next_shard >= self.shards.len() {
                self.done = true;
                return None;
            }
            let shard = self.shards[self.next_shard];
            self.next_shard += 1;

            let timer = self.metrics.start_timer(QueryOp::EdgeScan);
            let scan = self.store.range_scan(
                &self.coordinate,
                &shard,
                shard.start_version,
                self.max_version,
            );
            self.metrics.record(timer);

            match scan {
                Ok(edges) => {
                    self.buffer = edges
                        .into_iter()
                        .map(|e| e.version)
                        .collect::<Vec<_>>()
                        .into_iter();
                }
                Err(err) => {
                    warn!(
                        coordinate = %self.coordinate,
                        shard_id = shard.shard_id,
                        error = %err,
                        "version scan failed"
                    );
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }
}
