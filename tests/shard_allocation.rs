//! End-to-end shard routing scenarios: cold-cache reads, write-volume
//! triggered allocation, clock-skew safety, and cross-shard version scans.

use std::sync::Arc;

use shardstream::{
    CacheConfig, Coordinate, NodeId, NodeShardCache, ScopeKey, ShardStore, MemoryShardStore,
    Version, VersionFactory,
};

fn scope() -> ScopeKey {
    ScopeKey::new("acme", "app1")
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

fn cache_with(threshold: u64, skew_ms: u64) -> (Arc<MemoryShardStore>, NodeShardCache) {
    let store = Arc::new(MemoryShardStore::new());
    let cache = NodeShardCache::new(
        store.clone() as Arc<dyn ShardStore>,
        CacheConfig {
            shard_write_threshold: threshold,
            skew_window_ms: skew_ms,
            allocation_retries: 3,
        },
    );
    (store, cache)
}

/// The full lifecycle: a fresh coordinate routes to the default shard;
/// crossing the write threshold cuts a shard whose start honors the skew
/// window; versions straddling the boundary route to their own sides.
#[test]
fn allocation_lifecycle_honors_skew_window() {
    // Parametric across window sizes: the invariant must hold for all.
    for skew_ms in [100u64, 5_000, 60_000] {
        let (store, cache) = cache_with(1_000, skew_ms);
        let node = NodeId::from_name("popular-node");
        let factory = VersionFactory::new();

        // No prior shards: the default shard owns everything.
        let v0 = factory.next();
        assert_eq!(cache.get_slice(&scope(), node, v0, &["likes"]).unwrap(), 0);

        // Push the counter past the threshold.
        let before = now_ms();
        let count = cache.increment(&scope(), node, 0, 1_000, &["likes"]);
        assert_eq!(count, 1_000);

        let coord = Coordinate::new(scope(), node, &["likes"]);
        assert_eq!(store.allocated_shard_count(&coord), 1);

        let group = store.read_shard_group(&coord).unwrap();
        let allocated = *group.latest();
        assert!(
            allocated.start_version.timestamp_ms >= before + 2 * skew_ms,
            "shard start {} violates now + 2 * {} window",
            allocated.start_version.timestamp_ms,
            skew_ms
        );

        // A write stamped just below the new start still lands in the old
        // shard; at or after the start, the new shard owns it.
        let boundary = allocated.start_version;
        let just_below = Version::new(boundary.timestamp_ms - 1, u64::MAX);
        assert_eq!(
            cache.get_slice(&scope(), node, just_below, &["likes"]).unwrap(),
            0
        );
        assert_eq!(
            cache.get_slice(&scope(), node, boundary, &["likes"]).unwrap(),
            allocated.shard_id
        );

        // A writer whose clock lags by up to the tolerated skew cannot
        // reach the new shard's range.
        let skewed = factory.next_at(now_ms() - skew_ms);
        assert_eq!(
            cache.get_slice(&scope(), node, skewed, &["likes"]).unwrap(),
            0
        );
    }
}

/// Selector monotonicity across a growing group.
#[test]
fn get_slice_is_monotone_in_version() {
    let (store, cache) = cache_with(10, 50);
    let node = NodeId::from_name("node");
    let coord = Coordinate::new(scope(), node, &["follows"]);

    // Seed two extra shards directly through the substrate.
    store
        .create_shard_if_absent(&coord, Version::new(1_000, 0), 900)
        .unwrap();
    store
        .create_shard_if_absent(&coord, Version::new(2_000, 0), 1_900)
        .unwrap();

    let mut prev = 0u64;
    for ts in (0..3_000).step_by(97) {
        let selector = cache
            .get_slice(&scope(), node, Version::new(ts, 0), &["follows"])
            .unwrap();
        assert!(
            selector >= prev,
            "selector regressed from {} to {} at ts {}",
            prev,
            selector,
            ts
        );
        prev = selector;
    }
}

/// get_versions crosses shard boundaries invisibly: strictly descending,
/// bounded above, no duplicates.
#[test]
fn get_versions_spans_shards_descending() {
    let (store, cache) = cache_with(1_000_000, 50);
    let node = NodeId::from_name("node");
    let coord = Coordinate::new(scope(), node, &["likes"]);
    let other = NodeId::from_name("target");

    store
        .create_shard_if_absent(&coord, Version::new(500, 0), 400)
        .unwrap();
    for ts in (100..1_000).step_by(100) {
        store.insert_edge(&coord, other, Version::new(ts, 0));
    }

    let versions: Vec<Version> = cache
        .get_versions(&scope(), node, Version::new(850, 0), &["likes"])
        .unwrap()
        .map(|r| r.unwrap())
        .collect();

    let stamps: Vec<u64> = versions.iter().map(|v| v.timestamp_ms).collect();
    assert_eq!(stamps, vec![800, 700, 600, 500, 400, 300, 200, 100]);

    // Strictly descending (which also implies no duplicates).
    for pair in versions.windows(2) {
        assert!(pair[0] > pair[1]);
    }
}

/// The cache never reports "no shard" on substrate failure, and recovers
/// read-through once the substrate is back.
#[test]
fn substrate_outage_surfaces_and_recovers() {
    let (store, cache) = cache_with(1_000, 50);
    let node = NodeId::from_name("node");

    store.set_fail_reads(true);
    let err = cache
        .get_slice(&scope(), node, Version::new(1, 0), &["likes"])
        .unwrap_err();
    assert_eq!(err.code(), "CACHE_UNAVAILABLE");

    store.set_fail_reads(false);
    assert_eq!(
        cache
            .get_slice(&scope(), node, Version::new(1, 0), &["likes"])
            .unwrap(),
        0
    );
}

/// Counters are per (coordinate, shard): an unrelated coordinate crossing
/// its threshold never allocates for a neighbor.
#[test]
fn counters_are_scoped_per_coordinate() {
    let (store, cache) = cache_with(100, 50);
    let hot = NodeId::from_name("hot");
    let cold = NodeId::from_name("cold");

    cache.increment(&scope(), hot, 0, 100, &["likes"]);

    let hot_coord = Coordinate::new(scope(), hot, &["likes"]);
    let cold_coord = Coordinate::new(scope(), cold, &["likes"]);
    assert_eq!(store.allocated_shard_count(&hot_coord), 1);
    assert_eq!(store.allocated_shard_count(&cold_coord), 0);

    // Same node, different edge type: separate coordinate, separate count.
    cache.increment(&scope(), hot, 0, 99, &["follows"]);
    let follows_coord = Coordinate::new(scope(), hot, &["follows"]);
    assert_eq!(store.allocated_shard_count(&follows_coord), 0);
}

/// Concurrent increments from many writers converge on one allocation.
#[test]
fn concurrent_increments_allocate_once() {
    let (store, cache) = cache_with(1_000, 50);
    let cache = Arc::new(cache);
    let node = NodeId::from_name("contested");

    let mut handles = vec![];
    for _ in 0..8 {
        let cache = Arc::clone(&cache);
        handles.push(std::thread::spawn(move || {
            for _ in 0..50 {
                cache.increment(&ScopeKey::new("acme", "app1"), node, 0, 10, &["likes"]);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // 8 * 50 * 10 = 4000 observed writes, threshold 1000: the audit fires
    // on several writers, but racing audits converge on one new shard;
    // once it exists, the original shard is sealed and stops triggering.
    let coord = Coordinate::new(ScopeKey::new("acme", "app1"), node, &["likes"]);
    assert_eq!(store.allocated_shard_count(&coord), 1);
}
