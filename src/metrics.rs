//! Query timing metrics for the shard cache and pipeline.
//!
//! Lightweight, thread-safe collection around every index and shard-cache
//! query: a timer is started before the query and recorded after it
//! resolves. Recording is infallible and lock-free on the hot path, so a
//! metrics problem can never affect a query's outcome.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Queries slower than this are retained for reporting.
pub const SLOW_QUERY_THRESHOLD_MS: u64 = 100;

/// Maximum number of slow queries to retain.
const MAX_SLOW_QUERIES: usize = 10;

/// Operations measured by this collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOp {
    /// Secondary-index search issued by a search filter.
    IndexSearch,
    /// Version scan through the shard cache issued by an edge filter.
    EdgeScan,
    /// Shard group read-through against the substrate.
    CacheRead,
    /// Shard allocation round-trip against the substrate.
    ShardAllocate,
}

impl QueryOp {
    pub fn name(&self) -> &'static str {
        match self {
            QueryOp::IndexSearch => "IndexSearch",
            QueryOp::EdgeScan => "EdgeScan",
            QueryOp::CacheRead => "CacheRead",
            QueryOp::ShardAllocate => "ShardAllocate",
        }
    }
}

/// Running totals for one operation type.
#[derive(Default)]
struct OpCell {
    count: AtomicU64,
    latency_sum_ms: AtomicU64,
    latency_max_ms: AtomicU64,
}

impl OpCell {
    fn record(&self, duration_ms: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_ms.fetch_add(duration_ms, Ordering::Relaxed);
        self.latency_max_ms.fetch_max(duration_ms, Ordering::Relaxed);
    }
}

/// A started timer handle. Created by [`Metrics::start_timer`] and consumed
/// by [`Metrics::record`] once the wrapped query resolves.
pub struct QueryTimer {
    op: QueryOp,
    started: Instant,
}

/// A recorded slow query.
#[derive(Clone, Debug, PartialEq)]
pub struct SlowQuery {
    pub operation: String,
    pub duration_ms: u64,
}

/// Thread-safe metrics collector. One instance per cache/pipeline setup,
/// shared via `Arc`.
pub struct Metrics {
    index_search: OpCell,
    edge_scan: OpCell,
    cache_read: OpCell,
    shard_allocate: OpCell,

    /// Recent queries exceeding [`SLOW_QUERY_THRESHOLD_MS`].
    slow_queries: Mutex<VecDeque<SlowQuery>>,
}

/// Point-in-time stats for one operation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OpStats {
    pub count: u64,
    pub avg_ms: u64,
    pub max_ms: u64,
}

/// Point-in-time copy of all metrics.
#[derive(Clone, Debug, Default)]
pub struct MetricsSnapshot {
    pub index_search: OpStats,
    pub edge_scan: OpStats,
    pub cache_read: OpStats,
    pub shard_allocate: OpStats,
    pub slow_queries: Vec<SlowQuery>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            index_search: OpCell::default(),
            edge_scan: OpCell::default(),
            cache_read: OpCell::default(),
            shard_allocate: OpCell::default(),
            slow_queries: Mutex::new(VecDeque::with_capacity(MAX_SLOW_QUERIES)),
        }
    }

    /// Start timing a query.
    pub fn start_timer(&self, op: QueryOp) -> QueryTimer {
        QueryTimer {
            op,
            started: Instant::now(),
        }
    }

    /// Record a finished timer. Called whether the query succeeded or
    /// failed; duration is observability, not outcome.
    pub fn record(&self, timer: QueryTimer) {
        let duration_ms = timer.started.elapsed().as_millis() as u64;
        self.cell(timer.op).record(duration_ms);

        if duration_ms >= SLOW_QUERY_THRESHOLD_MS {
            let mut slow = match self.slow_queries.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if slow.len() >= MAX_SLOW_QUERIES {
                slow.pop_front();
            }
            slow.push_back(SlowQuery {
                operation: timer.op.name().to_string(),
                duration_ms,
            });
        }
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let slow_queries = {
            let slow = match self.slow_queries.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            slow.iter().cloned().collect()
        };
        MetricsSnapshot {
            index_search: Self::stats(&self.index_search),
            edge_scan: Self::stats(&self.edge_scan),
            cache_read: Self::stats(&self.cache_read),
            shard_allocate: Self::stats(&self.shard_allocate),
            slow_queries,
        }
    }

    fn cell(&self, op: QueryOp) -> &OpCell {
        match op {
            QueryOp::IndexSearch => &self.index_search,
            QueryOp::EdgeScan => &self.edge_scan,
            QueryOp::CacheRead => &self.cache_read,
            QueryOp::ShardAllocate => &self.shard_allocate,
        }
    }

    fn stats(cell: &OpCell) -> OpStats {
        let count = cell.count.load(Ordering::Relaxed);
        let sum = cell.latency_sum_ms.load(Ordering::Relaxed);
        OpStats {
            count,
            avg_ms: if count > 0 { sum / count } else { 0 },
            max_ms: cell.latency_max_ms.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_empty_snapshot() {
        let m = Metrics::new();
        let snap = m.snapshot();
        assert_eq!(snap.index_search, OpStats::default());
        assert_eq!(snap.cache_read, OpStats::default());
        assert!(snap.slow_queries.is_empty());
    }

    #[test]
    fn test_timer_records_per_op() {
        let m = Metrics::new();
        m.record(m.start_timer(QueryOp::IndexSearch));
        m.record(m.start_timer(QueryOp::IndexSearch));
        m.record(m.start_timer(QueryOp::EdgeScan));

        let snap = m.snapshot();
        assert_eq!(snap.index_search.count, 2);
        assert_eq!(snap.edge_scan.count, 1);
        assert_eq!(snap.cache_read.count, 0);
    }

    #[test]
    fn test_slow_query_window_bounded() {
        let m = Metrics::new();
        for i in 0..15u64 {
            // Inject synthetic slow timers by backdating the start.
            let timer = QueryTimer {
                op: QueryOp::IndexSearch,
                started: Instant::now()
                    - std::time::Duration::from_millis(SLOW_QUERY_THRESHOLD_MS + i),
            };
            m.record(timer);
        }
        let snap = m.snapshot();
        assert_eq!(snap.slow_queries.len(), MAX_SLOW_QUERIES);
        assert!(snap
            .slow_queries
            .iter()
            .all(|q| q.operation == "IndexSearch"));
    }

    #[test]
    fn test_thread_safety() {
        let m = Arc::new(Metrics::new());
        let mut handles = vec![];
        for _ in 0..8 {
            let m = Arc::clone(&m);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    m.record(m.start_timer(QueryOp::CacheRead));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.snapshot().cache_read.count, 800);
    }
}
