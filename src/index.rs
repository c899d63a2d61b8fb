//! Secondary search index interface.
//!
//! The index is an external collaborator: it executes queries and ranks
//! results. This crate only issues paginated searches against it, one
//! search edge at a time, and treats an empty page as exhaustion.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::error::{GraphError, Result};
use crate::types::{NodeId, ScopeKey};

// ── Search Edge ────────────────────────────────────────────────────

/// The coordinate handed to the index: scope plus node/edge context,
/// derived from an incoming identifier by a stage-specific rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SearchEdge {
    pub scope: ScopeKey,
    pub node: NodeId,
    pub edge_type: String,
}

// ── Candidate ──────────────────────────────────────────────────────

/// One tentative match from the index: an entity reference plus its
/// relevance token. Filtering above may still discard it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub entity: NodeId,
    pub score: f32,
}

// ── Index Interface ────────────────────────────────────────────────

/// Query execution against the secondary index.
///
/// One synchronous-per-call page at a time: `(limit, offset)` windows a
/// relevance-ordered result list, and an empty page signals exhaustion
/// for that search edge.
pub trait SearchIndex: Send + Sync + 'static {
    fn search(
        &self,
        edge: SearchEdge,
        query: String,
        limit: usize,
        offset: usize,
    ) -> BoxFuture<'_, Result<Vec<Candidate>>>;
}

// ── In-Memory Index ────────────────────────────────────────────────

/// In-memory index for tests and ephemeral deployments.
///
/// Results are seeded per (node, edge type). Failure injection covers the
/// pipeline's error paths: per-node hard failures and a global response
/// delay for timeout tests. Issued queries are counted per node.
pub struct MemorySearchIndex {
    entries: Mutex<HashMap<(NodeId, String), Vec<Candidate>>>,
    failing_nodes: Mutex<HashMap<NodeId, String>>,
    query_counts: Mutex<HashMap<NodeId, usize>>,
    delay: Mutex<Option<Duration>>,
    enabled: AtomicBool,
}

impl MemorySearchIndex {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            failing_nodes: Mutex::new(HashMap::new()),
            query_counts: Mutex::new(HashMap::new()),
            delay: Mutex::new(None),
            enabled: AtomicBool::new(true),
        }
    }

    /// Seed the full relevance-ordered result list for a search edge.
    pub fn put(&self, node: NodeId, edge_type: &str, candidates: Vec<Candidate>) {
        lock(&self.entries).insert((node, edge_type.to_string()), candidates);
    }

    /// Make every search for `node` fail with the given message.
    pub fn fail_node(&self, node: NodeId, message: &str) {
        lock(&self.failing_nodes).insert(node, message.to_string());
    }

    /// Delay every response (timeout tests).
    pub fn set_delay(&self, delay: Option<Duration>) {
        *lock(&self.delay) = delay;
    }

    /// Number of queries issued for `node` so far.
    pub fn queries_issued(&self, node: NodeId) -> usize {
        lock(&self.query_counts).get(&node).copied().unwrap_or(0)
    }

    /// Stop counting/serving (used to assert cancellation stops fetches).
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

impl Default for MemorySearchIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl SearchIndex for MemorySearchIndex {
    fn search(
        &self,
        edge: SearchEdge,
        _query: String,
        limit: usize,
        offset: usize,
    ) -> BoxFuture<'_, Result<Vec<Candidate>>> {
        Box::pin(async move {
            let delay = *lock(&self.delay);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            if !self.enabled.load(Ordering::SeqCst) {
                return Err(GraphError::QueryFailure("index disabled".to_string()));
            }

            *lock(&self.query_counts).entry(edge.node).or_insert(0) += 1;

            if let Some(message) = lock(&self.failing_nodes).get(&edge.node) {
                return Err(GraphError::QueryFailure(message.clone()));
            }

            let entries = lock(&self.entries);
            let all = entries
                .get(&(edge.node, edge.edge_type.clone()))
                .map(|v| v.as_slice())
                .unwrap_or(&[]);
            let page = all
                .iter()
                .skip(offset)
                .take(limit)
                .copied()
                .collect::<Vec<_>>();
            Ok(page)
        })
    }
}
