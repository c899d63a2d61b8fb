//! Graph-edge pipeline stage.
//!
//! Same state machine as the search stage, but the data source is the
//! shard cache: each incoming node id is scanned for edge versions in
//! descending order across however many shards cover the coordinate. The
//! seek state is a version, not an offset: the resume cursor carries the
//! last yielded version, and a resumed scan skips that version itself.
//!
//! Substrate scans run inline on the producer task between page
//! emissions; the page boundary (a bounded send) is the suspension and
//! backpressure point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::error;

use crate::error::Result;
use crate::pipeline::cursor::{Cursor, CursorCodec, EdgeCursorCodec};
use crate::pipeline::filter::{fan_out, reject, resume_seek, Filter, Page, PipelineContext};
use crate::shard::cache::NodeShardCache;
use crate::types::{NodeId, ScopeKey, Version};

/// Upper scan bound when no cursor is supplied. Kept inside the signed
/// wire range so every minted cursor round-trips.
const SCAN_CEILING: Version = Version {
    timestamp_ms: i64::MAX as u64,
    seq: i64::MAX as u64,
};

// ── Edge Page ──────────────────────────────────────────────────────

/// One page of edge versions for one upstream id, newest first, plus the
/// cursor that resumes strictly below it.
#[derive(Debug, Clone)]
pub struct EdgePage {
    pub source: NodeId,
    pub versions: Vec<Version>,
    pub cursor: Cursor,
}

impl Page for EdgePage {
    type Item = Version;

    fn is_final(&self) -> bool {
        self.versions.is_empty()
    }

    fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    fn into_items(self) -> Vec<Version> {
        self.versions
    }
}

// ── Edge Scan Filter ───────────────────────────────────────────────

/// Pipeline stage reading graph edges through the shard cache.
pub struct EdgeScanFilter {
    cache: Arc<NodeShardCache>,
    edge_types: Vec<String>,
}

impl EdgeScanFilter {
    pub fn new(cache: Arc<NodeShardCache>, edge_types: &[&str]) -> Self {
        Self {
            cache,
            edge_types: edge_types.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Filter for EdgeScanFilter {
    type In = NodeId;
    type Out = EdgePage;

    fn call(
        &self,
        ctx: Arc<PipelineContext>,
        input: mpsc::Receiver<Result<NodeId>>,
    ) -> mpsc::Receiver<Result<EdgePage>> {
        let capacity = ctx.config.channel_capacity;

        let seek = match resume_seek(ctx.as_ref(), &EdgeCursorCodec) {
            Ok(seek) => seek,
            Err(err) => return reject(capacity, err),
        };

        let cache = Arc::clone(&self.cache);
        let edge_types = self.edge_types.clone();
        let scope = ctx.scope.clone();
        let limit = ctx.limit;

        fan_out(capacity, input, move |id, tx, failed| {
            scan_loop(
                Arc::clone(&cache),
                scope.clone(),
                edge_types.clone(),
                id,
                seek,
                limit,
                failed,
                tx,
            )
        })
    }
}

/// Per-id scan loop over the shard cache's descending version stream.
#[allow(clippy::too_many_arguments)]
async fn scan_loop(
    cache: Arc<NodeShardCache>,
    scope: ScopeKey,
    edge_types: Vec<String>,
    id: NodeId,
    seek: Option<Version>,
    limit: usize,
    failed: Arc<AtomicBool>,
    tx: mpsc::Sender<Result<EdgePage>>,
) {
    let max = seek.unwrap_or(SCAN_CEILING);
    let types: Vec<&str> = edge_types.iter().map(String::as_str).collect();

    let mut iter = match cache.get_versions(&scope, id, max, &types) {
        Ok(iter) => iter,
        Err(err) => {
            error!(node = %id, error = %err, "edge scan could not start");
            failed.store(true, Ordering::SeqCst);
            let _ = tx.send(Err(err)).await;
            return;
        }
    };

    // The scan bound is inclusive; on resume the cursor's own version is
    // re-yielded first and must be dropped.
    let mut skip_resume_point = seek;
    let mut resume_at = max;

    loop {
        if failed.load(Ordering::SeqCst) {
            return;
        }

        let mut versions = Vec::with_capacity(limit.max(1));
        let mut failure = None;
        while versions.len() < limit.max(1) {
            match iter.next() {
                Some(Ok(version)) => {
                    if skip_resume_point.take() == Some(version) {
                        continue;
                    }
                    versions.push(version);
                }
                Some(Err(err)) => {
                    failure = Some(err);
                    break;
                }
                None => break,
            }
        }

        if let Some(err) = failure {
            error!(
                node = %id,
                resume_at = %resume_at,
                error = %err,
                "edge scan failed"
            );
            failed.store(true, Ordering::SeqCst);
            let _ = tx.send(Err(err)).await;
            return;
        }

        if let Some(last) = versions.last() {
            resume_at = *last;
        }
        let cursor = match EdgeCursorCodec.encode(&resume_at) {
            Ok(cursor) => cursor,
            Err(err) => {
                failed.store(true, Ordering::SeqCst);
                let _ = tx.send(Err(err)).await;
                return;
            }
        };

        let done = versions.is_empty();
        let page = EdgePage {
            source: id,
            versions,
            cursor,
        };
        if tx.send(Ok(page)).await.is_err() {
            return; // downstream unsubscribed
        }
        if done {
            return;
        }
    }
}
