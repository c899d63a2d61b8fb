//! Index-search pipeline stage.
//!
//! For each incoming node id, derives a search edge and pages through the
//! secondary index: fetch, emit, advance the offset, mint the resume
//! cursor, repeat until an empty page. Each id's fetch loop is sequential
//! (no read-ahead past the downstream bound); different ids run
//! concurrently and merge into one output stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::error;

use crate::error::{GraphError, Result};
use crate::index::{Candidate, SearchEdge, SearchIndex};
use crate::metrics::{Metrics, QueryOp};
use crate::pipeline::cursor::{Cursor, CursorCodec, SearchCursorCodec};
use crate::pipeline::filter::{fan_out, reject, resume_seek, Filter, Page, PipelineContext};
use crate::types::NodeId;

// ── Candidate Page ─────────────────────────────────────────────────

/// One page of index results for one upstream id, plus the cursor that
/// resumes immediately after it.
#[derive(Debug, Clone)]
pub struct CandidatePage {
    /// The upstream id this page belongs to.
    pub source: NodeId,
    /// Offset of the first candidate in this page.
    pub offset: usize,
    pub candidates: Vec<Candidate>,
    pub cursor: Cursor,
}

impl Page for CandidatePage {
    type Item = Candidate;

    fn is_final(&self) -> bool {
        self.candidates.is_empty()
    }

    fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    fn into_items(self) -> Vec<Candidate> {
        self.candidates
    }
}

// ── Search Filter ──────────────────────────────────────────────────

/// Pipeline stage querying the secondary index per incoming id.
pub struct SearchFilter {
    index: Arc<dyn SearchIndex>,
    /// Relation category searched under; combined with the request scope
    /// and the incoming id to form the search edge.
    edge_type: String,
    /// Query expression, opaque to this crate.
    query: String,
}

impl SearchFilter {
    pub fn new(index: Arc<dyn SearchIndex>, edge_type: &str, query: &str) -> Self {
        Self {
            index,
            edge_type: edge_type.to_string(),
            query: query.to_string(),
        }
    }
}

impl Filter for SearchFilter {
    type In = NodeId;
    type Out = CandidatePage;

    fn call(
        &self,
        ctx: Arc<PipelineContext>,
        input: mpsc::Receiver<Result<NodeId>>,
    ) -> mpsc::Receiver<Result<CandidatePage>> {
        let capacity = ctx.config.channel_capacity;

        // Seek before any query: a bad cursor is a caller error and must
        // reject with no side effects.
        let start_offset = match resume_seek(ctx.as_ref(), &SearchCursorCodec) {
            Ok(seek) => seek.unwrap_or(0),
            Err(err) => return reject(capacity, err),
        };

        let index = Arc::clone(&self.index);
        let edge_type = self.edge_type.clone();
        let query = self.query.clone();
        let scope = ctx.scope.clone();
        let limit = ctx.limit;
        let timeout = ctx.config.query_timeout();
        let metrics = Arc::clone(&ctx.metrics);

        fan_out(capacity, input, move |id, tx, failed| {
            let edge = SearchEdge {
                scope: scope.clone(),
                node: id,
                edge_type: edge_type.clone(),
            };
            fetch_loop(
                Arc::clone(&index),
                edge,
                query.clone(),
                limit,
                start_offset,
                timeout,
                Arc::clone(&metrics),
                failed,
                tx,
            )
        })
    }
}

/// The per-id fetch loop: Seeking -> Fetching -> Emitting until the empty
/// page (Completed) or an unrecoverable error (Failed, terminal for the
/// whole stream).
#[allow(clippy::too_many_arguments)]
async fn fetch_loop(
    index: Arc<dyn SearchIndex>,
    edge: SearchEdge,
    query: String,
    limit: usize,
    start_offset: usize,
    timeout: Duration,
    metrics: Arc<Metrics>,
    failed: Arc<AtomicBool>,
    tx: mpsc::Sender<Result<CandidatePage>>,
) {
    let source = edge.node;
    let mut offset = start_offset;

    loop {
        // A sibling's failure stops this loop before its next fetch.
        if failed.load(Ordering::SeqCst) {
            return;
        }

        let timer = metrics.start_timer(QueryOp::IndexSearch);
        let outcome = tokio::time::timeout(
            timeout,
            index.search(edge.clone(), query.clone(), limit, offset),
        )
        .await;
        metrics.record(timer);

        let fetched = match outcome {
            Err(_) => Err(GraphError::QueryTimeout {
                elapsed_ms: timeout.as_millis() as u64,
            }),
            Ok(Err(err)) => Err(err),
            Ok(Ok(candidates)) => Ok(candidates),
        };

        let candidates = match fetched {
            Err(err) => {
                error!(
                    node = %source,
                    edge_type = %edge.edge_type,
                    offset,
                    error = %err,
                    "candidate search failed"
                );
                failed.store(true, Ordering::SeqCst);
                let _ = tx.send(Err(err)).await;
                return;
            }
            Ok(candidates) => candidates,
        };

        let page_offset = offset;
        offset += candidates.len();

        let cursor = match SearchCursorCodec.encode(&offset) {
            Ok(cursor) => cursor,
            Err(err) => {
                failed.store(true, Ordering::SeqCst);
                let _ = tx.send(Err(err)).await;
                return;
            }
        };

        let done = candidates.is_empty();
        let page = CandidatePage {
            source,
            offset: page_offset,
            candidates,
            cursor,
        };

        // Send blocks while downstream is paused; a closed channel means
        // downstream unsubscribed, so stop without fetching again.
        if tx.send(Ok(page)).await.is_err() {
            return;
        }
        if done {
            return; // the empty page was this branch's last emission
        }
    }
}
