//! Pipeline filter capability interface and shared stage machinery.
//!
//! A filter turns a stream of upstream values into a stream of downstream
//! values. Streams are bounded mpsc channels: the bound is the
//! backpressure contract (a producer blocks on send until downstream
//! drains) and a dropped receiver is the cancellation signal (the next
//! send fails, stopping the producer before its next fetch).
//!
//! Each upstream element runs its own producer; all producers merge into
//! one output channel. Merge order across elements is unspecified, but
//! pages for a single element arrive in order, gap-free, and terminate
//! exactly once. The first error is terminal for the whole stream: there
//! is no per-element error isolation at this layer; retry belongs to the
//! caller, by resubscribing with the last emitted cursor.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::pipeline::cursor::{Cursor, CursorCodec};
use crate::types::ScopeKey;

// ── Pipeline Context ───────────────────────────────────────────────

/// Request-scoped state shared by every stage of one pipeline execution.
#[derive(Clone)]
pub struct PipelineContext {
    pub scope: ScopeKey,
    /// Page size for index queries and response assembly.
    pub limit: usize,
    /// Resume cursor supplied by the caller, if any. Stage-scoped: a
    /// stage decodes it with its own codec and rejects foreign tokens.
    pub cursor: Option<Cursor>,
    pub config: PipelineConfig,
    pub metrics: Arc<Metrics>,
}

impl PipelineContext {
    pub fn new(scope: ScopeKey, limit: usize) -> Self {
        Self {
            scope,
            limit,
            cursor: None,
            config: PipelineConfig::default(),
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn with_cursor(mut self, cursor: Option<Cursor>) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }
}

// ── Filter Interface ───────────────────────────────────────────────

/// One pipeline stage: the sole operational entry point is `call`.
pub trait Filter: Send + Sync {
    type In: Send + 'static;
    type Out: Send + 'static;

    fn call(
        &self,
        ctx: Arc<PipelineContext>,
        input: mpsc::Receiver<Result<Self::In>>,
    ) -> mpsc::Receiver<Result<Self::Out>>;
}

// ── Emitted Pages ──────────────────────────────────────────────────

/// A batch emitted downstream by a paginating stage.
pub trait Page: Send {
    type Item: Send;

    /// The final (empty) page of an element's branch: emitted exactly
    /// once, last, as that branch's end-of-stream signal.
    fn is_final(&self) -> bool;

    /// Resume cursor positioned after this page.
    fn cursor(&self) -> &Cursor;

    fn into_items(self) -> Vec<Self::Item>;
}

// ── Shared Stage Machinery ─────────────────────────────────────────

/// Decode the request cursor for a stage, before any query is issued.
/// Absent cursor means "start from the beginning"; a malformed or
/// foreign-stage token is a caller error with no partial side effects.
pub fn resume_seek<C: CursorCodec>(
    ctx: &PipelineContext,
    codec: &C,
) -> Result<Option<C::Seek>> {
    match &ctx.cursor {
        Some(cursor) => codec.decode(cursor).map(Some),
        None => Ok(None),
    }
}

/// Output channel that carries a single terminal error. Used when a stage
/// rejects its input (bad cursor) before starting any producer.
pub(crate) fn reject<Out: Send + 'static>(
    capacity: usize,
    err: crate::error::GraphError,
) -> mpsc::Receiver<Result<Out>> {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    tokio::spawn(async move {
        let _ = tx.send(Err(err)).await;
    });
    rx
}

/// Fan upstream elements out to one producer each and merge their output.
///
/// `make_producer` builds the per-element future; it receives the shared
/// failure flag and must honor it between fetches. An upstream error is
/// forwarded downstream and stops the intake loop; producers already
/// running finish on their own (seeing the flag or a closed channel).
pub(crate) fn fan_out<In, Out, F, Fut>(
    capacity: usize,
    mut input: mpsc::Receiver<Result<In>>,
    make_producer: F,
) -> mpsc::Receiver<Result<Out>>
where
    In: Send + 'static,
    Out: Send + 'static,
    F: Fn(In, mpsc::Sender<Result<Out>>, Arc<AtomicBool>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    tokio::spawn(async move {
        let failed = Arc::new(AtomicBool::new(false));
        let mut producers = JoinSet::new();

        while let Some(item) = input.recv().await {
            match item {
                Ok(value) => {
                    if failed.load(Ordering::SeqCst) {
                        break;
                    }
                    producers.spawn(make_producer(value, tx.clone(), Arc::clone(&failed)));
                }
                Err(err) => {
                    failed.store(true, Ordering::SeqCst);
                    let _ = tx.send(Err(err)).await;
                    break;
                }
            }
        }

        drop(tx);
        while producers.join_next().await.is_some() {}
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GraphError;
    use crate::pipeline::cursor::SearchCursorCodec;

    #[test]
    fn test_resume_seek_defaults_to_none() {
        let ctx = PipelineContext::new(ScopeKey::new("acme", "app1"), 10);
        let seek = resume_seek(&ctx, &SearchCursorCodec).unwrap();
        assert_eq!(seek, None);
    }

    #[test]
    fn test_resume_seek_decodes_own_stage() {
        let cursor = SearchCursorCodec.encode(&42).unwrap();
        let ctx =
            PipelineContext::new(ScopeKey::new("acme", "app1"), 10).with_cursor(Some(cursor));
        let seek = resume_seek(&ctx, &SearchCursorCodec).unwrap();
        assert_eq!(seek, Some(42));
    }

    #[tokio::test]
    async fn test_reject_emits_single_terminal_error() {
        let mut rx: mpsc::Receiver<Result<u32>> =
            reject(4, GraphError::InvalidCursor("boom".into()));
        let first = rx.recv().await.unwrap();
        assert_eq!(first.unwrap_err().code(), "INVALID_CURSOR");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_fan_out_merges_producers_and_closes() {
        let (in_tx, in_rx) = mpsc::channel(4);
        let mut rx = fan_out(4, in_rx, |value: u32, tx, _failed| async move {
            let _ = tx.send(Ok(value * 10)).await;
        });

        in_tx.send(Ok(1)).await.unwrap();
        in_tx.send(Ok(2)).await.unwrap();
        drop(in_tx);

        let mut got = vec![];
        while let Some(item) = rx.recv().await {
            got.push(item.unwrap());
        }
        got.sort();
        assert_eq!(got, vec![10, 20]);
    }

    #[tokio::test]
    async fn test_fan_out_forwards_upstream_error() {
        let (in_tx, in_rx) = mpsc::channel(4);
        let mut rx = fan_out(4, in_rx, |value: u32, tx, _failed| async move {
            let _ = tx.send(Ok(value)).await;
        });

        in_tx
            .send(Err(GraphError::QueryFailure("upstream died".into())))
            .await
            .unwrap();
        drop(in_tx);

        let only = rx.recv().await.unwrap();
        assert_eq!(only.unwrap_err().code(), "QUERY_FAILURE");
        assert!(rx.recv().await.is_none());
    }
}
