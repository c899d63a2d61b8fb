//! Request-scoped pipeline execution.
//!
//! The executor owns the context for one request (scope, limit, cursor),
//! seeds the source channel, runs filter stages, and folds the terminal
//! stage's pages into a single response page the caller can return, with
//! the cursor of the last emitted page for resumption.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::Result;
use crate::pipeline::cursor::Cursor;
use crate::pipeline::filter::{Filter, Page, PipelineContext};

// ── Response Page ──────────────────────────────────────────────────

/// What one request returns: collected items plus the token that resumes
/// where this response left off. `cursor` is None when no stage emitted
/// a page (e.g. the request had no input ids).
#[derive(Debug, Clone)]
pub struct ResponsePage<T> {
    pub items: Vec<T>,
    pub cursor: Option<Cursor>,
}

// ── Pipeline Executor ──────────────────────────────────────────────

/// Chains filters under one request-scoped context.
pub struct PipelineExecutor {
    ctx: Arc<PipelineContext>,
}

impl PipelineExecutor {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    pub fn context(&self) -> Arc<PipelineContext> {
        Arc::clone(&self.ctx)
    }

    /// Seed a source channel from a fixed id list.
    pub fn source<T: Send + 'static>(&self, items: Vec<T>) -> mpsc::Receiver<Result<T>> {
        let (tx, rx) = mpsc::channel(self.ctx.config.channel_capacity.max(1));
        tokio::spawn(async move {
            for item in items {
                if tx.send(Ok(item)).await.is_err() {
                    return;
                }
            }
        });
        rx
    }

    /// Run one filter stage under this executor's context.
    pub fn run<F: Filter>(
        &self,
        filter: &F,
        input: mpsc::Receiver<Result<F::In>>,
    ) -> mpsc::Receiver<Result<F::Out>> {
        filter.call(self.context(), input)
    }

    /// Drain a stage's output into one response page.
    ///
    /// Stops pulling once `limit` items are collected (dropping the
    /// stream cancels upstream producers before their next fetch). A
    /// terminal stream error is returned as-is; pages already emitted in
    /// earlier responses remain valid and resumable via their cursors.
    pub async fn collect_page<P: Page>(
        &self,
        mut output: mpsc::Receiver<Result<P>>,
    ) -> Result<ResponsePage<P::Item>> {
        let mut items = Vec::new();
        let mut cursor = None;

        while let Some(page) = output.recv().await {
            let page = page?;
            cursor = Some(page.cursor().clone());
            items.extend(page.into_items());
            if items.len() >= self.ctx.limit {
                break;
            }
        }

        Ok(ResponsePage { items, cursor })
    }

    /// Convenience: run a single-stage pipeline over a fixed id list and
    /// collect the response.
    pub async fn execute_page<F>(
        &self,
        filter: &F,
        ids: Vec<F::In>,
    ) -> Result<ResponsePage<<F::Out as Page>::Item>>
    where
        F: Filter,
        F::Out: Page,
    {
        let source = self.source(ids);
        let output = self.run(filter, source);
        self.collect_page(output).await
    }
}
