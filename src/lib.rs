//! Sharded graph edge persistence with a streaming query pipeline.
//!
//! Two cooperating halves:
//!
//! - The **shard cache** ([`shard::NodeShardCache`]) maps a logical
//!   (scope, node, edge type, version) coordinate to the physical shard
//!   holding data there, tracks approximate per-shard write volume, and
//!   cuts new shards far enough in the future that skewed writer clocks
//!   cannot misroute in-flight writes.
//! - The **pipeline** ([`pipeline`]) resolves graph traversals into
//!   entity results: per-id fetch loops against a secondary search index
//!   or the shard cache, merged into one backpressure-aware stream of
//!   pages, each carrying an opaque resume cursor.
//!
//! The storage substrate ([`store::ShardStore`]) and the search index
//! ([`index::SearchIndex`]) are external collaborators; in-memory
//! implementations ship for tests and ephemeral use.

pub mod config;
pub mod error;
pub mod index;
pub mod metrics;
pub mod pipeline;
pub mod shard;
pub mod store;
pub mod types;

pub use config::{CacheConfig, PipelineConfig};
pub use error::{GraphError, Result};
pub use index::{Candidate, MemorySearchIndex, SearchEdge, SearchIndex};
pub use metrics::{Metrics, MetricsSnapshot, QueryOp};
pub use pipeline::{
    CandidatePage, Cursor, CursorCodec, EdgeCursorCodec, EdgePage, EdgeScanFilter, Filter,
    Page, PipelineContext, PipelineExecutor, ResponsePage, SearchCursorCodec, SearchFilter,
};
pub use shard::{NodeShardCache, Shard, ShardAllocator, ShardGroup, VersionIter};
pub use store::{MemoryShardStore, ShardStore, StoredEdge};
pub use types::{Coordinate, NodeId, ScopeKey, Version, VersionFactory};
