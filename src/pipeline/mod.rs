//! Streaming query pipeline: filters that turn a stream of node ids into
//! a stream of paginated, cursor-resumable result batches.

pub mod cursor;
pub mod edges;
pub mod executor;
pub mod filter;
pub mod search;

pub use cursor::{Cursor, CursorCodec, EdgeCursorCodec, SearchCursorCodec};
pub use edges::{EdgePage, EdgeScanFilter};
pub use executor::{PipelineExecutor, ResponsePage};
pub use filter::{Filter, Page, PipelineContext};
pub use search::{CandidatePage, SearchFilter};
