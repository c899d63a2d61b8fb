//! Shard routing: data entities, allocation policy, and the node shard
//! cache that ties them to the storage substrate.

pub mod allocator;
pub mod cache;
pub mod group;

pub use allocator::ShardAllocator;
pub use cache::{NodeShardCache, VersionIter};
pub use group::{Shard, ShardGroup};
