//! Async streaming and caching client for sharded 3D asset datasets.
//!
//! This crate streams manifests and binary mesh blobs from a remote origin
//! into a client process with strict resource limits: a priority-lane
//! concurrency-limited fetch scheduler, an in-flight request deduplicator,
//! an optional durable byte cache, a lazily loaded sharded manifest index,
//! and a byte-budgeted LRU cache of uploaded resource handles.
//!
//! # Design principles
//!
//! - **Runtime-agnostic**: every operation is an `async fn`; any executor
//!   works
//! - **Caching is optional**: the durable layer is a performance
//!   optimization and every failure in it degrades to a network fetch
//! - **No retries**: failures propagate to the caller; retry policy
//!   belongs to the rendering/UI layer
//!
//! # Example
//!
//! ```ignore
//! use assetflow::{
//!     AssetFetcher, FsByteCache, ManifestShardIndex, Priority, PriorityScheduler,
//!     ShardIndexDescriptor, StreamingConfig,
//! };
//! use std::sync::Arc;
//!
//! let config = StreamingConfig::default();
//! let scheduler = PriorityScheduler::new(config.concurrency, config.high_share);
//! let cache = FsByteCache::new("cache", &config.cache_version);
//! let fetcher = Arc::new(
//!     AssetFetcher::with_cache(scheduler, cache).with_base_url("https://assets.example/tree/"),
//! );
//!
//! let descriptor: ShardIndexDescriptor =
//!     fetcher.fetch_json("manifest-index.json", Priority::High).await?;
//! let index = ManifestShardIndex::new(Arc::clone(&fetcher), descriptor)?;
//! index.prefetch(assetflow::ArchetypeId::normalize("0x2a"), Priority::High).await;
//! ```

pub mod blob;
pub mod cache;
pub mod config;
pub mod dedupe;
mod error;
pub mod fetch;
pub mod identity;
pub mod manifest;
pub mod resource_cache;
pub mod scheduler;

pub use blob::{BLOB_HEADER_LEN, BLOB_MAGIC, BlobHeader};
pub use cache::{ByteCache, FsByteCache, MemoryByteCache, NoCache, is_cacheable};
pub use config::StreamingConfig;
pub use dedupe::InflightRegistry;
pub use error::{Error, Result};
pub use fetch::AssetFetcher;
pub use identity::ArchetypeId;
pub use manifest::{
    LOD_FALLBACK, LodEntry, Manifest, ManifestEntry, ManifestShardIndex, SHARD_INDEX_SCHEMA,
    ShardIndexDescriptor, Submesh,
};
pub use resource_cache::{DisposeFn, MeshResourceCache};
pub use scheduler::{Priority, PriorityScheduler};
