//! Fairshard
//!
//! Redis-backed coordination primitives for high-throughput services:
//! - **Streams queue**: tenant-isolated fair FIFO over N virtual shards,
//!   shuffle-sharded writes, round-robin reads with wake notifications,
//!   optional message tracking and cancellation
//! - **Rate limiter**: token bucket in a single hash, multi-token grants
//!   applied by one atomic script, lazy bucket creation
//! - **Cache**: typed serve-stale store with fresh/stale/negative states and
//!   stampede protection behind a distributed lock
//! - **Distributed lock**: set-if-absent with owner-checked release, single-
//!   or multi-endpoint
//!
//! Every multi-step mutation runs as one server-side script, so the
//! primitives stay correct under concurrent callers and partial failure.
//! All clients share one [`redis::aio::ConnectionManager`] handle and are
//! cheap to clone.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use fairshard::{Queue, QueueConfig, ReadArgs, WriteArgs};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let queue = Queue::connect("redis://127.0.0.1:6379", QueueConfig::default()).await?;
//!
//!     // Writes from one tenant land on the shortest of its shuffle shards.
//!     let receipt = queue
//!         .write(&WriteArgs {
//!             name: "predictions".into(),
//!             values: vec![("id".into(), "pred-abc".into())],
//!             streams: 8,
//!             streams_per_shard: 2,
//!             shard_key: b"tenant-1".to_vec(),
//!             deadline: None,
//!         })
//!         .await?;
//!     println!("wrote {} to shard {}", receipt.id, receipt.shard);
//!
//!     // Reads round-robin the shards for cross-tenant fairness.
//!     let message = queue
//!         .read(&ReadArgs {
//!             name: "predictions".into(),
//!             group: "workers".into(),
//!             consumer: "worker-1".into(),
//!             block: Some(std::time::Duration::from_secs(5)),
//!             prefer_stream: None,
//!         })
//!         .await?;
//!     println!("read {} from {}", message.id, message.stream);
//!
//!     Ok(())
//! }
//! ```
//!
//! # Guarantees, briefly
//!
//! Within one shard, deliveries follow append order; across shards there is
//! fairness (one message per shard per cycle), not ordering. The lock is an
//! efficiency primitive, not consensus: a lost lock is acceptable. The cache
//! degrades to direct fetches on driver errors instead of amplifying them.
//! Queue keys carry a TTL renewed on every write; nothing here is long-term
//! storage.

pub mod cache;
pub mod limiter;
pub mod lock;
pub mod queue;
pub mod shard;
pub mod util;

pub use cache::{Cache, CacheConfig, CacheError};
pub use limiter::{LimiterError, RateLimiter, Take};
pub use lock::{LockClient, LockError, LockGuard, MultiLock, MultiLockGuard};
pub use queue::{
    CancelationEntry, GcOutcome, Message, Queue, QueueConfig, QueueError, QueueStats, ReadArgs,
    TrackingConfig, WriteArgs, WriteReceipt,
};
pub use shard::{ShardError, select};
