//! Shuffle-shard selection
//!
//! Deterministic assignment of a tenant to a fixed subset of virtual shards.
//! Hashing the tenant key with a stable 64-bit hash and drawing from a seeded
//! generator means the same `(n, m, key)` always maps to the same shards, so
//! a noisy tenant can only ever affect its own M-of-N slice of the queue.

use rand::SeedableRng;
use rand::rngs::SmallRng;
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

/// Error returned when shard counts are out of range.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShardError {
    /// `m` must satisfy `1 <= m <= n`.
    #[error("invalid shard counts: want 1 <= {m} <= {n}")]
    InvalidShardCounts {
        /// Total number of virtual shards.
        n: u32,
        /// Requested shuffle-shard width.
        m: u32,
    },
}

/// Select `m` distinct shard indices out of `[0, n)` for a tenant key.
///
/// The selection is a pure function of `(n, m, key)`: the key is hashed with
/// XXH3 and the hash seeds the permutation draw. Re-running with the same
/// inputs always yields the same sequence, independent of wall time.
///
/// # Errors
///
/// Returns [`ShardError::InvalidShardCounts`] unless `1 <= m <= n`.
pub fn select(n: u32, m: u32, key: &[u8]) -> Result<Vec<u32>, ShardError> {
    if m < 1 || m > n {
        return Err(ShardError::InvalidShardCounts { n, m });
    }

    let mut rng = SmallRng::seed_from_u64(xxh3_64(key));
    let picked = rand::seq::index::sample(&mut rng, n as usize, m as usize);

    #[allow(clippy::cast_possible_truncation)]
    let indices = picked.into_iter().map(|i| i as u32).collect();
    Ok(indices)
}
