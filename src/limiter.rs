//! Token-bucket rate limiting
//!
//! One Redis hash per bucket, mutated by a single Lua script so refill,
//! grant, and TTL renewal are atomic with respect to concurrent callers.
//! Buckets are created lazily on first access and expire one second after
//! the point at which they would be full again, so idle keys cost nothing.
//!
//! Limits stored in the bucket (via [`RateLimiter::set_options`]) override
//! whatever a caller passes to [`RateLimiter::take`]. That ordering lets a
//! front-door check run with placeholder limits while a second stage installs
//! the real per-tenant numbers.

use std::sync::Arc;

use redis::Script;
use redis::aio::ConnectionManager;
use thiserror::Error;
use tracing::debug;

/// Tokens per second used when a fresh bucket has no stored limits and the
/// caller supplied none.
pub const DEFAULT_RATE: f64 = 50.0;

/// Bucket capacity used when a fresh bucket has no stored limits and the
/// caller supplied none.
pub const DEFAULT_CAPACITY: u64 = 3000;

/// TTL applied to a bucket by `set_options`.
const OPTIONS_TTL_SECS: u64 = 60;

/// Atomic token-bucket update.
///
/// State lives in a hash: `tokens`, `last_fill_time` (microseconds), `rate`,
/// `capacity`. Stored rate/capacity win over ARGV; ARGV of -1 means the
/// caller supplied nothing and the defaults apply. Fractional refill credit
/// survives between calls because `last_fill_time` only advances by the whole
/// tokens actually added.
///
/// Returns `{granted, remaining, reset_seconds}`.
const TAKE_SCRIPT: &str = r#"
redis.replicate_commands()

local key = KEYS[1]
local requested = tonumber(ARGV[1])
local arg_rate = tonumber(ARGV[2])
local arg_capacity = tonumber(ARGV[3])
local default_rate = tonumber(ARGV[4])
local default_capacity = tonumber(ARGV[5])

local t = redis.call('TIME')
local now = t[1] * 1000000 + t[2]

local state = redis.call('HMGET', key, 'tokens', 'last_fill_time', 'rate', 'capacity')

local rate = tonumber(state[3])
if not rate then
    if arg_rate >= 0 then rate = arg_rate else rate = default_rate end
end
local capacity = tonumber(state[4])
if not capacity then
    if arg_capacity >= 0 then capacity = arg_capacity else capacity = default_capacity end
end

local tokens = tonumber(state[1])
local last_fill = tonumber(state[2])
if not tokens then tokens = capacity end
if not last_fill then last_fill = now end

local elapsed = now - last_fill
if elapsed < 0 then elapsed = 0 end
local added = rate * elapsed / 1000000

tokens = math.floor(math.min(tokens + added, capacity))
if tokens == capacity then
    last_fill = now
else
    last_fill = last_fill + math.floor(added) * math.floor(1000000 / rate)
end

local granted = math.min(tokens, requested)
tokens = tokens - granted

local reset = math.ceil((capacity - tokens) / rate - (now - last_fill) / 1000000)
if reset < 0 then reset = 0 end

-- %.0f keeps full microsecond precision; plain number-to-string conversion
-- in Redis Lua is %.14g and would truncate a 16-digit timestamp.
redis.call('HSET', key,
    'tokens', tokens,
    'last_fill_time', string.format('%.0f', last_fill),
    'rate', rate,
    'capacity', capacity)
redis.call('EXPIRE', key, reset + 1)

return {granted, tokens, reset}
"#;

/// Errors produced by rate-limiter operations.
#[derive(Debug, Error)]
pub enum LimiterError {
    /// Rejected before any driver call: a supplied rate was zero, negative,
    /// or not finite.
    #[error("negative or non-finite input: {0}")]
    NegativeInput(String),

    /// Transport or server error from the driver.
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}

/// Outcome of a [`RateLimiter::take`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Take {
    /// True when the full requested amount was granted.
    pub ok: bool,
    /// Whole tokens actually granted (`granted <= requested`).
    pub granted: u64,
    /// Whole tokens left in the bucket after the grant.
    pub remaining: u64,
    /// Whole seconds until the bucket would be full again.
    pub reset: u64,
}

/// Reject zero, negative, and non-finite rates before any driver call.
fn validate_rate(rate: f64) -> Result<(), LimiterError> {
    if rate.is_finite() && rate > 0.0 {
        Ok(())
    } else {
        Err(LimiterError::NegativeInput(format!("rate {rate}")))
    }
}

/// Token-bucket rate limiter over a single Redis endpoint.
#[derive(Clone)]
pub struct RateLimiter {
    conn: ConnectionManager,
    take: Arc<Script>,
}

impl RateLimiter {
    /// Create a rate limiter over an existing connection manager.
    #[must_use]
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            take: Arc::new(Script::new(TAKE_SCRIPT)),
        }
    }

    /// Take up to `n` whole tokens from the bucket at `key`.
    ///
    /// `rate` and `capacity` seed a bucket that has no stored limits; limits
    /// already stored in the bucket override them. When neither is present
    /// the defaults (50 tokens/s, capacity 3000) apply.
    ///
    /// # Errors
    ///
    /// [`LimiterError::NegativeInput`] if `rate` is zero, negative, or not
    /// finite, checked before any driver interaction. Driver errors pass
    /// through.
    pub async fn take(
        &self,
        key: &str,
        n: u64,
        rate: Option<f64>,
        capacity: Option<u64>,
    ) -> Result<Take, LimiterError> {
        if let Some(r) = rate {
            validate_rate(r)?;
        }

        #[allow(clippy::cast_precision_loss)]
        let capacity_arg = capacity.map_or(-1.0, |c| c as f64);

        let mut conn = self.conn.clone();
        let (granted, remaining, reset): (u64, u64, u64) = self
            .take
            .key(key)
            .arg(n)
            .arg(rate.unwrap_or(-1.0))
            .arg(capacity_arg)
            .arg(DEFAULT_RATE)
            .arg(DEFAULT_CAPACITY)
            .invoke_async(&mut conn)
            .await?;

        debug!(key = %key, requested = n, granted, remaining, reset, "bucket take");
        Ok(Take {
            ok: granted == n,
            granted,
            remaining,
            reset,
        })
    }

    /// Install per-key limits, overriding whatever callers pass to `take`.
    ///
    /// Applies a one-minute TTL to the bucket key; intended to follow a
    /// front-door `take` that ran with placeholder limits.
    ///
    /// # Errors
    ///
    /// [`LimiterError::NegativeInput`] for a zero/negative/non-finite rate;
    /// driver errors pass through.
    pub async fn set_options(
        &self,
        key: &str,
        rate: f64,
        capacity: u64,
    ) -> Result<(), LimiterError> {
        validate_rate(rate)?;

        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .hset(key, "rate", rate)
            .ignore()
            .hset(key, "capacity", capacity)
            .ignore()
            .expire(key, i64::try_from(OPTIONS_TTL_SECS).unwrap_or(i64::MAX))
            .ignore()
            .query_async(&mut conn)
            .await?;

        debug!(key = %key, rate, capacity, "bucket limits installed");
        Ok(())
    }

    /// Preload the take script into the server's script cache. Idempotent.
    ///
    /// # Errors
    ///
    /// Driver errors are passed through.
    pub async fn prepare(&self) -> Result<(), LimiterError> {
        let mut conn = self.conn.clone();
        self.take.prepare_invoke().load_async(&mut conn).await?;
        Ok(())
    }
}
