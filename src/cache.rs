//! Serve-stale typed cache
//!
//! Each logical entry is three physical keys: the JSON payload (`data`, kept
//! for the full stale window), a freshness sentinel (`fresh`, shorter TTL),
//! and an optional negative sentinel recording an authoritative
//! does-not-exist answer. While `fresh` is alive a hit is served as-is; after
//! it lapses the stale payload is still served but a background refresh is
//! kicked off behind a distributed lock so only one caller per key refills.
//!
//! The cache degrades rather than amplifies: any driver error on the read
//! path is logged and the call falls through to the fetcher directly.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{Instrument, debug, error, warn};

use crate::lock::{LockClient, LockError};

/// Errors produced by cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Authoritative "this value does not exist". Returned by fetchers to
    /// request negative caching, and by `get` on a negative-sentinel hit.
    #[error("value does not exist")]
    DoesNotExist,

    /// Refusing to store a value that serializes to JSON `null`.
    #[error("refusing to cache a null value")]
    NilValue,

    /// Payload (de)serialization failure.
    #[error("json codec: {0}")]
    Json(#[from] serde_json::Error),

    /// Transport or server error from the driver.
    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    /// Failure from the stampede lock.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Fetcher failure other than [`CacheError::DoesNotExist`].
    #[error("fetch failed: {0}")]
    Fetch(#[source] anyhow::Error),
}

impl CacheError {
    /// Wrap an arbitrary fetcher error.
    #[must_use]
    pub fn fetch(err: impl Into<anyhow::Error>) -> Self {
        Self::Fetch(err.into())
    }
}

/// TTL layout for a named cache.
///
/// `fresh` must not exceed `stale`: the fresh sentinel marks the head of the
/// data key's lifetime, after which the entry is stale but still servable.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Cache name, embedded in every physical key.
    pub name: String,
    /// Freshness window; the fresh sentinel's TTL.
    pub fresh: Duration,
    /// Total payload lifetime; the data key's TTL.
    pub stale: Duration,
    /// Negative-caching window; `None` disables negative caching.
    pub negative: Option<Duration>,
}

impl CacheConfig {
    /// Config with negative caching disabled.
    #[must_use]
    pub fn new(name: impl Into<String>, fresh: Duration, stale: Duration) -> Self {
        Self {
            name: name.into(),
            fresh,
            stale,
            negative: None,
        }
    }

    /// Enable negative caching with the given sentinel TTL.
    #[must_use]
    pub fn with_negative(mut self, negative: Duration) -> Self {
        self.negative = Some(negative);
        self
    }
}

/// Physical key names for one logical entry.
struct Keys {
    data: String,
    fresh: String,
    negative: String,
    lock: String,
}

impl Keys {
    fn for_entry(name: &str, key: &str) -> Self {
        Self {
            data: format!("cache:data:{name}:{key}"),
            fresh: format!("cache:fresh:{name}:{key}"),
            negative: format!("cache:negative:{name}:{key}"),
            lock: format!("cache:lock:{name}:{key}"),
        }
    }
}

struct Shadow {
    conn: ConnectionManager,
    timeout: Duration,
}

struct Inner {
    conn: ConnectionManager,
    lock: LockClient,
    name: String,
    fresh: Duration,
    stale: Duration,
    negative: Option<Duration>,
    shadow: Option<Shadow>,
}

/// Typed serve-stale cache over a single Redis endpoint.
///
/// The payload type round-trips through JSON. A disabled handle (from
/// [`Cache::disabled`]) serves every `get` straight from the fetcher and
/// turns `set`/`prepare` into no-ops, so call sites need no special casing
/// when caching is switched off.
pub struct Cache<T> {
    inner: Option<Arc<Inner>>,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Clone for Cache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _payload: PhantomData,
        }
    }
}

impl<T> Cache<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    /// Create a cache over an existing connection manager.
    #[must_use]
    pub fn new(conn: ConnectionManager, config: CacheConfig) -> Self {
        Self::build(conn, config, None)
    }

    /// Create a cache that mirrors every write to a second endpoint, each
    /// shadow write bounded by `timeout`.
    ///
    /// Shadow failures are logged and never surface to callers; the shadow
    /// exists for migrations and dark reads, not correctness.
    #[must_use]
    pub fn with_shadow(
        conn: ConnectionManager,
        config: CacheConfig,
        shadow_conn: ConnectionManager,
        timeout: Duration,
    ) -> Self {
        Self::build(
            conn,
            config,
            Some(Shadow {
                conn: shadow_conn,
                timeout,
            }),
        )
    }

    fn build(conn: ConnectionManager, config: CacheConfig, shadow: Option<Shadow>) -> Self {
        Self {
            inner: Some(Arc::new(Inner {
                lock: LockClient::new(conn.clone()),
                conn,
                name: config.name,
                fresh: config.fresh,
                stale: config.stale,
                negative: config.negative,
                shadow,
            })),
            _payload: PhantomData,
        }
    }

    /// A cache that is switched off: `get` calls the fetcher directly,
    /// `set` and `prepare` do nothing.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            inner: None,
            _payload: PhantomData,
        }
    }

    /// Look up `key`, filling or refreshing from `fetcher` as needed.
    ///
    /// One multi-key read classifies the entry: a negative sentinel returns
    /// [`CacheError::DoesNotExist`]; a fresh hit decodes and returns; a stale
    /// hit decodes, returns, and spawns a lock-guarded background refresh; a
    /// miss fills synchronously. On any other driver error the cache is
    /// bypassed and the fetcher result is returned untouched.
    ///
    /// # Errors
    ///
    /// [`CacheError::DoesNotExist`] for negative hits and fetcher-reported
    /// missing values; fetcher errors otherwise pass through. Fill-write
    /// failures are logged, never returned.
    pub async fn get<F, Fut>(&self, key: &str, fetcher: F) -> Result<T, CacheError>
    where
        F: FnOnce(String) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, CacheError>> + Send + 'static,
    {
        let Some(inner) = &self.inner else {
            return fetcher(key.to_string()).await;
        };

        let keys = Keys::for_entry(&inner.name, key);
        let mut conn = inner.conn.clone();
        let read: Result<(Option<String>, Option<Vec<u8>>, Option<String>), redis::RedisError> =
            redis::cmd("MGET")
                .arg(&keys.fresh)
                .arg(&keys.data)
                .arg(&keys.negative)
                .query_async(&mut conn)
                .await;

        let (fresh, data, negative) = match read {
            Ok(t) => t,
            Err(e) => {
                // Serving through the fetcher instead of failing keeps a
                // driver outage from amplifying into an application outage.
                error!(cache = %inner.name, key = %key, error = %e,
                    "cache read failed, serving directly from fetcher");
                return fetcher(key.to_string()).await;
            }
        };

        if negative.is_some() {
            return Err(CacheError::DoesNotExist);
        }

        if let Some(bytes) = data {
            match serde_json::from_slice::<T>(&bytes) {
                Ok(value) => {
                    if fresh.is_none() {
                        Self::refresh(inner, key, fetcher).await;
                    }
                    return Ok(value);
                }
                Err(e) => {
                    warn!(cache = %inner.name, key = %key, error = %e,
                        "cached payload failed to decode, refilling");
                }
            }
        }

        Self::fill(inner, key, fetcher).await
    }

    /// Store `value` under `key` with the configured TTLs.
    ///
    /// # Errors
    ///
    /// [`CacheError::NilValue`] when the value serializes to JSON `null`;
    /// codec and driver errors pass through.
    pub async fn set(&self, key: &str, value: &T) -> Result<(), CacheError> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };

        if serde_json::to_value(value)? == serde_json::Value::Null {
            return Err(CacheError::NilValue);
        }
        let bytes = serde_json::to_vec(value)?;
        inner.write_payload(key, &bytes).await
    }

    /// Preload the stampede lock's release script. Idempotent; a no-op on a
    /// disabled handle.
    ///
    /// # Errors
    ///
    /// Driver errors are passed through.
    pub async fn prepare(&self) -> Result<(), CacheError> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };
        inner.lock.prepare().await?;
        Ok(())
    }

    /// Synchronous fill on a hard miss. The fetched value is always returned
    /// as-is; cache writes are best-effort.
    async fn fill<F, Fut>(inner: &Arc<Inner>, key: &str, fetcher: F) -> Result<T, CacheError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<T, CacheError>>,
    {
        match fetcher(key.to_string()).await {
            Ok(value) => {
                match serde_json::to_vec(&value) {
                    Ok(bytes) => {
                        if let Err(e) = inner.write_payload(key, &bytes).await {
                            error!(cache = %inner.name, key = %key, error = %e,
                                "cache fill write failed");
                        }
                    }
                    Err(e) => {
                        error!(cache = %inner.name, key = %key, error = %e,
                            "cache fill serialization failed");
                    }
                }
                Ok(value)
            }
            Err(CacheError::DoesNotExist) => {
                if inner.negative.is_some() {
                    if let Err(e) = inner.write_negative(key).await {
                        error!(cache = %inner.name, key = %key, error = %e,
                            "negative sentinel write failed");
                    }
                }
                Err(CacheError::DoesNotExist)
            }
            Err(e) => Err(e),
        }
    }

    /// Soft-miss path: grab the per-key refresh lock and, if we win it,
    /// refill in a detached task so the stale response is not delayed.
    async fn refresh<F, Fut>(inner: &Arc<Inner>, key: &str, fetcher: F)
    where
        F: FnOnce(String) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, CacheError>> + Send + 'static,
    {
        let keys = Keys::for_entry(&inner.name, key);
        let guard = match inner.lock.try_acquire(&keys.lock, inner.stale).await {
            Ok(guard) => guard,
            Err(LockError::NotAcquired) => return,
            Err(e) => {
                warn!(cache = %inner.name, key = %key, error = %e,
                    "refresh lock attempt failed");
                return;
            }
        };

        let inner = Arc::clone(inner);
        let key = key.to_string();
        // The refresh gets its own root span so it survives the caller's
        // request span, with follows_from linking it back for trace search.
        let span =
            tracing::info_span!(parent: None, "cache_refresh", cache = %inner.name, key = %key);
        span.follows_from(tracing::Span::current().id());

        tokio::spawn(
            async move {
                match fetcher(key.clone()).await {
                    Ok(value) => match serde_json::to_vec(&value) {
                        Ok(bytes) => {
                            if let Err(e) = inner.write_payload(&key, &bytes).await {
                                error!(cache = %inner.name, key = %key, error = %e,
                                    "refresh write failed");
                            } else {
                                debug!(cache = %inner.name, key = %key, "entry refreshed");
                            }
                        }
                        Err(e) => {
                            error!(cache = %inner.name, key = %key, error = %e,
                                "refresh serialization failed");
                        }
                    },
                    Err(CacheError::DoesNotExist) => {
                        if inner.negative.is_some() {
                            if let Err(e) = inner.write_negative(&key).await {
                                error!(cache = %inner.name, key = %key, error = %e,
                                    "refresh negative write failed");
                            }
                        }
                    }
                    Err(e) => {
                        warn!(cache = %inner.name, key = %key, error = %e, "refresh fetch failed");
                    }
                }

                if let Err(e) = guard.release().await {
                    // Lost to TTL expiry; the next stale hit will retry.
                    debug!(cache = %inner.name, key = %key, error = %e,
                        "refresh lock release failed");
                }
            }
            .instrument(span),
        );
    }
}

impl Inner {
    /// Positive fill: data + fresh sentinel written, negative sentinel
    /// cleared, all in one pipeline. Mirrored to the shadow endpoint.
    async fn write_payload(&self, key: &str, bytes: &[u8]) -> Result<(), CacheError> {
        let keys = Keys::for_entry(&self.name, key);
        let mut pipe = redis::pipe();
        pipe.set_ex(&keys.data, bytes, self.stale.as_secs().max(1))
            .ignore()
            .set_ex(&keys.fresh, 1, self.fresh.as_secs().max(1))
            .ignore()
            .del(&keys.negative)
            .ignore();
        self.run_write(&pipe).await
    }

    /// Negative fill: sentinel written, payload and fresh sentinel cleared.
    /// The data key and the negative sentinel are never both written.
    async fn write_negative(&self, key: &str) -> Result<(), CacheError> {
        let Some(negative) = self.negative else {
            return Ok(());
        };
        let keys = Keys::for_entry(&self.name, key);
        let mut pipe = redis::pipe();
        pipe.set_ex(&keys.negative, 1, negative.as_secs().max(1))
            .ignore()
            .del(&keys.data)
            .ignore()
            .del(&keys.fresh)
            .ignore();
        self.run_write(&pipe).await
    }

    async fn run_write(&self, pipe: &redis::Pipeline) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let () = pipe.query_async(&mut conn).await?;

        if let Some(shadow) = &self.shadow {
            let mut shadow_conn = shadow.conn.clone();
            let shadow_pipe = pipe.clone();
            match tokio::time::timeout(
                shadow.timeout,
                shadow_pipe.query_async::<()>(&mut shadow_conn),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(cache = %self.name, error = %e, "shadow write failed");
                }
                Err(_) => {
                    warn!(cache = %self.name, timeout = ?shadow.timeout, "shadow write timed out");
                }
            }
        }

        Ok(())
    }
}
