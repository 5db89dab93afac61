//! Distributed locking
//!
//! Locks are acquired with the Redis `SET key value NX PX ttl` pattern: the
//! key only lands if absent, a random owner token is stored as the value, and
//! the TTL bounds how long a crashed holder can wedge other callers. Release
//! runs a Lua script so the owner check and the delete are one atomic step.
//!
//! This is an efficiency lock, not a consensus primitive. Under failover a
//! lock can be lost while its holder still believes it owns it; callers must
//! tolerate the occasional duplicate critical section.

use std::time::Duration;

use redis::Script;
use redis::aio::ConnectionManager;
use thiserror::Error;
use tracing::debug;

/// Owner-checked release: delete the key only if we still hold it.
const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// Owner-checked extension: push the TTL out only if we still hold the key.
const EXTEND_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
    return 1
else
    return 0
end
"#;

/// Retry interval when polling for lock acquisition.
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Errors produced by lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    /// The key is currently held by another owner.
    #[error("lock not acquired")]
    NotAcquired,

    /// The stored token no longer matches ours; the lock expired or was
    /// grabbed by a new owner after our TTL lapsed.
    #[error("lock not held")]
    NotHeld,

    /// A multi-endpoint acquire failed and rolling back the already-acquired
    /// prefix hit further errors.
    #[error("multi-lock acquire failed: {cause} (rollback errors: {rollback:?})")]
    Aggregate {
        /// The failure that aborted the acquire sequence.
        cause: Box<LockError>,
        /// Errors hit while releasing the acquired prefix in reverse order.
        rollback: Vec<LockError>,
    },

    /// Transport or server error from the driver.
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}

/// Lock client bound to a single Redis endpoint.
#[derive(Clone)]
pub struct LockClient {
    conn: ConnectionManager,
}

impl LockClient {
    /// Create a lock client over an existing connection manager.
    #[must_use]
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Single acquisition attempt.
    ///
    /// Issues an atomic set-if-absent with a fresh owner token and the given
    /// TTL. The returned guard releases via [`LockGuard::release`]; dropping
    /// it without releasing is safe, the key simply expires after `ttl`.
    ///
    /// # Errors
    ///
    /// [`LockError::NotAcquired`] when the key is already held; driver errors
    /// are passed through.
    pub async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<LockGuard, LockError> {
        let token = uuid::Uuid::new_v4().to_string();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);

        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;

        match reply {
            Some(_) => {
                debug!(key = %key, "lock acquired");
                Ok(LockGuard {
                    conn: self.conn.clone(),
                    key: key.to_string(),
                    token,
                })
            }
            None => Err(LockError::NotAcquired),
        }
    }

    /// Acquire the lock, retrying every 50 ms until it succeeds.
    ///
    /// Cancellation is cooperative: the loop suspends between attempts, so
    /// bound it with `tokio::time::timeout` to impose a deadline. Without one
    /// this call can block forever under contention; that is the documented
    /// caller contract, not a bug.
    ///
    /// # Errors
    ///
    /// Driver errors abort the retry loop and are passed through.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockGuard, LockError> {
        loop {
            match self.try_acquire(key, ttl).await {
                Ok(guard) => return Ok(guard),
                Err(LockError::NotAcquired) => {
                    tokio::time::sleep(ACQUIRE_POLL_INTERVAL).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Preload the release and extend scripts into the server's script cache
    /// so later calls run by hash. Idempotent; loading an already-cached
    /// script is a no-op on the server.
    ///
    /// # Errors
    ///
    /// Driver errors are passed through.
    pub async fn prepare(&self) -> Result<(), LockError> {
        let mut conn = self.conn.clone();
        for script in [RELEASE_SCRIPT, EXTEND_SCRIPT] {
            Script::new(script)
                .prepare_invoke()
                .load_async(&mut conn)
                .await?;
        }
        Ok(())
    }
}

/// A held lock: key plus the owner token proving we hold it.
///
/// Dropping the guard without releasing leaves the key to expire on its own
/// TTL. Explicit release is preferred so waiters unblock promptly.
pub struct LockGuard {
    conn: ConnectionManager,
    key: String,
    token: String,
}

impl LockGuard {
    /// The locked key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Push the lock's TTL out to `ttl` from now, if we still own it.
    ///
    /// Long-running holders call this partway through their critical section
    /// instead of guessing a worst-case TTL up front.
    ///
    /// # Errors
    ///
    /// [`LockError::NotHeld`] when the lock already expired or changed
    /// owners; driver errors pass through.
    pub async fn extend(&self, ttl: Duration) -> Result<(), LockError> {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let mut conn = self.conn.clone();
        let extended: i64 = Script::new(EXTEND_SCRIPT)
            .key(&self.key)
            .arg(&self.token)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;

        if extended == 1 {
            Ok(())
        } else {
            Err(LockError::NotHeld)
        }
    }

    /// Whether the stored token still matches ours. Advisory only: the
    /// answer can be stale by the time the caller acts on it.
    ///
    /// # Errors
    ///
    /// Driver errors are passed through.
    pub async fn is_held(&self) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let owner: Option<String> = redis::cmd("GET")
            .arg(&self.key)
            .query_async(&mut conn)
            .await?;
        Ok(owner.as_deref() == Some(&self.token))
    }

    /// Release the lock if we still own it.
    ///
    /// # Errors
    ///
    /// [`LockError::NotHeld`] when the stored token no longer matches (the
    /// lock expired or another owner took over); driver errors pass through.
    pub async fn release(self) -> Result<(), LockError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = Script::new(RELEASE_SCRIPT)
            .key(&self.key)
            .arg(&self.token)
            .invoke_async(&mut conn)
            .await?;

        if deleted == 1 {
            debug!(key = %self.key, "lock released");
            Ok(())
        } else {
            Err(LockError::NotHeld)
        }
    }
}

/// Lock spanning several independent Redis endpoints, acquired in order.
///
/// All callers must construct their `MultiLock` with the same endpoint
/// ordering; mixed orderings can deadlock against each other. On any failure
/// mid-sequence the already-acquired prefix is released in reverse order
/// before the error is returned.
pub struct MultiLock {
    clients: Vec<LockClient>,
}

impl MultiLock {
    /// Build a multi-endpoint lock from an ordered list of clients.
    #[must_use]
    pub fn new(clients: Vec<LockClient>) -> Self {
        Self { clients }
    }

    /// Attempt to acquire the lock on every endpoint, in order.
    ///
    /// # Errors
    ///
    /// The first acquisition failure aborts the sequence; if releasing the
    /// acquired prefix also fails, the errors are joined into
    /// [`LockError::Aggregate`].
    pub async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<MultiLockGuard, LockError> {
        let mut held: Vec<LockGuard> = Vec::with_capacity(self.clients.len());

        for client in &self.clients {
            match client.try_acquire(key, ttl).await {
                Ok(guard) => held.push(guard),
                Err(cause) => {
                    let mut rollback = Vec::new();
                    for guard in held.into_iter().rev() {
                        if let Err(e) = guard.release().await {
                            rollback.push(e);
                        }
                    }
                    if rollback.is_empty() {
                        return Err(cause);
                    }
                    return Err(LockError::Aggregate {
                        cause: Box::new(cause),
                        rollback,
                    });
                }
            }
        }

        Ok(MultiLockGuard { held })
    }

    /// Acquire on every endpoint, retrying the whole ordered sequence every
    /// 50 ms while any endpoint reports contention. Same cancellation
    /// contract as [`LockClient::acquire`].
    ///
    /// # Errors
    ///
    /// Driver errors abort the retry loop and are passed through.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<MultiLockGuard, LockError> {
        loop {
            match self.try_acquire(key, ttl).await {
                Ok(guard) => return Ok(guard),
                Err(LockError::NotAcquired) => {
                    tokio::time::sleep(ACQUIRE_POLL_INTERVAL).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Preload the release script on every endpoint.
    ///
    /// # Errors
    ///
    /// Driver errors are passed through.
    pub async fn prepare(&self) -> Result<(), LockError> {
        for client in &self.clients {
            client.prepare().await?;
        }
        Ok(())
    }
}

/// Guards held across every endpoint of a [`MultiLock`].
pub struct MultiLockGuard {
    held: Vec<LockGuard>,
}

impl MultiLockGuard {
    /// Release every endpoint's lock in reverse acquisition order.
    ///
    /// # Errors
    ///
    /// Release errors from all endpoints are joined into
    /// [`LockError::Aggregate`]; a single failure is returned as-is.
    pub async fn release(self) -> Result<(), LockError> {
        let mut errors = Vec::new();
        for guard in self.held.into_iter().rev() {
            if let Err(e) = guard.release().await {
                errors.push(e);
            }
        }

        if errors.is_empty() {
            return Ok(());
        }
        let cause = Box::new(errors.remove(0));
        if errors.is_empty() {
            return Err(*cause);
        }
        Err(LockError::Aggregate {
            cause,
            rollback: errors,
        })
    }
}
