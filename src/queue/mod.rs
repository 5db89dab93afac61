//! Shuffle-sharded streams queue
//!
//! One logical queue is N append-only streams plus a meta hash and a wake
//! channel. Producers land on the shortest of their tenant's M shuffle
//! shards, which isolates noisy tenants to their own slice of the queue and
//! levels fill under skew. Consumers round-robin the shards through a cursor
//! stored in meta, so every shard yields one message before any shard yields
//! two. That is fairness, not global ordering.
//!
//! The notification stream is capped at a single entry on purpose: racing
//! producers may overwrite each other's wake, but one wake is enough because
//! a woken consumer re-scans every shard. Do not raise the cap.
//!
//! Optional tracking records every written message in a cancelation hash so
//! it can be deleted by value before delivery; a periodic [`Queue::gc`]
//! sweep retires tracking entries whose deadline has passed.

mod reply;
mod scripts;
mod tracking;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use redis::Script;
use redis::aio::ConnectionManager;
use thiserror::Error;
use tracing::debug;

pub use reply::Message;
pub use tracking::{CancelationEntry, GcOutcome};

use reply::parse_read_reply;

/// Errors produced by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// No message is currently available.
    #[error("queue is empty")]
    Empty,

    /// Read arguments failed validation before any driver call.
    #[error("invalid read arguments: {0}")]
    InvalidReadArgs(String),

    /// Write arguments failed validation before any driver call.
    #[error("invalid write arguments: {0}")]
    InvalidWriteArgs(String),

    /// The tracked value names no live message.
    #[error("no matching message in stream")]
    NoMatchingMessage,

    /// The cancelation hash held an entry that does not decode.
    #[error("invalid cancelation entry: {0}")]
    InvalidMetaCancelation(String),

    /// `n_time_digits` passed to [`Queue::gc`] is unusable.
    #[error("invalid time digit count: {0}")]
    InvalidNTimeDigits(i32),

    /// A GC callback asked the sweep to halt. Never escapes [`Queue::gc`];
    /// reported through [`GcOutcome::halted`] instead.
    #[error("gc halted by callback")]
    StopGc,

    /// A read reply did not match the expected stream shape.
    #[error("malformed stream reply: {0}")]
    MalformedReply(String),

    /// A GC callback failed with an error other than [`QueueError::StopGc`].
    #[error("gc callback failed: {0}")]
    Callback(#[source] anyhow::Error),

    /// Transport or server error from the driver.
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}

/// Tracking configuration: which field names a message for cancellation, and
/// the default deadline horizon when a writer does not supply one.
#[derive(Debug, Clone)]
pub struct TrackingConfig {
    /// Field whose value uniquely names a message.
    pub field: String,
    /// Deadline applied when a write carries no explicit deadline.
    pub ttl: Duration,
}

/// Queue construction parameters.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// TTL renewed on every queue key at each write.
    pub ttl: Duration,
    /// Message tracking; `None` disables the cancelation index.
    pub tracking: Option<TrackingConfig>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            tracking: None,
        }
    }
}

/// Arguments to [`Queue::write`].
#[derive(Debug, Clone)]
pub struct WriteArgs {
    /// Queue base name.
    pub name: String,
    /// Message payload as field/value pairs.
    pub values: Vec<(String, String)>,
    /// Total virtual shard count N for this queue.
    pub streams: u32,
    /// Shuffle-shard width M; the tenant writes to the shortest of these.
    pub streams_per_shard: u32,
    /// Tenant key hashed into the shard selection.
    pub shard_key: Vec<u8>,
    /// Cancellation deadline for tracked messages; defaults to now plus the
    /// tracking TTL when absent.
    pub deadline: Option<SystemTime>,
}

/// Arguments to [`Queue::read`].
#[derive(Debug, Clone)]
pub struct ReadArgs {
    /// Queue base name.
    pub name: String,
    /// Consumer group, created on demand.
    pub group: String,
    /// Consumer name within the group.
    pub consumer: String,
    /// How long to wait for a wake notification when every shard is empty;
    /// `None` (or zero) returns [`QueueError::Empty`] immediately.
    pub block: Option<Duration>,
    /// Shard stream to try first, e.g. to drain a shard this consumer has
    /// affinity for. Ignored unless it names a stream of this queue.
    pub prefer_stream: Option<String>,
}

/// Receipt for a written message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    /// Index of the shard the message landed on.
    pub shard: u32,
    /// Server-assigned entry ID.
    pub id: String,
}

/// Length and backlog counts for one consumer group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Total entries across all active shards.
    pub len: u64,
    /// Delivered-but-unacked entries for the group.
    pub pending: u64,
}

/// Client for one logical queue namespace.
#[derive(Clone)]
pub struct Queue {
    /// Kept alongside the manager: blocking reads each get a dedicated
    /// connection so they cannot stall the shared multiplexed pipeline.
    client: redis::Client,
    conn: ConnectionManager,
    ttl: Duration,
    tracking: Option<TrackingConfig>,
    write_script: Arc<Script>,
    read_script: Arc<Script>,
    len_script: Arc<Script>,
    stats_script: Arc<Script>,
}

impl Queue {
    /// Connect a queue client to the given Redis URL.
    ///
    /// # Errors
    ///
    /// Driver errors from client creation or the initial connection are
    /// passed through.
    pub async fn connect(redis_url: &str, config: QueueConfig) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            conn,
            ttl: config.ttl,
            tracking: config.tracking,
            write_script: Arc::new(Script::new(scripts::WRITE)),
            read_script: Arc::new(Script::new(scripts::READ)),
            len_script: Arc::new(Script::new(scripts::LEN)),
            stats_script: Arc::new(Script::new(scripts::STATS)),
        })
    }

    /// Append a message, shuffle-sharded by `shard_key`.
    ///
    /// The whole write (shard-count resize, shortest-shard choice, append,
    /// wake notification, tracking index, TTL renewal) is one server-side
    /// script, so concurrent writers cannot observe a half-applied write.
    ///
    /// # Errors
    ///
    /// [`QueueError::InvalidWriteArgs`] for an empty name or payload, a zero
    /// stream count, a shard width outside `[1, streams]`, or (with tracking
    /// enabled) a payload missing the tracked field. Driver errors pass
    /// through.
    pub async fn write(&self, args: &WriteArgs) -> Result<WriteReceipt, QueueError> {
        let shards = validate_write(args)?;

        let track = match &self.tracking {
            Some(tracking) => {
                let value = args
                    .values
                    .iter()
                    .find(|(field, _)| *field == tracking.field)
                    .map(|(_, value)| value.clone())
                    .ok_or_else(|| {
                        QueueError::InvalidWriteArgs(format!(
                            "payload missing tracked field {:?}",
                            tracking.field
                        ))
                    })?;
                let deadline = args.deadline.map_or(0, |at| {
                    at.duration_since(UNIX_EPOCH)
                        .unwrap_or(Duration::ZERO)
                        .as_secs()
                });
                Some((value, deadline, tracking.ttl.as_secs()))
            }
            None => None,
        };

        let mut invocation = self.write_script.prepare_invoke();
        invocation
            .arg(&args.name)
            .arg(args.streams)
            .arg(self.ttl.as_secs().max(1))
            .arg(args.streams_per_shard);
        for shard in &shards {
            invocation.arg(*shard);
        }
        invocation.arg(args.values.len());
        for (field, value) in &args.values {
            invocation.arg(field).arg(value);
        }
        match track {
            Some((value, deadline, track_ttl)) => {
                invocation
                    .arg(1)
                    .arg(value)
                    .arg(deadline)
                    .arg(track_ttl)
                    .arg(tracking::CANCELATION_KEY)
                    .arg(tracking::DEADLINES_KEY);
            }
            None => {
                invocation.arg(0);
            }
        }

        let mut conn = self.conn.clone();
        let (shard, id): (u32, String) = invocation.invoke_async(&mut conn).await?;

        debug!(queue = %args.name, shard, id = %id, "message written");
        Ok(WriteReceipt { shard, id })
    }

    /// Read one message for `group`/`consumer`, waiting up to `block` for a
    /// wake notification when every shard is empty.
    ///
    /// # Errors
    ///
    /// [`QueueError::Empty`] when no message arrives within the block window;
    /// [`QueueError::InvalidReadArgs`] for empty name/group/consumer. Driver
    /// errors pass through. A failure after delivery leaves the message in
    /// the group's pending-entries list, recoverable by claim/ack.
    pub async fn read(&self, args: &ReadArgs) -> Result<Message, QueueError> {
        if args.name.is_empty() || args.group.is_empty() || args.consumer.is_empty() {
            return Err(QueueError::InvalidReadArgs(
                "name, group, and consumer are required".into(),
            ));
        }

        if let Some(preferred) = &args.prefer_stream {
            if is_queue_stream(&args.name, preferred) {
                if let Some(message) = self.read_preferred(args, preferred).await? {
                    return Ok(message);
                }
            }
        }

        if let Some(message) = self.read_round_robin(args).await? {
            return Ok(message);
        }

        let Some(block) = args.block.filter(|d| !d.is_zero()) else {
            return Err(QueueError::Empty);
        };

        if self.await_notification(args, block).await? {
            if let Some(message) = self.read_round_robin(args).await? {
                return Ok(message);
            }
        }
        Err(QueueError::Empty)
    }

    /// Net number of deliverable messages, or `None` when nothing is
    /// available (including when pending entries exceed the backlog).
    ///
    /// Prefer [`Queue::stats`] for new callers; it reports length and
    /// pending separately instead of netting them.
    ///
    /// # Errors
    ///
    /// Driver errors are passed through.
    pub async fn len(&self, name: &str) -> Result<Option<u64>, QueueError> {
        let mut conn = self.conn.clone();
        let net: Option<u64> = self
            .len_script
            .prepare_invoke()
            .arg(name)
            .invoke_async(&mut conn)
            .await?;
        Ok(net)
    }

    /// Total length and per-group pending count.
    ///
    /// # Errors
    ///
    /// Driver errors are passed through.
    pub async fn stats(&self, name: &str, group: &str) -> Result<QueueStats, QueueError> {
        let mut conn = self.conn.clone();
        let (len, pending): (u64, u64) = self
            .stats_script
            .prepare_invoke()
            .arg(name)
            .arg(group)
            .invoke_async(&mut conn)
            .await?;
        Ok(QueueStats { len, pending })
    }

    /// Preload every queue script into the server's script cache. Idempotent.
    ///
    /// # Errors
    ///
    /// Driver errors are passed through.
    pub async fn prepare(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        for script in [
            &self.write_script,
            &self.read_script,
            &self.len_script,
            &self.stats_script,
        ] {
            script.prepare_invoke().load_async(&mut conn).await?;
        }
        Ok(())
    }

    /// Fast path: one consumer-group read against the preferred stream,
    /// blocking only if the caller asked to block.
    async fn read_preferred(
        &self,
        args: &ReadArgs,
        stream: &str,
    ) -> Result<Option<Message>, QueueError> {
        let block = args.block.filter(|d| !d.is_zero());
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(&args.group).arg(&args.consumer);
        if let Some(block) = block {
            cmd.arg("BLOCK")
                .arg(u64::try_from(block.as_millis()).unwrap_or(u64::MAX));
        }
        cmd.arg("COUNT").arg(1).arg("STREAMS").arg(stream).arg(">");

        let value = if block.is_some() {
            let mut conn = self.blocking_connection().await?;
            self.run_group_read(&cmd, &mut conn, stream, &args.group, false)
                .await?
        } else {
            let mut conn = self.conn.clone();
            self.run_group_read(&cmd, &mut conn, stream, &args.group, false)
                .await?
        };
        parse_read_reply(&value)
    }

    /// One pass of the round-robin read script.
    async fn read_round_robin(&self, args: &ReadArgs) -> Result<Option<Message>, QueueError> {
        let mut conn = self.conn.clone();
        let value: redis::Value = self
            .read_script
            .prepare_invoke()
            .arg(&args.name)
            .arg(&args.group)
            .arg(&args.consumer)
            .arg(self.ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        parse_read_reply(&value)
    }

    /// Block on the wake channel. Returns true when a notification arrived
    /// (whatever its content), false on timeout. Runs on a dedicated
    /// connection so the shared pipeline keeps flowing while we wait.
    async fn await_notification(
        &self,
        args: &ReadArgs,
        block: Duration,
    ) -> Result<bool, QueueError> {
        let notifications = format!("{}:notifications", args.name);
        let mut conn = self.blocking_connection().await?;
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&args.group)
            .arg(&args.consumer)
            .arg("BLOCK")
            .arg(u64::try_from(block.as_millis()).unwrap_or(u64::MAX))
            .arg("NOACK")
            .arg("COUNT")
            .arg(1)
            .arg("STREAMS")
            .arg(&notifications)
            .arg(">");

        let value = self
            .run_group_read(&cmd, &mut conn, &notifications, &args.group, true)
            .await?;
        Ok(!matches!(value, redis::Value::Nil))
    }

    /// Run a consumer-group read, creating the group on NOGROUP and retrying
    /// once.
    async fn run_group_read<C: redis::aio::ConnectionLike>(
        &self,
        cmd: &redis::Cmd,
        conn: &mut C,
        stream: &str,
        group: &str,
        expire_on_create: bool,
    ) -> Result<redis::Value, QueueError> {
        match cmd.query_async::<redis::Value>(conn).await {
            Ok(value) => Ok(value),
            Err(e) if is_nogroup(&e) => {
                self.create_group(stream, group, expire_on_create).await?;
                Ok(cmd.query_async(conn).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Dedicated connection for blocking commands.
    async fn blocking_connection(
        &self,
    ) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// Create a consumer group at "0" with MKSTREAM, optionally putting the
    /// queue TTL on a stream the group call had to create.
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        expire: bool,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let created: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(()) => {}
            // BUSYGROUP: somebody else created it between our read and now.
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(e.into()),
        }
        if expire {
            let _: () = redis::cmd("EXPIRE")
                .arg(stream)
                .arg(self.ttl.as_secs().max(1))
                .query_async(&mut conn)
                .await?;
        }
        Ok(())
    }
}

fn is_nogroup(err: &redis::RedisError) -> bool {
    err.code() == Some("NOGROUP")
}

/// Validate write arguments and compute the tenant's candidate shards.
fn validate_write(args: &WriteArgs) -> Result<Vec<u32>, QueueError> {
    if args.name.is_empty() {
        return Err(QueueError::InvalidWriteArgs("empty queue name".into()));
    }
    if args.values.is_empty() {
        return Err(QueueError::InvalidWriteArgs("empty payload".into()));
    }
    crate::shard::select(args.streams, args.streams_per_shard, &args.shard_key)
        .map_err(|e| QueueError::InvalidWriteArgs(e.to_string()))
}

/// Whether `stream` belongs to the queue `name`: one of its shard streams,
/// or the legacy unsuffixed stream.
fn is_queue_stream(name: &str, stream: &str) -> bool {
    if stream == name {
        return true;
    }
    stream
        .strip_prefix(name)
        .and_then(|rest| rest.strip_prefix(":s"))
        .is_some_and(|idx| idx.parse::<u32>().is_ok())
}
