//! Message tracking and cancellation.
//!
//! When tracking is enabled every write records its message in the
//! cancelation hash under the tracked field's value, alongside an expiry
//! sibling field and an entry in the deadline index. [`Queue::del`] cancels
//! a message by value before it is delivered; [`Queue::gc`] sweeps tracking
//! state whose deadline has passed, handing each batch to a caller callback
//! before deleting it.

use std::future::Future;
use std::time::Duration;

use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Queue, QueueError};
use crate::util::unix_time_secs;

/// Hash mapping tracked value to its [`CancelationEntry`] JSON, plus the
/// `{value}:expiry:{deadline}` sibling fields the GC scan keys off.
pub(crate) const CANCELATION_KEY: &str = "meta:cancelation";

/// Sorted set scoring tracked values by cancellation deadline.
pub(crate) const DEADLINES_KEY: &str = "meta:cancelation:deadlines";

/// Tracked entries handed to the GC callback per invocation.
const GC_BATCH: usize = 100;

/// Location of a tracked message, stored as JSON in the cancelation hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelationEntry {
    /// Stream key holding the message.
    pub stream_id: String,
    /// Entry ID within the stream.
    pub msg_id: String,
    /// The tracked field's value.
    pub track_value: String,
    /// Cancellation deadline, unix seconds.
    pub deadline: u64,
}

/// Result of a [`Queue::gc`] sweep.
#[derive(Debug, Default)]
pub struct GcOutcome {
    /// Expiry fields examined.
    pub scanned: u64,
    /// Tracked entries deleted. An entry and its expiry sibling count once.
    pub deleted: u64,
    /// True when the callback halted the sweep with [`QueueError::StopGc`];
    /// the batch in flight was left undeleted.
    pub halted: bool,
    /// Non-fatal errors accumulated across the sweep.
    pub errors: Vec<QueueError>,
}

impl Queue {
    /// Cancel the tracked message named by `track_value`, deleting it from
    /// its stream before delivery.
    ///
    /// # Errors
    ///
    /// [`QueueError::NoMatchingMessage`] when the value is untracked or the
    /// message is already gone; [`QueueError::InvalidMetaCancelation`] when
    /// the stored entry does not decode or carries empty IDs. Driver errors
    /// pass through.
    pub async fn del(&self, track_value: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let stored: Option<String> = redis::cmd("HGET")
            .arg(CANCELATION_KEY)
            .arg(track_value)
            .query_async(&mut conn)
            .await?;
        let Some(json) = stored else {
            return Err(QueueError::NoMatchingMessage);
        };

        let entry: CancelationEntry = serde_json::from_str(&json)
            .map_err(|e| QueueError::InvalidMetaCancelation(e.to_string()))?;
        if entry.stream_id.is_empty() || entry.msg_id.is_empty() {
            return Err(QueueError::InvalidMetaCancelation(
                "empty stream or message id".into(),
            ));
        }

        let deleted: u64 = redis::cmd("XDEL")
            .arg(&entry.stream_id)
            .arg(&entry.msg_id)
            .query_async(&mut conn)
            .await?;
        if deleted == 0 {
            return Err(QueueError::NoMatchingMessage);
        }

        debug!(track_value, stream = %entry.stream_id, id = %entry.msg_id, "message cancelled");
        Ok(())
    }

    /// Sweep expired tracking state.
    ///
    /// `n_time_digits` bounds the scan to expiry fields whose deadline
    /// starts with the first N digits of the current unix time, keeping the
    /// scanned keyspace small for frequent sweeps; `-1` scans everything.
    /// Expired entries are batched and `on_gc` is invoked per batch *before*
    /// the batch is deleted, so a callback failure never loses state:
    /// returning [`QueueError::StopGc`] halts the sweep with the batch kept.
    ///
    /// Driver errors while deleting a batch are non-fatal and collected into
    /// [`GcOutcome::errors`]. Sweeps are expected to be serialized by the
    /// caller; concurrent sweeps are safe but will double-report.
    ///
    /// # Errors
    ///
    /// [`QueueError::InvalidNTimeDigits`] for a zero, sub-`-1`, or too-long
    /// digit count. Callback errors other than `StopGc` abort the sweep and
    /// are returned. Driver errors on the scan itself pass through.
    pub async fn gc<F, Fut>(&self, n_time_digits: i32, mut on_gc: F) -> Result<GcOutcome, QueueError>
    where
        F: FnMut(Vec<String>) -> Fut,
        Fut: Future<Output = Result<(), QueueError>>,
    {
        let now = unix_time_secs();
        let pattern = expiry_pattern(n_time_digits, now)?;

        let mut conn = self.conn.clone();
        let mut outcome = GcOutcome::default();
        let mut batch: Vec<(String, String)> = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, items): (u64, Vec<String>) = redis::cmd("HSCAN")
                .arg(CANCELATION_KEY)
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;

            for pair in items.chunks_exact(2) {
                let [field, _value] = pair else {
                    continue;
                };
                let Some((id, deadline)) = split_expiry_field(field) else {
                    outcome.errors.push(QueueError::InvalidMetaCancelation(format!(
                        "unparseable expiry field {field:?}"
                    )));
                    continue;
                };
                outcome.scanned += 1;
                if deadline < now {
                    batch.push((id.to_string(), field.clone()));
                    if batch.len() >= GC_BATCH
                        && !flush_batch(&mut conn, &mut on_gc, &mut batch, &mut outcome).await?
                    {
                        outcome.halted = true;
                        return Ok(outcome);
                    }
                }
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        if !flush_batch(&mut conn, &mut on_gc, &mut batch, &mut outcome).await? {
            outcome.halted = true;
        }

        debug!(
            scanned = outcome.scanned,
            deleted = outcome.deleted,
            halted = outcome.halted,
            "gc sweep finished"
        );
        Ok(outcome)
    }

    /// Tracked values whose deadline fell inside `[now - within, now + 1s]`.
    ///
    /// # Errors
    ///
    /// Driver errors are passed through.
    pub async fn deadline_exceeded(&self, within: Duration) -> Result<Vec<String>, QueueError> {
        let now = unix_time_secs();
        let mut conn = self.conn.clone();
        let values: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(DEADLINES_KEY)
            .arg(now.saturating_sub(within.as_secs()))
            .arg(now + 1)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }
}

/// Hand a full batch to the callback, then delete it. `Ok(false)` means the
/// callback asked to halt; the batch stays in place.
async fn flush_batch<F, Fut>(
    conn: &mut ConnectionManager,
    on_gc: &mut F,
    batch: &mut Vec<(String, String)>,
    outcome: &mut GcOutcome,
) -> Result<bool, QueueError>
where
    F: FnMut(Vec<String>) -> Fut,
    Fut: Future<Output = Result<(), QueueError>>,
{
    if batch.is_empty() {
        return Ok(true);
    }

    let ids: Vec<String> = batch.iter().map(|(id, _)| id.clone()).collect();
    match on_gc(ids).await {
        Ok(()) => {}
        Err(QueueError::StopGc) => return Ok(false),
        Err(e) => return Err(e),
    }

    let mut pipe = redis::pipe();
    for (id, field) in batch.iter() {
        pipe.cmd("HDEL")
            .arg(CANCELATION_KEY)
            .arg(id)
            .arg(field)
            .ignore();
        pipe.cmd("ZREM").arg(DEADLINES_KEY).arg(id).ignore();
    }
    match pipe.query_async::<()>(conn).await {
        Ok(()) => outcome.deleted += batch.len() as u64,
        Err(e) => outcome.errors.push(e.into()),
    }

    batch.clear();
    Ok(true)
}

/// HSCAN pattern for expiry sibling fields, narrowed by a deadline digit
/// prefix of the current time.
fn expiry_pattern(n_time_digits: i32, now: u64) -> Result<String, QueueError> {
    if n_time_digits == -1 {
        return Ok("*:expiry:*".to_string());
    }
    let now_digits = now.to_string();
    let wanted = usize::try_from(n_time_digits)
        .ok()
        .filter(|&d| d >= 1 && d <= now_digits.len())
        .ok_or(QueueError::InvalidNTimeDigits(n_time_digits))?;
    let prefix = now_digits
        .get(..wanted)
        .ok_or(QueueError::InvalidNTimeDigits(n_time_digits))?;
    Ok(format!("*:expiry:{prefix}*"))
}

/// Split `{id}:expiry:{deadline}` into its parts. The id may itself contain
/// colons, so the split anchors on the last `:expiry:` marker.
fn split_expiry_field(field: &str) -> Option<(&str, u64)> {
    let at = field.rfind(":expiry:")?;
    let id = field.get(..at)?;
    let deadline: u64 = field.get(at + ":expiry:".len()..)?.parse().ok()?;
    if id.is_empty() {
        return None;
    }
    Some((id, deadline))
}
