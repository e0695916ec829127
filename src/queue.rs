//! The per-domain priority queue: a Redis sorted set keyed by
//! `{spiderid}:{registered-domain}:queue`, score = `-priority`.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::QueueError;
use crate::request::RequestRecord;

/// A shared ordered set in Redis holding serialized [`RequestRecord`]s.
///
/// Ties on priority are broken by Redis's lexical order on member bytes —
/// no stronger guarantee is promised.
#[derive(Clone)]
pub struct PriorityQueue {
    conn: ConnectionManager,
    key: String,
}

impl PriorityQueue {
    pub fn new(conn: ConnectionManager, key: impl Into<String>) -> Self {
        Self {
            conn,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Insert `record` with score `-priority` (so ascending score is
    /// descending priority — `ZPOPMIN` then returns the highest-priority
    /// item first).
    pub async fn push(&self, record: &RequestRecord, priority: i64) -> Result<(), QueueError> {
        let bytes = record.serialize()?;
        let mut conn = self.conn.clone();
        let _: () = conn.zadd(&self.key, bytes, -priority).await?;
        Ok(())
    }

    /// Atomically remove and return the highest-priority member, or `None`
    /// if the queue is empty. `ZPOPMIN` is a single server-side command, so
    /// concurrent workers never receive the same member.
    pub async fn pop(&self) -> Result<Option<RequestRecord>, QueueError> {
        let mut conn = self.conn.clone();
        let popped: Vec<(Vec<u8>, f64)> = conn.zpopmin(&self.key, 1).await?;
        match popped.into_iter().next() {
            Some((bytes, _score)) => Ok(Some(RequestRecord::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Number of items currently queued.
    pub async fn len(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        Ok(conn.zcard(&self.key).await?)
    }

    pub async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len().await? == 0)
    }

    /// Delete the underlying Redis key.
    pub async fn clear(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(&self.key).await?;
        Ok(())
    }
}
