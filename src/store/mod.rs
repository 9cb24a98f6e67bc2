//! Storage-layer seams: the Metadata Index (MI), Payload Store (PS), and
//! Pub/Sub Bus (PSB) abstractions spec.md §2 names. Concrete adapters live
//! in [`mi`] (Redis) and [`ps`] (MongoDB); [`retry`] is the shared backoff
//! helper both adapters use.
//!
//! These are traits — not because multiple backends are expected in
//! production, but so the job/pub-sub engines can be exercised in tests
//! against small in-memory fakes instead of live Redis/Mongo.

pub mod mi;
pub mod ps;
pub mod retry;

use futures::stream::BoxStream;

use crate::errors::StoreError;

/// A job that `take` has just claimed.
#[derive(Debug, Clone, PartialEq)]
pub struct TakenJob {
    pub job_id: String,
    pub grab_ts: f64,
}

#[async_trait::async_trait]
pub trait MetadataIndex: Send + Sync {
    /// Ensures the queue's secondary indices exist. Idempotent.
    async fn create_queue(&self, queue: &str) -> Result<(), StoreError>;

    /// Writes `{created_ts, status: "created"}` under the job's canonical
    /// key and indexes it.
    async fn add_job(&self, queue: &str, job_id: &str, created_ts: f64) -> Result<(), StoreError>;

    /// Atomically claims the oldest `created` job in `queue`, if any.
    async fn take(&self, queue: &str) -> Result<Option<TakenJob>, StoreError>;

    /// Deletes the job's metadata unconditionally.
    async fn done(&self, queue: &str, job_id: &str) -> Result<(), StoreError>;

    /// Returns the job to `created`, dropping `grab_ts`. Returns `false` if
    /// the job did not exist.
    async fn reset(&self, queue: &str, job_id: &str) -> Result<bool, StoreError>;

    /// Deletes one job (`job_id != "*"`) or every job in the queue
    /// (`job_id == "*"`). Returns the number of metadata keys removed.
    async fn remove(&self, queue: &str, job_id: &str) -> Result<u64, StoreError>;

    /// Number of `created` jobs in `queue`, or `None` if the queue's index
    /// doesn't exist (`NotReady`).
    async fn count_created(&self, queue: &str) -> Result<Option<u64>, StoreError>;

    /// Resets every `in_progress` job whose `grab_ts` is older than `ttl`
    /// seconds (or every `in_progress` job, if `ttl` is absent). Returns the
    /// number of jobs reset.
    async fn unstale(&self, queue: &str, ttl: Option<f64>) -> Result<u64, StoreError>;

    /// Marks `key` to expire in `ttl_secs` seconds, so the Expiration
    /// Watcher eventually reclaims whatever payload it corresponds to.
    async fn mark_ephemeral(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError>;
}

#[async_trait::async_trait]
pub trait PubSubBus: Send + Sync {
    /// Publishes `message` on `channel`, returning the number of
    /// subscribers the bus reports (informational only).
    async fn publish(&self, channel: &str, message: &[u8]) -> Result<u64, StoreError>;

    /// Subscribes to `channel`, yielding each message's raw bytes in
    /// publication order until the stream is dropped.
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Vec<u8>>, StoreError>;
}

#[async_trait::async_trait]
pub trait PayloadStore: Send + Sync {
    async fn store(&self, collection: &str, id: &str, payload: &[u8]) -> Result<(), StoreError>;

    async fn fetch(&self, collection: &str, id: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError>;

    /// Deletes every id in `ids` from `collection`. Used by the Expiration
    /// Watcher's batched GC sweeps.
    async fn bulk_delete(&self, collection: &str, ids: &[String]) -> Result<u64, StoreError>;

    /// Non-fatal: a failed health check degrades publish to PSB-direct
    /// fallback rather than aborting startup (spec §4.5).
    async fn health_check(&self) -> bool;
}

/// Converts a Redis key prefix (everything before the final `:segment`)
/// into its corresponding PS collection name, e.g. `"Zaku-task-queues:jobs"`
/// -> `"Zaku-task-queues_jobs"`. Mirrors
/// `listen_redis_key_gc_mongo.py`'s `item.rsplit(":", 1)` grouping.
pub fn key_prefix_to_collection(key_prefix: &str) -> String {
    key_prefix.replace(':', "_")
}

/// Splits an expired MI key into `(collection, id)` for GC, or `None` if the
/// key has no `:` separator (and so isn't one of ours).
pub fn split_expired_key(key: &str) -> Option<(String, String)> {
    let (prefix, id) = key.rsplit_once(':')?;
    Some((key_prefix_to_collection(prefix), id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_key_splits_to_job_collection() {
        let (coll, id) = split_expired_key("Zaku-task-queues:render:job-42").unwrap();
        assert_eq!(coll, "Zaku-task-queues_render");
        assert_eq!(id, "job-42");
    }

    #[test]
    fn topic_marker_key_splits_to_topics_collection() {
        let (coll, id) =
            split_expired_key("Zaku-task-queues:render:topics:msg-7").unwrap();
        assert_eq!(coll, "Zaku-task-queues_render_topics");
        assert_eq!(id, "msg-7");
    }

    #[test]
    fn key_without_separator_is_ignored() {
        assert_eq!(split_expired_key("standalone"), None);
    }
}
