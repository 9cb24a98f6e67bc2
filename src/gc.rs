//! The Expiration Watcher (EW): listens for Redis key-expiry notifications
//! and garbage-collects the Payload Store documents those keys stood in
//! for. Grounded in
//! `examples/original_source/zaku/listen_redis_key_gc_mongo.py` —
//! `PSUBSCRIBE __keyevent@{db}__:expired`, a bounded buffer flushed on a
//! size-or-time trigger, and a `bulk_delete` per collection.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::store::{split_expired_key, PayloadStore};

const BUFFER_CAPACITY: usize = 10_000;
const FLUSH_BATCH_SIZE: usize = 1_000;
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);

/// Tracks ephemeral MI keys the broker itself set a TTL on (topic
/// messages), so the watchdog can notice when Redis never actually expires
/// them — almost always because `notify-keyspace-events` isn't enabled.
pub struct MarkerTracker {
    deadlines: Mutex<HashMap<String, Instant>>,
    warned_collections: Mutex<HashSet<String>>,
}

impl MarkerTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(MarkerTracker {
            deadlines: Mutex::new(HashMap::new()),
            warned_collections: Mutex::new(HashSet::new()),
        })
    }

    /// Call right after marking `key` ephemeral with `ttl`. The watchdog
    /// gives it until `2 * ttl` to show up on the expired-keys channel.
    pub fn track(&self, key: &str, ttl: Duration) {
        self.deadlines
            .lock()
            .unwrap()
            .insert(key.to_string(), Instant::now() + ttl * 2);
    }

    /// Call when the expired-keys channel actually reports `key`.
    pub fn observe_expired(&self, key: &str) {
        self.deadlines.lock().unwrap().remove(key);
    }

    /// Drops every marker past its deadline and returns the distinct
    /// collection names newly found overdue (each name is only ever
    /// returned once across the tracker's lifetime).
    pub fn sweep_overdue(&self) -> Vec<String> {
        let now = Instant::now();
        let overdue: Vec<String> = {
            let mut deadlines = self.deadlines.lock().unwrap();
            let overdue: Vec<String> = deadlines
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &overdue {
                deadlines.remove(key);
            }
            overdue
        };

        let mut warned = self.warned_collections.lock().unwrap();
        overdue
            .into_iter()
            .filter_map(|key| split_expired_key(&key))
            .filter_map(|(collection, _id)| warned.insert(collection.clone()).then_some(collection))
            .collect()
    }
}

pub struct ExpirationWatcher {
    client: redis::Client,
    db: i64,
    payloads: Arc<dyn PayloadStore>,
    tracker: Arc<MarkerTracker>,
    overflow_warned: bool,
}

impl ExpirationWatcher {
    pub fn new(
        client: redis::Client,
        db: i64,
        payloads: Arc<dyn PayloadStore>,
    ) -> (Self, Arc<MarkerTracker>) {
        let tracker = MarkerTracker::new();
        let watcher = ExpirationWatcher {
            client,
            db,
            payloads,
            tracker: tracker.clone(),
            overflow_warned: false,
        };
        (watcher, tracker)
    }

    async fn warn_if_keyspace_notifications_missing(&self) {
        let conn = self.client.get_multiplexed_async_connection().await;
        let Ok(mut conn) = conn else {
            tracing::warn!("EW: could not open a connection to check notify-keyspace-events");
            return;
        };

        let result: redis::RedisResult<Vec<String>> = redis::cmd("CONFIG")
            .arg("GET")
            .arg("notify-keyspace-events")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(pair) if pair.get(1).is_some_and(|v| v.contains('x') || v.contains('A')) => {}
            Ok(_) => tracing::warn!(
                "redis notify-keyspace-events is not configured for expired-key events \
                 (need e.g. 'Ex'); garbage collection will not run until this is enabled"
            ),
            Err(err) => {
                tracing::warn!(error = %err, "EW: could not read notify-keyspace-events config")
            }
        }
    }

    async fn flush(&self, buffer: &mut VecDeque<String>) {
        if buffer.is_empty() {
            return;
        }

        let mut grouped: HashMap<String, Vec<String>> = HashMap::new();
        for key in buffer.drain(..) {
            if let Some((collection, id)) = split_expired_key(&key) {
                grouped.entry(collection).or_default().push(id);
            }
        }

        for (collection, ids) in grouped {
            match self.payloads.bulk_delete(&collection, &ids).await {
                Ok(deleted) => {
                    tracing::debug!(%collection, deleted, "GC swept expired payloads")
                }
                Err(err) => {
                    tracing::warn!(%collection, error = %err, "GC bulk_delete failed")
                }
            }
        }
    }

    /// Runs until `shutdown` fires. Intended to be spawned as its own task
    /// by `bin/zaku-broker/main.rs`; a failure here degrades GC, not
    /// request handling, so the caller should log and carry on rather than
    /// treat it as fatal.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        self.warn_if_keyspace_notifications_missing().await;

        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .context("EW: opening redis pubsub connection")?;
        let pattern = format!("__keyevent@{}__:expired", self.db);
        pubsub
            .psubscribe(&pattern)
            .await
            .context("EW: psubscribe on expired-key channel")?;
        let mut messages = pubsub.into_on_message();

        let mut buffer: VecDeque<String> = VecDeque::with_capacity(BUFFER_CAPACITY);
        let mut flush_tick = tokio::time::interval(FLUSH_INTERVAL);
        let mut watchdog_tick = tokio::time::interval(WATCHDOG_INTERVAL);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.flush(&mut buffer).await;
                    return Ok(());
                }
                _ = watchdog_tick.tick() => {
                    for collection in self.tracker.sweep_overdue() {
                        tracing::warn!(
                            %collection,
                            "no expiration event observed for this collection's TTL markers \
                             within twice their TTL; check notify-keyspace-events"
                        );
                    }
                }
                _ = flush_tick.tick() => {
                    self.flush(&mut buffer).await;
                }
                maybe_msg = messages.next() => {
                    let Some(msg) = maybe_msg else {
                        return Ok(());
                    };
                    let Ok(key) = msg.get_payload::<String>() else {
                        continue;
                    };
                    self.tracker.observe_expired(&key);

                    if buffer.len() >= BUFFER_CAPACITY {
                        buffer.pop_front();
                        if !self.overflow_warned {
                            tracing::warn!("EW buffer overflow, dropping oldest expired keys");
                            self.overflow_warned = true;
                        }
                    } else {
                        self.overflow_warned = false;
                    }
                    buffer.push_back(key);

                    if buffer.len() >= FLUSH_BATCH_SIZE {
                        self.flush(&mut buffer).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observed_marker_is_not_overdue() {
        let tracker = MarkerTracker::new();
        tracker.track("prefix:queue:topics:msg-1", Duration::from_millis(1));
        tracker.observe_expired("prefix:queue:topics:msg-1");
        std::thread::sleep(Duration::from_millis(5));
        assert!(tracker.sweep_overdue().is_empty());
    }

    #[test]
    fn unobserved_marker_warns_once_per_collection() {
        let tracker = MarkerTracker::new();
        tracker.track("prefix:queue:topics:msg-1", Duration::from_millis(1));
        tracker.track("prefix:queue:topics:msg-2", Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        let first = tracker.sweep_overdue();
        assert_eq!(first, vec!["prefix_queue_topics".to_string()]);
        // Second message for the same collection is dropped silently, no
        // second warning.
        assert!(tracker.sweep_overdue().is_empty());
    }
}
