//! The Pub-Sub Engine: `publish`/`subscribe_one`/`subscribe_stream`.
//!
//! `publish` tries PS-indirection first — store the payload under a fresh
//! message id, mark that id to expire, and broadcast only the id over the
//! bus — so large payloads don't get replayed to every subscriber's socket
//! buffer. If the Payload Store looks unavailable it falls back to
//! broadcasting the raw payload directly, logging once rather than per
//! message; a background task (wired up in `bin/zaku-broker/main.rs`) flips
//! `ps_available` back once the store recovers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use uuid::Uuid;

use crate::errors::{BrokerError, BrokerResult};
use crate::gc::MarkerTracker;
use crate::store::{MetadataIndex, PayloadStore, PubSubBus};

const TOPIC_MESSAGE_TTL_SECS: u64 = 60;

fn as_uuid_reference(bytes: &[u8]) -> Option<String> {
    if bytes.len() != 36 {
        return None;
    }
    let s = std::str::from_utf8(bytes).ok()?;
    Uuid::parse_str(s).ok()?;
    Some(s.to_string())
}

pub struct PubSubEngine {
    prefix: String,
    bus: Arc<dyn PubSubBus>,
    index: Arc<dyn MetadataIndex>,
    payloads: Arc<dyn PayloadStore>,
    ps_available: Arc<AtomicBool>,
    tracker: Option<Arc<MarkerTracker>>,
}

impl PubSubEngine {
    pub fn new(
        prefix: impl Into<String>,
        bus: Arc<dyn PubSubBus>,
        index: Arc<dyn MetadataIndex>,
        payloads: Arc<dyn PayloadStore>,
    ) -> Self {
        PubSubEngine {
            prefix: prefix.into(),
            bus,
            index,
            payloads,
            ps_available: Arc::new(AtomicBool::new(true)),
            tracker: None,
        }
    }

    /// Wires in the Expiration Watcher's marker tracker, so `publish`'s
    /// TTL-marked topic messages are covered by the "did this ever actually
    /// expire" watchdog.
    pub fn with_marker_tracker(mut self, tracker: Arc<MarkerTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Shared with the background reconnect task that flips this back to
    /// `true` once the Payload Store's health check succeeds again.
    pub fn ps_availability_handle(&self) -> Arc<AtomicBool> {
        self.ps_available.clone()
    }

    fn channel(&self, queue: &str, topic_id: &str) -> String {
        format!("{}:{}.topics:{}", self.prefix, queue, topic_id)
    }

    fn topics_collection(&self, queue: &str) -> String {
        format!("{}_{}_topics", self.prefix, queue)
    }

    fn topic_marker_key(&self, queue: &str, message_id: &str) -> String {
        format!("{}:{}:topics:{}", self.prefix, queue, message_id)
    }

    async fn publish_via_ps(
        &self,
        queue: &str,
        channel: &str,
        payload: &[u8],
    ) -> BrokerResult<u64> {
        let message_id = Uuid::new_v4().to_string();
        self.payloads
            .store(&self.topics_collection(queue), &message_id, payload)
            .await?;
        let marker_key = self.topic_marker_key(queue, &message_id);
        self.index
            .mark_ephemeral(&marker_key, TOPIC_MESSAGE_TTL_SECS)
            .await?;
        if let Some(tracker) = &self.tracker {
            tracker.track(&marker_key, Duration::from_secs(TOPIC_MESSAGE_TTL_SECS));
        }
        Ok(self.bus.publish(channel, message_id.as_bytes()).await?)
    }

    pub async fn publish(&self, queue: &str, topic_id: &str, payload: &[u8]) -> BrokerResult<u64> {
        let channel = self.channel(queue, topic_id);

        if self.ps_available.load(Ordering::Relaxed) {
            match self.publish_via_ps(queue, &channel, payload).await {
                Ok(count) => return Ok(count),
                Err(err) => {
                    self.ps_available.store(false, Ordering::Relaxed);
                    tracing::warn!(
                        %queue, %topic_id, error = %err,
                        "payload store unavailable, falling back to direct publish"
                    );
                }
            }
        }

        Ok(self.bus.publish(&channel, payload).await?)
    }

    async fn dereference(&self, queue: &str, raw: Vec<u8>) -> BrokerResult<Vec<u8>> {
        match as_uuid_reference(&raw) {
            Some(message_id) => {
                let payload = self
                    .payloads
                    .fetch(&self.topics_collection(queue), &message_id)
                    .await?;
                Ok(payload.unwrap_or_default())
            }
            None => Ok(raw),
        }
    }

    /// Waits up to `deadline` for one message, dereferencing it if it's a
    /// PS-indirection id. `DeliveryMiss` covers both "nothing arrived in
    /// time" and "the bus closed the subscription" — both render as an
    /// empty 200 at the HTTP layer.
    pub async fn subscribe_one(
        &self,
        queue: &str,
        topic_id: &str,
        deadline: Duration,
    ) -> BrokerResult<Vec<u8>> {
        let channel = self.channel(queue, topic_id);
        let mut stream = self.bus.subscribe(&channel).await?;

        match tokio::time::timeout(deadline, stream.next()).await {
            Ok(Some(raw)) => self.dereference(queue, raw).await,
            _ => Err(BrokerError::DeliveryMiss),
        }
    }

    /// Streams messages until `deadline` elapses or the caller drops the
    /// stream (e.g. the HTTP client disconnects). Bounded per spec; there's
    /// no separate per-message timeout, only the overall one.
    pub async fn subscribe_stream(
        &self,
        queue: &str,
        topic_id: &str,
        deadline: Duration,
    ) -> BrokerResult<BoxStream<'static, Vec<u8>>> {
        let channel = self.channel(queue, topic_id);
        let raw_stream = self.bus.subscribe(&channel).await?;
        let payloads = self.payloads.clone();
        let topics_collection = self.topics_collection(queue);
        let deadline_at = tokio::time::Instant::now() + deadline;

        let stream = futures::stream::unfold(
            (raw_stream, payloads, topics_collection, deadline_at),
            move |(mut raw_stream, payloads, topics_collection, deadline_at)| async move {
                let remaining = deadline_at.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    return None;
                }

                match tokio::time::timeout(remaining, raw_stream.next()).await {
                    Ok(Some(raw)) => {
                        let payload = match as_uuid_reference(&raw) {
                            Some(message_id) => payloads
                                .fetch(&topics_collection, &message_id)
                                .await
                                .ok()
                                .flatten()
                                .unwrap_or_default(),
                            None => raw,
                        };
                        Some((payload, (raw_stream, payloads, topics_collection, deadline_at)))
                    }
                    _ => None,
                }
            },
        );

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StoreError;
    use crate::store::TakenJob;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    struct FakeBus {
        channels: Mutex<HashMap<String, mpsc::Sender<Vec<u8>>>>,
    }

    impl FakeBus {
        fn new() -> Self {
            FakeBus {
                channels: Mutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl PubSubBus for FakeBus {
        async fn publish(&self, channel: &str, message: &[u8]) -> Result<u64, StoreError> {
            let senders = self.channels.lock().unwrap();
            if let Some(tx) = senders.get(channel) {
                let _ = tx.try_send(message.to_vec());
                Ok(1)
            } else {
                Ok(0)
            }
        }

        async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Vec<u8>>, StoreError> {
            let (tx, rx) = mpsc::channel(16);
            self.channels.lock().unwrap().insert(channel.to_string(), tx);
            Ok(Box::pin(ReceiverStream::new(rx)))
        }
    }

    #[derive(Default)]
    struct NullIndex;

    #[async_trait::async_trait]
    impl MetadataIndex for NullIndex {
        async fn create_queue(&self, _queue: &str) -> Result<(), StoreError> {
            Ok(())
        }
        async fn add_job(&self, _queue: &str, _job_id: &str, _created_ts: f64) -> Result<(), StoreError> {
            Ok(())
        }
        async fn take(&self, _queue: &str) -> Result<Option<TakenJob>, StoreError> {
            Ok(None)
        }
        async fn done(&self, _queue: &str, _job_id: &str) -> Result<(), StoreError> {
            Ok(())
        }
        async fn reset(&self, _queue: &str, _job_id: &str) -> Result<bool, StoreError> {
            Ok(false)
        }
        async fn remove(&self, _queue: &str, _job_id: &str) -> Result<u64, StoreError> {
            Ok(0)
        }
        async fn count_created(&self, _queue: &str) -> Result<Option<u64>, StoreError> {
            Ok(None)
        }
        async fn unstale(&self, _queue: &str, _ttl: Option<f64>) -> Result<u64, StoreError> {
            Ok(0)
        }
        async fn mark_ephemeral(&self, _key: &str, _ttl_secs: u64) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakePayloads {
        data: Mutex<HashMap<(String, String), Vec<u8>>>,
    }

    #[async_trait::async_trait]
    impl PayloadStore for FakePayloads {
        async fn store(&self, collection: &str, id: &str, payload: &[u8]) -> Result<(), StoreError> {
            self.data
                .lock()
                .unwrap()
                .insert((collection.to_string(), id.to_string()), payload.to_vec());
            Ok(())
        }
        async fn fetch(&self, collection: &str, id: &str) -> Result<Option<Vec<u8>>, StoreError> {
            Ok(self
                .data
                .lock()
                .unwrap()
                .get(&(collection.to_string(), id.to_string()))
                .cloned())
        }
        async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
            Ok(self
                .data
                .lock()
                .unwrap()
                .remove(&(collection.to_string(), id.to_string()))
                .is_some())
        }
        async fn bulk_delete(&self, _collection: &str, _ids: &[String]) -> Result<u64, StoreError> {
            Ok(0)
        }
        async fn health_check(&self) -> bool {
            true
        }
    }

    fn engine() -> (PubSubEngine, Arc<FakeBus>) {
        let bus = Arc::new(FakeBus::new());
        let engine = PubSubEngine::new(
            "test-prefix",
            bus.clone(),
            Arc::new(NullIndex),
            Arc::new(FakePayloads::default()),
        );
        (engine, bus)
    }

    #[tokio::test]
    async fn publish_then_subscribe_one_round_trips_via_ps_indirection() {
        let (engine, _bus) = engine();

        let publisher = {
            let engine = &engine;
            async move { engine.publish("render", "progress", b"42%").await.unwrap() }
        };
        let subscriber =
            engine.subscribe_one("render", "progress", Duration::from_millis(200));

        // subscribe first so the channel exists before publish fires.
        let sub_task = tokio::spawn(async move { subscriber.await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        publisher.await;

        let payload = sub_task.await.unwrap().unwrap();
        assert_eq!(payload, b"42%");
    }

    #[tokio::test]
    async fn subscribe_one_times_out_as_delivery_miss() {
        let (engine, _bus) = engine();
        let result = engine
            .subscribe_one("render", "nothing", Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(BrokerError::DeliveryMiss)));
    }

    /// A stream subscriber observes every message published while it's
    /// listening, in publication order.
    #[tokio::test]
    async fn subscribe_stream_observes_messages_in_order() {
        let (engine, _bus) = engine();
        let engine = Arc::new(engine);

        let stream_engine = engine.clone();
        let sub_task = tokio::spawn(async move {
            let stream = stream_engine
                .subscribe_stream("render", "progress", Duration::from_millis(500))
                .await
                .unwrap();
            stream.take(5).collect::<Vec<_>>().await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        for step in 0..5u8 {
            engine
                .publish("render", "progress", &[step])
                .await
                .unwrap();
        }

        let received = sub_task.await.unwrap();
        assert_eq!(received, vec![vec![0], vec![1], vec![2], vec![3], vec![4]]);
    }
}
