//! The Job Engine: combines the Metadata Index and Payload Store into the
//! job lifecycle operations. Neither store call is transactional with the
//! other, so a job can transiently exist in one store without the other;
//! `take` tolerates a missing payload as an empty one, and payloads orphaned
//! by `done`/`remove` are reconciled by the Expiration Watcher rather than
//! blocked on here.

use std::sync::Arc;

use uuid::Uuid;

use crate::errors::{BrokerError, BrokerResult};
use crate::store::mi::now_secs;
use crate::store::{MetadataIndex, PayloadStore};

pub struct JobEngine {
    prefix: String,
    index: Arc<dyn MetadataIndex>,
    payloads: Arc<dyn PayloadStore>,
}

impl JobEngine {
    pub fn new(
        prefix: impl Into<String>,
        index: Arc<dyn MetadataIndex>,
        payloads: Arc<dyn PayloadStore>,
    ) -> Self {
        JobEngine {
            prefix: prefix.into(),
            index,
            payloads,
        }
    }

    fn collection(&self, queue: &str) -> String {
        format!("{}_{}", self.prefix, queue)
    }

    pub async fn create_queue(&self, queue: &str) -> BrokerResult<()> {
        self.index.create_queue(queue).await?;
        Ok(())
    }

    /// Mints a job id when the caller doesn't supply one, indexes it, and
    /// stores the payload if non-empty (an empty payload is a valid job
    /// with no body, not something to store).
    pub async fn add(
        &self,
        queue: &str,
        job_id: Option<String>,
        payload: &[u8],
    ) -> BrokerResult<String> {
        let job_id = job_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        self.index.add_job(queue, &job_id, now_secs()).await?;
        if !payload.is_empty() {
            self.payloads
                .store(&self.collection(queue), &job_id, payload)
                .await?;
        }
        Ok(job_id)
    }

    pub async fn take(&self, queue: &str) -> BrokerResult<Option<(String, Vec<u8>)>> {
        let Some(taken) = self.index.take(queue).await? else {
            return Ok(None);
        };
        let payload = self
            .payloads
            .fetch(&self.collection(queue), &taken.job_id)
            .await?
            .unwrap_or_default();
        Ok(Some((taken.job_id, payload)))
    }

    pub async fn done(&self, queue: &str, job_id: &str) -> BrokerResult<()> {
        self.index.done(queue, job_id).await?;
        if let Err(err) = self.payloads.delete(&self.collection(queue), job_id).await {
            tracing::warn!(%queue, %job_id, error = %err, "payload delete failed after done(); left for GC");
        }
        Ok(())
    }

    pub async fn reset(&self, queue: &str, job_id: &str) -> BrokerResult<bool> {
        Ok(self.index.reset(queue, job_id).await?)
    }

    pub async fn remove(&self, queue: &str, job_id: &str) -> BrokerResult<u64> {
        let removed = self.index.remove(queue, job_id).await?;
        if job_id != "*" {
            if let Err(err) = self.payloads.delete(&self.collection(queue), job_id).await {
                tracing::warn!(%queue, %job_id, error = %err, "payload delete failed after remove(); left for GC");
            }
        }
        // job_id == "*": payload cleanup is deferred to the Expiration
        // Watcher rather than fanning out a delete per removed id here.
        Ok(removed)
    }

    pub async fn count(&self, queue: &str) -> BrokerResult<u64> {
        match self.index.count_created(queue).await? {
            Some(n) => Ok(n),
            None => Err(BrokerError::NotReady),
        }
    }

    pub async fn unstale(&self, queue: &str, ttl: Option<f64>) -> BrokerResult<u64> {
        Ok(self.index.unstale(queue, ttl).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TakenJob;
    use crate::errors::StoreError;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeIndex {
        queues: Mutex<HashSet<String>>,
        created: Mutex<HashMap<String, Vec<(String, f64)>>>,
        grabbed: Mutex<HashMap<String, Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl MetadataIndex for FakeIndex {
        async fn create_queue(&self, queue: &str) -> Result<(), StoreError> {
            self.queues.lock().unwrap().insert(queue.to_string());
            Ok(())
        }

        async fn add_job(&self, queue: &str, job_id: &str, created_ts: f64) -> Result<(), StoreError> {
            self.created
                .lock()
                .unwrap()
                .entry(queue.to_string())
                .or_default()
                .push((job_id.to_string(), created_ts));
            Ok(())
        }

        async fn take(&self, queue: &str) -> Result<Option<TakenJob>, StoreError> {
            let mut created = self.created.lock().unwrap();
            let Some(list) = created.get_mut(queue) else {
                return Ok(None);
            };
            if list.is_empty() {
                return Ok(None);
            }
            let (job_id, _) = list.remove(0);
            self.grabbed
                .lock()
                .unwrap()
                .entry(queue.to_string())
                .or_default()
                .push(job_id.clone());
            Ok(Some(TakenJob { job_id, grab_ts: 0.0 }))
        }

        async fn done(&self, queue: &str, job_id: &str) -> Result<(), StoreError> {
            if let Some(list) = self.grabbed.lock().unwrap().get_mut(queue) {
                list.retain(|id| id != job_id);
            }
            Ok(())
        }

        async fn reset(&self, queue: &str, job_id: &str) -> Result<bool, StoreError> {
            let mut grabbed = self.grabbed.lock().unwrap();
            let Some(list) = grabbed.get_mut(queue) else {
                return Ok(false);
            };
            if let Some(pos) = list.iter().position(|id| id == job_id) {
                list.remove(pos);
                drop(grabbed);
                self.created
                    .lock()
                    .unwrap()
                    .entry(queue.to_string())
                    .or_default()
                    .push((job_id.to_string(), 0.0));
                Ok(true)
            } else {
                Ok(false)
            }
        }

        async fn remove(&self, queue: &str, job_id: &str) -> Result<u64, StoreError> {
            if job_id == "*" {
                let n = self.created.lock().unwrap().remove(queue).map(|v| v.len()).unwrap_or(0)
                    + self.grabbed.lock().unwrap().remove(queue).map(|v| v.len()).unwrap_or(0);
                Ok(n as u64)
            } else {
                let mut removed = 0u64;
                if let Some(list) = self.created.lock().unwrap().get_mut(queue) {
                    let before = list.len();
                    list.retain(|(id, _)| id != job_id);
                    removed += (before - list.len()) as u64;
                }
                if let Some(list) = self.grabbed.lock().unwrap().get_mut(queue) {
                    let before = list.len();
                    list.retain(|id| id != job_id);
                    removed += (before - list.len()) as u64;
                }
                Ok(removed)
            }
        }

        async fn count_created(&self, queue: &str) -> Result<Option<u64>, StoreError> {
            if !self.queues.lock().unwrap().contains(queue) {
                return Ok(None);
            }
            Ok(Some(
                self.created.lock().unwrap().get(queue).map(|v| v.len()).unwrap_or(0) as u64,
            ))
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

        async fn bulk_delete(&self, collection: &str, ids: &[String]) -> Result<u64, StoreError> {
            let mut data = self.data.lock().unwrap();
            let mut n = 0u64;
            for id in ids {
                if data.remove(&(collection.to_string(), id.clone())).is_some() {
                    n += 1;
                }
            }
            Ok(n)
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    fn engine() -> JobEngine {
        JobEngine::new(
            "test-prefix",
            Arc::new(FakeIndex::default()),
            Arc::new(FakePayloads::default()),
        )
    }

    #[tokio::test]
    async fn add_then_take_round_trips_payload() {
        let engine = engine();
        engine.create_queue("render").await.unwrap();
        let id = engine.add("render", None, b"hello").await.unwrap();
        let (taken_id, payload) = engine.take("render").await.unwrap().unwrap();
        assert_eq!(taken_id, id);
        assert_eq!(payload, b"hello");
    }

    #[tokio::test]
    async fn take_on_empty_queue_is_none() {
        let engine = engine();
        engine.create_queue("render").await.unwrap();
        assert!(engine.take("render").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn count_before_create_queue_is_not_ready() {
        let engine = engine();
        let err = engine.count("render").await.unwrap_err();
        assert!(matches!(err, BrokerError::NotReady));
    }

    #[tokio::test]
    async fn reset_returns_job_to_created() {
        let engine = engine();
        engine.create_queue("render").await.unwrap();
        let id = engine.add("render", None, b"").await.unwrap();
        let (taken_id, _) = engine.take("render").await.unwrap().unwrap();
        assert_eq!(taken_id, id);
        assert!(engine.reset("render", &id).await.unwrap());
        assert_eq!(engine.count("render").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn done_removes_job_and_payload() {
        let engine = engine();
        engine.create_queue("render").await.unwrap();
        let id = engine.add("render", None, b"payload").await.unwrap();
        let (taken_id, _) = engine.take("render").await.unwrap().unwrap();
        engine.done("render", &taken_id).await.unwrap();
        let collection = engine.collection("render");
        assert_eq!(engine.payloads.fetch(&collection, &id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn remove_star_clears_queue() {
        let engine = engine();
        engine.create_queue("render").await.unwrap();
        engine.add("render", None, b"a").await.unwrap();
        engine.add("render", None, b"b").await.unwrap();
        let removed = engine.remove("render", "*").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(engine.count("render").await.unwrap(), 0);
    }

    /// Two consumers draining the same queue concurrently never observe the
    /// same job twice, and together see every payload exactly once.
    #[tokio::test]
    async fn concurrent_consumers_never_duplicate_a_job() {
        let engine = Arc::new(engine());
        engine.create_queue("render").await.unwrap();
        for payload in [b"0", b"1", b"2", b"3", b"4"] {
            engine.add("render", None, payload).await.unwrap();
        }

        async fn drain(engine: Arc<JobEngine>) -> Vec<Vec<u8>> {
            let mut seen = Vec::new();
            while let Some((job_id, payload)) = engine.take("render").await.unwrap() {
                engine.done("render", &job_id).await.unwrap();
                seen.push(payload);
            }
            seen
        }

        let (a, b) = tokio::join!(drain(engine.clone()), drain(engine.clone()));
        let mut all: Vec<_> = a.into_iter().chain(b).collect();
        all.sort();
        assert_eq!(
            all,
            vec![
                b"0".to_vec(),
                b"1".to_vec(),
                b"2".to_vec(),
                b"3".to_vec(),
                b"4".to_vec(),
            ]
        );
    }
}
