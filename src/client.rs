//! `TaskQ`: the client SDK other services use to talk to a running broker.
//! Grounded in `examples/original_source/zaku/client.py`'s `TaskQ` — same
//! method names, same `pop()`-as-a-scope-guard idiom (there a
//! contextmanager, here a `Drop`-based guard), and the same
//! gather/rpc helpers built entirely out of `add` + `subscribe_one`/
//! `subscribe_stream` rather than any dedicated server endpoint
//! (`examples/original_source/specs/test_gather.py`,
//! `test_server_pubsub_rpc.py`).

use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Buf;
use futures::stream::unfold;
use futures::{Stream, StreamExt};
use uuid::Uuid;

use crate::wire::{
    AddTaskRequest, AddTaskResponse, CountRequest, CountResponse, CreateQueueRequest,
    PublishRequest, RemoveRequest, ResetRequest, StreamFrame, SubscribeRequest, TakeRequest,
    TakeResponse, UnstaleRequest,
};

#[derive(Clone)]
pub struct TaskQ {
    client: reqwest::Client,
    uri: String,
    queue: String,
}

impl TaskQ {
    pub fn new(uri: impl Into<String>, queue: impl Into<String>) -> Self {
        TaskQ {
            client: reqwest::Client::new(),
            uri: uri.into(),
            queue: queue.into(),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.uri.trim_end_matches('/'), path)
    }

    pub async fn init_queue(&self) -> Result<()> {
        let body = CreateQueueRequest {
            name: self.queue.clone(),
        };
        let resp = self
            .client
            .put(self.url("/queues"))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let text = resp.text().await?;
        if text.starts_with("ERROR") {
            anyhow::bail!("create_queue failed: {text}");
        }
        Ok(())
    }

    pub async fn add(&self, job_id: Option<String>, payload: &[u8]) -> Result<String> {
        let body = AddTaskRequest {
            queue: self.queue.clone(),
            job_id,
            payload: if payload.is_empty() {
                None
            } else {
                Some(serde_bytes::ByteBuf::from(payload.to_vec()))
            },
        };
        let bytes = crate::wire::to_msgpack(&body)?;
        let resp = self
            .client
            .put(self.url("/tasks"))
            .body(bytes)
            .send()
            .await?
            .error_for_status()?;
        let bytes = resp.bytes().await?;
        let decoded: AddTaskResponse = crate::wire::from_msgpack(&bytes)?;
        Ok(decoded.job_id)
    }

    pub async fn take(&self) -> Result<Option<(String, Vec<u8>)>> {
        let body = TakeRequest {
            queue: self.queue.clone(),
        };
        let resp = self
            .client
            .post(self.url("/tasks"))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Ok(None);
        }
        let decoded: TakeResponse = crate::wire::from_msgpack(&bytes)?;
        Ok(Some((decoded.job_id, decoded.payload)))
    }

    pub async fn mark_done(&self, job_id: &str) -> Result<()> {
        let body = RemoveRequest {
            queue: self.queue.clone(),
            job_id: job_id.to_string(),
        };
        self.client
            .delete(self.url("/tasks"))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn mark_reset(&self, job_id: &str) -> Result<()> {
        let body = ResetRequest {
            queue: self.queue.clone(),
            job_id: job_id.to_string(),
        };
        self.client
            .post(self.url("/tasks/reset"))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn count(&self) -> Result<Option<u64>> {
        let body = CountRequest {
            queue: self.queue.clone(),
        };
        let resp = self
            .client
            .get(self.url("/tasks/counts"))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Ok(None);
        }
        let decoded: CountResponse = crate::wire::from_msgpack(&bytes)?;
        Ok(Some(decoded.counts))
    }

    pub async fn unstale(&self, ttl: Option<f64>) -> Result<()> {
        let body = UnstaleRequest {
            queue: self.queue.clone(),
            ttl,
        };
        self.client
            .put(self.url("/tasks/unstale"))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn clear_queue(&self) -> Result<()> {
        let body = RemoveRequest {
            queue: self.queue.clone(),
            job_id: "*".to_string(),
        };
        self.client
            .delete(self.url("/tasks"))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn publish(&self, topic_id: &str, payload: &[u8]) -> Result<u64> {
        let body = PublishRequest {
            queue: self.queue.clone(),
            topic_id: topic_id.to_string(),
            payload: payload.to_vec(),
        };
        let bytes = crate::wire::to_msgpack(&body)?;
        let resp = self
            .client
            .put(self.url("/publish"))
            .body(bytes)
            .send()
            .await?
            .error_for_status()?;
        let text = resp.text().await?;
        text.trim().parse().context("parsing subscriber count")
    }

    pub async fn subscribe_one(
        &self,
        topic_id: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>> {
        let body = SubscribeRequest {
            queue: self.queue.clone(),
            topic_id: topic_id.to_string(),
            timeout: Some(timeout.as_secs_f64()),
        };
        let resp = self
            .client
            .post(self.url("/subscribe_one"))
            .json(&body)
            .timeout(timeout + Duration::from_secs(5))
            .send()
            .await?
            .error_for_status()?;
        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            Ok(None)
        } else {
            Ok(Some(bytes.to_vec()))
        }
    }

    /// Streams messages off `/subscribe_stream`, decoding each msgpack
    /// frame as it arrives off the wire rather than waiting for the whole
    /// body.
    pub async fn subscribe_stream(
        &self,
        topic_id: &str,
        timeout: Duration,
    ) -> Result<impl Stream<Item = Result<Vec<u8>>>> {
        let body = SubscribeRequest {
            queue: self.queue.clone(),
            topic_id: topic_id.to_string(),
            timeout: Some(timeout.as_secs_f64()),
        };
        let resp = self
            .client
            .post(self.url("/subscribe_stream"))
            .json(&body)
            .timeout(timeout + Duration::from_secs(5))
            .send()
            .await?
            .error_for_status()?;

        let byte_stream = resp.bytes_stream();
        let buffer = bytes::BytesMut::new();

        Ok(unfold((byte_stream, buffer), |(mut byte_stream, mut buffer)| async move {
            loop {
                if let Some(frame) = try_decode_frame(&mut buffer) {
                    return Some((Ok(frame), (byte_stream, buffer)));
                }
                match byte_stream.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                    Some(Err(err)) => return Some((Err(err.into()), (byte_stream, buffer))),
                    None => return None,
                }
            }
        }))
    }

    pub async fn pop(&self) -> Result<Option<PoppedJob>> {
        match self.take().await? {
            Some((job_id, payload)) => Ok(Some(PoppedJob {
                task_queue: self.clone(),
                job_id,
                payload,
                settled: false,
            })),
            None => Ok(None),
        }
    }

    /// Submits `jobs` (arbitrary msgpack-able maps) to this queue, stamping
    /// each with `_gather_id`/`_gather_token` so a worker's completion
    /// fans back in on a dedicated, throwaway gather queue.
    pub async fn gather(&self, jobs: Vec<serde_json::Value>) -> Result<GatherHandle> {
        let gather_queue_name = format!("{}-gather-{}", self.queue, Uuid::new_v4());
        let gather_queue = TaskQ::new(self.uri.clone(), gather_queue_name.clone());
        gather_queue.init_queue().await?;

        let mut tokens = Vec::with_capacity(jobs.len());
        for mut job in jobs {
            let token = Uuid::new_v4().to_string();
            if let serde_json::Value::Object(ref mut map) = job {
                map.insert("_gather_id".into(), gather_queue_name.clone().into());
                map.insert("_gather_token".into(), token.clone().into());
            }
            let bytes = crate::wire::to_msgpack(&job)?;
            self.add(None, &bytes).await?;
            tokens.push(token);
        }

        Ok(GatherHandle {
            task_queue: gather_queue,
            pending_tokens: tokens,
        })
    }

    /// Submits one job carrying a fresh `_request_id` topic name, then
    /// waits for the worker's reply on that topic.
    pub async fn rpc(&self, mut args: serde_json::Value, timeout: Duration) -> Result<Vec<u8>> {
        let request_id = Uuid::new_v4().to_string();
        if let serde_json::Value::Object(ref mut map) = args {
            map.insert("_request_id".into(), request_id.clone().into());
        }
        let bytes = crate::wire::to_msgpack(&args)?;
        self.add(None, &bytes).await?;
        self.subscribe_one(&request_id, timeout)
            .await?
            .context("rpc call timed out with no reply")
    }

    /// Like [`TaskQ::rpc`] but for a worker that streams multiple replies
    /// on the same topic (e.g. progress updates followed by a final
    /// result).
    pub async fn rpc_stream(
        &self,
        mut args: serde_json::Value,
        timeout: Duration,
    ) -> Result<impl Stream<Item = Result<Vec<u8>>>> {
        let request_id = Uuid::new_v4().to_string();
        if let serde_json::Value::Object(ref mut map) = args {
            map.insert("_request_id".into(), request_id.clone().into());
        }
        let bytes = crate::wire::to_msgpack(&args)?;
        self.add(None, &bytes).await?;
        self.subscribe_stream(&request_id, timeout).await
    }
}

fn try_decode_frame(buffer: &mut bytes::BytesMut) -> Option<Vec<u8>> {
    let mut cursor = std::io::Cursor::new(&buffer[..]);
    match rmp_serde::from_read::<_, StreamFrame>(&mut cursor) {
        Ok(frame) => {
            let consumed = cursor.position() as usize;
            buffer.advance(consumed);
            Some(frame.payload)
        }
        Err(_) => None,
    }
}

/// A job claimed by [`TaskQ::pop`]. Call [`PoppedJob::done`] or
/// [`PoppedJob::reset`] explicitly; if the guard is dropped without either,
/// it best-effort fires an async `reset` so a worker that panics mid-job
/// doesn't strand it as permanently `in_progress`.
pub struct PoppedJob {
    task_queue: TaskQ,
    job_id: String,
    payload: Vec<u8>,
    settled: bool,
}

impl PoppedJob {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub async fn done(mut self) -> Result<()> {
        self.settled = true;
        self.task_queue.mark_done(&self.job_id).await
    }

    pub async fn reset(mut self) -> Result<()> {
        self.settled = true;
        self.task_queue.mark_reset(&self.job_id).await
    }
}

impl Drop for PoppedJob {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let task_queue = self.task_queue.clone();
        let job_id = self.job_id.clone();
        tokio::spawn(async move {
            if let Err(err) = task_queue.mark_reset(&job_id).await {
                tracing::warn!(%job_id, error = %err, "best-effort reset on drop failed");
            }
        });
    }
}

/// Handle returned by [`TaskQ::gather`]; polls the throwaway gather queue
/// until every dispatched job's token has come back.
pub struct GatherHandle {
    task_queue: TaskQ,
    pending_tokens: Vec<String>,
}

impl GatherHandle {
    /// Drains whatever acknowledgements are currently queued and reports
    /// whether every token has now been seen.
    pub async fn is_done(&mut self) -> Result<bool> {
        while let Some((job_id, payload)) = self.task_queue.take().await? {
            if let Ok(serde_json::Value::Object(map)) =
                rmp_serde::from_slice::<serde_json::Value>(&payload)
            {
                if let Some(token) = map.get("_gather_token").and_then(|v| v.as_str()) {
                    self.pending_tokens.retain(|t| t != token);
                }
            }
            self.task_queue.mark_done(&job_id).await?;
        }
        Ok(self.pending_tokens.is_empty())
    }

    /// Polls every `poll_interval` until every worker has acknowledged or
    /// `deadline` elapses.
    pub async fn wait(&mut self, poll_interval: Duration, deadline: Duration) -> Result<bool> {
        let start = tokio::time::Instant::now();
        loop {
            if self.is_done().await? {
                return Ok(true);
            }
            if start.elapsed() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}
