//! Request/response bodies for the HTTP API (spec §6's endpoint table) and
//! the msgpack helpers those bodies are carried over. Kept as a thin DTO
//! layer: these types know nothing about the engine or storage layers
//! below them, matching how the teacher's `wire` module only ever dealt in
//! wire-format shapes, never domain state.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateQueueRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddTaskRequest {
    pub queue: String,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub payload: Option<serde_bytes::ByteBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddTaskResponse {
    pub job_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeRequest {
    pub queue: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeResponse {
    pub job_id: String,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountRequest {
    pub queue: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountResponse {
    pub counts: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetRequest {
    pub queue: String,
    pub job_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveRequest {
    pub queue: String,
    pub job_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnstaleRequest {
    pub queue: String,
    #[serde(default)]
    pub ttl: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRequest {
    pub queue: String,
    pub topic_id: String,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub queue: String,
    pub topic_id: String,
    /// Seconds. Callers that omit it get [`DEFAULT_SUBSCRIBE_TIMEOUT_SECS`].
    #[serde(default)]
    pub timeout: Option<f64>,
}

pub const DEFAULT_SUBSCRIBE_TIMEOUT_SECS: f64 = 5.0;

/// One chunk of a `/subscribe_stream` response body. Shared by the server
/// (which encodes a frame per message) and [`crate::client`] (which decodes
/// frames back out of the byte stream as they arrive).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamFrame {
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

/// Packs `value` as a named-field msgpack map, the shape Python's
/// `msgpack.packb(..., use_bin_type=True)` produces for a dict and what the
/// client SDKs on the other end expect.
pub fn to_msgpack<T: Serialize>(value: &T) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec_named(value)
}

pub fn from_msgpack<T: for<'de> Deserialize<'de>>(
    bytes: &[u8],
) -> Result<T, rmp_serde::decode::Error> {
    rmp_serde::from_slice(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_task_round_trips_through_msgpack() {
        let req = AddTaskRequest {
            queue: "render".into(),
            job_id: Some("job-1".into()),
            payload: Some(serde_bytes::ByteBuf::from(vec![1, 2, 3])),
        };
        let bytes = to_msgpack(&req).unwrap();
        let back: AddTaskRequest = from_msgpack(&bytes).unwrap();
        assert_eq!(back.queue, "render");
        assert_eq!(back.job_id.as_deref(), Some("job-1"));
        assert_eq!(back.payload.unwrap().into_vec(), vec![1, 2, 3]);
    }

    #[test]
    fn subscribe_request_defaults_timeout_to_none() {
        let json = r#"{"queue":"render","topic_id":"progress"}"#;
        let req: SubscribeRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.timeout, None);
    }
}
