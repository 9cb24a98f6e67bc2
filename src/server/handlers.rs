//! Axum handlers for the HTTP API (spec §6). msgpack-bodied endpoints take
//! raw `Bytes` and decode by hand since axum has no built-in msgpack
//! extractor; JSON-bodied ones use the regular `Json` extractor.

use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::Serialize;

use crate::errors::{BrokerError, BrokerResult};
use crate::server::state::AppState;
use crate::wire::{
    self, AddTaskRequest, AddTaskResponse, CountRequest, CountResponse, CreateQueueRequest,
    PublishRequest, RemoveRequest, ResetRequest, StreamFrame, SubscribeRequest, TakeRequest,
    TakeResponse, UnstaleRequest,
};

fn decode_msgpack<T: for<'de> serde::Deserialize<'de>>(body: &[u8]) -> BrokerResult<T> {
    wire::from_msgpack(body).map_err(|err| BrokerError::ClientInput(err.to_string()))
}

fn encode_msgpack<T: Serialize>(value: &T) -> BrokerResult<Vec<u8>> {
    wire::to_msgpack(value).map_err(|err| BrokerError::ClientInput(err.to_string()))
}

#[tracing::instrument(skip(state))]
pub async fn create_queue(
    State(state): State<AppState>,
    Json(req): Json<CreateQueueRequest>,
) -> Response {
    match state.jobs.create_queue(&req.name).await {
        Ok(()) => (StatusCode::OK, "OK").into_response(),
        Err(err) => (StatusCode::OK, format!("ERROR: {err}")).into_response(),
    }
}

#[tracing::instrument(skip(state, body))]
pub async fn add_task(State(state): State<AppState>, body: Bytes) -> BrokerResult<Response> {
    let req: AddTaskRequest = decode_msgpack(&body)?;
    let payload = req.payload.map(|b| b.into_vec()).unwrap_or_default();
    let job_id = state.jobs.add(&req.queue, req.job_id, &payload).await?;
    let resp = encode_msgpack(&AddTaskResponse { job_id })?;
    Ok((StatusCode::OK, resp).into_response())
}

#[tracing::instrument(skip(state))]
pub async fn take_task(
    State(state): State<AppState>,
    Json(req): Json<TakeRequest>,
) -> BrokerResult<Response> {
    match state.jobs.take(&req.queue).await? {
        Some((job_id, payload)) => {
            let resp = encode_msgpack(&TakeResponse { job_id, payload })?;
            Ok((StatusCode::OK, resp).into_response())
        }
        None => Ok(StatusCode::OK.into_response()),
    }
}

#[tracing::instrument(skip(state))]
pub async fn count_tasks(
    State(state): State<AppState>,
    Json(req): Json<CountRequest>,
) -> BrokerResult<Response> {
    let counts = state.jobs.count(&req.queue).await?;
    let resp = encode_msgpack(&CountResponse { counts })?;
    Ok((StatusCode::OK, resp).into_response())
}

#[tracing::instrument(skip(state))]
pub async fn reset_task(
    State(state): State<AppState>,
    Json(req): Json<ResetRequest>,
) -> BrokerResult<Response> {
    state.jobs.reset(&req.queue, &req.job_id).await?;
    Ok(StatusCode::OK.into_response())
}

#[tracing::instrument(skip(state))]
pub async fn remove_task(
    State(state): State<AppState>,
    Json(req): Json<RemoveRequest>,
) -> BrokerResult<Response> {
    state.jobs.remove(&req.queue, &req.job_id).await?;
    Ok(StatusCode::OK.into_response())
}

#[tracing::instrument(skip(state))]
pub async fn unstale_tasks(
    State(state): State<AppState>,
    Json(req): Json<UnstaleRequest>,
) -> BrokerResult<Response> {
    state.jobs.unstale(&req.queue, req.ttl).await?;
    Ok(StatusCode::OK.into_response())
}

#[tracing::instrument(skip(state, body))]
pub async fn publish(State(state): State<AppState>, body: Bytes) -> BrokerResult<Response> {
    let req: PublishRequest = decode_msgpack(&body)?;
    let subscriber_count = state
        .pubsub
        .publish(&req.queue, &req.topic_id, &req.payload)
        .await?;
    Ok((StatusCode::OK, subscriber_count.to_string()).into_response())
}

#[tracing::instrument(skip(state))]
pub async fn subscribe_one(
    State(state): State<AppState>,
    Json(req): Json<SubscribeRequest>,
) -> BrokerResult<Response> {
    let timeout = req
        .timeout
        .unwrap_or(wire::DEFAULT_SUBSCRIBE_TIMEOUT_SECS);
    match state
        .pubsub
        .subscribe_one(&req.queue, &req.topic_id, Duration::from_secs_f64(timeout))
        .await
    {
        Ok(payload) => Ok((StatusCode::OK, payload).into_response()),
        Err(BrokerError::DeliveryMiss) => Ok(StatusCode::OK.into_response()),
        Err(other) => Err(other),
    }
}

#[tracing::instrument(skip(state))]
pub async fn subscribe_stream(
    State(state): State<AppState>,
    Json(req): Json<SubscribeRequest>,
) -> BrokerResult<Response> {
    let timeout = req
        .timeout
        .unwrap_or(wire::DEFAULT_SUBSCRIBE_TIMEOUT_SECS);
    let messages = state
        .pubsub
        .subscribe_stream(&req.queue, &req.topic_id, Duration::from_secs_f64(timeout))
        .await?;

    let body_stream = messages.map(|payload| {
        let frame = StreamFrame { payload };
        let bytes = wire::to_msgpack(&frame).unwrap_or_default();
        Ok::<_, std::convert::Infallible>(Bytes::from(bytes))
    });

    let response = Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/octet-stream")
        .body(Body::from_stream(body_stream))
        .expect("building a streamed response from a fixed set of headers cannot fail");
    Ok(response)
}
