//! Crate-wide error kinds, mirroring the error taxonomy the broker is
//! specified against: adapter-level store failures get classified as
//! transient or fatal, and the engine layer turns those (plus request-level
//! problems) into a small set of kinds the HTTP layer knows how to answer.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Errors raised by the MI/PS adapters, before they reach the engine layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Timeout, connection reset, duplicate-key-on-insert: retried by the
    /// adapter's backoff loop, surfaced to the engine only once retries are
    /// exhausted.
    #[error("store temporarily unavailable: {0}")]
    Transient(String),

    /// Authentication failure, index corruption, or anything else that
    /// retrying cannot fix.
    #[error("store failure: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Errors surfaced by the Job Engine / Pub-Sub Engine to the broker server.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Malformed body, missing fields, or an otherwise invalid request.
    #[error("bad request: {0}")]
    ClientInput(String),

    /// The queue's index doesn't exist yet (e.g. `take`/`count` polled
    /// before `create_queue`). Not an error from the client's perspective.
    #[error("queue not ready")]
    NotReady,

    /// A store operation failed after exhausting its retry budget.
    #[error("store unavailable")]
    StoreTransient(#[source] StoreError),

    /// A store operation failed fatally.
    #[error("internal store error")]
    StoreFatal(#[source] StoreError),

    /// `subscribe_one`'s deadline elapsed with nothing delivered. Not an
    /// error — callers treat this the same as an empty 200.
    #[error("no message before deadline")]
    DeliveryMiss,
}

impl From<StoreError> for BrokerError {
    fn from(err: StoreError) -> Self {
        match err {
            e @ StoreError::Transient(_) => BrokerError::StoreTransient(e),
            e @ StoreError::Fatal(_) => BrokerError::StoreFatal(e),
        }
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        match &self {
            BrokerError::ClientInput(reason) => {
                (StatusCode::BAD_REQUEST, reason.clone()).into_response()
            }
            // NotReady and DeliveryMiss are first-class empty results, not
            // errors: an empty 200 is the idiomatic response (spec §7).
            BrokerError::NotReady | BrokerError::DeliveryMiss => {
                StatusCode::OK.into_response()
            }
            BrokerError::StoreTransient(e) => {
                tracing::warn!(error = %e, "store transient error reached handler");
                (StatusCode::SERVICE_UNAVAILABLE, "temporarily unavailable")
                    .into_response()
            }
            BrokerError::StoreFatal(e) => {
                tracing::error!(error = %e, "store fatal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error")
                    .into_response()
            }
        }
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;
