//! Shared retry/backoff helper used by both the MI and PS adapters (spec
//! §4.5, §7): three attempts, exponential backoff starting at 100ms.
//! Grounded in `examples/original_source/zaku/mongo_helpers.py`'s
//! `RobustMongo` methods, which all follow this same
//! try/except-classify/sleep(0.1 * 2**attempt) shape.

use std::future::Future;
use std::time::Duration;

use crate::errors::StoreError;

const BACKOFF_MS: [u64; 3] = [100, 200, 400];

/// Runs `op` until it succeeds, hits a [`StoreError::Fatal`], or exhausts
/// the backoff schedule. Fatal errors are never retried.
pub async fn with_backoff<T, F, Fut>(mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) => {
                if attempt >= BACKOFF_MS.len() {
                    return Err(err);
                }
                tokio::time::sleep(Duration::from_millis(BACKOFF_MS[attempt])).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn succeeds_without_retry() {
        let calls = AtomicUsize::new(0);
        let result = with_backoff(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, StoreError>(42) }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicUsize::new(0);
        let result = with_backoff(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(StoreError::Transient("timeout".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn never_retries_fatal() {
        let calls = AtomicUsize::new(0);
        let result: Result<i32, _> = with_backoff(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Fatal("bad auth".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_exhausting_schedule() {
        let calls = AtomicUsize::new(0);
        let result: Result<i32, _> = with_backoff(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Transient("still down".into())) }
        })
        .await;
        assert!(result.is_err());
        // initial attempt + 3 retries
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
