//! Status-based retry of whole requests.

use std::future::Future;

use tracing::{debug, warn};

use crate::error::HttpError;
use crate::metrics::RETRIES;
use crate::response::Response;

/// Re-issues a request while the server answers with a retryable status.
///
/// Only statuses are retried. Transport and protocol errors are returned to
/// the caller immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    /// Statuses that trigger another attempt.
    pub retryable_statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            retryable_statuses: vec![429, 529],
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            retryable_statuses: Vec::new(),
        }
    }

    pub fn is_retryable(&self, status: u16) -> bool {
        self.retryable_statuses.contains(&status)
    }

    /// Run `attempt` until it returns a non-retryable status or the retry
    /// budget is spent. `attempt` receives the 0-based attempt number.
    pub async fn run<F, Fut>(&self, mut attempt: F) -> Result<Response, HttpError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Response, HttpError>>,
    {
        let mut n = 0;
        loop {
            let response = attempt(n).await?;
            let status = response.status();
            if !self.is_retryable(status) {
                return Ok(response);
            }
            if n >= self.max_retries {
                warn!(status, attempts = n + 1, "retries exhausted");
                return Ok(response);
            }
            n += 1;
            RETRIES.increment();
            debug!(status, attempt = n, "retrying request");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use bytes::Bytes;

    fn response(status: u16) -> Response {
        Response::new(status, Vec::new(), Bytes::new())
    }

    #[tokio::test]
    async fn retryable_status_gets_one_more_attempt() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let resp = policy
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(response(429)) }
            })
            .await
            .unwrap();
        assert_eq!(resp.status(), 429);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn success_after_retry() {
        let policy = RetryPolicy {
            max_retries: 3,
            ..RetryPolicy::default()
        };
        let resp = policy
            .run(|n| async move { Ok(response(if n < 2 { 529 } else { 200 })) })
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    #[tokio::test]
    async fn errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result = RetryPolicy::default()
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<Response, _>(HttpError::Timeout) }
            })
            .await;
        assert!(matches!(result, Err(HttpError::Timeout)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn other_statuses_returned_directly() {
        let calls = AtomicU32::new(0);
        let resp = RetryPolicy::default()
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(response(500)) }
            })
            .await
            .unwrap();
        assert_eq!(resp.status(), 500);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
