//! Bounded retry for upstream HTTP calls.
//!
//! Only transient failures (HTTP 429, any 5xx, connect/timeout errors) are
//! retried. Everything else is handed straight back to the caller.

use std::future::Future;
use std::time::Duration;

use reqwest::{Response, StatusCode};
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `attempt + 1` (zero-based `attempt`).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[must_use]
pub fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("upstream returned {status} after {attempts} attempts")]
    Exhausted { status: StatusCode, attempts: u32 },
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Sends the request produced by `make` until it returns a non-transient
/// response or the attempt budget runs out. Non-transient responses (including
/// 4xx such as 404) are returned as `Ok` for the caller to interpret.
pub async fn send_with_retry<F, Fut>(policy: &RetryPolicy, mut make: F) -> Result<Response, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = reqwest::Result<Response>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let last = attempt >= attempts;

        match make().await {
            Ok(response) if is_transient_status(response.status()) => {
                let status = response.status();
                if last {
                    return Err(RetryError::Exhausted {
                        status,
                        attempts: attempt,
                    });
                }
                debug!("transient upstream status {status}, attempt {attempt}/{attempts}");
            }
            Ok(response) => return Ok(response),
            Err(e) if !last && is_transient_error(&e) => {
                debug!("transient upstream error: {e}, attempt {attempt}/{attempts}");
            }
            Err(e) => return Err(RetryError::Request(e)),
        }

        tokio::time::sleep(policy.backoff(attempt - 1)).await;
    }
}
