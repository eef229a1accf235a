//! Backoff shared by the remote handlers and the refresh queue.
//!
//! API and GitHub fetches go through [`send_with_retry`]: 408, 429 and 5xx
//! responses and connect/timeout failures are retried with exponential
//! backoff (down-jittered), honouring `Retry-After` when the server sends a
//! short one. Anything else is handed back after the first attempt so the
//! caller can map it to a reference error.

use std::future::Future;
use std::time::Duration;

use fenceref_types::ResolveError;
use reqwest::{RequestBuilder, Response, StatusCode, header::HeaderMap};

/// Longest `Retry-After` the policy will honour.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries (not counting initial request).
    pub max_retries: u32,
    /// Initial backoff delay before first retry.
    pub initial_delay: Duration,
    /// Maximum backoff delay.
    pub max_delay: Duration,
    /// Jitter factor for down-jitter (0.25 = up to 25% reduction).
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter_factor: 0.25,
        }
    }
}

/// Parse `Retry-After` (seconds) or `Retry-After-Ms` headers.
///
/// Returns `Some(duration)` if a valid value is found and `0 < duration < 60s`.
#[must_use]
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    if let Some(val) = headers.get("retry-after-ms")
        && let Ok(s) = val.to_str()
        && let Ok(ms) = s.trim().parse::<f64>()
        && ms.is_finite()
        && ms > 0.0
    {
        let duration = Duration::from_secs_f64(ms / 1000.0);
        if duration < MAX_RETRY_AFTER {
            return Some(duration);
        }
    }

    if let Some(val) = headers.get("retry-after")
        && let Ok(s) = val.to_str()
        && let Ok(secs) = s.trim().parse::<u64>()
    {
        let duration = Duration::from_secs(secs);
        if duration > Duration::ZERO && duration < MAX_RETRY_AFTER {
            return Some(duration);
        }
    }

    None
}

#[must_use]
pub fn should_retry(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 429 | 500..=599)
}

/// Calculate retry delay with exponential backoff and jitter.
///
/// - `backoff_step`: 0 before first retry, 1 before second, etc.
/// - A valid `Retry-After` header takes precedence.
#[must_use]
pub fn calculate_retry_delay(
    backoff_step: u32,
    config: &RetryConfig,
    headers: Option<&HeaderMap>,
) -> Duration {
    if let Some(headers) = headers
        && let Some(delay) = parse_retry_after(headers)
    {
        return delay;
    }

    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(backoff_step as i32);
    let capped = base.min(config.max_delay.as_secs_f64());

    let jitter = 1.0 - rand::random::<f64>() * config.jitter_factor;
    Duration::from_secs_f64(capped * jitter)
}

/// Outcome of a retried request.
///
/// Success and failure are distinct variants so an error response can never
/// be consumed as content by accident.
#[derive(Debug)]
pub enum RetryOutcome {
    /// 2xx response.
    Success(Response),
    /// Non-2xx response, either non-retryable or after exhausting retries.
    HttpError(Response),
    /// Transport failure after exhausting retries (or a non-retryable one).
    ConnectionError {
        attempts: u32,
        source: reqwest::Error,
    },
    /// The pacing gate refused an attempt.
    Throttled(ResolveError),
}

impl RetryOutcome {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Send a request, retrying transient failures. `build_request` runs once per attempt.
pub async fn send_with_retry<F>(service: &str, build_request: F, config: &RetryConfig) -> RetryOutcome
where
    F: Fn() -> RequestBuilder,
{
    send_paced(service, || std::future::ready(Ok(())), build_request, config).await
}

/// [`send_with_retry`] that awaits `pace` before every attempt, retries
/// included. A pacing error ends the loop with [`RetryOutcome::Throttled`].
pub async fn send_paced<P, Fut, F>(
    service: &str,
    pace: P,
    build_request: F,
    config: &RetryConfig,
) -> RetryOutcome
where
    P: Fn() -> Fut,
    Fut: Future<Output = Result<(), ResolveError>>,
    F: Fn() -> RequestBuilder,
{
    let mut attempt: u32 = 0;
    loop {
        let can_retry = attempt < config.max_retries;

        if let Err(e) = pace().await {
            tracing::debug!(service, attempt = attempt + 1, error = %e, "Request attempt throttled");
            return RetryOutcome::Throttled(e);
        }

        match build_request().send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return RetryOutcome::Success(response);
                }
                if !can_retry || !should_retry(status) {
                    return RetryOutcome::HttpError(response);
                }
                let delay = calculate_retry_delay(attempt, config, Some(response.headers()));
                tracing::debug!(
                    service,
                    %status,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis(),
                    "Retrying reference fetch after error status"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if !can_retry || !is_retryable_error(&e) {
                    return RetryOutcome::ConnectionError {
                        attempts: attempt + 1,
                        source: e,
                    };
                }
                let delay = calculate_retry_delay(attempt, config, None);
                tracing::debug!(
                    service,
                    error = %e,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis(),
                    "Retrying reference fetch after transport error"
                );
                tokio::time::sleep(delay).await;
            }
        }

        attempt += 1;
    }
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_connect() || error.is_timeout() || error.is_request()
}
