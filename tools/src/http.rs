//! Shared HTTP plumbing for the API and GitHub handlers.

use std::time::Duration;

use fenceref_types::ResolveError;
use futures_util::StreamExt;
use reqwest::{Response, StatusCode};

use crate::retry::{RetryConfig, RetryOutcome, parse_retry_after};

/// Longest error body excerpt carried into an `HttpStatus` message.
const ERROR_EXCERPT_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub timeout: Duration,
    pub user_agent: String,
    pub max_response_bytes: usize,
    pub retry: RetryConfig,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: format!("fenceref/{}", env!("CARGO_PKG_VERSION")),
            max_response_bytes: 2 * 1024 * 1024,
            retry: RetryConfig::default(),
        }
    }
}

pub(crate) fn build_client(settings: &HttpSettings) -> Result<reqwest::Client, ResolveError> {
    reqwest::Client::builder()
        .user_agent(&settings.user_agent)
        .timeout(settings.timeout)
        .build()
        .map_err(|e| ResolveError::Network {
            service: "http client".to_string(),
            message: format!("failed to build HTTP client: {e}"),
        })
}

/// Turn a retry outcome into a successful response or a typed error.
pub(crate) async fn into_response(
    outcome: RetryOutcome,
    service: &str,
    settings: &HttpSettings,
) -> Result<Response, ResolveError> {
    match outcome {
        RetryOutcome::Success(response) => Ok(response),
        RetryOutcome::HttpError(response) => Err(status_error(response, service).await),
        RetryOutcome::ConnectionError { attempts, source } => {
            tracing::debug!(service, attempts, error = %source, "Request failed after retries");
            Err(transport_error(&source, service, settings.timeout))
        }
        RetryOutcome::Throttled(error) => Err(error),
    }
}

pub(crate) fn transport_error(
    error: &reqwest::Error,
    service: &str,
    timeout: Duration,
) -> ResolveError {
    if error.is_timeout() {
        ResolveError::Timeout {
            operation: format!("request to {service}"),
            after: timeout,
        }
    } else {
        ResolveError::Network {
            service: service.to_string(),
            message: error.to_string(),
        }
    }
}

/// Map a non-2xx response onto the error taxonomy.
pub(crate) async fn status_error(response: Response, service: &str) -> ResolveError {
    let status = response.status();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ResolveError::Auth {
            service: service.to_string(),
            status: status.as_u16(),
        },
        StatusCode::NOT_FOUND => ResolveError::NotFound {
            what: "resource",
            name: response.url().path().to_string(),
        },
        StatusCode::REQUEST_TIMEOUT => ResolveError::Timeout {
            operation: format!("request to {service}"),
            after: Duration::ZERO,
        },
        StatusCode::TOO_MANY_REQUESTS => ResolveError::RateLimited {
            service: service.to_string(),
            retry_after: parse_retry_after(response.headers()),
        },
        _ => {
            let body = response.text().await.unwrap_or_default();
            let excerpt: String = body.trim().chars().take(ERROR_EXCERPT_CHARS).collect();
            let message = if excerpt.is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_string()
            } else {
                excerpt
            };
            ResolveError::HttpStatus {
                service: service.to_string(),
                status: status.as_u16(),
                message,
            }
        }
    }
}

/// Read a response body, failing once it grows past `max_bytes`.
pub(crate) async fn read_body_capped(
    response: Response,
    max_bytes: usize,
    service: &str,
) -> Result<Vec<u8>, ResolveError> {
    let too_large = |size: usize| ResolveError::NotResolvable {
        target: service.to_string(),
        reason: format!("response is {size} bytes, exceeding the {max_bytes} byte limit"),
    };

    if let Some(len) = response.content_length()
        && len > max_bytes as u64
    {
        return Err(too_large(usize::try_from(len).unwrap_or(usize::MAX)));
    }

    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ResolveError::Network {
            service: service.to_string(),
            message: format!("response stream error: {e}"),
        })?;
        if body.len() + chunk.len() > max_bytes {
            return Err(too_large(body.len() + chunk.len()));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

pub(crate) fn decode_utf8(body: Vec<u8>, service: &str) -> Result<String, ResolveError> {
    String::from_utf8(body).map_err(|_| ResolveError::NotResolvable {
        target: service.to_string(),
        reason: "response body is not valid UTF-8 text".to_string(),
    })
}
