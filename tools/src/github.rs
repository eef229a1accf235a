//! `@[github:issue:<owner>/<repo>#<number>]` handler.
//!
//! Tracks the `x-ratelimit-*` headers GitHub returns on every response. Once
//! the window is exhausted, requests wait for the reset if it is close enough
//! and fail with `RateLimited` otherwise.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fenceref_types::{GitHubIssueRef, Reference, ReferenceKind, ResolveError};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue};
use serde::Deserialize;

use crate::http::{HttpSettings, read_body_capped, status_error, transport_error};
use crate::retry::{RetryOutcome, send_with_retry};
use crate::{HandlerFut, ReferenceHandler, Resolved, Snapshot, fingerprint_of};

const SERVICE: &str = "github";
const API_VERSION: &str = "2022-11-28";

#[derive(Debug, Clone)]
pub struct GitHubSettings {
    pub api_base: String,
    /// Longest wait for a rate-limit reset before failing instead.
    pub max_reset_wait: Duration,
    pub ttl: Duration,
}

impl Default for GitHubSettings {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".to_string(),
            max_reset_wait: Duration::from_secs(60),
            ttl: Duration::from_secs(900),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IssuePayload {
    title: String,
    state: String,
    #[serde(default)]
    body: Option<String>,
}

/// Content block for one issue.
#[must_use]
pub fn format_issue(number: u64, title: &str, state: &str, body: &str) -> String {
    format!("Issue #{number}: {title}\nState: {state}\n\n{body}")
}

/// Last rate-limit window reported by GitHub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RateWindow {
    remaining: u32,
    reset_at: SystemTime,
}

impl RateWindow {
    fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let remaining = header_number(headers, "x-ratelimit-remaining")?;
        let reset = header_number(headers, "x-ratelimit-reset")?;
        Some(Self {
            remaining: u32::try_from(remaining).unwrap_or(u32::MAX),
            reset_at: UNIX_EPOCH + Duration::from_secs(reset),
        })
    }

    /// How long to wait before the next request, or the error to return.
    fn gate(self, now: SystemTime, max_wait: Duration) -> Result<Option<Duration>, ResolveError> {
        if self.remaining > 0 {
            return Ok(None);
        }
        let Ok(wait) = self.reset_at.duration_since(now) else {
            return Ok(None);
        };
        if wait > max_wait {
            return Err(ResolveError::RateLimited {
                service: SERVICE.to_string(),
                retry_after: Some(wait),
            });
        }
        Ok(Some(wait))
    }
}

fn header_number(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

#[derive(Debug)]
pub struct GitHubHandler {
    client: reqwest::Client,
    http: HttpSettings,
    settings: GitHubSettings,
    window: Mutex<Option<RateWindow>>,
}

impl GitHubHandler {
    #[must_use]
    pub fn new(client: reqwest::Client, http: HttpSettings, settings: GitHubSettings) -> Self {
        Self {
            client,
            http,
            settings,
            window: Mutex::new(None),
        }
    }

    fn parse(reference: &Reference) -> Result<GitHubIssueRef, ResolveError> {
        GitHubIssueRef::parse(&reference.value).ok_or_else(|| {
            ResolveError::validation(format!(
                "'{}' is not of the form issue:<owner>/<repo>#<number>",
                reference.value.trim()
            ))
        })
    }

    async fn wait_for_window(&self) -> Result<(), ResolveError> {
        let window = *self.window.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(window) = window else {
            return Ok(());
        };
        if let Some(wait) = window.gate(SystemTime::now(), self.settings.max_reset_wait)? {
            tracing::info!(
                wait_ms = wait.as_millis(),
                "GitHub rate limit exhausted; waiting for reset"
            );
            tokio::time::sleep(wait).await;
        }
        Ok(())
    }

    fn record_window(&self, headers: &HeaderMap) {
        if let Some(window) = RateWindow::from_headers(headers) {
            tracing::debug!(remaining = window.remaining, "GitHub rate limit window");
            *self.window.lock().unwrap_or_else(PoisonError::into_inner) = Some(window);
        }
    }

    fn headers(token: Option<&str>) -> Result<HeaderMap, ResolveError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert("x-github-api-version", HeaderValue::from_static(API_VERSION));
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| ResolveError::validation("GitHub token is not a valid header value"))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }

    async fn fetch_issue(
        &self,
        issue: &GitHubIssueRef,
        token: Option<&str>,
    ) -> Result<Resolved, ResolveError> {
        let headers = Self::headers(token)?;
        self.wait_for_window().await?;

        let url = format!(
            "{}/repos/{}/{}/issues/{}",
            self.settings.api_base.trim_end_matches('/'),
            issue.owner,
            issue.repo,
            issue.number
        );
        tracing::debug!(%url, "Fetching GitHub issue");

        let outcome = send_with_retry(
            SERVICE,
            || self.client.get(&url).headers(headers.clone()),
            &self.http.retry,
        )
        .await;

        let response = match outcome {
            RetryOutcome::Success(response) => response,
            RetryOutcome::HttpError(response) => {
                self.record_window(response.headers());
                return Err(self.issue_error(response, issue).await);
            }
            RetryOutcome::ConnectionError { attempts, source } => {
                tracing::debug!(attempts, error = %source, "GitHub request failed after retries");
                return Err(transport_error(&source, SERVICE, self.http.timeout));
            }
            RetryOutcome::Throttled(error) => return Err(error),
        };
        self.record_window(response.headers());

        let body = read_body_capped(response, self.http.max_response_bytes, SERVICE).await?;
        let byte_length = body.len() as u64;
        let payload: IssuePayload =
            serde_json::from_slice(&body).map_err(|e| ResolveError::NotResolvable {
                target: issue.to_reference_value(),
                reason: format!("unexpected GitHub response: {e}"),
            })?;

        let content = format_issue(
            issue.number,
            &payload.title,
            &payload.state,
            payload.body.as_deref().unwrap_or_default(),
        );
        let mut resolved = Resolved::text(content, "text/markdown").with_source(url);
        resolved.byte_length = byte_length;
        Ok(resolved)
    }

    async fn issue_error(&self, response: reqwest::Response, issue: &GitHubIssueRef) -> ResolveError {
        let status = response.status();
        // GitHub reports an exhausted window as 403 with zero remaining.
        let exhausted = RateWindow::from_headers(response.headers())
            .filter(|w| w.remaining == 0)
            .map(|w| w.reset_at.duration_since(SystemTime::now()).ok());
        match (status, exhausted) {
            (StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS, Some(retry_after)) => {
                ResolveError::RateLimited {
                    service: SERVICE.to_string(),
                    retry_after,
                }
            }
            (StatusCode::NOT_FOUND, _) => ResolveError::NotFound {
                what: "issue",
                name: format!("{}/{}#{}", issue.owner, issue.repo, issue.number),
            },
            _ => status_error(response, SERVICE).await,
        }
    }
}

impl ReferenceHandler for GitHubHandler {
    fn kind(&self) -> ReferenceKind {
        ReferenceKind::GitHubIssue
    }

    fn validate(&self, reference: &Reference, _snapshot: &Snapshot) -> Result<(), ResolveError> {
        Self::parse(reference).map(|_| ())
    }

    /// API host plus the token in use; private issues are only visible to their token.
    fn fingerprint(&self, reference: &Reference, snapshot: &Snapshot) -> Result<String, ResolveError> {
        Self::parse(reference)?;
        Ok(fingerprint_of([
            self.settings.api_base.as_str(),
            snapshot.github_token.as_deref().unwrap_or_default(),
        ]))
    }

    fn resolve<'a>(&'a self, reference: &'a Reference, snapshot: &'a Snapshot) -> HandlerFut<'a> {
        Box::pin(async move {
            let issue = Self::parse(reference)?;
            self.fetch_issue(&issue, snapshot.github_token.as_deref())
                .await
        })
    }

    fn cache_ttl(&self) -> Duration {
        self.settings.ttl
    }
}
