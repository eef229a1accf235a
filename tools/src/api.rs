//! `@[api:<endpoint>[/path][?query]]` handler for configured REST endpoints.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use fenceref_types::{ApiEndpointConfig, AuthType, Reference, ReferenceKind, ResolveError};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use url::Url;

use crate::http::{HttpSettings, decode_utf8, into_response, read_body_capped};
use crate::ratelimit::RateLimiter;
use crate::retry::send_paced;
use crate::{HandlerFut, ReferenceHandler, Resolved, Snapshot, fingerprint_of};

/// A reference value resolved against the configured endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiTarget {
    pub endpoint: String,
    pub url: Url,
}

impl ApiTarget {
    /// Accepts `name`, `name/sub/path`, `name/path?k=v`, or an absolute URL
    /// under some endpoint's `base_url`. An empty value selects the default
    /// endpoint when one is configured.
    pub fn parse(value: &str, snapshot: &Snapshot) -> Result<Self, ResolveError> {
        let value = value.trim();
        if value.chars().any(char::is_control) {
            return Err(ResolveError::validation(
                "api reference contains control characters",
            ));
        }

        if value.is_empty() {
            let name = snapshot.default_endpoint.as_deref().ok_or_else(|| {
                ResolveError::validation("api reference names no endpoint and no default is configured")
            })?;
            let endpoint = lookup(snapshot, name)?;
            return Ok(Self {
                endpoint: endpoint.name.clone(),
                url: parse_base(endpoint)?,
            });
        }

        if value.starts_with("http://") || value.starts_with("https://") {
            return Self::parse_absolute(value, snapshot);
        }

        let split = value.find(['/', '?']).unwrap_or(value.len());
        let (name, rest) = value.split_at(split);
        let endpoint = lookup(snapshot, name)?;

        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (rest, None),
        };
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.iter().any(|s| *s == ".." || *s == ".") {
            return Err(ResolveError::validation(format!(
                "api path '{path}' may not contain '.' or '..' segments"
            )));
        }

        let mut url = parse_base(endpoint)?;
        if !segments.is_empty() {
            url.path_segments_mut()
                .map_err(|()| {
                    ResolveError::validation(format!(
                        "endpoint '{}' has a base URL that cannot take a path",
                        endpoint.name
                    ))
                })?
                .pop_if_empty()
                .extend(segments);
        }
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            url.set_query(Some(query));
        }

        Ok(Self {
            endpoint: endpoint.name.clone(),
            url,
        })
    }

    fn parse_absolute(value: &str, snapshot: &Snapshot) -> Result<Self, ResolveError> {
        let url = Url::parse(value)
            .map_err(|e| ResolveError::validation(format!("invalid URL '{value}': {e}")))?;
        let endpoint = snapshot
            .endpoints
            .iter()
            .find(|endpoint| {
                parse_base(endpoint).is_ok_and(|base| is_under_base(url.as_str(), base.as_str()))
            })
            .ok_or_else(|| {
                ResolveError::validation(format!(
                    "URL '{value}' does not belong to any configured endpoint"
                ))
            })?;
        Ok(Self {
            endpoint: endpoint.name.clone(),
            url,
        })
    }
}

fn lookup<'a>(snapshot: &'a Snapshot, name: &str) -> Result<&'a ApiEndpointConfig, ResolveError> {
    snapshot.endpoint(name).ok_or_else(|| ResolveError::NotFound {
        what: "endpoint",
        name: name.to_string(),
    })
}

fn parse_base(endpoint: &ApiEndpointConfig) -> Result<Url, ResolveError> {
    Url::parse(&endpoint.base_url).map_err(|e| {
        ResolveError::validation(format!(
            "endpoint '{}' has an invalid base URL: {e}",
            endpoint.name
        ))
    })
}

fn is_under_base(url: &str, base: &str) -> bool {
    let base = base.trim_end_matches('/');
    url.strip_prefix(base)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'))
}

/// Auth and custom headers for one endpoint.
fn request_headers(endpoint: &ApiEndpointConfig) -> Result<HeaderMap, ResolveError> {
    let mut headers = HeaderMap::new();
    for (name, value) in &endpoint.headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
            ResolveError::validation(format!(
                "endpoint '{}' has an invalid header name '{name}'",
                endpoint.name
            ))
        })?;
        let value = HeaderValue::from_str(value).map_err(|_| {
            ResolveError::validation(format!(
                "endpoint '{}' has an invalid value for header '{name}'",
                endpoint.name
            ))
        })?;
        headers.insert(name, value);
    }

    let credentials = match endpoint.auth_type {
        AuthType::None => None,
        auth => {
            let token = endpoint
                .auth_token
                .as_deref()
                .filter(|t| !t.is_empty())
                .ok_or_else(|| {
                    ResolveError::validation(format!(
                        "endpoint '{}' uses {} auth but has no token",
                        endpoint.name,
                        auth.as_str()
                    ))
                })?;
            Some(match auth {
                AuthType::Basic => format!("Basic {}", BASE64.encode(token)),
                _ => format!("Bearer {token}"),
            })
        }
    };
    if let Some(credentials) = credentials {
        let mut value = HeaderValue::from_str(&credentials).map_err(|_| {
            ResolveError::validation(format!(
                "endpoint '{}' has a token that is not a valid header value",
                endpoint.name
            ))
        })?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }

    Ok(headers)
}

fn render_body(body: String, content_type: &str) -> String {
    if !content_type.contains("json") {
        return body;
    }
    serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|value| serde_json::to_string_pretty(&value).ok())
        .unwrap_or(body)
}

#[derive(Debug)]
pub struct ApiHandler {
    client: reqwest::Client,
    http: HttpSettings,
    ttl: Duration,
    limiter: RateLimiter,
}

impl ApiHandler {
    #[must_use]
    pub fn new(client: reqwest::Client, http: HttpSettings, ttl: Duration) -> Self {
        Self {
            client,
            http,
            ttl,
            limiter: RateLimiter::new(),
        }
    }

    async fn fetch(&self, target: &ApiTarget, endpoint: &ApiEndpointConfig) -> Result<Resolved, ResolveError> {
        let headers = request_headers(endpoint)?;
        let limiter = &self.limiter;
        // Every attempt, retries included, takes a token.
        let pace = || async move {
            match &endpoint.rate_limit {
                Some(limit) => limiter.acquire(&endpoint.name, limit).await,
                None => Ok(()),
            }
        };

        tracing::debug!(endpoint = %endpoint.name, url = %target.url, "Fetching API reference");
        let outcome = send_paced(
            &endpoint.name,
            pace,
            || self.client.get(target.url.clone()).headers(headers.clone()),
            &self.http.retry,
        )
        .await;
        let response = into_response(outcome, &endpoint.name, &self.http).await?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("text/plain")
            .to_string();
        let final_url = response.url().to_string();
        let body = read_body_capped(response, self.http.max_response_bytes, &endpoint.name).await?;
        let byte_length = body.len() as u64;
        let text = decode_utf8(body, &endpoint.name)?;

        let mut resolved = Resolved::text(render_body(text, &content_type), content_type)
            .with_source(final_url);
        resolved.byte_length = byte_length;
        Ok(resolved)
    }
}

impl ReferenceHandler for ApiHandler {
    fn kind(&self) -> ReferenceKind {
        ReferenceKind::Api
    }

    fn validate(&self, reference: &Reference, snapshot: &Snapshot) -> Result<(), ResolveError> {
        let target = ApiTarget::parse(&reference.value, snapshot)?;
        let endpoint = lookup(snapshot, &target.endpoint)?;
        request_headers(endpoint).map(|_| ())
    }

    /// Target URL plus everything about the endpoint that shapes the request.
    fn fingerprint(&self, reference: &Reference, snapshot: &Snapshot) -> Result<String, ResolveError> {
        let target = ApiTarget::parse(&reference.value, snapshot)?;
        let endpoint = lookup(snapshot, &target.endpoint)?;
        request_headers(endpoint)?;

        let mut parts = vec![
            target.url.as_str(),
            endpoint.base_url.as_str(),
            endpoint.auth_type.as_str(),
            endpoint.auth_token.as_deref().unwrap_or_default(),
        ];
        for (name, value) in &endpoint.headers {
            parts.push(name.as_str());
            parts.push(value.as_str());
        }
        Ok(fingerprint_of(parts))
    }

    fn resolve<'a>(&'a self, reference: &'a Reference, snapshot: &'a Snapshot) -> HandlerFut<'a> {
        Box::pin(async move {
            let target = ApiTarget::parse(&reference.value, snapshot)?;
            let endpoint = lookup(snapshot, &target.endpoint)?;
            self.fetch(&target, endpoint).await
        })
    }

    fn cache_ttl(&self) -> Duration {
        self.ttl
    }
}
