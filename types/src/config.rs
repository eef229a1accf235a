//! Admin-owned configuration records.
//!
//! These are produced by the external admin layer and handed to the resolver
//! as read-only snapshots. Nothing in this workspace mutates them.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A filesystem root that file references may read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedDirectory {
    pub path: PathBuf,
    /// When false only direct children of `path` are accepted.
    #[serde(default)]
    pub recursive: bool,
}

impl AllowedDirectory {
    pub fn new(path: impl Into<PathBuf>, recursive: bool) -> Self {
        Self {
            path: path.into(),
            recursive,
        }
    }
}

/// A named value referenced with `@[var:name]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentVariable {
    pub name: String,
    pub value: String,
}

impl PersistentVariable {
    /// Variable names follow the identifier pattern `[A-Za-z_][A-Za-z0-9_]*`.
    #[must_use]
    pub fn is_valid_name(name: &str) -> bool {
        let mut bytes = name.bytes();
        match bytes.next() {
            Some(first) if first.is_ascii_alphabetic() || first == b'_' => {}
            _ => return false,
        }
        bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_')
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    #[default]
    None,
    Basic,
    Token,
    #[serde(alias = "oauth")]
    OAuth2,
}

impl AuthType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            AuthType::None => "none",
            AuthType::Basic => "basic",
            AuthType::Token => "token",
            AuthType::OAuth2 => "oauth2",
        }
    }
}

/// What to do when an endpoint's token bucket is empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitPolicy {
    /// Wait for a token, bounded by `RateLimit::max_wait_ms`.
    #[default]
    Queue,
    /// Fail immediately with `RateLimited`.
    Fail,
}

const fn default_max_wait_ms() -> u64 {
    5_000
}

/// Token-bucket parameters for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Sustained requests per second (bucket refill rate).
    pub requests_per_second: u32,
    /// Bucket capacity. Defaults to `requests_per_second`.
    #[serde(default)]
    pub burst: Option<u32>,
    #[serde(default)]
    pub policy: RateLimitPolicy,
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
}

impl RateLimit {
    #[must_use]
    pub fn per_second(requests_per_second: u32) -> Self {
        Self {
            requests_per_second,
            burst: None,
            policy: RateLimitPolicy::Queue,
            max_wait_ms: default_max_wait_ms(),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.burst.unwrap_or(self.requests_per_second).max(1)
    }

    /// Longest a caller may wait for a token; zero under the fail policy.
    #[must_use]
    pub fn max_wait(&self) -> Duration {
        match self.policy {
            RateLimitPolicy::Queue => Duration::from_millis(self.max_wait_ms),
            RateLimitPolicy::Fail => Duration::ZERO,
        }
    }
}

/// A named REST endpoint referenced with `@[api:name]`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiEndpointConfig {
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub auth_type: AuthType,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
}

impl ApiEndpointConfig {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            auth_type: AuthType::None,
            auth_token: None,
            headers: BTreeMap::new(),
            rate_limit: None,
        }
    }
}

// Manual Debug impl to prevent leaking tokens in logs.
impl fmt::Debug for ApiEndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiEndpointConfig")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("auth_type", &self.auth_type)
            .field(
                "auth_token",
                &self.auth_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("rate_limit", &self.rate_limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variable_name_pattern() {
        assert!(PersistentVariable::is_valid_name("name"));
        assert!(PersistentVariable::is_valid_name("_private1"));
        assert!(!PersistentVariable::is_valid_name("1abc"));
        assert!(!PersistentVariable::is_valid_name("has-dash"));
        assert!(!PersistentVariable::is_valid_name(""));
    }

    #[test]
    fn endpoint_debug_redacts_token() {
        let mut endpoint = ApiEndpointConfig::new("weather", "https://example.com");
        endpoint.auth_token = Some("sk-secret".to_string());
        let debug = format!("{endpoint:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("sk-secret"));
    }

    #[test]
    fn rate_limit_policy_defaults() {
        let limit: RateLimit = serde_json::from_str(
            r#"{"requests_per_second": 2, "policy": "queue", "max_wait_ms": 100}"#,
        )
        .unwrap();
        assert_eq!(limit.capacity(), 2);
        assert_eq!(limit.max_wait(), Duration::from_millis(100));

        let limit: RateLimit =
            serde_json::from_str(r#"{"requests_per_second": 5, "burst": 10, "policy": "fail"}"#)
                .unwrap();
        assert_eq!(limit.capacity(), 10);
        assert_eq!(limit.policy, RateLimitPolicy::Fail);
        assert_eq!(limit.max_wait(), Duration::ZERO);

        let limit: RateLimit = serde_json::from_str(r#"{"requests_per_second": 1}"#).unwrap();
        assert_eq!(limit, RateLimit::per_second(1));
    }

    #[test]
    fn auth_type_accepts_oauth_alias() {
        let auth: AuthType = serde_json::from_str("\"oauth\"").unwrap();
        assert_eq!(auth, AuthType::OAuth2);
        let auth: AuthType = serde_json::from_str("\"oauth2\"").unwrap();
        assert_eq!(auth, AuthType::OAuth2);
    }
}
