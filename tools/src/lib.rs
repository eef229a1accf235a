//! Reference handlers for fenceref.
//!
//! Each [`ReferenceKind`] has exactly one handler behind the shared
//! [`ReferenceHandler`] interface. The [`HandlerRegistry`] is the single
//! dispatch point used by the resolver.
//!
//! Handlers never mutate admin-owned configuration: directories, variables,
//! endpoints and the GitHub token arrive as a read-only [`Snapshot`] per call.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fenceref_types::{
    AllowedDirectory, ApiEndpointConfig, Reference, ReferenceKind, ResolveError,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

mod api;
mod file;
mod github;
mod http;
mod ratelimit;
mod retry;
mod sandbox;
mod variable;

pub use api::{ApiHandler, ApiTarget};
pub use file::{DIRECTORY_LISTING_CONTENT_TYPE, FileHandler, FileSettings, MAX_LISTING_ENTRIES};
pub use github::{GitHubHandler, GitHubSettings, format_issue};
pub use http::HttpSettings;
pub use ratelimit::RateLimiter;
pub use retry::{
    RetryConfig, RetryOutcome, calculate_retry_delay, parse_retry_after, send_paced,
    send_with_retry, should_retry,
};
pub use sandbox::{DEFAULT_DENY_PATTERNS, DenyList, PathValidator, ValidatedPath, default_deny_patterns};
pub use variable::VariableHandler;

/// Handler future type alias.
pub type HandlerFut<'a> = Pin<Box<dyn Future<Output = Result<Resolved, ResolveError>> + Send + 'a>>;

/// Content produced by a handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolved {
    pub content: String,
    pub content_type: String,
    pub fetched_at: SystemTime,
    pub byte_length: u64,
    /// Canonical path or final URL the content came from.
    #[serde(default)]
    pub source: Option<String>,
}

impl Resolved {
    pub fn text(content: impl Into<String>, content_type: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            byte_length: content.len() as u64,
            content,
            content_type: content_type.into(),
            fetched_at: SystemTime::now(),
            source: None,
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// One backend for one reference kind.
pub trait ReferenceHandler: Send + Sync {
    fn kind(&self) -> ReferenceKind;

    /// Syntactic and configuration checks that need no IO.
    fn validate(&self, reference: &Reference, snapshot: &Snapshot) -> Result<(), ResolveError>;

    fn resolve<'a>(&'a self, reference: &'a Reference, snapshot: &'a Snapshot) -> HandlerFut<'a>;

    /// Identity of the source `reference` reads under `snapshot`.
    ///
    /// Runs before every cache lookup and must include every check
    /// [`validate`](Self::validate) makes. A cached resolution is served only
    /// while its stored fingerprint still matches.
    fn fingerprint(&self, reference: &Reference, snapshot: &Snapshot) -> Result<String, ResolveError> {
        self.validate(reference, snapshot).map(|()| String::new())
    }

    /// How long a successful resolution may be served from cache.
    fn cache_ttl(&self) -> Duration;

    /// User-facing marker text for a failed reference.
    fn describe_error(&self, reference: &Reference, error: &ResolveError) -> String {
        format!("{} could not be resolved: {error}", reference.raw_token)
    }
}

/// Hex SHA-256 over `parts`, each one length-prefixed so boundaries cannot shift.
pub(crate) fn fingerprint_of<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

/// Read-only lookup of persistent variables owned by the admin layer.
pub trait VariableProvider: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
}

impl VariableProvider for BTreeMap<String, String> {
    fn get(&self, name: &str) -> Option<String> {
        BTreeMap::get(self, name).cloned()
    }
}

impl VariableProvider for HashMap<String, String> {
    fn get(&self, name: &str) -> Option<String> {
        HashMap::get(self, name).cloned()
    }
}

/// Admin-owned configuration passed to every resolution.
#[derive(Clone)]
pub struct Snapshot {
    pub directories: Vec<AllowedDirectory>,
    pub variables: Arc<dyn VariableProvider>,
    pub endpoints: Vec<ApiEndpointConfig>,
    pub github_token: Option<String>,
    /// Endpoint used by an empty `@[api:]` reference.
    pub default_endpoint: Option<String>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            directories: Vec::new(),
            variables: Arc::new(BTreeMap::<String, String>::new()),
            endpoints: Vec::new(),
            github_token: None,
            default_endpoint: None,
        }
    }
}

// Manual Debug impl to prevent leaking tokens in logs.
impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("directories", &self.directories)
            .field("endpoints", &self.endpoints)
            .field(
                "github_token",
                &self.github_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("default_endpoint", &self.default_endpoint)
            .finish_non_exhaustive()
    }
}

impl Snapshot {
    #[must_use]
    pub fn with_directory(mut self, directory: AllowedDirectory) -> Self {
        self.directories.push(directory);
        self
    }

    #[must_use]
    pub fn with_variables(mut self, variables: Arc<dyn VariableProvider>) -> Self {
        self.variables = variables;
        self
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: ApiEndpointConfig) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    #[must_use]
    pub fn with_github_token(mut self, token: impl Into<String>) -> Self {
        self.github_token = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_default_endpoint(mut self, name: impl Into<String>) -> Self {
        self.default_endpoint = Some(name.into());
        self
    }

    #[must_use]
    pub fn endpoint(&self, name: &str) -> Option<&ApiEndpointConfig> {
        self.endpoints.iter().find(|e| e.name == name)
    }
}

/// Handlers by kind.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<ReferenceKind, Arc<dyn ReferenceHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.handlers.keys().collect();
        kinds.sort();
        f.debug_struct("HandlerRegistry").field("kinds", &kinds).finish()
    }
}

impl HandlerRegistry {
    /// Registry with the built-in handler for every kind.
    pub fn standard(
        file: FileSettings,
        http: HttpSettings,
        api_ttl: Duration,
        github: GitHubSettings,
        variable_ttl: Duration,
    ) -> Result<Self, ResolveError> {
        let client = http::build_client(&http)?;
        let mut registry = Self::default();
        registry.register(Arc::new(FileHandler::new(file)?));
        registry.register(Arc::new(VariableHandler::new(variable_ttl)));
        registry.register(Arc::new(ApiHandler::new(client.clone(), http.clone(), api_ttl)));
        registry.register(Arc::new(GitHubHandler::new(client, http, github)));
        Ok(registry)
    }

    /// Replaces any handler already registered for the same kind.
    pub fn register(&mut self, handler: Arc<dyn ReferenceHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    #[must_use]
    pub fn get(&self, kind: ReferenceKind) -> Option<&Arc<dyn ReferenceHandler>> {
        self.handlers.get(&kind)
    }
}
