//! `~/.fenceref/config.toml` loading.
//!
//! Every section is optional. Secrets may be written as `${ENV_VAR}` and are
//! expanded once at load time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use std::{env, fs};

use fenceref_tools::{
    FileSettings, GitHubSettings, HttpSettings, RetryConfig, Snapshot, default_deny_patterns,
};
use fenceref_types::{AllowedDirectory, ApiEndpointConfig};
use serde::Deserialize;
use thiserror::Error;

const fn default_true() -> bool {
    true
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &PathBuf {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct FencerefConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub files: FilesConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub github: GitHubConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    /// Admin-owned snapshot used by the CLI.
    #[serde(default)]
    pub directories: Vec<AllowedDirectory>,
    #[serde(default)]
    pub endpoints: Vec<ApiEndpointConfig>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub memory_capacity: usize,
    #[serde(default = "default_true")]
    pub durable: bool,
    pub durable_path: Option<PathBuf>,
    pub file_ttl_secs: u64,
    pub variable_ttl_secs: u64,
    pub api_ttl_secs: u64,
    pub github_issue_ttl_secs: u64,
    pub token_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_capacity: 1024,
            durable: true,
            durable_path: None,
            file_ttl_secs: 86_400,
            variable_ttl_secs: 86_400,
            api_ttl_secs: 3_600,
            github_issue_ttl_secs: 900,
            token_ttl_secs: 30 * 86_400,
        }
    }
}

impl CacheConfig {
    /// Location of the durable tier, or `None` when it is disabled.
    #[must_use]
    pub fn durable_path(&self) -> Option<PathBuf> {
        if !self.durable {
            return None;
        }
        self.durable_path
            .clone()
            .or_else(|| fenceref_dir().map(|dir| dir.join("cache.db")))
    }

    #[must_use]
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    pub max_bytes: u64,
    pub deny_patterns: Vec<String>,
    pub read_timeout_secs: u64,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            max_bytes: 1024 * 1024,
            deny_patterns: default_deny_patterns(),
            read_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_response_bytes: usize,
    pub user_agent: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_retries: 2,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            max_response_bytes: 2 * 1024 * 1024,
            user_agent: None,
        }
    }
}

#[derive(Default, Clone, Deserialize)]
#[serde(default)]
pub struct GitHubConfig {
    pub token: Option<String>,
    pub api_base: Option<String>,
    pub max_reset_wait_secs: Option<u64>,
}

// Manual Debug impl to prevent leaking tokens in logs.
impl std::fmt::Debug for GitHubConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubConfig")
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("api_base", &self.api_base)
            .field("max_reset_wait_secs", &self.max_reset_wait_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub concurrency: usize,
    pub reference_timeout_secs: u64,
    pub default_endpoint: Option<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            reference_timeout_secs: 45,
            default_endpoint: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub workers: usize,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    /// Finished tasks kept for status polling.
    pub max_finished_tasks: usize,
    pub finished_task_ttl_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_retries: 3,
            initial_backoff_ms: 250,
            max_finished_tasks: 1024,
            finished_task_ttl_secs: 3600,
        }
    }
}

/// Replace `${VAR}` with the value of the environment variable (empty if unset).
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        let var = &after[..end];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

impl FencerefConfig {
    /// Load from the default location. `Ok(None)` when no file exists.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| {
            tracing::warn!(path = %path.display(), error = %source, "Failed to read config");
            ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }
        })?;
        Self::parse(&content).map_err(|source| {
            tracing::warn!(path = %path.display(), error = %source, "Failed to parse config");
            ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        let mut config: Self = toml::from_str(content)?;
        config.expand_secrets();
        Ok(config)
    }

    fn expand_secrets(&mut self) {
        if let Some(token) = self.github.token.as_mut() {
            *token = expand_env_vars(token);
        }
        for endpoint in &mut self.endpoints {
            if let Some(token) = endpoint.auth_token.as_mut() {
                *token = expand_env_vars(token);
            }
            for value in endpoint.headers.values_mut() {
                *value = expand_env_vars(value);
            }
        }
    }

    #[must_use]
    pub fn file_settings(&self) -> FileSettings {
        FileSettings {
            max_bytes: self.files.max_bytes,
            read_timeout: Duration::from_secs(self.files.read_timeout_secs),
            deny_patterns: self.files.deny_patterns.clone(),
            ttl: Duration::from_secs(self.cache.file_ttl_secs),
        }
    }

    #[must_use]
    pub fn http_settings(&self) -> HttpSettings {
        let defaults = HttpSettings::default();
        HttpSettings {
            timeout: Duration::from_secs(self.http.timeout_secs),
            user_agent: self.http.user_agent.clone().unwrap_or(defaults.user_agent),
            max_response_bytes: self.http.max_response_bytes,
            retry: RetryConfig {
                max_retries: self.http.max_retries,
                initial_delay: Duration::from_millis(self.http.initial_backoff_ms),
                max_delay: Duration::from_millis(self.http.max_backoff_ms),
                ..defaults.retry
            },
        }
    }

    #[must_use]
    pub fn github_settings(&self) -> GitHubSettings {
        let defaults = GitHubSettings::default();
        GitHubSettings {
            api_base: self.github.api_base.clone().unwrap_or(defaults.api_base),
            max_reset_wait: self
                .github
                .max_reset_wait_secs
                .map_or(defaults.max_reset_wait, Duration::from_secs),
            ttl: Duration::from_secs(self.cache.github_issue_ttl_secs),
        }
    }

    /// The admin-owned tables as a read-only snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            directories: self.directories.clone(),
            variables: Arc::new(self.variables.clone()),
            endpoints: self.endpoints.clone(),
            github_token: self.github.token.clone().filter(|t| !t.is_empty()),
            default_endpoint: self.resolver.default_endpoint.clone(),
        }
    }
}

/// `~/.fenceref`
#[must_use]
pub fn fenceref_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".fenceref"))
}

#[must_use]
pub fn config_path() -> Option<PathBuf> {
    fenceref_dir().map(|dir| dir.join("config.toml"))
}
