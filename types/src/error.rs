//! Per-reference error taxonomy.
//!
//! Handler failures attach to the reference that produced them and are
//! reported in the resolution result; they never abort a whole resolution.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable tag for a [`ResolveError`], suitable for serialization and matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    TraversalRejected,
    NotInAllowedDirectory,
    NotFound,
    FileTooLarge,
    NotResolvable,
    Auth,
    RateLimited,
    Network,
    Timeout,
    HttpStatus,
    Tokenization,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::TraversalRejected => "traversal_rejected",
            ErrorKind::NotInAllowedDirectory => "not_in_allowed_directory",
            ErrorKind::NotFound => "not_found",
            ErrorKind::FileTooLarge => "file_too_large",
            ErrorKind::NotResolvable => "not_resolvable",
            ErrorKind::Auth => "auth",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::HttpStatus => "http_status",
            ErrorKind::Tokenization => "tokenization",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("invalid reference: {message}")]
    Validation { message: String },

    #[error("path '{attempted}' rejected: {reason}")]
    TraversalRejected { attempted: String, reason: String },

    #[error("path '{attempted}' is not within any allowed directory{}", detail_suffix(.detail.as_deref()))]
    NotInAllowedDirectory {
        attempted: String,
        detail: Option<String>,
    },

    #[error("{what} not found: {name}")]
    NotFound { what: &'static str, name: String },

    #[error("file '{}' is {size} bytes, exceeding the {limit} byte limit", .path.display())]
    FileTooLarge { path: PathBuf, size: u64, limit: u64 },

    #[error("'{target}' cannot be resolved: {reason}")]
    NotResolvable { target: String, reason: String },

    #[error("authentication failed for {service} (HTTP {status})")]
    Auth { service: String, status: u16 },

    #[error("rate limit exceeded for {service}{}", retry_suffix(.retry_after.as_ref()))]
    RateLimited {
        service: String,
        retry_after: Option<Duration>,
    },

    #[error("network error contacting {service}: {message}")]
    Network { service: String, message: String },

    #[error("{operation} timed out after {}ms", .after.as_millis())]
    Timeout { operation: String, after: Duration },

    #[error("{service} returned HTTP {status}: {message}")]
    HttpStatus {
        service: String,
        status: u16,
        message: String,
    },

    #[error("tokenization failed: {message}")]
    Tokenization { message: String },
}

fn detail_suffix(detail: Option<&str>) -> String {
    detail.map(|d| format!(" ({d})")).unwrap_or_default()
}

fn retry_suffix(retry_after: Option<&Duration>) -> String {
    retry_after
        .map(|d| format!("; retry after {}s", d.as_secs().max(1)))
        .unwrap_or_default()
}

impl ResolveError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::TraversalRejected { .. } => ErrorKind::TraversalRejected,
            Self::NotInAllowedDirectory { .. } => ErrorKind::NotInAllowedDirectory,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::FileTooLarge { .. } => ErrorKind::FileTooLarge,
            Self::NotResolvable { .. } => ErrorKind::NotResolvable,
            Self::Auth { .. } => ErrorKind::Auth,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Network { .. } => ErrorKind::Network,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::HttpStatus { .. } => ErrorKind::HttpStatus,
            Self::Tokenization { .. } => ErrorKind::Tokenization,
        }
    }

    /// Transient failures may succeed if the same request is repeated later.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Network { .. } | Self::Timeout { .. } => true,
            Self::HttpStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Security rejections are always logged by the handler that raises them.
    #[must_use]
    pub const fn is_security_rejection(&self) -> bool {
        matches!(
            self,
            Self::TraversalRejected { .. } | Self::NotInAllowedDirectory { .. }
        )
    }
}
