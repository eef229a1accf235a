//! Reference kinds, signatures and per-kind value normalization.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of reference backends.
///
/// The tag is the text before the first colon inside `@[...]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    File,
    Variable,
    Api,
    GitHubIssue,
}

impl ReferenceKind {
    pub const ALL: [ReferenceKind; 4] = [
        ReferenceKind::File,
        ReferenceKind::Variable,
        ReferenceKind::Api,
        ReferenceKind::GitHubIssue,
    ];

    /// Tag as written in the inline grammar.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            ReferenceKind::File => "file",
            ReferenceKind::Variable => "var",
            ReferenceKind::Api => "api",
            ReferenceKind::GitHubIssue => "github",
        }
    }

    /// Map a grammar tag to a kind. Tags are case-sensitive.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "file" => Some(ReferenceKind::File),
            "var" => Some(ReferenceKind::Variable),
            "api" => Some(ReferenceKind::Api),
            "github" => Some(ReferenceKind::GitHubIssue),
            _ => None,
        }
    }
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A single inline reference as written in source text.
///
/// `value` is the unescaped text after the first colon; `raw_token` is the
/// exact source slice including `@[` and `]` so unresolved references can be
/// left in place verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub kind: ReferenceKind,
    pub raw_token: String,
    pub value: String,
}

impl Reference {
    #[must_use]
    pub fn new(kind: ReferenceKind, raw_token: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind,
            raw_token: raw_token.into(),
            value: value.into(),
        }
    }

    /// Deduplication key: kind plus normalized value.
    #[must_use]
    pub fn signature(&self) -> Signature {
        Signature::new(self.kind, &self.value)
    }
}

/// Stable identity of a reference, used for dedup and as the resolution cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(String);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid reference signature '{0}': expected <kind>:<value>")]
pub struct SignatureParseError(pub String);

impl Signature {
    #[must_use]
    pub fn new(kind: ReferenceKind, value: &str) -> Self {
        Self(format!("{}:{}", kind.tag(), normalize_value(kind, value)))
    }

    /// Parse a user-supplied signature such as `var:name` or `file:./docs/a.md`.
    ///
    /// The value is re-normalized, so `file:./a.md` and `file:a.md` yield the same key.
    pub fn parse(input: &str) -> Result<Self, SignatureParseError> {
        let input = input.trim();
        let input = input
            .strip_prefix("@[")
            .and_then(|s| s.strip_suffix(']'))
            .unwrap_or(input);
        let (tag, value) = input
            .split_once(':')
            .ok_or_else(|| SignatureParseError(input.to_string()))?;
        let kind = ReferenceKind::from_tag(tag).ok_or_else(|| SignatureParseError(input.to_string()))?;
        Ok(Self::new(kind, value))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The reference kind encoded in the signature prefix.
    #[must_use]
    pub fn kind(&self) -> Option<ReferenceKind> {
        self.0.split_once(':').and_then(|(tag, _)| ReferenceKind::from_tag(tag))
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn normalize_value(kind: ReferenceKind, value: &str) -> String {
    let trimmed = value.trim();
    match kind {
        ReferenceKind::File => match normalize_relative_path(trimmed) {
            Ok(path) => path,
            // Rejected paths keep a raw-but-separator-normalized key so they still dedup.
            Err(_) => trimmed.replace('\\', "/"),
        },
        ReferenceKind::Variable | ReferenceKind::Api => trimmed.to_string(),
        ReferenceKind::GitHubIssue => match GitHubIssueRef::parse(trimmed) {
            Some(issue) => issue.to_reference_value(),
            None => trimmed.to_string(),
        },
    }
}

/// Why a relative file path was rejected before touching the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PathRejection {
    #[error("absolute paths are not allowed")]
    Absolute,
    #[error("path escapes its root via '..'")]
    Traversal,
    #[error("path contains control characters")]
    ControlCharacters,
    #[error("path is empty")]
    Empty,
}

/// Lexically normalize a relative path.
///
/// Backslashes become `/`, empty and `.` segments are dropped and `..` pops the
/// previous segment. A `..` that would climb above the start is rejected, as are
/// absolute paths (leading `/`, `\`, or a Windows drive prefix).
pub fn normalize_relative_path(raw: &str) -> Result<String, PathRejection> {
    if raw.chars().any(char::is_control) {
        return Err(PathRejection::ControlCharacters);
    }
    let unified = raw.replace('\\', "/");
    if unified.starts_with('/') || has_drive_prefix(&unified) {
        return Err(PathRejection::Absolute);
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(PathRejection::Traversal);
                }
            }
            other => segments.push(other),
        }
    }

    if segments.is_empty() {
        return Err(PathRejection::Empty);
    }
    Ok(segments.join("/"))
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Parsed `issue:<owner>/<repo>#<number>` value of a GitHub reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GitHubIssueRef {
    pub owner: String,
    pub repo: String,
    pub number: u64,
}

impl GitHubIssueRef {
    /// Parse the value part of `@[github:issue:owner/repo#N]`.
    ///
    /// Owner and repo follow GitHub naming (alphanumerics, `-`, `_`, `.`), and
    /// are compared case-insensitively, so they are stored lowercased.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let rest = value.trim().strip_prefix("issue:")?;
        let (slug, number) = rest.rsplit_once('#')?;
        let (owner, repo) = slug.split_once('/')?;
        if !is_github_name(owner) || !is_github_name(repo) {
            return None;
        }
        if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let number: u64 = number.parse().ok()?;
        if number == 0 {
            return None;
        }
        Some(Self {
            owner: owner.to_ascii_lowercase(),
            repo: repo.to_ascii_lowercase(),
            number,
        })
    }

    #[must_use]
    pub fn to_reference_value(&self) -> String {
        format!("issue:{}/{}#{}", self.owner, self.repo, self.number)
    }
}

fn is_github_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 100
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}
