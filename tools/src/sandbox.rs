//! Filesystem sandbox for file references.
//!
//! A reference path is lexically normalized first (absolute paths and any `..`
//! that climbs above the start are rejected outright), then joined to each
//! allowed root, most specific root first, and canonicalized. A candidate is
//! accepted only if its canonical form stays under the canonical root, honours
//! the root's `recursive` flag and matches no deny pattern.

use std::path::{Path, PathBuf};

use fenceref_types::{AllowedDirectory, PathRejection, ResolveError, normalize_relative_path};

/// Default deny patterns for secrets and tool directories.
pub const DEFAULT_DENY_PATTERNS: &[&str] = &[
    "**/.ssh/**",
    "**/.gnupg/**",
    "**/.aws/**",
    "**/.git",
    "**/.git/**",
    "**/.git-credentials",
    "**/.venv",
    "**/.venv/**",
    "**/node_modules",
    "**/node_modules/**",
    "**/__pycache__",
    "**/__pycache__/**",
    "**/.npmrc",
    "**/.pypirc",
    "**/.netrc",
    "**/.env",
    "**/.env.*",
    "**/*.env",
    "**/id_rsa*",
    "**/id_ed25519*",
    "**/id_ecdsa*",
    "**/*.pem",
    "**/*.key",
    "**/*.p12",
    "**/*.pfx",
];

#[must_use]
pub fn default_deny_patterns() -> Vec<String> {
    DEFAULT_DENY_PATTERNS
        .iter()
        .map(std::string::ToString::to_string)
        .collect()
}

#[derive(Debug, Clone)]
struct DenyPattern {
    pattern: String,
    matcher: globset::GlobMatcher,
}

/// Compiled deny globs, matched case-insensitively against canonical paths.
#[derive(Debug, Clone, Default)]
pub struct DenyList {
    patterns: Vec<DenyPattern>,
}

impl DenyList {
    pub fn new(patterns: &[String]) -> Result<Self, ResolveError> {
        let mut compiled = Vec::with_capacity(patterns.len());
        for pat in patterns {
            let mut builder = globset::GlobBuilder::new(pat);
            // Case-insensitive so "Secret.PEM" cannot slip past "*.pem".
            builder.case_insensitive(true);
            let glob = builder.build().map_err(|e| {
                ResolveError::validation(format!("invalid deny pattern '{pat}': {e}"))
            })?;
            compiled.push(DenyPattern {
                pattern: pat.clone(),
                matcher: glob.compile_matcher(),
            });
        }
        Ok(Self { patterns: compiled })
    }

    /// The first pattern matching `path`, if any.
    #[must_use]
    pub fn matched(&self, path: &Path) -> Option<&str> {
        let normalized = path.to_string_lossy().replace('\\', "/");
        self.patterns
            .iter()
            .find(|p| p.matcher.is_match(&normalized))
            .map(|p| p.pattern.as_str())
    }
}

/// A path that passed every sandbox check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedPath {
    pub canonical_path: PathBuf,
    pub matched_root: PathBuf,
    pub is_dir: bool,
}

#[derive(Debug, Clone)]
struct Root {
    canonical: PathBuf,
    recursive: bool,
}

/// Validator over one snapshot of allowed directories.
#[derive(Debug, Clone)]
pub struct PathValidator<'a> {
    roots: Vec<Root>,
    deny: &'a DenyList,
}

impl<'a> PathValidator<'a> {
    /// Roots that do not exist or cannot be canonicalized are skipped.
    #[must_use]
    pub fn new(directories: &[AllowedDirectory], deny: &'a DenyList) -> Self {
        let mut roots: Vec<Root> = directories
            .iter()
            .filter_map(|dir| match std::fs::canonicalize(&dir.path) {
                Ok(canonical) => Some(Root {
                    canonical,
                    recursive: dir.recursive,
                }),
                Err(e) => {
                    tracing::warn!(
                        root = %dir.path.display(),
                        error = %e,
                        "Skipping allowed directory that cannot be canonicalized"
                    );
                    None
                }
            })
            .collect();
        // Most specific (deepest) root first.
        roots.sort_by_key(|root| std::cmp::Reverse(root.canonical.components().count()));
        Self { roots, deny }
    }

    pub fn validate(&self, raw_path: &str) -> Result<ValidatedPath, ResolveError> {
        let relative = match normalize_relative_path(raw_path.trim()) {
            Ok(path) => path,
            Err(PathRejection::Empty) => {
                return Err(ResolveError::validation("file reference has an empty path"));
            }
            Err(rejection) => {
                tracing::warn!(path = raw_path, reason = %rejection, "Rejected file reference path");
                return Err(ResolveError::TraversalRejected {
                    attempted: raw_path.to_string(),
                    reason: rejection.to_string(),
                });
            }
        };

        if self.roots.is_empty() {
            return Err(reject(raw_path, "no allowed directories are configured"));
        }

        let mut rejection: Option<&'static str> = None;
        for root in &self.roots {
            let candidate = root.canonical.join(&relative);
            let canonical = match std::fs::canonicalize(&candidate) {
                Ok(canonical) => canonical,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    tracing::debug!(candidate = %candidate.display(), error = %e, "Cannot canonicalize candidate");
                    continue;
                }
            };

            let Ok(under_root) = canonical.strip_prefix(&root.canonical) else {
                rejection.get_or_insert("resolves outside its root");
                continue;
            };
            if under_root.as_os_str().is_empty() {
                rejection.get_or_insert("refers to the root itself");
                continue;
            }
            if !root.recursive && under_root.components().count() > 1 {
                rejection.get_or_insert("directory is not recursive");
                continue;
            }
            if let Some(pattern) = self.deny.matched(&canonical) {
                tracing::warn!(
                    path = raw_path,
                    resolved = %canonical.display(),
                    pattern,
                    "File reference matched a denied pattern"
                );
                return Err(ResolveError::NotInAllowedDirectory {
                    attempted: raw_path.to_string(),
                    detail: Some("denied_pattern".to_string()),
                });
            }

            let is_dir = canonical.is_dir();
            return Ok(ValidatedPath {
                canonical_path: canonical,
                matched_root: root.canonical.clone(),
                is_dir,
            });
        }

        match rejection {
            Some(detail) => Err(reject(raw_path, detail)),
            None => Err(ResolveError::NotFound {
                what: "file",
                name: relative,
            }),
        }
    }
}

fn reject(raw_path: &str, detail: &str) -> ResolveError {
    tracing::warn!(path = raw_path, detail, "File reference outside allowed directories");
    ResolveError::NotInAllowedDirectory {
        attempted: raw_path.to_string(),
        detail: Some(detail.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fenceref_types::ErrorKind;
    use tempfile::tempdir;

    fn deny() -> DenyList {
        DenyList::new(&default_deny_patterns()).unwrap()
    }

    fn sandbox_with_notes(recursive: bool) -> (tempfile::TempDir, Vec<AllowedDirectory>) {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "top").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("notes.txt"), "nested").unwrap();
        let dirs = vec![AllowedDirectory::new(dir.path(), recursive)];
        (dir, dirs)
    }

    #[test]
    fn parent_traversal_is_rejected() {
        let (_dir, dirs) = sandbox_with_notes(false);
        let deny = deny();
        let validator = PathValidator::new(&dirs, &deny);
        let err = validator.validate("../etc/passwd").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TraversalRejected);
    }

    #[test]
    fn absolute_path_is_rejected() {
        let (_dir, dirs) = sandbox_with_notes(true);
        let deny = deny();
        let validator = PathValidator::new(&dirs, &deny);
        let err = validator.validate("/etc/passwd").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TraversalRejected);
    }

    #[test]
    fn direct_child_accepted_when_present() {
        let (dir, dirs) = sandbox_with_notes(false);
        let deny = deny();
        let validator = PathValidator::new(&dirs, &deny);
        let validated = validator.validate("notes.txt").unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(validated.matched_root, root);
        assert_eq!(validated.canonical_path, root.join("notes.txt"));
        assert!(!validated.is_dir);

        let err = validator.validate("missing.txt").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn nested_path_requires_recursive_root() {
        let (_dir, dirs) = sandbox_with_notes(false);
        let deny = deny();
        let validator = PathValidator::new(&dirs, &deny);
        let err = validator.validate("sub/notes.txt").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInAllowedDirectory);

        let (_dir, dirs) = sandbox_with_notes(true);
        let validator = PathValidator::new(&dirs, &deny);
        assert!(validator.validate("sub/notes.txt").is_ok());
    }

    #[test]
    fn inner_parent_segments_stay_inside() {
        let (_dir, dirs) = sandbox_with_notes(true);
        let deny = deny();
        let validator = PathValidator::new(&dirs, &deny);
        let validated = validator.validate("sub/../notes.txt").unwrap();
        assert!(validated.canonical_path.ends_with("notes.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_rejected() {
        let outside = tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "secret").unwrap();
        let (dir, dirs) = sandbox_with_notes(true);
        std::os::unix::fs::symlink(outside.path().join("secret.txt"), dir.path().join("link.txt"))
            .unwrap();

        let deny = deny();
        let validator = PathValidator::new(&dirs, &deny);
        let err = validator.validate("link.txt").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInAllowedDirectory);
    }

    #[test]
    fn denied_patterns_are_rejected() {
        let (dir, dirs) = sandbox_with_notes(true);
        std::fs::write(dir.path().join(".env"), "KEY=1").unwrap();
        std::fs::write(dir.path().join("Server.PEM"), "cert").unwrap();
        let deny = deny();
        let validator = PathValidator::new(&dirs, &deny);

        for path in [".env", "Server.PEM"] {
            let err = validator.validate(path).unwrap_err();
            assert_eq!(
                err,
                ResolveError::NotInAllowedDirectory {
                    attempted: path.to_string(),
                    detail: Some("denied_pattern".to_string()),
                }
            );
        }
    }

    #[test]
    fn most_specific_root_wins() {
        let outer = tempdir().unwrap();
        let inner = outer.path().join("inner");
        std::fs::create_dir(&inner).unwrap();
        std::fs::write(inner.join("a.txt"), "inner").unwrap();
        std::fs::create_dir(inner.join("inner")).unwrap();
        std::fs::write(inner.join("inner").join("a.txt"), "nested").unwrap();

        let dirs = vec![
            AllowedDirectory::new(outer.path(), true),
            AllowedDirectory::new(&inner, true),
        ];
        let deny = deny();
        let validator = PathValidator::new(&dirs, &deny);
        let validated = validator.validate("inner/a.txt").unwrap();
        assert_eq!(validated.matched_root, std::fs::canonicalize(&inner).unwrap());
    }

    #[test]
    fn no_roots_rejects_everything() {
        let deny = deny();
        let validator = PathValidator::new(&[], &deny);
        let err = validator.validate("notes.txt").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInAllowedDirectory);
    }

    #[test]
    fn empty_path_is_a_validation_error() {
        let (_dir, dirs) = sandbox_with_notes(true);
        let deny = deny();
        let validator = PathValidator::new(&dirs, &deny);
        assert_eq!(validator.validate("./").unwrap_err().kind(), ErrorKind::Validation);
    }

    #[test]
    fn invalid_deny_pattern_fails() {
        assert!(DenyList::new(&["[invalid".to_string()]).is_err());
    }
}
