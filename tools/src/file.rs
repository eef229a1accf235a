//! `@[file:<relative/path>]` handler.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fenceref_types::{Reference, ReferenceKind, ResolveError};
use tokio::io::AsyncReadExt;

use crate::sandbox::{DenyList, PathValidator, default_deny_patterns};
use crate::{HandlerFut, ReferenceHandler, Resolved, Snapshot, ValidatedPath, fingerprint_of};

pub const DIRECTORY_LISTING_CONTENT_TYPE: &str = "text/x-directory-listing";
pub const MAX_LISTING_ENTRIES: usize = 1000;

#[derive(Debug, Clone)]
pub struct FileSettings {
    pub max_bytes: u64,
    pub read_timeout: Duration,
    pub deny_patterns: Vec<String>,
    pub ttl: Duration,
}

impl Default for FileSettings {
    fn default() -> Self {
        Self {
            max_bytes: 1024 * 1024,
            read_timeout: Duration::from_secs(10),
            deny_patterns: default_deny_patterns(),
            ttl: Duration::from_secs(86_400),
        }
    }
}

#[derive(Debug)]
pub struct FileHandler {
    settings: FileSettings,
    deny: DenyList,
}

impl FileHandler {
    pub fn new(settings: FileSettings) -> Result<Self, ResolveError> {
        let deny = DenyList::new(&settings.deny_patterns)?;
        Ok(Self { settings, deny })
    }

    fn validate_path(&self, raw: &str, snapshot: &Snapshot) -> Result<ValidatedPath, ResolveError> {
        PathValidator::new(&snapshot.directories, &self.deny).validate(raw)
    }

    async fn read_file(&self, path: &Path, raw: &str) -> Result<Resolved, ResolveError> {
        let limit = self.settings.max_bytes;
        let io_error = |e: std::io::Error| ResolveError::NotResolvable {
            target: raw.to_string(),
            reason: e.to_string(),
        };

        let file = tokio::fs::File::open(path).await.map_err(io_error)?;
        let size = file.metadata().await.map_err(io_error)?.len();
        if size > limit {
            return Err(ResolveError::FileTooLarge {
                path: path.to_path_buf(),
                size,
                limit,
            });
        }

        // The file may grow between stat and read; cap the stream as well.
        let mut bytes = Vec::with_capacity(usize::try_from(size).unwrap_or(0));
        file.take(limit + 1)
            .read_to_end(&mut bytes)
            .await
            .map_err(io_error)?;
        if bytes.len() as u64 > limit {
            return Err(ResolveError::FileTooLarge {
                path: path.to_path_buf(),
                size: bytes.len() as u64,
                limit,
            });
        }

        let byte_length = bytes.len() as u64;
        let content = String::from_utf8(bytes).map_err(|_| ResolveError::NotResolvable {
            target: raw.to_string(),
            reason: "file is not valid UTF-8 text".to_string(),
        })?;

        Ok(Resolved {
            content,
            content_type: "text/plain".to_string(),
            fetched_at: SystemTime::now(),
            byte_length,
            source: Some(path.display().to_string()),
        })
    }

    async fn list_directory(&self, path: &Path, raw: &str) -> Result<Resolved, ResolveError> {
        let io_error = |e: std::io::Error| ResolveError::NotResolvable {
            target: raw.to_string(),
            reason: e.to_string(),
        };

        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(path).await.map_err(io_error)?;
        while let Some(entry) = read_dir.next_entry().await.map_err(io_error)? {
            let entry_path = entry.path();
            if self.deny.matched(&entry_path).is_some() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry.file_type().await.is_ok_and(|t| t.is_dir());
            entries.push(if is_dir { format!("{name}/") } else { name });
        }
        entries.sort();

        let total = entries.len();
        entries.truncate(MAX_LISTING_ENTRIES);
        let mut content = entries.join("\n");
        if total > MAX_LISTING_ENTRIES {
            content.push_str(&format!(
                "\n... ({} more entries not shown)",
                total - MAX_LISTING_ENTRIES
            ));
        }

        Ok(Resolved::text(content, DIRECTORY_LISTING_CONTENT_TYPE)
            .with_source(path.display().to_string()))
    }
}

impl ReferenceHandler for FileHandler {
    fn kind(&self) -> ReferenceKind {
        ReferenceKind::File
    }

    fn validate(&self, reference: &Reference, snapshot: &Snapshot) -> Result<(), ResolveError> {
        self.validate_path(&reference.value, snapshot).map(|_| ())
    }

    /// Canonical path plus modification time, so an edited file or a
    /// different root never serves an old read.
    fn fingerprint(&self, reference: &Reference, snapshot: &Snapshot) -> Result<String, ResolveError> {
        let validated = self.validate_path(&reference.value, snapshot)?;
        let modified = std::fs::metadata(&validated.canonical_path)
            .and_then(|meta| meta.modified())
            .map_err(|e| ResolveError::NotResolvable {
                target: reference.value.clone(),
                reason: e.to_string(),
            })?
            .duration_since(UNIX_EPOCH)
            .map_or(0, |since| since.as_nanos());
        let canonical = validated.canonical_path.to_string_lossy();
        Ok(fingerprint_of([&*canonical, modified.to_string().as_str()]))
    }

    fn resolve<'a>(&'a self, reference: &'a Reference, snapshot: &'a Snapshot) -> HandlerFut<'a> {
        Box::pin(async move {
            let raw = reference.value.as_str();
            let validated = self.validate_path(raw, snapshot)?;

            let read = async {
                if validated.is_dir {
                    self.list_directory(&validated.canonical_path, raw).await
                } else {
                    self.read_file(&validated.canonical_path, raw).await
                }
            };
            tokio::time::timeout(self.settings.read_timeout, read)
                .await
                .map_err(|_| ResolveError::Timeout {
                    operation: format!("reading {raw}"),
                    after: self.settings.read_timeout,
                })?
        })
    }

    fn cache_ttl(&self) -> Duration {
        self.settings.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fenceref_types::{AllowedDirectory, ErrorKind};
    use tempfile::tempdir;

    fn handler(max_bytes: u64) -> FileHandler {
        FileHandler::new(FileSettings {
            max_bytes,
            ..FileSettings::default()
        })
        .unwrap()
    }

    fn file_ref(path: &str) -> Reference {
        Reference::new(ReferenceKind::File, format!("@[file:{path}]"), path)
    }

    #[tokio::test]
    async fn reads_text_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hello notes").unwrap();
        let snapshot = Snapshot::default().with_directory(AllowedDirectory::new(dir.path(), false));

        let resolved = handler(1024)
            .resolve(&file_ref("notes.txt"), &snapshot)
            .await
            .unwrap();
        assert_eq!(resolved.content, "hello notes");
        assert_eq!(resolved.byte_length, 11);
        assert_eq!(resolved.content_type, "text/plain");
    }

    #[tokio::test]
    async fn oversized_file_is_rejected() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("big.txt"), "x".repeat(64)).unwrap();
        let snapshot = Snapshot::default().with_directory(AllowedDirectory::new(dir.path(), false));

        let err = handler(16)
            .resolve(&file_ref("big.txt"), &snapshot)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileTooLarge);
    }

    #[tokio::test]
    async fn binary_file_is_not_resolvable() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("blob.bin"), [0xff, 0xfe, 0x00, 0x81]).unwrap();
        let snapshot = Snapshot::default().with_directory(AllowedDirectory::new(dir.path(), false));

        let err = handler(1024)
            .resolve(&file_ref("blob.bin"), &snapshot)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotResolvable);
    }

    #[tokio::test]
    async fn directory_resolves_to_sorted_listing() {
        let dir = tempdir().unwrap();
        let docs = dir.path().join("docs");
        std::fs::create_dir(&docs).unwrap();
        std::fs::write(docs.join("b.md"), "b").unwrap();
        std::fs::write(docs.join("a.md"), "a").unwrap();
        std::fs::create_dir(docs.join("images")).unwrap();
        std::fs::create_dir(docs.join("node_modules")).unwrap();
        let snapshot = Snapshot::default().with_directory(AllowedDirectory::new(dir.path(), false));

        let resolved = handler(1024)
            .resolve(&file_ref("docs"), &snapshot)
            .await
            .unwrap();
        assert_eq!(resolved.content_type, DIRECTORY_LISTING_CONTENT_TYPE);
        assert_eq!(resolved.content, "a.md\nb.md\nimages/");
    }

    #[tokio::test]
    async fn traversal_never_touches_filesystem() {
        let dir = tempdir().unwrap();
        let snapshot = Snapshot::default().with_directory(AllowedDirectory::new(dir.path(), true));
        let err = handler(1024)
            .resolve(&file_ref("../../etc/passwd"), &snapshot)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TraversalRejected);
    }

    #[test]
    fn validation_runs_the_sandbox() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "n").unwrap();
        let handler = handler(1024);

        let err = handler
            .validate(&file_ref("notes.txt"), &Snapshot::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInAllowedDirectory);

        let snapshot = Snapshot::default().with_directory(AllowedDirectory::new(dir.path(), false));
        assert!(handler.validate(&file_ref("notes.txt"), &snapshot).is_ok());
        let err = handler.validate(&file_ref(" "), &snapshot).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn fingerprint_tracks_root_and_modification() {
        let first = tempdir().unwrap();
        let second = tempdir().unwrap();
        let path = first.path().join("notes.txt");
        std::fs::write(&path, "one").unwrap();
        std::fs::write(second.path().join("notes.txt"), "two").unwrap();
        let handler = handler(1024);
        let in_first = Snapshot::default().with_directory(AllowedDirectory::new(first.path(), false));
        let in_second = Snapshot::default().with_directory(AllowedDirectory::new(second.path(), false));

        let before = handler.fingerprint(&file_ref("notes.txt"), &in_first).unwrap();
        assert_eq!(before, handler.fingerprint(&file_ref("notes.txt"), &in_first).unwrap());
        assert_ne!(before, handler.fingerprint(&file_ref("notes.txt"), &in_second).unwrap());

        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(60)).unwrap();
        assert_ne!(before, handler.fingerprint(&file_ref("notes.txt"), &in_first).unwrap());
    }
}
