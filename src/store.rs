//! Artifact store for synthesized audio files
//!
//! Every synthesis job writes exactly one file into the working directory.
//! Files are named after a random UUID, so concurrent allocations never collide
//! and no counter has to be shared between sessions. Files are reclaimed by age
//! through [`ArtifactStore::sweep`].
//!
//! # Retention invariant
//!
//! Nothing in this module locks individual files. A sweep only removes entries
//! whose last modification is older than `max_age`, so `max_age` has to be
//! larger than the longest time between an artifact being created and its
//! client consuming it. Otherwise a client can lose its own in-flight file.

use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// File extension of every artifact produced by the engine
pub const ARTIFACT_EXTENSION: &str = "wav";

/// Errors raised by the artifact store
#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("Invalid artifact name: {0:?}")]
    InvalidName(String),

    #[error("Cannot create working directory {}: {source}", path.display())]
    WorkingDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A synthesized audio file and its identifying metadata
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Artifact {
    /// Random identifier, also the file stem
    pub id: Uuid,
    /// Absolute or working-directory-relative path of the audio file
    pub path: PathBuf,
    /// When the path was allocated
    pub created_at: SystemTime,
}

impl Artifact {
    /// File name under which the artifact can be retrieved
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.id, ARTIFACT_EXTENSION)
    }
}

/// A single entry a sweep could not inspect or delete
#[derive(Clone, Debug)]
pub struct SweepFailure {
    pub path: PathBuf,
    pub error: String,
}

/// Outcome of one retention sweep
#[derive(Clone, Debug, Default)]
pub struct SweepReport {
    /// Regular files looked at
    pub scanned: usize,
    /// Files removed because they exceeded the age threshold
    pub deleted: usize,
    /// Entries that could not be handled; logged, never propagated
    pub failures: Vec<SweepFailure>,
}

impl SweepReport {
    fn fail(&mut self, path: &Path, error: impl ToString) {
        let error = error.to_string();
        warn!(path = %path.display(), error = %error, "retention sweep failure");
        self.failures.push(SweepFailure {
            path: path.to_path_buf(),
            error,
        });
    }
}

/// Working directory of audio artifacts
#[derive(Clone, Debug)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open the store, creating the working directory if it is absent
    ///
    /// Failure here is the one fatal error of the store: without a working
    /// directory no synthesis job can ever succeed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, ArtifactError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|source| ArtifactError::WorkingDir {
                path: root.clone(),
                source,
            })?;
        info!(dir = %root.display(), "artifact store ready");
        Ok(Self { root })
    }

    /// Working directory of this store
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Allocate a fresh artifact path
    ///
    /// The file itself is not created; the engine writes it.
    pub fn allocate(&self) -> Artifact {
        let id = Uuid::new_v4();
        let path = self.root.join(format!("{id}.{ARTIFACT_EXTENSION}"));
        Artifact {
            id,
            path,
            created_at: SystemTime::now(),
        }
    }

    /// Whether a file exists at `path`
    pub async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    /// Read the whole content of an artifact
    pub async fn read(&self, path: &Path) -> Result<Vec<u8>, ArtifactError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ArtifactError::NotFound(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Map a client-supplied file name to a path inside the working directory
    ///
    /// Only a single plain path component is accepted.
    pub fn resolve(&self, file_name: &str) -> Result<PathBuf, ArtifactError> {
        let invalid = || ArtifactError::InvalidName(file_name.to_string());
        if file_name.is_empty() || file_name.contains(['/', '\\', '\0']) {
            return Err(invalid());
        }
        let mut components = Path::new(file_name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.root.join(file_name)),
            _ => Err(invalid()),
        }
    }

    /// Read an artifact by its file name
    pub async fn read_named(&self, file_name: &str) -> Result<Vec<u8>, ArtifactError> {
        let path = self.resolve(file_name)?;
        self.read(&path)
            .await
            .map_err(|e| match e {
                ArtifactError::NotFound(_) => ArtifactError::NotFound(file_name.to_string()),
                other => other,
            })
    }

    /// Delete every file whose last modification is older than `max_age`
    ///
    /// Per-entry failures are logged and recorded in the report; they never
    /// abort the sweep.
    pub async fn sweep(&self, max_age: Duration) -> SweepReport {
        self.sweep_with(max_age, |path| async move { tokio::fs::remove_file(path).await })
            .await
    }

    async fn sweep_with<F, Fut>(&self, max_age: Duration, remove: F) -> SweepReport
    where
        F: Fn(PathBuf) -> Fut,
        Fut: Future<Output = std::io::Result<()>>,
    {
        let now = SystemTime::now();
        let mut report = SweepReport::default();

        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) => {
                report.fail(&self.root, e);
                return report;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    report.fail(&self.root, e);
                    break;
                }
            };
            let path = entry.path();

            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                // Removed between listing and stat
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    report.fail(&path, e);
                    continue;
                }
            };
            if !metadata.is_file() {
                continue;
            }
            report.scanned += 1;

            let modified = match metadata.modified() {
                Ok(modified) => modified,
                Err(e) => {
                    report.fail(&path, e);
                    continue;
                }
            };
            if !is_expired(now, modified, max_age) {
                continue;
            }

            match remove(path.clone()).await {
                Ok(()) => {
                    debug!(path = %path.display(), "deleted expired artifact");
                    report.deleted += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => report.fail(&path, e),
            }
        }

        report
    }
}

/// Strictly older than `max_age`. A modification time in the future never expires.
fn is_expired(now: SystemTime, modified: SystemTime, max_age: Duration) -> bool {
    now.duration_since(modified)
        .map(|age| age > max_age)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    const HOUR: Duration = Duration::from_secs(3600);

    fn backdate(path: &Path, age: Duration) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    async fn temp_store() -> (tempfile::TempDir, ArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path().join("audio")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn open_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("nested").join("audio");
        let store = ArtifactStore::open(&root).await.unwrap();
        assert!(root.is_dir());
        assert_eq!(store.root(), root.as_path());
    }

    #[tokio::test]
    async fn open_fails_when_path_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("taken");
        std::fs::write(&file, b"x").unwrap();
        let err = ArtifactStore::open(&file).await.unwrap_err();
        assert!(matches!(err, ArtifactError::WorkingDir { .. }));
    }

    #[tokio::test]
    async fn allocate_does_not_create_the_file() {
        let (_dir, store) = temp_store().await;
        let artifact = store.allocate();

        assert_eq!(artifact.path.parent(), Some(store.root()));
        assert_eq!(
            artifact.path.extension().and_then(|e| e.to_str()),
            Some(ARTIFACT_EXTENSION)
        );
        assert_eq!(
            artifact.path.file_name().and_then(|n| n.to_str()),
            Some(artifact.file_name().as_str())
        );
        assert!(!store.exists(&artifact.path).await);
    }

    #[tokio::test]
    async fn concurrent_allocations_never_collide() {
        let (_dir, store) = temp_store().await;
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                (0..64).map(|_| store.allocate().path).collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for path in handle.await.unwrap() {
                assert!(seen.insert(path), "duplicate artifact path");
            }
        }
        assert_eq!(seen.len(), 16 * 64);
    }

    #[tokio::test]
    async fn read_returns_content_or_not_found() {
        let (_dir, store) = temp_store().await;
        let artifact = store.allocate();

        let err = store.read(&artifact.path).await.unwrap_err();
        assert!(matches!(err, ArtifactError::NotFound(_)));

        std::fs::write(&artifact.path, b"RIFF....WAVE").unwrap();
        assert!(store.exists(&artifact.path).await);
        assert_eq!(store.read(&artifact.path).await.unwrap(), b"RIFF....WAVE");
        assert_eq!(
            store.read_named(&artifact.file_name()).await.unwrap(),
            b"RIFF....WAVE"
        );
    }

    #[test]
    fn resolve_rejects_traversal() {
        let store = ArtifactStore {
            root: PathBuf::from("/srv/audio"),
        };
        assert_eq!(
            store.resolve("abc.wav").unwrap(),
            PathBuf::from("/srv/audio/abc.wav")
        );
        for bad in ["", ".", "..", "../etc/passwd", "a/b.wav", "/etc/passwd", "a\\b"] {
            assert!(
                matches!(store.resolve(bad), Err(ArtifactError::InvalidName(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[tokio::test]
    async fn read_named_reports_the_requested_name() {
        let (_dir, store) = temp_store().await;
        match store.read_named("missing.wav").await {
            Err(ArtifactError::NotFound(name)) => assert_eq!(name, "missing.wav"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sweep_deletes_only_expired_files() {
        let (_dir, store) = temp_store().await;

        let old = store.allocate();
        let fresh = store.allocate();
        std::fs::write(&old.path, b"old").unwrap();
        std::fs::write(&fresh.path, b"fresh").unwrap();
        backdate(&old.path, HOUR * 2);

        let report = store.sweep(HOUR).await;
        assert_eq!(report.scanned, 2);
        assert_eq!(report.deleted, 1);
        assert!(report.failures.is_empty());
        assert!(!old.path.exists());
        assert!(fresh.path.exists());

        // Repeated sweeps never touch a file younger than the threshold
        for _ in 0..5 {
            let report = store.sweep(HOUR).await;
            assert_eq!(report.deleted, 0);
        }
        assert!(fresh.path.exists());
    }

    #[tokio::test]
    async fn sweep_skips_directories() {
        let (_dir, store) = temp_store().await;
        let sub = store.root().join("keep");
        std::fs::create_dir(&sub).unwrap();

        let report = store.sweep(Duration::ZERO).await;
        assert_eq!(report.scanned, 0);
        assert!(sub.is_dir());
    }

    #[tokio::test]
    async fn sweep_of_missing_directory_is_recorded_not_raised() {
        let (dir, store) = temp_store().await;
        std::fs::remove_dir_all(dir.path().join("audio")).unwrap();

        let report = store.sweep(HOUR).await;
        assert_eq!(report.deleted, 0);
        assert_eq!(report.failures.len(), 1);
    }

    #[tokio::test]
    async fn failed_deletion_is_recorded_and_sweep_continues() {
        let (_dir, store) = temp_store().await;

        let stuck = store.allocate();
        let old = store.allocate();
        std::fs::write(&stuck.path, b"stuck").unwrap();
        std::fs::write(&old.path, b"old").unwrap();
        backdate(&stuck.path, HOUR * 2);
        backdate(&old.path, HOUR * 2);

        let stuck_path = stuck.path.clone();
        let report = store
            .sweep_with(HOUR, |path| {
                let denied = path == stuck_path;
                async move {
                    if denied {
                        Err(std::io::Error::new(
                            std::io::ErrorKind::PermissionDenied,
                            "read-only",
                        ))
                    } else {
                        tokio::fs::remove_file(path).await
                    }
                }
            })
            .await;

        assert_eq!(report.scanned, 2);
        assert_eq!(report.deleted, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, stuck.path);
        assert!(report.failures[0].error.contains("read-only"));
        assert!(stuck.path.exists());
        assert!(!old.path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn sweep_in_read_only_directory_records_every_file() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, store) = temp_store().await;
        let a = store.allocate();
        let b = store.allocate();
        std::fs::write(&a.path, b"a").unwrap();
        std::fs::write(&b.path, b"b").unwrap();
        backdate(&a.path, HOUR * 2);
        backdate(&b.path, HOUR * 2);

        let root = store.root().to_path_buf();
        std::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o555)).unwrap();
        // Permission bits do not bind root
        let check = root.join("writable-check");
        let is_root = std::fs::write(&check, b"").is_ok();
        if is_root {
            std::fs::remove_file(&check).unwrap();
        }

        let report = store.sweep(HOUR).await;
        std::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o755)).unwrap();

        if is_root {
            assert_eq!(report.deleted, 2);
            return;
        }
        assert_eq!(report.scanned, 2);
        assert_eq!(report.deleted, 0);
        assert_eq!(report.failures.len(), 2);
        assert!(a.path.exists() && b.path.exists());
    }

    #[test]
    fn expiry_is_strict_and_ignores_future_times() {
        let now = SystemTime::now();
        assert!(is_expired(now, now - HOUR * 2, HOUR));
        assert!(!is_expired(now, now - HOUR, HOUR));
        assert!(!is_expired(now, now + HOUR, HOUR));
    }
}
