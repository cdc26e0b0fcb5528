//! Export worker: pull → save → compress → write → verify → rename.
//!
//! The image is pulled into a staging OCI layout inside the destination
//! directory, serialized as a tar stream, gzip-compressed into a hidden
//! `.partial` sibling of the final path, verified by decoding it back and
//! renamed into place. Nothing but a complete archive ever appears at the
//! final path; the staging directory and any partial file are removed on
//! every exit path.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use flate2::write::GzEncoder;
use flate2::Compression;
use imirror_core::catalog::CatalogFilters;
use imirror_core::error::{MirrorError, PullFailure, Result};
use imirror_core::retry::RetryPolicy;
use imirror_core::work::WorkItem;
use tokio_util::sync::CancellationToken;

use crate::archive::{partial_path, verify_archive, ArchivePathResolver, STAGING_PREFIX};
use crate::oci::{ImageReference, ImageSource};
use crate::retry::retry;

/// A finished export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exported {
    pub path: PathBuf,
    /// An intact archive was already at the path; nothing was pulled
    pub reused: bool,
    pub bytes: u64,
}

/// Exports one work item at a time; run several under the coordinator.
pub struct ExportWorker {
    date: NaiveDate,
    source: Arc<dyn ImageSource>,
    resolver: ArchivePathResolver,
    retry: RetryPolicy,
    pull_timeout: Duration,
    cancel: CancellationToken,
    filters: Arc<CatalogFilters>,
}

impl ExportWorker {
    pub fn new(
        date: NaiveDate,
        source: Arc<dyn ImageSource>,
        resolver: ArchivePathResolver,
        retry: RetryPolicy,
        pull_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            date,
            source,
            resolver,
            retry,
            pull_timeout,
            cancel,
            filters: Arc::new(CatalogFilters::default()),
        }
    }

    /// Catalog filters deciding which same-day archives belong to the same
    /// major line.
    pub fn with_filters(mut self, filters: Arc<CatalogFilters>) -> Self {
        self.filters = filters;
        self
    }

    pub fn resolver(&self) -> &ArchivePathResolver {
        &self.resolver
    }

    /// Export `item` to its destination.
    pub async fn export(&self, item: &WorkItem) -> Result<Exported> {
        let destination = item.destination.clone();

        if destination.exists() {
            match verify_blocking(destination.clone()).await {
                Ok(bytes) => {
                    tracing::info!(
                        item = %item.key,
                        path = %destination.display(),
                        "Archive already present and intact, skipping pull"
                    );
                    return Ok(Exported {
                        path: destination,
                        reused: true,
                        bytes,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        item = %item.key,
                        path = %destination.display(),
                        error = %e,
                        "Existing archive failed verification, exporting again"
                    );
                    std::fs::remove_file(&destination)
                        .map_err(|e| write_failed(&destination, e))?;
                }
            }
        }

        let filter = self.filters.get(&item.key.component);
        let line = filter.line_of(&item.key.version);
        let conflicts = self.resolver.check_collision(
            self.date,
            item.key.arch,
            &item.key.component,
            &item.key.version,
            |existing| filter.line_of(existing) == line,
        )?;

        let dir = destination
            .parent()
            .ok_or_else(|| MirrorError::WriteFailed {
                path: destination.display().to_string(),
                message: "destination has no parent directory".to_string(),
            })?
            .to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| write_failed(&dir, e))?;

        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&dir)
            .map_err(|e| write_failed(&dir, e))?;

        let reference = ImageReference::parse(&item.reference())?;
        let arch = item.key.arch;
        let staging_root = staging.path().to_path_buf();
        let timeout = self.pull_timeout;

        // Each attempt pulls into a fresh directory so a failed attempt
        // leaves nothing behind for the next one
        let layout = retry(&self.retry, &self.cancel, "pull", |attempt| {
            let target = staging_root.join(format!("attempt-{}", attempt));
            let reference = &reference;
            let source = &self.source;
            async move {
                std::fs::create_dir_all(&target).map_err(|e| write_failed(&target, e))?;
                tracing::debug!(reference = %reference, arch = %arch, attempt, "Pulling");
                match tokio::time::timeout(timeout, source.pull(reference, arch, &target)).await {
                    Ok(Ok(pulled)) => {
                        tracing::debug!(
                            reference = %reference,
                            digest = %pulled.digest,
                            layers = pulled.layers,
                            "Pull complete"
                        );
                        Ok(target)
                    }
                    Ok(Err(e)) => {
                        discard_attempt(&target);
                        Err(e)
                    }
                    Err(_) => {
                        discard_attempt(&target);
                        Err(MirrorError::PullFailed {
                            reference: reference.to_string(),
                            arch: arch.to_string(),
                            cause: PullFailure::Transient(format!(
                                "timed out after {}s",
                                timeout.as_secs()
                            )),
                        })
                    }
                }
            }
        })
        .await?;

        if self.cancel.is_cancelled() {
            return Err(MirrorError::Cancelled);
        }

        let reference_name = reference.to_string();
        let final_path = destination.clone();
        let bytes = tokio::task::spawn_blocking(move || {
            write_archive(&layout, &final_path, &reference_name)
        })
        .await
        .map_err(|e| MirrorError::SaveFailed {
            reference: reference.to_string(),
            message: format!("archive task failed: {}", e),
        })??;

        if let Err(e) = staging.close() {
            tracing::warn!(error = %e, "Failed to remove staging layout");
        }

        for conflict in conflicts {
            tracing::info!(path = %conflict.display(), "Removing same-day archive of another version");
            if let Err(e) = std::fs::remove_file(&conflict) {
                tracing::warn!(path = %conflict.display(), error = %e, "Failed to remove replaced archive");
            }
        }

        tracing::info!(
            item = %item.key,
            path = %destination.display(),
            bytes,
            "Exported"
        );

        Ok(Exported {
            path: destination,
            reused: false,
            bytes,
        })
    }
}

async fn verify_blocking(path: PathBuf) -> io::Result<u64> {
    tokio::task::spawn_blocking(move || verify_archive(&path))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?
}

fn discard_attempt(target: &Path) {
    if let Err(e) = std::fs::remove_dir_all(target) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %target.display(), error = %e, "Failed to remove pull attempt");
        }
    }
}

fn write_failed(path: &Path, err: io::Error) -> MirrorError {
    MirrorError::WriteFailed {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}

/// Remembers whether the file underneath failed, so errors surfacing
/// through the tar and gzip layers can be attributed to the right stage.
struct TrackedWriter<W> {
    inner: W,
    failed: Arc<AtomicBool>,
}

impl<W: Write> Write for TrackedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf).map_err(|e| {
            self.failed.store(true, Ordering::SeqCst);
            e
        })
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().map_err(|e| {
            self.failed.store(true, Ordering::SeqCst);
            e
        })
    }
}

/// Archive `layout` into `final_path` via a partial file. Blocking.
pub fn write_archive(layout: &Path, final_path: &Path, reference: &str) -> Result<u64> {
    let partial = partial_path(final_path);
    let result = write_partial(layout, &partial, reference).and_then(|_| {
        let bytes = verify_archive(&partial).map_err(|e| MirrorError::WriteFailed {
            path: partial.display().to_string(),
            message: format!("verification failed: {}", e),
        })?;
        std::fs::rename(&partial, final_path).map_err(|e| write_failed(final_path, e))?;
        Ok(bytes)
    });

    if result.is_err() {
        if let Err(e) = std::fs::remove_file(&partial) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %partial.display(), error = %e, "Failed to remove partial archive");
            }
        }
    }
    result
}

fn write_partial(layout: &Path, partial: &Path, reference: &str) -> Result<()> {
    let file = File::create(partial).map_err(|e| write_failed(partial, e))?;
    let failed = Arc::new(AtomicBool::new(false));
    let sink = TrackedWriter {
        inner: BufWriter::new(file),
        failed: failed.clone(),
    };

    let stage_error = |stage: &dyn Fn(String) -> MirrorError, e: io::Error| {
        if failed.load(Ordering::SeqCst) {
            write_failed(partial, e)
        } else {
            stage(e.to_string())
        }
    };
    let save = |message: String| MirrorError::SaveFailed {
        reference: reference.to_string(),
        message,
    };
    let compress = |message: String| MirrorError::CompressFailed {
        path: partial.display().to_string(),
        message,
    };

    // save: tar the layout
    let mut builder = tar::Builder::new(GzEncoder::new(sink, Compression::default()));
    builder.follow_symlinks(false);
    builder
        .append_dir_all(".", layout)
        .map_err(|e| stage_error(&save, e))?;
    let encoder = builder.into_inner().map_err(|e| stage_error(&save, e))?;

    // compress: flush the deflate stream and trailer
    let sink = encoder.finish().map_err(|e| stage_error(&compress, e))?;

    // write: make it durable
    let file = sink
        .inner
        .into_inner()
        .map_err(|e| write_failed(partial, e.into_error()))?;
    file.sync_all().map_err(|e| write_failed(partial, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use imirror_core::catalog::{Architecture, Component};
    use imirror_core::work::WorkKey;
    use std::sync::atomic::AtomicU32;
    use tempfile::TempDir;

    use crate::oci::PulledImage;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 12, 2).unwrap()
    }

    fn write_layout(dir: &Path) {
        std::fs::create_dir_all(dir.join("blobs/sha256")).unwrap();
        std::fs::write(dir.join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#).unwrap();
        std::fs::write(dir.join("index.json"), r#"{"schemaVersion":2,"manifests":[]}"#).unwrap();
        std::fs::write(dir.join("blobs/sha256/abc"), vec![7u8; 4096]).unwrap();
    }

    /// Pull behavior scripted per attempt.
    #[derive(Clone, Copy)]
    enum Script {
        Ok,
        Transient,
        Missing,
        Hang,
    }

    struct FakeSource {
        script: Vec<Script>,
        calls: AtomicU32,
    }

    impl FakeSource {
        fn new(script: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                script,
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ImageSource for FakeSource {
        async fn pull(
            &self,
            reference: &ImageReference,
            arch: Architecture,
            target_dir: &Path,
        ) -> Result<PulledImage> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            let step = self.script.get(n).copied().unwrap_or(Script::Ok);
            let failure = |cause| MirrorError::PullFailed {
                reference: reference.to_string(),
                arch: arch.to_string(),
                cause,
            };
            match step {
                Script::Ok => {
                    write_layout(target_dir);
                    Ok(PulledImage {
                        digest: "sha256:abc".to_string(),
                        layers: 1,
                        bytes: 4096,
                    })
                }
                Script::Transient => {
                    std::fs::write(target_dir.join("junk"), b"half a layer").unwrap();
                    Err(failure(PullFailure::Transient("connection reset".to_string())))
                }
                Script::Missing => Err(failure(PullFailure::TagMissing("manifest unknown".to_string()))),
                Script::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }

    fn item(resolver: &ArchivePathResolver, version: &str) -> WorkItem {
        WorkItem {
            key: WorkKey::new("elasticsearch", Architecture::Amd64, version),
            image: "docker.io/library/elasticsearch".to_string(),
            destination: resolver.resolve(date(), Architecture::Amd64, "elasticsearch", version),
            previous: Some("8.15.0".to_string()),
        }
    }

    fn worker(source: Arc<FakeSource>, root: &Path, attempts: u32) -> ExportWorker {
        ExportWorker::new(
            date(),
            source,
            ArchivePathResolver::new(root, false),
            RetryPolicy::immediate(attempts),
            Duration::from_secs(5),
            CancellationToken::new(),
        )
    }

    fn dir_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_export_writes_verified_archive() {
        let root = TempDir::new().unwrap();
        let source = FakeSource::new(vec![Script::Ok]);
        let worker = worker(source.clone(), root.path(), 3);
        let item = item(worker.resolver(), "8.16.0");

        let exported = worker.export(&item).await.unwrap();
        assert!(!exported.reused);
        assert_eq!(exported.path, item.destination);
        assert!(verify_archive(&exported.path).is_ok());
        assert_eq!(
            dir_entries(item.destination.parent().unwrap()),
            vec!["elasticsearch_8.16.0_amd64_20241202.tar.gz".to_string()],
            "no staging or partial files left behind"
        );
    }

    #[tokio::test]
    async fn test_archive_contains_layout() {
        let root = TempDir::new().unwrap();
        let worker = worker(FakeSource::new(vec![Script::Ok]), root.path(), 1);
        let item = item(worker.resolver(), "8.16.0");
        worker.export(&item).await.unwrap();

        let file = File::open(&item.destination).unwrap();
        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|n| n.ends_with("index.json")));
        assert!(names.iter().any(|n| n.ends_with("blobs/sha256/abc")));
    }

    #[tokio::test]
    async fn test_existing_archive_short_circuits() {
        let root = TempDir::new().unwrap();
        let source = FakeSource::new(vec![Script::Ok]);
        let worker = worker(source.clone(), root.path(), 1);
        let item = item(worker.resolver(), "8.16.0");

        worker.export(&item).await.unwrap();
        let before = std::fs::read(&item.destination).unwrap();

        let again = worker.export(&item).await.unwrap();
        assert!(again.reused);
        assert_eq!(source.calls(), 1, "second export must not pull");
        assert_eq!(std::fs::read(&item.destination).unwrap(), before);
    }

    #[tokio::test]
    async fn test_corrupt_existing_archive_is_replaced() {
        let root = TempDir::new().unwrap();
        let source = FakeSource::new(vec![Script::Ok]);
        let worker = worker(source.clone(), root.path(), 1);
        let item = item(worker.resolver(), "8.16.0");
        std::fs::create_dir_all(item.destination.parent().unwrap()).unwrap();
        std::fs::write(&item.destination, b"truncated").unwrap();

        let exported = worker.export(&item).await.unwrap();
        assert!(!exported.reused);
        assert_eq!(source.calls(), 1);
        assert!(verify_archive(&item.destination).is_ok());
    }

    #[tokio::test]
    async fn test_transient_pull_retried() {
        let root = TempDir::new().unwrap();
        let source = FakeSource::new(vec![Script::Transient, Script::Transient, Script::Ok]);
        let worker = worker(source.clone(), root.path(), 3);
        let item = item(worker.resolver(), "8.16.0");

        worker.export(&item).await.unwrap();
        assert_eq!(source.calls(), 3);
        assert!(verify_archive(&item.destination).is_ok());
    }

    #[tokio::test]
    async fn test_exhausted_retries_leave_nothing() {
        let root = TempDir::new().unwrap();
        let source = FakeSource::new(vec![Script::Transient, Script::Transient]);
        let worker = worker(source.clone(), root.path(), 2);
        let item = item(worker.resolver(), "8.16.0");

        let err = worker.export(&item).await.unwrap_err();
        assert!(matches!(err, MirrorError::PullFailed { cause: PullFailure::Transient(_), .. }));
        assert_eq!(source.calls(), 2);
        assert!(!item.destination.exists());
        assert!(dir_entries(item.destination.parent().unwrap()).is_empty());
    }

    #[tokio::test]
    async fn test_missing_tag_not_retried() {
        let root = TempDir::new().unwrap();
        let source = FakeSource::new(vec![Script::Missing]);
        let worker = worker(source.clone(), root.path(), 5);
        let item = item(worker.resolver(), "8.16.0");

        let err = worker.export(&item).await.unwrap_err();
        assert!(err.is_skip());
        assert_eq!(source.calls(), 1);
        assert!(!item.destination.exists());
    }

    #[tokio::test]
    async fn test_pull_timeout_is_transient() {
        let root = TempDir::new().unwrap();
        let source = FakeSource::new(vec![Script::Hang]);
        let worker = ExportWorker::new(
            date(),
            source,
            ArchivePathResolver::new(root.path(), false),
            RetryPolicy::no_retry(),
            Duration::from_millis(50),
            CancellationToken::new(),
        );
        let item = item(worker.resolver(), "8.16.0");

        let err = worker.export(&item).await.unwrap_err();
        assert!(err.is_transient());
        assert!(!item.destination.exists());
    }

    #[tokio::test]
    async fn test_cancel_mid_pull_leaves_no_partial() {
        let root = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let worker = ExportWorker::new(
            date(),
            FakeSource::new(vec![Script::Hang]),
            ArchivePathResolver::new(root.path(), false),
            RetryPolicy::immediate(3),
            Duration::from_secs(60),
            cancel.clone(),
        );
        let item = item(worker.resolver(), "8.16.0");

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let err = worker.export(&item).await.unwrap_err();
        assert!(matches!(err, MirrorError::Cancelled));
        assert!(!item.destination.exists());
        assert!(dir_entries(item.destination.parent().unwrap()).is_empty());
    }

    #[tokio::test]
    async fn test_path_collision_without_overwrite() {
        let root = TempDir::new().unwrap();
        let source = FakeSource::new(vec![Script::Ok, Script::Ok]);
        let worker = worker(source.clone(), root.path(), 1);

        worker.export(&item(worker.resolver(), "8.16.0")).await.unwrap();
        let err = worker
            .export(&item(worker.resolver(), "8.16.1"))
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::PathCollision { .. }));
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_overwrite_replaces_other_version() {
        let root = TempDir::new().unwrap();
        let source = FakeSource::new(vec![Script::Ok, Script::Ok]);
        let worker = ExportWorker::new(
            date(),
            source,
            ArchivePathResolver::new(root.path(), true),
            RetryPolicy::immediate(1),
            Duration::from_secs(5),
            CancellationToken::new(),
        );

        let old = item(worker.resolver(), "8.16.0");
        let new = item(worker.resolver(), "8.16.1");
        worker.export(&old).await.unwrap();
        worker.export(&new).await.unwrap();

        assert!(!old.destination.exists());
        assert!(new.destination.exists());
    }

    #[tokio::test]
    async fn test_other_major_line_is_not_a_collision() {
        let root = TempDir::new().unwrap();
        let source = FakeSource::new(vec![Script::Ok, Script::Ok, Script::Ok]);
        let catalog = vec![Component::new("postgresql-postgis", "docker.io/postgis/postgis").tracking_majors()];
        let worker = worker(source.clone(), root.path(), 1)
            .with_filters(Arc::new(CatalogFilters::compile(&catalog).unwrap()));
        let postgis = |version: &str| WorkItem {
            key: WorkKey::new("postgresql-postgis", Architecture::Amd64, version),
            image: "docker.io/postgis/postgis".to_string(),
            destination: worker
                .resolver()
                .resolve(date(), Architecture::Amd64, "postgresql-postgis", version),
            previous: None,
        };

        worker.export(&postgis("16-3.5")).await.unwrap();
        worker.export(&postgis("17-3.4")).await.unwrap();
        assert!(postgis("16-3.5").destination.exists());

        // A newer build of a line already on disk still collides
        let err = worker.export(&postgis("17-3.5")).await.unwrap_err();
        assert!(matches!(err, MirrorError::PathCollision { .. }));
        assert_eq!(source.calls(), 2);
    }

    #[test]
    fn test_write_archive_save_failure() {
        let dir = TempDir::new().unwrap();
        let final_path = dir.path().join("out.tar.gz");
        let err = write_archive(&dir.path().join("missing-layout"), &final_path, "x:1").unwrap_err();
        assert!(matches!(err, MirrorError::SaveFailed { .. }), "{:?}", err);
        assert!(!final_path.exists());
        assert!(!partial_path(&final_path).exists());
    }

    #[test]
    fn test_write_archive_write_failure() {
        let dir = TempDir::new().unwrap();
        write_layout(dir.path());
        let final_path = dir.path().join("no-such-dir").join("out.tar.gz");
        let err = write_archive(dir.path(), &final_path, "x:1").unwrap_err();
        assert!(matches!(err, MirrorError::WriteFailed { .. }), "{:?}", err);
    }
}
