//! Workspace archiving.
//!
//! A terminated job's workspace is packed into `<downloads>/<job_id>.tar.gz`
//! and served statically under `/downloads/`.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use flate2::Compression;
use flate2::write::GzEncoder;
use uuid::Uuid;

use crate::error::OrchestratorError;

/// URL prefix the downloads directory is mounted at.
pub const DOWNLOADS_ROUTE: &str = "/downloads";

/// Packs workspaces and serialises archive writes per job.
#[derive(Debug)]
pub struct Archiver {
    downloads_dir: PathBuf,
    guards: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    written: AtomicU64,
}

impl Archiver {
    pub fn new(downloads_dir: impl Into<PathBuf>) -> Self {
        Self {
            downloads_dir: downloads_dir.into(),
            guards: Mutex::new(HashMap::new()),
            written: AtomicU64::new(0),
        }
    }

    pub fn downloads_dir(&self) -> &Path {
        &self.downloads_dir
    }

    pub fn archive_name(job_id: Uuid) -> String {
        format!("{job_id}.tar.gz")
    }

    pub fn archive_path(&self, job_id: Uuid) -> PathBuf {
        self.downloads_dir.join(Self::archive_name(job_id))
    }

    /// Public reference to a job's archive.
    pub fn download_url(job_id: Uuid) -> String {
        format!("{DOWNLOADS_ROUTE}/{}", Self::archive_name(job_id))
    }

    /// Per-job lock. Whoever holds it is the only writer of that job's
    /// archive; later callers wait and then see the published reference.
    pub fn guard(&self, job_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut guards = self.guards.lock().unwrap_or_else(PoisonError::into_inner);
        guards.entry(job_id).or_default().clone()
    }

    /// Drop a job's lock once its download reference is published. Callers
    /// still holding a clone finish normally; later ones take a fresh lock
    /// and find the reference already set.
    pub fn release_guard(&self, job_id: Uuid) {
        let mut guards = self.guards.lock().unwrap_or_else(PoisonError::into_inner);
        guards.remove(&job_id);
    }

    /// Number of archives successfully written since start-up.
    pub fn archives_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn guard_count(&self) -> usize {
        self.guards.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Pack `workspace` into the job's archive and return its path.
    ///
    /// The tarball is written next to its final name and renamed into place,
    /// so the download route never serves a partial file.
    pub async fn archive(&self, job_id: Uuid, workspace: &Path) -> Result<PathBuf, OrchestratorError> {
        let workspace = workspace.to_path_buf();
        let dest = self.archive_path(job_id);
        let downloads_dir = self.downloads_dir.clone();

        let dest_for_task = dest.clone();
        let result = tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&downloads_dir)?;
            write_tar_gz(&workspace, &dest_for_task)
        })
        .await;

        match result {
            Ok(Ok(())) => {
                let total = self.written.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::info!(job_id = %job_id, archive = %dest.display(), total, "Archived workspace");
                Ok(dest)
            }
            Ok(Err(e)) => Err(OrchestratorError::ArchiveFailed {
                job_id,
                reason: e.to_string(),
            }),
            Err(e) => Err(OrchestratorError::ArchiveFailed {
                job_id,
                reason: format!("archive task failed to join: {}", e),
            }),
        }
    }
}

/// Write `src` as a gzipped tarball at `dest`, atomically.
fn write_tar_gz(src: &Path, dest: &Path) -> std::io::Result<()> {
    let partial = dest.with_extension("gz.partial");
    let write = || -> std::io::Result<()> {
        let file = File::create(&partial)?;
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        // Store links as links; never pull in files from outside the workspace.
        builder.follow_symlinks(false);
        builder.append_dir_all(".", src)?;
        let file = builder.into_inner()?.finish()?;
        file.sync_all()
    };

    if let Err(e) = write() {
        let _ = std::fs::remove_file(&partial);
        return Err(e);
    }
    std::fs::rename(&partial, dest)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::io::Read;

    use flate2::read::GzDecoder;

    use super::*;

    fn entries(archive: &Path) -> BTreeSet<String> {
        let file = File::open(archive).unwrap();
        let mut tar = tar::Archive::new(GzDecoder::new(file));
        tar.entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect()
    }

    #[test]
    fn test_guard_released_after_publish() {
        let archiver = Archiver::new("/tmp/unused");
        let id = Uuid::new_v4();
        let held = archiver.guard(id);
        assert!(Arc::ptr_eq(&held, &archiver.guard(id)));
        assert_eq!(archiver.guard_count(), 1);

        archiver.release_guard(id);
        assert_eq!(archiver.guard_count(), 0);
        archiver.release_guard(id);
    }

    #[test]
    fn test_download_url_format() {
        let id = Uuid::new_v4();
        assert_eq!(Archiver::download_url(id), format!("/downloads/{id}.tar.gz"));
    }

    #[tokio::test]
    async fn test_archive_contains_workspace_files() {
        let workspace = tempfile::tempdir().unwrap();
        let downloads = tempfile::tempdir().unwrap();
        std::fs::write(workspace.path().join("hello.txt"), "hi").unwrap();
        std::fs::create_dir_all(workspace.path().join(".agent")).unwrap();
        std::fs::write(workspace.path().join(".agent/transcript.json"), "[]").unwrap();

        let archiver = Archiver::new(downloads.path().join("nested"));
        let id = Uuid::new_v4();
        let path = archiver.archive(id, workspace.path()).await.unwrap();

        assert_eq!(path, archiver.archive_path(id));
        assert!(!path.with_extension("gz.partial").exists());

        let names = entries(&path);
        assert!(names.iter().any(|n| n.ends_with("hello.txt")), "got: {names:?}");
        assert!(
            names.iter().any(|n| n.ends_with(".agent/transcript.json")),
            "got: {names:?}"
        );

        let mut tar = tar::Archive::new(GzDecoder::new(File::open(&path).unwrap()));
        let mut found = String::new();
        for entry in tar.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.path().unwrap().ends_with("hello.txt") {
                entry.read_to_string(&mut found).unwrap();
            }
        }
        assert_eq!(found, "hi");
    }

    #[tokio::test]
    async fn test_missing_workspace_fails_without_leftovers() {
        let downloads = tempfile::tempdir().unwrap();
        let archiver = Archiver::new(downloads.path());
        let id = Uuid::new_v4();

        let err = archiver
            .archive(id, Path::new("/nonexistent/agentbox/workspace"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ArchiveFailed { .. }));
        assert!(!archiver.archive_path(id).exists());
        assert!(!archiver.archive_path(id).with_extension("gz.partial").exists());
    }

    #[test]
    fn test_guard_is_shared_per_job() {
        let archiver = Archiver::new("/tmp/unused");
        let id = Uuid::new_v4();
        assert!(Arc::ptr_eq(&archiver.guard(id), &archiver.guard(id)));
        assert!(!Arc::ptr_eq(&archiver.guard(id), &archiver.guard(Uuid::new_v4())));
    }
}
