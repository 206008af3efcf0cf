// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Storage reconciler: persistent volume layout, public links and cleanup.
//!
//! ## Layout
//!
//! ```text
//! <root>/
//!   downloads/<job_id>/...   install directory handed to the utility
//!   public/<job_id>          symlink (or copy) of a completed install
//!   state/jobs.json          job ledger
//! ```
//!
//! The downloader writes files without any locking, so existence checks on
//! the install directory are the only synchronization point between a
//! finishing job and this module.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::jobs::{Job, JobId, JobRegistry, PublicFile, PublicLink};

/// How long terminal jobs and orphaned files are kept.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub max_age: Duration,
}

impl RetentionPolicy {
    pub fn new(max_age: Duration) -> Self {
        Self { max_age }
    }
}

/// What one cleanup pass did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    /// Jobs removed from the registry along with their files.
    pub purged_jobs: Vec<JobId>,
    /// Orphaned entries removed from the downloads and public roots.
    pub removed_paths: Vec<PathBuf>,
    /// Completed jobs whose delayed finalize succeeded.
    pub finalized: Vec<JobId>,
    pub errors: Vec<String>,
}

impl CleanupReport {
    /// True when the pass deleted or finalized nothing.
    pub fn is_noop(&self) -> bool {
        self.purged_jobs.is_empty() && self.removed_paths.is_empty() && self.finalized.is_empty()
    }
}

/// Paths and link construction for the persistent volume.
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
    downloads: PathBuf,
    public: PathBuf,
    state: PathBuf,
    public_url: String,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>, public_url: impl Into<String>) -> Self {
        let root = root.into();
        Self {
            downloads: root.join("downloads"),
            public: root.join("public"),
            state: root.join("state"),
            public_url: public_url.into().trim_end_matches('/').to_string(),
            root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn downloads_root(&self) -> &Path {
        &self.downloads
    }

    pub fn public_root(&self) -> &Path {
        &self.public
    }

    pub fn state_dir(&self) -> &Path {
        &self.state
    }

    /// Create the directory layout if missing.
    pub fn ensure_layout(&self) -> Result<(), StorageError> {
        for dir in [&self.downloads, &self.public, &self.state] {
            fs::create_dir_all(dir).map_err(|e| StorageError::io(dir.clone(), e))?;
        }
        Ok(())
    }

    pub fn install_dir(&self, id: &JobId) -> PathBuf {
        self.downloads.join(id.as_str())
    }

    pub fn public_path(&self, id: &JobId) -> PathBuf {
        self.public.join(id.as_str())
    }

    fn link_url(&self, id: &JobId) -> String {
        format!("{}/public/{}", self.public_url, id)
    }

    fn source_dir(&self, job: &Job) -> PathBuf {
        job.output_path
            .clone()
            .unwrap_or_else(|| self.install_dir(&job.id))
    }

    /// Files under `dir` as `(relative path, size)`, sorted.
    ///
    /// Fails if `dir` is absent or holds no regular files.
    pub fn verify_output(&self, dir: &Path) -> Result<Vec<(String, u64)>, StorageError> {
        if !dir.is_dir() {
            return Err(StorageError::OutputMissing(dir.to_path_buf()));
        }
        let mut files = Vec::new();
        collect_files(dir, dir, &mut files)?;
        if files.is_empty() {
            return Err(StorageError::OutputEmpty(dir.to_path_buf()));
        }
        files.sort();
        Ok(files)
    }

    /// Publish a completed job's output and describe the result.
    ///
    /// Replaces any existing public entry, so calling it again is harmless.
    /// Callers claim the job first (see
    /// [`JobRegistry::claim_pending_finalize`]); two finalizers racing on
    /// one job may see an error but never damage the install directory.
    pub fn finalize(&self, job: &Job) -> Result<PublicLink, StorageError> {
        ensure_path_safe(&job.id)?;
        let source = self.source_dir(job);
        let files = self.verify_output(&source)?;

        fs::create_dir_all(&self.public).map_err(|e| StorageError::io(self.public.clone(), e))?;
        let link_path = self.public_path(&job.id);
        remove_entry(&link_path)?;
        publish(&source, &link_path)?;

        let url = self.link_url(&job.id);
        let total_bytes = files.iter().map(|(_, size)| size).sum();
        let files: Vec<PublicFile> = files
            .into_iter()
            .map(|(path, size)| PublicFile {
                url: format!("{}/{}", url, path),
                path,
                size,
            })
            .collect();

        info!(
            job_id = %job.id,
            files = files.len(),
            total_bytes,
            "Published download output"
        );
        Ok(PublicLink {
            job_id: job.id.clone(),
            target: job.target.clone(),
            path: link_path,
            url,
            files,
            total_bytes,
        })
    }

    /// Delete a job's install directory and public entry.
    pub fn purge(&self, job: &Job) -> Result<Vec<PathBuf>, StorageError> {
        ensure_path_safe(&job.id)?;
        let mut removed = Vec::new();
        for path in [self.public_path(&job.id), self.source_dir(job)] {
            if remove_entry(&path)? {
                removed.push(path);
            }
        }
        if !removed.is_empty() {
            debug!(job_id = %job.id, paths = removed.len(), "Purged job files");
        }
        Ok(removed)
    }

    /// One reconciliation sweep.
    ///
    /// 1. Retry finalize for completed jobs still lacking a link.
    /// 2. Purge terminal jobs older than the retention window.
    /// 3. Remove old entries under the downloads and public roots that no
    ///    job refers to.
    ///
    /// Errors are collected rather than returned; a job whose files could not
    /// be removed stays registered and is retried next pass. The caller
    /// decides how to report them.
    pub fn cleanup(&self, registry: &JobRegistry, policy: &RetentionPolicy) -> CleanupReport {
        let mut report = CleanupReport::default();

        for job in registry.claim_pending_finalize() {
            match self.finalize(&job) {
                Ok(link) => {
                    if registry.attach_link(&job.id, link).is_ok() {
                        report.finalized.push(job.id.clone());
                    }
                }
                Err(e) => {
                    let _ = registry.record_finalize_error(&job.id, e.to_string());
                    report.errors.push(format!("finalize {}: {}", job.id, e));
                }
            }
        }

        let cutoff = Utc::now()
            - chrono::Duration::from_std(policy.max_age).unwrap_or_else(|_| chrono::Duration::days(36500));
        for job in registry.finished_before(cutoff) {
            match self.purge(&job) {
                Ok(_) => {
                    if registry.delete(&job.id).is_ok() {
                        report.purged_jobs.push(job.id.clone());
                    }
                }
                Err(e) => report.errors.push(format!("purge {}: {}", job.id, e)),
            }
        }

        for root in [&self.downloads, &self.public] {
            if let Err(e) = self.sweep_orphans(root, registry, policy, &mut report) {
                report.errors.push(e.to_string());
            }
        }
        report
    }

    fn sweep_orphans(
        &self,
        root: &Path,
        registry: &JobRegistry,
        policy: &RetentionPolicy,
        report: &mut CleanupReport,
    ) -> Result<(), StorageError> {
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StorageError::io(root, e)),
        };
        let now = SystemTime::now();

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if registry.contains(&JobId::from(name.as_str())) {
                continue;
            }
            let path = entry.path();
            let modified = fs::symlink_metadata(&path)
                .and_then(|meta| meta.modified())
                .map_err(|e| StorageError::io(&path, e))?;
            let age = now.duration_since(modified).unwrap_or_default();
            if age < policy.max_age {
                continue;
            }
            match remove_entry(&path) {
                Ok(true) => report.removed_paths.push(path),
                Ok(false) => {}
                Err(e) => report.errors.push(e.to_string()),
            }
        }
        Ok(())
    }
}

fn ensure_path_safe(id: &JobId) -> Result<(), StorageError> {
    if id.is_path_safe() {
        Ok(())
    } else {
        Err(StorageError::io(
            id.as_str(),
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "job id is not a safe path component"),
        ))
    }
}

fn collect_files(base: &Path, dir: &Path, out: &mut Vec<(String, u64)>) -> Result<(), StorageError> {
    let entries = fs::read_dir(dir).map_err(|e| StorageError::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| StorageError::io(dir, e))?;
        let path = entry.path();
        let meta = fs::metadata(&path).map_err(|e| StorageError::io(&path, e))?;
        if meta.is_dir() {
            collect_files(base, &path, out)?;
        } else if meta.is_file() {
            let rel = path
                .strip_prefix(base)
                .unwrap_or(&path)
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            out.push((rel, meta.len()));
        }
    }
    Ok(())
}

/// Remove a file, directory or symlink without following links.
/// Returns false when nothing was there.
fn remove_entry(path: &Path) -> Result<bool, StorageError> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(StorageError::io(path, e)),
    };
    let result = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    result.map_err(|e| StorageError::io(path, e))?;
    Ok(true)
}

fn publish(source: &Path, link: &Path) -> Result<(), StorageError> {
    #[cfg(unix)]
    {
        match std::os::unix::fs::symlink(source, link) {
            Ok(()) => return Ok(()),
            // Someone else published first. Never copy over a live link.
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return match fs::read_link(link) {
                    Ok(target) if target == source => Ok(()),
                    _ => Err(StorageError::io(link, e)),
                };
            }
            Err(e) => debug!(error = %e, link = ?link, "Symlink failed; copying instead"),
        }
    }
    copy_tree(source, link)
}

/// True when `dest` already resolves to `source` or somewhere inside it.
fn resolves_into(source: &Path, dest: &Path) -> bool {
    match (fs::canonicalize(source), fs::canonicalize(dest)) {
        (Ok(source), Ok(dest)) => dest.starts_with(source),
        _ => false,
    }
}

fn copy_tree(source: &Path, dest: &Path) -> Result<(), StorageError> {
    if resolves_into(source, dest) {
        return Err(StorageError::io(
            dest,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "copy destination resolves into its source"),
        ));
    }
    fs::create_dir_all(dest).map_err(|e| StorageError::io(dest, e))?;
    let entries = fs::read_dir(source).map_err(|e| StorageError::io(source, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| StorageError::io(source, e))?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        let meta = fs::metadata(&from).map_err(|e| StorageError::io(&from, e))?;
        if meta.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            fs::copy(&from, &to).map_err(|e| StorageError::io(&from, e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobFailure, JobState, SubmitRequest};
    use tempfile::TempDir;

    fn setup() -> (TempDir, Storage, JobRegistry) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path(), "https://dl.example.com/");
        storage.ensure_layout().unwrap();
        (dir, storage, JobRegistry::new())
    }

    /// Submit and run a job to completion, optionally writing output.
    fn completed_job(storage: &Storage, registry: &JobRegistry, target: &str, write: bool) -> Job {
        let id = registry.submit(SubmitRequest::new(target)).unwrap();
        let ticket = registry.start_next(8, storage.downloads_root()).unwrap();
        if write {
            let dir = ticket.job.output_path.clone().unwrap();
            fs::create_dir_all(dir.join("bin")).unwrap();
            fs::write(dir.join("game.exe"), b"abcd").unwrap();
            fs::write(dir.join("bin").join("lib.so"), b"xy").unwrap();
        }
        registry.mark_completed(&id).unwrap()
    }

    #[test]
    fn test_finalize_publishes_files() {
        let (_dir, storage, registry) = setup();
        let job = completed_job(&storage, &registry, "740", true);

        let link = storage.finalize(&job).unwrap();
        assert_eq!(link.total_bytes, 6);
        assert_eq!(link.url, format!("https://dl.example.com/public/{}", job.id));
        let paths: Vec<_> = link.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["bin/lib.so", "game.exe"]);
        assert_eq!(link.files[1].url, format!("https://dl.example.com/public/{}/game.exe", job.id));
        assert!(storage.public_path(&job.id).join("game.exe").exists());

        let again = storage.finalize(&job).unwrap();
        assert_eq!(again, link);
    }

    #[test]
    fn test_concurrent_finalize_keeps_source_intact() {
        let (_dir, storage, registry) = setup();
        let job = completed_job(&storage, &registry, "740", true);
        let source = job.output_path.clone().unwrap();
        for i in 0..20 {
            fs::write(source.join(format!("chunk{:02}.bin", i)), vec![7u8; 4096]).unwrap();
        }

        std::thread::scope(|scope| {
            for _ in 0..2 {
                scope.spawn(|| {
                    for _ in 0..100 {
                        let _ = storage.finalize(&job);
                    }
                });
            }
        });

        for i in 0..20 {
            let size = fs::metadata(source.join(format!("chunk{:02}.bin", i))).unwrap().len();
            assert_eq!(size, 4096, "chunk{:02}.bin was truncated", i);
        }
        assert_eq!(fs::read(source.join("game.exe")).unwrap(), b"abcd");
        let link = storage.finalize(&job).unwrap();
        assert_eq!(link.total_bytes, 20 * 4096 + 6);
    }

    #[test]
    fn test_copy_refuses_destination_inside_source() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("a.bin"), b"payload").unwrap();

        assert!(copy_tree(&source, &source).is_err());
        assert_eq!(fs::read(source.join("a.bin")).unwrap(), b"payload");

        let dest = dir.path().join("copy");
        copy_tree(&source, &dest).unwrap();
        assert_eq!(fs::read(dest.join("a.bin")).unwrap(), b"payload");
    }

    #[test]
    fn test_cleanup_skips_job_claimed_by_supervisor() {
        let (_dir, storage, registry) = setup();
        let id = registry.submit(SubmitRequest::new("740")).unwrap();
        let ticket = registry.start_next(8, storage.downloads_root()).unwrap();
        let out = ticket.job.output_path.clone().unwrap();
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("game.exe"), b"abcd").unwrap();
        registry.begin_completion(&id).unwrap();
        registry.mark_completed(&id).unwrap();

        let report = storage.cleanup(&registry, &RetentionPolicy::new(Duration::ZERO));
        assert!(report.is_noop(), "{:?}", report);
        assert!(fs::symlink_metadata(storage.public_path(&id)).is_err());
        assert!(registry.contains(&id));
    }

    #[test]
    fn test_finalize_missing_output_keeps_job() {
        let (_dir, storage, registry) = setup();
        let job = completed_job(&storage, &registry, "740", false);

        assert!(matches!(storage.finalize(&job), Err(StorageError::OutputMissing(_))));
        assert_eq!(registry.get(&job.id).unwrap().state, JobState::Completed);
    }

    #[test]
    fn test_finalize_empty_output() {
        let (_dir, storage, registry) = setup();
        let job = completed_job(&storage, &registry, "740", false);
        fs::create_dir_all(job.output_path.as_ref().unwrap().join("empty-subdir")).unwrap();
        assert!(matches!(storage.finalize(&job), Err(StorageError::OutputEmpty(_))));
    }

    #[test]
    fn test_cleanup_purges_expired_jobs_once() {
        let (_dir, storage, registry) = setup();
        let job = completed_job(&storage, &registry, "740", true);
        let link = storage.finalize(&job).unwrap();
        registry.attach_link(&job.id, link).unwrap();

        let failed = registry.submit(SubmitRequest::new("10")).unwrap();
        registry.start_next(8, storage.downloads_root()).unwrap();
        registry.mark_failed(&failed, JobFailure::stalled()).unwrap();

        let policy = RetentionPolicy::new(Duration::ZERO);
        let first = storage.cleanup(&registry, &policy);
        assert_eq!(first.purged_jobs.len(), 2);
        assert!(first.errors.is_empty());
        assert!(!storage.install_dir(&job.id).exists());
        assert!(fs::symlink_metadata(storage.public_path(&job.id)).is_err());
        assert_eq!(registry.counts().total(), 0);

        let second = storage.cleanup(&registry, &policy);
        assert!(second.is_noop());
    }

    #[test]
    fn test_cleanup_keeps_recent_jobs() {
        let (_dir, storage, registry) = setup();
        let job = completed_job(&storage, &registry, "740", true);

        let report = storage.cleanup(&registry, &RetentionPolicy::new(Duration::from_secs(3600)));
        assert!(report.purged_jobs.is_empty());
        assert_eq!(report.finalized, vec![job.id.clone()]);
        assert!(registry.get(&job.id).unwrap().link.is_some());
        assert!(storage.install_dir(&job.id).exists());
    }

    #[test]
    fn test_cleanup_records_failed_finalize() {
        let (_dir, storage, registry) = setup();
        let job = completed_job(&storage, &registry, "740", false);

        let report = storage.cleanup(&registry, &RetentionPolicy::new(Duration::from_secs(3600)));
        assert_eq!(report.errors.len(), 1);
        let job = registry.get(&job.id).unwrap();
        assert!(job.finalize_error.is_some());
        assert_eq!(job.state, JobState::Completed);
    }

    #[test]
    fn test_cleanup_removes_orphans() {
        let (_dir, storage, registry) = setup();
        let orphan = storage.downloads_root().join("leftover");
        fs::create_dir_all(&orphan).unwrap();
        fs::write(orphan.join("f"), b"1").unwrap();

        let queued = registry.submit(SubmitRequest::new("1")).unwrap();
        let kept = storage.install_dir(&queued);
        fs::create_dir_all(&kept).unwrap();

        let policy = RetentionPolicy::new(Duration::ZERO);
        let report = storage.cleanup(&registry, &policy);
        assert_eq!(report.removed_paths, vec![orphan.clone()]);
        assert!(!orphan.exists());
        assert!(kept.exists());

        assert!(storage.cleanup(&registry, &policy).is_noop());
    }

    #[test]
    fn test_purge_rejects_unsafe_ids() {
        let (_dir, storage, _registry) = setup();
        let mut job = Job::new(JobId::from("../escape"), &SubmitRequest::new("1"));
        job.output_path = None;
        assert!(storage.purge(&job).is_err());
    }
}
