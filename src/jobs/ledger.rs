// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persistent job ledger.
//!
//! The registry writes every job snapshot to `state/jobs.json` after each
//! transition, so a restart can tell users what happened to their downloads.
//! Credentials are never part of a snapshot and so never reach disk.
//!
//! Writes go to a temp file and are renamed into place while holding an
//! exclusive lock on `state/jobs.lock`; reads take a shared lock.
//!
//! The registry never saves inline. It hands snapshots to a [`LedgerWriter`],
//! whose thread does the disk work and coalesces bursts down to the newest
//! snapshot, so a slow disk or a contended lock file never holds up the job
//! table.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::types::Job;

/// Default timeout for acquiring the ledger lock.
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry interval while the lock is held elsewhere.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

const LEDGER_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct LedgerFile {
    version: u32,
    saved_at: DateTime<Utc>,
    jobs: Vec<Job>,
}

/// On-disk record of every known job.
#[derive(Debug, Clone)]
pub struct JobLedger {
    path: PathBuf,
    lock_timeout: Duration,
}

impl JobLedger {
    /// Ledger stored as `jobs.json` inside `state_dir`.
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            path: state_dir.as_ref().join("jobs.json"),
            lock_timeout: LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    fn open_lock_file(path: &Path) -> Result<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create ledger directory: {:?}", parent))?;
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open ledger lock file: {:?}", path))
    }

    fn lock_with_timeout(file: &File, exclusive: bool, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            let attempt = if exclusive {
                FileExt::try_lock_exclusive(file)
            } else {
                FileExt::try_lock_shared(file)
            };
            match attempt {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        bail!(
                            "Timed out after {:?} waiting for the job ledger lock. \
                             Another instance may be using the same storage volume.",
                            timeout
                        );
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => return Err(e).context("Failed to lock job ledger"),
            }
        }
    }

    /// Read every persisted job. A missing ledger is an empty one.
    pub fn load(&self) -> Result<Vec<Job>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let lock_file = Self::open_lock_file(&self.lock_path())?;
        Self::lock_with_timeout(&lock_file, false, self.lock_timeout)?;

        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read job ledger: {:?}", self.path))?;
        let ledger: LedgerFile =
            serde_json::from_str(&content).context("Failed to parse job ledger")?;

        if ledger.version > LEDGER_VERSION {
            bail!(
                "Job ledger version {} is newer than supported version {}",
                ledger.version,
                LEDGER_VERSION
            );
        }
        Ok(ledger.jobs)
    }

    /// Replace the ledger with `jobs`.
    pub fn save(&self, jobs: &[Job]) -> Result<()> {
        // Held until the rename below completes.
        let lock_file = Self::open_lock_file(&self.lock_path())?;
        Self::lock_with_timeout(&lock_file, true, self.lock_timeout)?;

        let content = serde_json::to_string_pretty(&LedgerFile {
            version: LEDGER_VERSION,
            saved_at: Utc::now(),
            jobs: jobs.to_vec(),
        })
        .context("Failed to serialize job ledger")?;

        let temp_path = self.path.with_extension("tmp");
        {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .with_context(|| format!("Failed to create temp ledger: {:?}", temp_path))?;
            temp_file
                .write_all(content.as_bytes())
                .context("Failed to write temp ledger")?;
            temp_file.sync_all().context("Failed to sync temp ledger")?;
        }

        fs::rename(&temp_path, &self.path).with_context(|| {
            format!("Failed to move ledger into place: {:?} -> {:?}", temp_path, self.path)
        })?;
        Ok(())
    }
}

// =============================================================================
// BACKGROUND WRITER
// =============================================================================

enum WriterCommand {
    Save(Vec<Job>),
    Flush(oneshot::Sender<()>),
}

/// Owns every save of one ledger.
///
/// Snapshots are queued without touching the disk. Dropping the writer
/// drains the queue and joins the thread.
pub struct LedgerWriter {
    ledger: JobLedger,
    commands: Option<mpsc::UnboundedSender<WriterCommand>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl LedgerWriter {
    /// Start the writer thread. If the thread cannot be started, saves
    /// happen on the caller's thread instead.
    pub fn spawn(ledger: JobLedger) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = ledger.clone();
        match thread::Builder::new()
            .name("ledger-writer".into())
            .spawn(move || writer_loop(worker, rx))
        {
            Ok(handle) => Self {
                ledger,
                commands: Some(tx),
                thread: Some(handle),
            },
            Err(e) => {
                warn!(error = %e, "Could not start ledger writer; saving inline");
                Self {
                    ledger,
                    commands: None,
                    thread: None,
                }
            }
        }
    }

    pub fn ledger(&self) -> &JobLedger {
        &self.ledger
    }

    /// Queue a snapshot. Returns immediately.
    pub fn save(&self, jobs: Vec<Job>) {
        match &self.commands {
            Some(tx) if tx.send(WriterCommand::Save(jobs.clone())).is_ok() => {}
            _ => save_logged(&self.ledger, &jobs),
        }
    }

    /// Block until every snapshot queued so far is on disk.
    ///
    /// Must not be called from inside an async task; use `spawn_blocking`.
    pub fn flush(&self) {
        let Some(tx) = &self.commands else {
            return;
        };
        let (ack, done) = oneshot::channel();
        if tx.send(WriterCommand::Flush(ack)).is_ok() {
            let _ = done.blocking_recv();
        }
    }
}

impl Drop for LedgerWriter {
    fn drop(&mut self) {
        // Closing the channel ends the loop once the queue is drained.
        self.commands.take();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("Ledger writer thread panicked");
            }
        }
    }
}

fn writer_loop(ledger: JobLedger, mut commands: mpsc::UnboundedReceiver<WriterCommand>) {
    while let Some(first) = commands.blocking_recv() {
        let mut latest = None;
        let mut waiters = Vec::new();
        let mut next = Some(first);
        while let Some(command) = next {
            match command {
                WriterCommand::Save(jobs) => latest = Some(jobs),
                WriterCommand::Flush(ack) => waiters.push(ack),
            }
            next = commands.try_recv().ok();
        }

        if let Some(jobs) = latest {
            save_logged(&ledger, &jobs);
        }
        for ack in waiters {
            let _ = ack.send(());
        }
    }
    debug!("Ledger writer stopped");
}

fn save_logged(ledger: &JobLedger, jobs: &[Job]) {
    if let Err(e) = ledger.save(jobs) {
        warn!(path = ?ledger.path(), error = %e, "Failed to persist job ledger");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{JobId, JobState, SubmitRequest};
    use tempfile::TempDir;

    #[test]
    fn test_missing_ledger_is_empty() {
        let dir = TempDir::new().unwrap();
        let ledger = JobLedger::new(dir.path().join("state"));
        assert!(ledger.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_then_load_preserves_order_and_state() {
        let dir = TempDir::new().unwrap();
        let ledger = JobLedger::new(dir.path());

        let mut first = Job::new(JobId::generate(), &SubmitRequest::new("10"));
        first.state = JobState::Completed;
        let second = Job::new(JobId::generate(), &SubmitRequest::new("20"));

        ledger.save(&[first.clone(), second.clone()]).unwrap();
        let loaded = ledger.load().unwrap();

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, first.id);
        assert_eq!(loaded[0].state, JobState::Completed);
        assert_eq!(loaded[1].target, "20");
        assert!(!dir.path().join("jobs.tmp").exists());
    }

    #[test]
    fn test_corrupt_ledger_is_an_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("jobs.json"), "{ not json").unwrap();
        assert!(JobLedger::new(dir.path()).load().is_err());
    }

    #[test]
    fn test_save_times_out_while_locked() {
        let dir = TempDir::new().unwrap();
        let ledger = JobLedger::new(dir.path()).with_lock_timeout(Duration::from_millis(150));

        let holder = JobLedger::open_lock_file(&ledger.lock_path()).unwrap();
        holder.lock_exclusive().unwrap();

        let start = Instant::now();
        let result = ledger.save(&[]);
        assert!(result.is_err());
        assert!(start.elapsed() >= Duration::from_millis(150));

        holder.unlock().unwrap();
        assert!(ledger.save(&[]).is_ok());
    }

    #[test]
    fn test_writer_keeps_newest_snapshot() {
        let dir = TempDir::new().unwrap();
        let writer = LedgerWriter::spawn(JobLedger::new(dir.path()));

        let mut job = Job::new(JobId::generate(), &SubmitRequest::new("10"));
        writer.save(vec![job.clone()]);
        job.state = JobState::Running;
        writer.save(vec![job.clone()]);
        job.state = JobState::Completed;
        writer.save(vec![job.clone()]);
        writer.flush();

        let loaded = JobLedger::new(dir.path()).load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].state, JobState::Completed);
    }

    #[test]
    fn test_writer_save_returns_while_lock_held() {
        let dir = TempDir::new().unwrap();
        let ledger = JobLedger::new(dir.path());
        let holder = JobLedger::open_lock_file(&ledger.lock_path()).unwrap();
        holder.lock_exclusive().unwrap();

        let writer = LedgerWriter::spawn(ledger);
        let start = Instant::now();
        writer.save(vec![Job::new(JobId::generate(), &SubmitRequest::new("10"))]);
        assert!(start.elapsed() < Duration::from_millis(100));

        holder.unlock().unwrap();
        drop(writer);
        assert_eq!(JobLedger::new(dir.path()).load().unwrap().len(), 1);
    }
}
