// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Process supervisor.
//!
//! Runs one task per running job. Each task spawns the download utility,
//! feeds its output through a [`ProgressParser`], watches for cancellation,
//! stalls and shutdown, and reports the outcome back to the registry:
//!
//! | Outcome | Job result |
//! |---------|------------|
//! | exit 0, output present | completed, then finalized |
//! | exit 0, output absent | failed: `output missing` |
//! | exit != 0 | failed: last error line, or `unknown` |
//! | silent for the stall timeout | terminated, failed: `stalled` |
//! | cancelled | terminated, failed: `cancelled` |
//! | service shutdown | terminated, failed: `interrupted` |
//!
//! Failed jobs are never restarted automatically.

pub mod command;
mod dispatcher;
pub mod process;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::error::StorageError;
use crate::jobs::{FailureKind, Job, JobFailure, JobId, JobRegistry, StartTicket};
use crate::metrics::Metrics;
use crate::progress::ProgressParser;
use crate::storage::Storage;
use crate::sync::resilient_lock;

pub use command::DownloadCommand;
pub use process::{ProcessHandle, RecentLines};

/// Output lines kept for failure diagnostics.
const RECENT_LINES: usize = 50;

/// Supervisor tunables.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub binary: PathBuf,
    pub max_concurrent: usize,
    pub stall_timeout: Duration,
    pub terminate_grace: Duration,
    pub recent_lines: usize,
}

impl SupervisorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            binary: config.steamcmd_path.clone(),
            max_concurrent: config.max_downloads,
            stall_timeout: config.stall_timeout(),
            terminate_grace: config.terminate_grace(),
            recent_lines: RECENT_LINES,
        }
    }
}

enum Outcome {
    Exited(Option<i32>),
    Cancelled,
    Stalled,
    Interrupted,
    Failed(String),
}

/// Owns the running-job pool.
pub struct Supervisor {
    registry: Arc<JobRegistry>,
    storage: Arc<Storage>,
    metrics: Arc<Metrics>,
    config: SupervisorConfig,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(
        registry: Arc<JobRegistry>,
        storage: Arc<Storage>,
        metrics: Arc<Metrics>,
        config: SupervisorConfig,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            registry,
            storage,
            metrics,
            config,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Start the dispatch loop that moves queued jobs into free slots.
    pub fn spawn_dispatcher(self: &Arc<Self>) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(dispatcher::run(supervisor, shutdown))
    }

    /// Start queued jobs until the pool is full. Returns how many started.
    pub fn dispatch_ready(self: &Arc<Self>) -> usize {
        if self.is_shutting_down() {
            return 0;
        }
        let mut started = 0;
        while let Some(ticket) = self
            .registry
            .start_next(self.config.max_concurrent, self.storage.downloads_root())
        {
            let supervisor = Arc::clone(self);
            let handle = tokio::spawn(supervisor.supervise(ticket));
            let mut tasks = resilient_lock(&self.tasks);
            tasks.retain(|task| !task.is_finished());
            tasks.push(handle);
            started += 1;
        }
        started
    }

    /// Stop dispatching, terminate running jobs and wait for their tasks.
    ///
    /// Running jobs end as failed with reason `interrupted`.
    pub async fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        let tasks: Vec<_> = resilient_lock(&self.tasks).drain(..).collect();
        info!(running = tasks.len(), "Supervisor shutting down");

        let deadline = self.config.terminate_grace + Duration::from_secs(5);
        for task in tasks {
            if tokio::time::timeout(deadline, task).await.is_err() {
                warn!("Supervisor task did not stop in time");
            }
        }
    }

    // =========================================================================
    // PER-JOB TASK
    // =========================================================================

    async fn supervise(self: Arc<Self>, ticket: StartTicket) {
        let StartTicket {
            job,
            credentials,
            mut cancel,
        } = ticket;
        let id = job.id.clone();
        let install_dir = job
            .output_path
            .clone()
            .unwrap_or_else(|| self.storage.install_dir(&id));

        if let Err(e) = tokio::fs::create_dir_all(&install_dir).await {
            error!(job_id = %id, path = ?install_dir, error = %e, "Cannot create install directory");
            self.metrics.record_error();
            self.fail(&id, JobFailure::spawn(format!("cannot create {}: {}", install_dir.display(), e)));
            return;
        }

        let command = DownloadCommand::new(&self.config.binary, &install_dir, &job.target, credentials)
            .platform(job.platform)
            .validate(job.validate);
        let mut handle = match ProcessHandle::start(&command) {
            Ok(handle) => handle,
            Err(e) => {
                error!(job_id = %id, error = %e, "Failed to launch download utility");
                self.metrics.record_error();
                self.fail(&id, JobFailure::spawn(&e));
                return;
            }
        };

        self.metrics.record_started();
        info!(
            job_id = %id,
            target = %job.target,
            login = %job.login,
            pid = ?handle.pid(),
            "Download started"
        );

        let started = Instant::now();
        let mut parser = ProgressParser::new();
        let mut recent = RecentLines::new(self.config.recent_lines);
        let outcome = self
            .drive(&id, &mut handle, &mut parser, &mut recent, &mut cancel)
            .await;
        self.finish(&job, &mut handle, outcome, &parser, &recent, &mut cancel, started.elapsed())
            .await;
    }

    /// Pump output into the parser until the process exits or something
    /// forces it to stop.
    async fn drive(
        &self,
        id: &JobId,
        handle: &mut ProcessHandle,
        parser: &mut ProgressParser,
        recent: &mut RecentLines,
        cancel: &mut oneshot::Receiver<()>,
    ) -> Outcome {
        let mut lines = match handle.output_stream() {
            Ok(lines) => lines,
            Err(e) => return Outcome::Failed(e.to_string()),
        };
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Outcome::Interrupted;
        }

        let stall = self.config.stall_timeout;
        let mut cancel_armed = true;
        loop {
            tokio::select! {
                biased;
                received = &mut *cancel, if cancel_armed => {
                    cancel_armed = false;
                    if received.is_ok() {
                        return Outcome::Cancelled;
                    }
                }
                _ = shutdown.changed() => return Outcome::Interrupted,
                next = tokio::time::timeout(stall, lines.next()) => match next {
                    Err(_) => return Outcome::Stalled,
                    Ok(Some(line)) => {
                        trace!(job_id = %id, line = %line, "utility output");
                        recent.push(&line);
                        if let Some(event) = parser.parse_line(&line) {
                            let _ = self.registry.update_progress(id, &event);
                        }
                    }
                    Ok(None) => break,
                },
            }
        }

        // Both pipes closed; the process should be on its way out.
        match tokio::time::timeout(stall, handle.wait()).await {
            Err(_) => Outcome::Stalled,
            Ok(Ok(code)) => Outcome::Exited(code),
            Ok(Err(e)) => Outcome::Failed(e.to_string()),
        }
    }

    async fn finish(
        &self,
        job: &Job,
        handle: &mut ProcessHandle,
        outcome: Outcome,
        parser: &ProgressParser,
        recent: &RecentLines,
        cancel: &mut oneshot::Receiver<()>,
        elapsed: Duration,
    ) {
        let id = &job.id;
        match outcome {
            Outcome::Exited(Some(0)) => self.complete(job, cancel, elapsed).await,
            Outcome::Exited(code) => {
                self.metrics.record_error();
                let failure = JobFailure::subprocess(code, parser.last_error());
                warn!(job_id = %id, exit_code = ?code, reason = %failure.reason, "Download failed");
                for line in recent.lines() {
                    debug!(job_id = %id, line, "recent output");
                }
                self.fail(id, failure);
            }
            Outcome::Cancelled => {
                self.stop(id, handle).await;
                self.metrics.record_cancelled();
                info!(job_id = %id, "Download cancelled");
                self.fail(id, JobFailure::cancelled());
            }
            Outcome::Stalled => {
                warn!(
                    job_id = %id,
                    stall_secs = self.config.stall_timeout.as_secs_f64(),
                    "No output within stall timeout; terminating"
                );
                self.stop(id, handle).await;
                self.metrics.record_error();
                self.fail(id, JobFailure::stalled());
            }
            Outcome::Interrupted => {
                self.stop(id, handle).await;
                self.fail(id, JobFailure::interrupted());
            }
            Outcome::Failed(reason) => {
                error!(job_id = %id, reason = %reason, "Lost contact with download utility");
                self.stop(id, handle).await;
                self.metrics.record_error();
                self.fail(id, JobFailure::new(FailureKind::Subprocess, reason));
            }
        }
    }

    async fn complete(&self, job: &Job, cancel: &mut oneshot::Receiver<()>, elapsed: Duration) {
        let id = &job.id;
        if let Err(e) = self.registry.begin_completion(id) {
            debug!(job_id = %id, error = %e, "Job left running state before completion");
            return;
        }
        // A cancel sent before the claim is still buffered here.
        if cancel.try_recv().is_ok() {
            self.metrics.record_cancelled();
            info!(job_id = %id, "Download cancelled as the utility exited");
            self.fail(id, JobFailure::cancelled());
            return;
        }

        let dir = job
            .output_path
            .clone()
            .unwrap_or_else(|| self.storage.install_dir(id));

        if let Err(e) = self.with_storage(move |storage| storage.verify_output(&dir)).await {
            warn!(job_id = %id, error = %e, "Utility reported success but output is missing");
            self.metrics.record_error();
            self.fail(id, JobFailure::output_missing());
            return;
        }

        let completed = match self.registry.mark_completed(id) {
            Ok(job) => job,
            Err(e) => {
                warn!(job_id = %id, error = %e, "Could not mark job completed");
                return;
            }
        };
        self.metrics.record_completed(elapsed);
        info!(job_id = %id, elapsed_secs = elapsed.as_secs(), "Download completed");

        let to_finalize = completed.clone();
        match self.with_storage(move |storage| storage.finalize(&to_finalize)).await {
            Ok(link) => {
                self.metrics.record_finalized(link.total_bytes);
                let _ = self.registry.attach_link(id, link);
            }
            Err(e) => {
                warn!(job_id = %id, error = %e, "Finalize failed; cleanup will retry");
                let _ = self.registry.record_finalize_error(id, e.to_string());
            }
        }
    }

    async fn with_storage<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Storage) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let storage = Arc::clone(&self.storage);
        let root = storage.root().to_path_buf();
        tokio::task::spawn_blocking(move || f(&storage))
            .await
            .unwrap_or_else(|e| Err(StorageError::io(root, std::io::Error::other(e.to_string()))))
    }

    async fn stop(&self, id: &JobId, handle: &mut ProcessHandle) {
        if let Err(e) = handle.terminate(self.config.terminate_grace).await {
            warn!(job_id = %id, error = %e, "Failed to terminate download utility");
        }
    }

    fn fail(&self, id: &JobId, failure: JobFailure) {
        if let Err(e) = self.registry.mark_failed(id, failure) {
            debug!(job_id = %id, error = %e, "Job already finished");
        }
    }
}
