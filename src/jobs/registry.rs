// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The job registry: sole owner of job state.
//!
//! Every read and write of a job goes through [`JobRegistry`]. The supervisor
//! and storage reconciler never touch job records directly; they call the
//! mutation methods here, which validate the transition, update the record,
//! publish a snapshot on the event channel and queue a ledger save, all under
//! one lock. Disk writes happen on the [`LedgerWriter`] thread.
//!
//! Once the supervisor sees a clean exit it claims the job with
//! [`JobRegistry::begin_completion`]. From then until the public link (or a
//! finalize error) is recorded, the job cannot be cancelled or deleted and no
//! other finalizer will pick it up.
//!
//! ## Transitions
//!
//! ```text
//! queued ──start_next──▶ running ──mark_completed──▶ completed
//!    │                      │
//!    └──cancel──▶ failed ◀──┴──mark_failed
//! ```

use std::path::Path;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::{broadcast, oneshot, Notify};
use tracing::{debug, info, warn};

use super::ledger::{JobLedger, LedgerWriter};
use super::types::{Credentials, Job, JobFailure, JobId, JobState, PublicLink, SubmitRequest};
use crate::error::JobError;
use crate::progress::ProgressEvent;
use crate::sync::{resilient_read, resilient_write};

/// Events buffered per subscriber before it starts lagging.
const EVENT_CAPACITY: usize = 256;

/// Longest accepted target identifier.
const MAX_TARGET_LEN: usize = 10;

/// Change notification emitted by the registry.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Updated(Job),
    Removed(JobId),
}

/// Everything the supervisor needs to run a job it was just handed.
#[derive(Debug)]
pub struct StartTicket {
    pub job: Job,
    pub credentials: Credentials,
    /// Fires when the job is cancelled while running.
    pub cancel: oneshot::Receiver<()>,
}

/// Number of jobs in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StateCounts {
    pub fn total(&self) -> usize {
        self.queued + self.running + self.completed + self.failed
    }
}

struct JobEntry {
    job: Job,
    /// Held only while queued; handed to the supervisor on start.
    credentials: Option<Credentials>,
    cancel: Option<oneshot::Sender<()>>,
    /// Set while exactly one caller verifies and publishes the output.
    finalizing: bool,
}

impl JobEntry {
    fn new(job: Job, credentials: Option<Credentials>) -> Self {
        Self {
            job,
            credentials,
            cancel: None,
            finalizing: false,
        }
    }
}

/// Authoritative, insertion-ordered job table.
pub struct JobRegistry {
    jobs: RwLock<IndexMap<JobId, JobEntry>>,
    events: broadcast::Sender<JobEvent>,
    wake: Arc<Notify>,
    ledger: Option<LedgerWriter>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    /// In-memory registry with no ledger.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            jobs: RwLock::new(IndexMap::new()),
            events,
            wake: Arc::new(Notify::new()),
            ledger: None,
        }
    }

    /// Registry backed by a ledger, restoring whatever it holds.
    ///
    /// Jobs that were queued or running when the previous process stopped
    /// come back as failed with reason `interrupted`. An unreadable ledger is
    /// logged and ignored.
    pub fn with_ledger(ledger: JobLedger) -> Self {
        let mut registry = Self::new();
        let restored = match ledger.load() {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(path = ?ledger.path(), error = %e, "Ignoring unreadable job ledger");
                Vec::new()
            }
        };
        registry.ledger = Some(LedgerWriter::spawn(ledger));

        let mut interrupted = 0usize;
        {
            let mut jobs = resilient_write(&registry.jobs);
            for mut job in restored {
                if job.state.is_active() {
                    job.state = JobState::Failed;
                    job.error = Some(JobFailure::interrupted());
                    job.finished_at = Some(Utc::now());
                    job.touch();
                    interrupted += 1;
                }
                jobs.insert(job.id.clone(), JobEntry::new(job, None));
            }
            if !jobs.is_empty() {
                info!(jobs = jobs.len(), interrupted, "Restored jobs from ledger");
            }
            if interrupted > 0 {
                registry.persist(&jobs);
            }
        }
        registry
    }

    /// Receive every snapshot the registry publishes.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Signalled whenever a queued job appears or a running slot frees.
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    pub fn get(&self, id: &JobId) -> Result<Job, JobError> {
        resilient_read(&self.jobs)
            .get(id)
            .map(|entry| entry.job.clone().with_timing(Utc::now()))
            .ok_or_else(|| JobError::NotFound(id.clone()))
    }

    pub fn contains(&self, id: &JobId) -> bool {
        resilient_read(&self.jobs).contains_key(id)
    }

    /// Jobs in submission order, optionally filtered by state.
    pub fn list(&self, filter: Option<JobState>) -> Vec<Job> {
        let now = Utc::now();
        resilient_read(&self.jobs)
            .values()
            .filter(|entry| filter.map_or(true, |state| entry.job.state == state))
            .map(|entry| entry.job.clone().with_timing(now))
            .collect()
    }

    pub fn counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for entry in resilient_read(&self.jobs).values() {
            match entry.job.state {
                JobState::Queued => counts.queued += 1,
                JobState::Running => counts.running += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Terminal jobs that finished at or before `cutoff`, skipping any that
    /// are being finalized.
    pub fn finished_before(&self, cutoff: DateTime<Utc>) -> Vec<Job> {
        resilient_read(&self.jobs)
            .values()
            .filter(|entry| {
                entry.job.is_terminal()
                    && !entry.finalizing
                    && entry.job.finished_at.unwrap_or(entry.job.updated_at) <= cutoff
            })
            .map(|entry| entry.job.clone())
            .collect()
    }

    // =========================================================================
    // COMMANDS
    // =========================================================================

    /// Queue a new download.
    pub fn submit(&self, mut request: SubmitRequest) -> Result<JobId, JobError> {
        request.target = validate_target(&request.target)?;

        let mut jobs = resilient_write(&self.jobs);
        if let Some(active) = jobs
            .values()
            .find(|entry| entry.job.target == request.target && entry.job.state.is_active())
        {
            return Err(JobError::AlreadyActive {
                target: request.target,
                job_id: active.job.id.clone(),
            });
        }

        let id = JobId::generate();
        let job = Job::new(id.clone(), &request);
        info!(
            job_id = %id,
            target = %job.target,
            login = %job.login,
            "Job queued"
        );
        jobs.insert(id.clone(), JobEntry::new(job, Some(request.credentials)));
        self.commit(&jobs, &id);
        drop(jobs);

        self.wake.notify_one();
        Ok(id)
    }

    /// Cancel a queued or running job.
    ///
    /// A queued job fails immediately with reason `cancelled` and never runs.
    /// A running job is signalled; the supervisor terminates its process and
    /// records the failure, so the returned snapshot may still say running.
    /// A job whose utility already exited cleanly can no longer be cancelled.
    pub fn cancel(&self, id: &JobId) -> Result<Job, JobError> {
        let mut jobs = resilient_write(&self.jobs);
        let entry = jobs
            .get_mut(id)
            .ok_or_else(|| JobError::NotFound(id.clone()))?;
        if entry.finalizing {
            return Err(JobError::Finalizing(id.clone()));
        }

        match entry.job.state {
            JobState::Queued => {
                fail_entry(entry, JobFailure::cancelled());
                let job = entry.job.clone();
                info!(job_id = %id, "Queued job cancelled");
                self.commit(&jobs, id);
                Ok(job)
            }
            JobState::Running => {
                if let Some(cancel) = entry.cancel.take() {
                    let _ = cancel.send(());
                    info!(job_id = %id, "Cancellation requested for running job");
                }
                Ok(entry.job.clone())
            }
            state => Err(JobError::InvalidState {
                job_id: id.clone(),
                state,
            }),
        }
    }

    /// Remove a job record. Running jobs must be cancelled first, and a job
    /// being finalized cannot be removed until that finishes.
    pub fn delete(&self, id: &JobId) -> Result<Job, JobError> {
        let mut jobs = resilient_write(&self.jobs);
        let (state, finalizing) = jobs
            .get(id)
            .map(|entry| (entry.job.state, entry.finalizing))
            .ok_or_else(|| JobError::NotFound(id.clone()))?;
        if finalizing {
            return Err(JobError::Finalizing(id.clone()));
        }
        if state == JobState::Running {
            return Err(JobError::InvalidState {
                job_id: id.clone(),
                state,
            });
        }

        let Some(entry) = jobs.shift_remove(id) else {
            return Err(JobError::NotFound(id.clone()));
        };
        let _ = self.events.send(JobEvent::Removed(id.clone()));
        self.persist(&jobs);
        debug!(job_id = %id, "Job removed");
        Ok(entry.job)
    }

    // =========================================================================
    // SUPERVISOR MUTATIONS
    // =========================================================================

    /// Move the oldest queued job to running if fewer than `limit` jobs run.
    ///
    /// The check and the transition happen under one lock, so concurrent
    /// callers can never push the running count past `limit`.
    pub fn start_next(&self, limit: usize, output_root: &Path) -> Option<StartTicket> {
        let mut jobs = resilient_write(&self.jobs);
        let running = jobs
            .values()
            .filter(|entry| entry.job.state == JobState::Running)
            .count();
        if running >= limit {
            return None;
        }

        let (id, entry) = jobs
            .iter_mut()
            .find(|(_, entry)| entry.job.state == JobState::Queued)?;
        let id = id.clone();

        let (cancel_tx, cancel_rx) = oneshot::channel();
        entry.cancel = Some(cancel_tx);
        entry.job.state = JobState::Running;
        entry.job.started_at = Some(Utc::now());
        entry.job.output_path = Some(output_root.join(id.as_str()));
        entry.job.touch();
        let credentials = entry.credentials.take().unwrap_or_else(Credentials::anonymous);
        let job = entry.job.clone();

        self.commit(&jobs, &id);
        Some(StartTicket {
            job,
            credentials,
            cancel: cancel_rx,
        })
    }

    /// Merge a parsed progress event into a running job.
    ///
    /// Published to subscribers but not persisted.
    pub fn update_progress(&self, id: &JobId, event: &ProgressEvent) -> Result<(), JobError> {
        let mut jobs = resilient_write(&self.jobs);
        let entry = running_entry(&mut jobs, id)?;
        entry.job.progress.apply(event);
        entry.job.touch();
        let snapshot = entry.job.clone().with_timing(Utc::now());
        let _ = self.events.send(JobEvent::Updated(snapshot));
        Ok(())
    }

    /// Claim a running job whose utility exited cleanly.
    ///
    /// Drops the cancel handle, so a cancel that arrived earlier is still
    /// waiting in the supervisor's receiver and any later one is refused.
    pub fn begin_completion(&self, id: &JobId) -> Result<(), JobError> {
        let mut jobs = resilient_write(&self.jobs);
        let entry = running_entry(&mut jobs, id)?;
        entry.finalizing = true;
        entry.cancel = None;
        debug!(job_id = %id, "Completion started");
        Ok(())
    }

    /// Claim every completed job that still lacks a public link and that no
    /// one else is finalizing. Each claim is released by
    /// [`attach_link`](Self::attach_link) or
    /// [`record_finalize_error`](Self::record_finalize_error).
    pub fn claim_pending_finalize(&self) -> Vec<Job> {
        resilient_write(&self.jobs)
            .values_mut()
            .filter(|entry| {
                entry.job.state == JobState::Completed && entry.job.link.is_none() && !entry.finalizing
            })
            .map(|entry| {
                entry.finalizing = true;
                entry.job.clone()
            })
            .collect()
    }

    pub fn mark_completed(&self, id: &JobId) -> Result<Job, JobError> {
        let mut jobs = resilient_write(&self.jobs);
        let entry = running_entry(&mut jobs, id)?;
        entry.job.state = JobState::Completed;
        entry.job.finished_at = Some(Utc::now());
        entry.job.progress.percent = 100.0;
        entry.job.progress.eta_secs = Some(0);
        entry.job.progress.eta_estimated = false;
        entry.job.touch();
        entry.cancel = None;
        let job = entry.job.clone();

        self.commit(&jobs, id);
        drop(jobs);
        self.wake.notify_one();
        Ok(job)
    }

    pub fn mark_failed(&self, id: &JobId, failure: JobFailure) -> Result<Job, JobError> {
        let mut jobs = resilient_write(&self.jobs);
        let entry = jobs
            .get_mut(id)
            .ok_or_else(|| JobError::NotFound(id.clone()))?;
        if entry.job.is_terminal() {
            return Err(JobError::InvalidState {
                job_id: id.clone(),
                state: entry.job.state,
            });
        }
        fail_entry(entry, failure);
        let job = entry.job.clone();

        self.commit(&jobs, id);
        drop(jobs);
        self.wake.notify_one();
        Ok(job)
    }

    /// Record the public link for a completed job.
    pub fn attach_link(&self, id: &JobId, link: PublicLink) -> Result<Job, JobError> {
        let mut jobs = resilient_write(&self.jobs);
        let entry = completed_entry(&mut jobs, id)?;
        entry.job.link = Some(link);
        entry.job.finalize_error = None;
        entry.job.touch();
        entry.finalizing = false;
        let job = entry.job.clone();
        self.commit(&jobs, id);
        Ok(job)
    }

    /// Note that finalizing a completed job failed; cleanup retries it.
    pub fn record_finalize_error(&self, id: &JobId, reason: impl Into<String>) -> Result<(), JobError> {
        let mut jobs = resilient_write(&self.jobs);
        let entry = completed_entry(&mut jobs, id)?;
        entry.job.finalize_error = Some(reason.into());
        entry.job.touch();
        entry.finalizing = false;
        self.commit(&jobs, id);
        Ok(())
    }

    /// Write the whole table, including progress not yet persisted, and wait
    /// for it to reach disk. Blocking; use `spawn_blocking` from async code.
    pub fn flush(&self) {
        self.persist(&resilient_read(&self.jobs));
        if let Some(writer) = &self.ledger {
            writer.flush();
        }
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    /// Publish the job's snapshot and queue the table for the ledger.
    ///
    /// Callers hold the write lock, so snapshots reach the writer in
    /// transition order.
    fn commit(&self, jobs: &IndexMap<JobId, JobEntry>, id: &JobId) {
        if let Some(entry) = jobs.get(id) {
            let snapshot = entry.job.clone().with_timing(Utc::now());
            // No receivers is fine.
            let _ = self.events.send(JobEvent::Updated(snapshot));
        }
        self.persist(jobs);
    }

    fn persist(&self, jobs: &IndexMap<JobId, JobEntry>) {
        if let Some(writer) = &self.ledger {
            writer.save(jobs.values().map(|entry| entry.job.clone()).collect());
        }
    }
}

fn fail_entry(entry: &mut JobEntry, failure: JobFailure) {
    entry.job.state = JobState::Failed;
    entry.job.finished_at = Some(Utc::now());
    entry.job.error = Some(failure);
    entry.job.touch();
    entry.credentials = None;
    entry.cancel = None;
    entry.finalizing = false;
}

fn running_entry<'a>(
    jobs: &'a mut IndexMap<JobId, JobEntry>,
    id: &JobId,
) -> Result<&'a mut JobEntry, JobError> {
    entry_in_state(jobs, id, JobState::Running)
}

fn completed_entry<'a>(
    jobs: &'a mut IndexMap<JobId, JobEntry>,
    id: &JobId,
) -> Result<&'a mut JobEntry, JobError> {
    entry_in_state(jobs, id, JobState::Completed)
}

fn entry_in_state<'a>(
    jobs: &'a mut IndexMap<JobId, JobEntry>,
    id: &JobId,
    expected: JobState,
) -> Result<&'a mut JobEntry, JobError> {
    let entry = jobs
        .get_mut(id)
        .ok_or_else(|| JobError::NotFound(id.clone()))?;
    if entry.job.state != expected {
        return Err(JobError::InvalidState {
            job_id: id.clone(),
            state: entry.job.state,
        });
    }
    Ok(entry)
}

/// Targets are numeric application ids of at most ten digits.
fn validate_target(raw: &str) -> Result<String, JobError> {
    let target = raw.trim();
    if target.is_empty() {
        return Err(JobError::InvalidInput("target identifier must not be empty".into()));
    }
    if target.len() > MAX_TARGET_LEN || !target.chars().all(|c| c.is_ascii_digit()) {
        return Err(JobError::InvalidInput(format!(
            "target identifier must be 1-{} digits",
            MAX_TARGET_LEN
        )));
    }
    Ok(target.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fs2::FileExt;
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn root() -> PathBuf {
        PathBuf::from("/tmp/steamfetch-test/downloads")
    }

    fn progress(percent: f64) -> ProgressEvent {
        ProgressEvent {
            percent: Some(percent),
            ..ProgressEvent::empty()
        }
    }

    #[test]
    fn test_submit_validates_target() {
        let registry = JobRegistry::new();
        assert!(matches!(
            registry.submit(SubmitRequest::new("")),
            Err(JobError::InvalidInput(_))
        ));
        assert!(matches!(
            registry.submit(SubmitRequest::new("12a")),
            Err(JobError::InvalidInput(_))
        ));
        assert!(matches!(
            registry.submit(SubmitRequest::new("12345678901")),
            Err(JobError::InvalidInput(_))
        ));
        let id = registry.submit(SubmitRequest::new(" 740 ")).unwrap();
        assert_eq!(registry.get(&id).unwrap().target, "740");
        assert_eq!(registry.counts().queued, 1);
    }

    #[test]
    fn test_duplicate_active_target_rejected() {
        let registry = JobRegistry::new();
        let first = registry.submit(SubmitRequest::new("740")).unwrap();
        match registry.submit(SubmitRequest::new("740")) {
            Err(JobError::AlreadyActive { job_id, .. }) => assert_eq!(job_id, first),
            other => panic!("expected AlreadyActive, got {:?}", other.map(|_| ())),
        }

        registry.cancel(&first).unwrap();
        assert!(registry.submit(SubmitRequest::new("740")).is_ok());
    }

    #[test]
    fn test_start_next_respects_limit_and_fifo() {
        let registry = JobRegistry::new();
        let a = registry.submit(SubmitRequest::new("1")).unwrap();
        let b = registry.submit(SubmitRequest::new("2")).unwrap();

        let ticket = registry.start_next(1, &root()).unwrap();
        assert_eq!(ticket.job.id, a);
        assert_eq!(ticket.job.output_path, Some(root().join(a.as_str())));
        assert!(registry.start_next(1, &root()).is_none());
        assert_eq!(registry.get(&b).unwrap().state, JobState::Queued);

        registry.mark_completed(&a).unwrap();
        let ticket = registry.start_next(1, &root()).unwrap();
        assert_eq!(ticket.job.id, b);
    }

    #[test]
    fn test_credentials_handed_over_once() {
        let registry = JobRegistry::new();
        let creds = Credentials::from_parts(Some("someone".into()), Some("pw".into()), None);
        registry
            .submit(SubmitRequest::new("1").with_credentials(creds.clone()))
            .unwrap();
        let ticket = registry.start_next(1, &root()).unwrap();
        assert_eq!(ticket.credentials, creds);
        assert_eq!(ticket.job.login, "som...");
    }

    #[test]
    fn test_cancel_queued_never_runs() {
        let registry = JobRegistry::new();
        let id = registry.submit(SubmitRequest::new("1")).unwrap();
        let job = registry.cancel(&id).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error.unwrap().reason, "cancelled");
        assert!(job.started_at.is_none());
        assert!(registry.start_next(4, &root()).is_none());

        assert!(matches!(
            registry.cancel(&id),
            Err(JobError::InvalidState { state: JobState::Failed, .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_running_signals_supervisor() {
        let registry = JobRegistry::new();
        let id = registry.submit(SubmitRequest::new("1")).unwrap();
        let ticket = registry.start_next(1, &root()).unwrap();

        let job = registry.cancel(&id).unwrap();
        assert_eq!(job.state, JobState::Running);
        assert!(ticket.cancel.await.is_ok());
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let registry = JobRegistry::new();
        let id = registry.submit(SubmitRequest::new("1")).unwrap();

        assert!(registry.mark_completed(&id).is_err());
        assert!(registry.update_progress(&id, &progress(5.0)).is_err());

        registry.start_next(1, &root()).unwrap();
        registry.mark_failed(&id, JobFailure::stalled()).unwrap();
        assert!(registry.mark_completed(&id).is_err());
        assert!(registry.mark_failed(&id, JobFailure::cancelled()).is_err());
        assert_eq!(registry.get(&id).unwrap().error.unwrap().reason, "stalled");
    }

    #[test]
    fn test_progress_is_monotonic() {
        let registry = JobRegistry::new();
        let id = registry.submit(SubmitRequest::new("1")).unwrap();
        registry.start_next(1, &root()).unwrap();

        registry.update_progress(&id, &progress(60.0)).unwrap();
        registry.update_progress(&id, &progress(20.0)).unwrap();
        assert_eq!(registry.get(&id).unwrap().progress.percent, 60.0);
    }

    #[test]
    fn test_delete_rules() {
        let registry = JobRegistry::new();
        let id = registry.submit(SubmitRequest::new("1")).unwrap();
        registry.start_next(1, &root()).unwrap();
        assert!(matches!(
            registry.delete(&id),
            Err(JobError::InvalidState { state: JobState::Running, .. })
        ));

        registry.mark_completed(&id).unwrap();
        registry.delete(&id).unwrap();
        assert!(matches!(registry.get(&id), Err(JobError::NotFound(_))));
        assert!(matches!(registry.delete(&id), Err(JobError::NotFound(_))));
    }

    #[test]
    fn test_list_filters_in_submission_order() {
        let registry = JobRegistry::new();
        let ids: Vec<_> = ["3", "1", "2"]
            .iter()
            .map(|t| registry.submit(SubmitRequest::new(*t)).unwrap())
            .collect();
        registry.cancel(&ids[1]).unwrap();

        let targets: Vec<_> = registry.list(None).into_iter().map(|j| j.target).collect();
        assert_eq!(targets, vec!["3", "1", "2"]);
        let failed = registry.list(Some(JobState::Failed));
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, ids[1]);
    }

    #[test]
    fn test_events_published_on_transitions() {
        let registry = JobRegistry::new();
        let mut events = registry.subscribe();
        let id = registry.submit(SubmitRequest::new("1")).unwrap();
        registry.start_next(1, &root()).unwrap();
        registry.mark_completed(&id).unwrap();
        registry.delete(&id).unwrap();

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                JobEvent::Updated(job) => states.push(job.state.as_str().to_string()),
                JobEvent::Removed(removed) => {
                    assert_eq!(removed, id);
                    states.push("removed".into());
                }
            }
        }
        assert_eq!(states, vec!["queued", "running", "completed", "removed"]);
    }

    #[test]
    fn test_ledger_restore_marks_active_jobs_interrupted() {
        let dir = TempDir::new().unwrap();
        let (queued, running, done) = {
            let registry = JobRegistry::with_ledger(JobLedger::new(dir.path()));
            let running = registry.submit(SubmitRequest::new("1")).unwrap();
            let done = registry.submit(SubmitRequest::new("2")).unwrap();
            let queued = registry.submit(SubmitRequest::new("3")).unwrap();
            registry.start_next(2, &root()).unwrap();
            registry.start_next(2, &root()).unwrap();
            registry.mark_completed(&done).unwrap();
            (queued, running, done)
        };

        let registry = JobRegistry::with_ledger(JobLedger::new(dir.path()));
        assert_eq!(registry.get(&done).unwrap().state, JobState::Completed);
        for id in [&queued, &running] {
            let job = registry.get(id).unwrap();
            assert_eq!(job.state, JobState::Failed);
            assert_eq!(job.error.unwrap().reason, "interrupted");
        }
        assert!(registry.start_next(4, &root()).is_none());
    }

    #[test]
    fn test_completion_claim_blocks_cancel_and_delete() {
        let registry = JobRegistry::new();
        let id = registry.submit(SubmitRequest::new("1")).unwrap();
        let mut ticket = registry.start_next(1, &root()).unwrap();

        registry.begin_completion(&id).unwrap();
        assert!(matches!(registry.cancel(&id), Err(JobError::Finalizing(_))));
        assert!(ticket.cancel.try_recv().is_err());

        registry.mark_completed(&id).unwrap();
        assert!(matches!(registry.delete(&id), Err(JobError::Finalizing(_))));
        assert!(registry.claim_pending_finalize().is_empty());
        assert!(registry.finished_before(Utc::now()).is_empty());

        registry.record_finalize_error(&id, "disk full").unwrap();
        let claimed = registry.claim_pending_finalize();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);
        assert!(registry.claim_pending_finalize().is_empty());
    }

    #[test]
    fn test_cancel_before_completion_claim_is_delivered() {
        let registry = JobRegistry::new();
        let id = registry.submit(SubmitRequest::new("1")).unwrap();
        let mut ticket = registry.start_next(1, &root()).unwrap();

        registry.cancel(&id).unwrap();
        registry.begin_completion(&id).unwrap();
        assert!(ticket.cancel.try_recv().is_ok());
    }

    #[test]
    fn test_failed_completion_releases_claim() {
        let registry = JobRegistry::new();
        let id = registry.submit(SubmitRequest::new("1")).unwrap();
        registry.start_next(1, &root()).unwrap();
        registry.begin_completion(&id).unwrap();
        registry.mark_failed(&id, JobFailure::output_missing()).unwrap();

        registry.delete(&id).unwrap();
        assert!(!registry.contains(&id));
    }

    #[test]
    fn test_progress_flows_while_ledger_lock_is_held() {
        let dir = TempDir::new().unwrap();
        let registry = JobRegistry::with_ledger(JobLedger::new(dir.path()));
        let running = registry.submit(SubmitRequest::new("1")).unwrap();
        registry.start_next(1, &root()).unwrap();
        registry.flush();

        let holder = OpenOptions::new()
            .read(true)
            .write(true)
            .open(dir.path().join("jobs.lock"))
            .unwrap();
        holder.lock_exclusive().unwrap();

        let start = Instant::now();
        registry.submit(SubmitRequest::new("2")).unwrap();
        for percent in 1..=20 {
            registry.update_progress(&running, &progress(percent as f64)).unwrap();
        }
        assert!(
            start.elapsed() < Duration::from_secs(1),
            "registry stalled for {:?} behind the ledger lock",
            start.elapsed()
        );

        holder.unlock().unwrap();
        registry.flush();
        let saved = JobLedger::new(dir.path()).load().unwrap();
        assert_eq!(saved.len(), 2);
    }

    #[test]
    fn test_corrupt_ledger_starts_empty() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("jobs.json"), "garbage").unwrap();
        let registry = JobRegistry::with_ledger(JobLedger::new(dir.path()));
        assert_eq!(registry.counts().total(), 0);
    }
}
