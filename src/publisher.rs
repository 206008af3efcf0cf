// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Status publisher: per-job snapshot streams for the API layer.
//!
//! Built on the registry's broadcast channel, so a slow subscriber only ever
//! lags its own receiver and never blocks the supervisor. A subscriber that
//! falls behind is resynchronized with the registry's current snapshot, which
//! keeps delivery at-least-once for the latest state. Snapshots carry a
//! `revision`, so receiving one twice is harmless.

use std::sync::Arc;

use futures_util::stream::{self, BoxStream, StreamExt};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use crate::error::JobError;
use crate::jobs::{Job, JobEvent, JobId, JobRegistry};

/// Read-only view of job state for subscribers.
#[derive(Clone)]
pub struct StatusPublisher {
    registry: Arc<JobRegistry>,
}

struct Subscription {
    registry: Arc<JobRegistry>,
    id: JobId,
    initial: Option<Job>,
    events: BroadcastStream<JobEvent>,
    last_revision: Option<u64>,
    done: bool,
}

impl StatusPublisher {
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        Self { registry }
    }

    /// Current view of one job.
    pub fn snapshot(&self, id: &JobId) -> Result<Job, JobError> {
        self.registry.get(id)
    }

    /// Stream of snapshots for one job.
    ///
    /// Yields the current snapshot first, then every update. Ends after the
    /// first terminal snapshot or when the job is deleted. Drop the stream to
    /// unsubscribe; subscribe again to restart.
    pub fn subscribe(&self, id: &JobId) -> Result<BoxStream<'static, Job>, JobError> {
        // Subscribe before reading so no transition slips between the two.
        let events = BroadcastStream::new(self.registry.subscribe());
        let initial = self.registry.get(id)?;

        let subscription = Subscription {
            registry: Arc::clone(&self.registry),
            id: id.clone(),
            initial: Some(initial),
            events,
            last_revision: None,
            done: false,
        };
        Ok(stream::unfold(subscription, next_snapshot).boxed())
    }
}

async fn next_snapshot(mut sub: Subscription) -> Option<(Job, Subscription)> {
    if sub.done {
        return None;
    }
    if let Some(first) = sub.initial.take() {
        return Some(sub.deliver(first));
    }

    loop {
        match sub.events.next().await? {
            Ok(JobEvent::Updated(job)) if job.id == sub.id => {
                // Anything at or below the last delivered revision is stale.
                if sub.last_revision.is_some_and(|seen| job.revision <= seen) {
                    continue;
                }
                return Some(sub.deliver(job));
            }
            Ok(JobEvent::Removed(id)) if id == sub.id => return None,
            Ok(_) => continue,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                debug!(job_id = %sub.id, skipped, "Subscriber lagged; resyncing");
                let job = sub.registry.get(&sub.id).ok()?;
                return Some(sub.deliver(job));
            }
        }
    }
}

impl Subscription {
    fn deliver(mut self, job: Job) -> (Job, Subscription) {
        self.done = job.is_terminal();
        self.last_revision = Some(job.revision);
        (job, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobFailure, JobState, SubmitRequest};
    use crate::progress::ProgressEvent;
    use std::path::Path;

    fn progress(percent: f64) -> ProgressEvent {
        ProgressEvent {
            percent: Some(percent),
            ..ProgressEvent::empty()
        }
    }

    #[tokio::test]
    async fn test_stream_runs_until_terminal() {
        let registry = Arc::new(JobRegistry::new());
        let publisher = StatusPublisher::new(Arc::clone(&registry));
        let id = registry.submit(SubmitRequest::new("740")).unwrap();
        let other = registry.submit(SubmitRequest::new("10")).unwrap();

        let stream = publisher.subscribe(&id).unwrap();

        registry.start_next(1, Path::new("/tmp/dl")).unwrap();
        registry.update_progress(&id, &progress(10.0)).unwrap();
        registry.cancel(&other).unwrap();
        registry.update_progress(&id, &progress(55.5)).unwrap();
        registry.mark_failed(&id, JobFailure::stalled()).unwrap();

        let snapshots: Vec<Job> = stream.collect().await;
        let states: Vec<JobState> = snapshots.iter().map(|j| j.state).collect();
        assert_eq!(
            states,
            vec![
                JobState::Queued,
                JobState::Running,
                JobState::Running,
                JobState::Running,
                JobState::Failed
            ]
        );
        assert!(snapshots.iter().all(|j| j.id == id));

        let percents: Vec<f64> = snapshots.iter().map(|j| j.progress.percent).collect();
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(snapshots[4].error.as_ref().unwrap().reason, "stalled");
    }

    #[tokio::test]
    async fn test_terminal_job_yields_single_snapshot() {
        let registry = Arc::new(JobRegistry::new());
        let publisher = StatusPublisher::new(Arc::clone(&registry));
        let id = registry.submit(SubmitRequest::new("740")).unwrap();
        registry.cancel(&id).unwrap();

        let snapshots: Vec<Job> = publisher.subscribe(&id).unwrap().collect().await;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].state, JobState::Failed);
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let publisher = StatusPublisher::new(Arc::new(JobRegistry::new()));
        assert!(matches!(
            publisher.subscribe(&JobId::from("missing")),
            Err(JobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_lagging_subscriber_resyncs() {
        let registry = Arc::new(JobRegistry::new());
        let publisher = StatusPublisher::new(Arc::clone(&registry));
        let id = registry.submit(SubmitRequest::new("740")).unwrap();
        let mut stream = publisher.subscribe(&id).unwrap();
        assert_eq!(stream.next().await.unwrap().state, JobState::Queued);

        registry.start_next(1, Path::new("/tmp/dl")).unwrap();
        for step in 0..600 {
            registry.update_progress(&id, &progress(step as f64 / 10.0)).unwrap();
        }

        let resync = stream.next().await.unwrap();
        assert_eq!(resync.state, JobState::Running);
        assert_eq!(resync.progress.percent, 59.9);

        registry.mark_completed(&id).unwrap();
        let last = stream.next().await.unwrap();
        assert_eq!(last.state, JobState::Completed);
        assert!(stream.next().await.is_none());
    }
}
