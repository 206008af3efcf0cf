// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Typed errors for the job core.
//!
//! These never cross the HTTP boundary directly; [`crate::errors::ApiError`]
//! maps them to status codes and reference-coded JSON bodies.

use std::path::PathBuf;
use thiserror::Error;

use crate::jobs::{JobId, JobState};

/// Errors returned by [`crate::jobs::JobRegistry`] operations.
///
/// None of these mutate registry state.
#[derive(Debug, Error)]
pub enum JobError {
    /// Malformed submission (empty or non-numeric target, bad platform).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The same target already has a queued or running job.
    #[error("target {target} already has an active job ({job_id})")]
    AlreadyActive { target: String, job_id: JobId },

    /// No job with this id.
    #[error("job {0} not found")]
    NotFound(JobId),

    /// The job exists but its state does not allow the operation.
    #[error("job {job_id} is {state}")]
    InvalidState { job_id: JobId, state: JobState },

    /// The utility already exited cleanly and the output is being published.
    #[error("job {0} is being finalized")]
    Finalizing(JobId),
}

/// Errors from the persistent storage volume.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("output path {} does not exist", .0.display())]
    OutputMissing(PathBuf),

    #[error("output path {} contains no files", .0.display())]
    OutputEmpty(PathBuf),

    #[error("storage I/O failed at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors launching or talking to the download subprocess.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to launch {}: {source}", .binary.display())]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("output stream already taken")]
    StreamTaken,

    #[error("subprocess I/O failed: {0}")]
    Io(#[from] std::io::Error),
}
