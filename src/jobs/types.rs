// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Job data model shared by the registry, supervisor and HTTP layer.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::progress::ProgressEvent;

// =============================================================================
// IDENTIFIERS AND STATE
// =============================================================================

/// Opaque job identifier: 32 lowercase hex characters (a v4 UUID without dashes).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill(&mut bytes);
        bytes[6] = (bytes[6] & 0x0f) | 0x40;
        bytes[8] = (bytes[8] & 0x3f) | 0x80;
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if the id is safe to use as a single path component.
    pub fn is_path_safe(&self) -> bool {
        !self.0.is_empty() && self.0.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle state of a job.
///
/// The only reachable paths are `Queued -> Running -> Completed|Failed`, plus
/// `Queued -> Failed` when a queued job is cancelled or interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Queued | JobState::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("unknown job state '{}'", other)),
        }
    }
}

/// Platform forced onto the download utility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Windows,
    Linux,
    Macos,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Windows => "windows",
            Platform::Linux => "linux",
            Platform::Macos => "macos",
        }
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "windows" => Ok(Platform::Windows),
            "linux" => Ok(Platform::Linux),
            "macos" | "osx" => Ok(Platform::Macos),
            other => Err(format!("unsupported platform '{}'", other)),
        }
    }
}

// =============================================================================
// SUBMISSION
// =============================================================================

/// Login for the download utility. Never persisted and never logged in full.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
    pub guard_code: Option<String>,
}

impl Credentials {
    pub const ANONYMOUS: &'static str = "anonymous";

    pub fn anonymous() -> Self {
        Self {
            username: Self::ANONYMOUS.to_string(),
            password: None,
            guard_code: None,
        }
    }

    /// Build credentials from optional form fields. A missing or blank
    /// username means anonymous login.
    pub fn from_parts(
        username: Option<String>,
        password: Option<String>,
        guard_code: Option<String>,
    ) -> Self {
        let non_blank = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        match non_blank(username) {
            Some(username) if !username.eq_ignore_ascii_case(Self::ANONYMOUS) => Self {
                username,
                password: non_blank(password),
                guard_code: non_blank(guard_code),
            },
            _ => Self::anonymous(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.username == Self::ANONYMOUS
    }

    /// Username safe for logs and snapshots: the first three characters
    /// followed by `...`, or `anonymous`.
    pub fn masked_username(&self) -> String {
        if self.is_anonymous() {
            return Self::ANONYMOUS.to_string();
        }
        let visible: String = self.username.chars().take(3).collect();
        format!("{}...", visible)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.masked_username())
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("guard_code", &self.guard_code.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// A validated-on-submit download request.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub target: String,
    pub credentials: Credentials,
    pub platform: Option<Platform>,
    pub validate: bool,
}

impl SubmitRequest {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            credentials: Credentials::anonymous(),
            platform: None,
            validate: true,
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }
}

// =============================================================================
// PROGRESS
// =============================================================================

/// Latest known progress for a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// 0-100, never decreases while the job runs.
    pub percent: f64,
    pub rate_bps: Option<f64>,
    /// Rate exactly as the utility printed it, e.g. `3.2MB/s`.
    pub rate_text: Option<String>,
    pub eta_secs: Option<u64>,
    /// `eta_secs` as `HH:MM:SS`, filled in on every snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_text: Option<String>,
    /// True when `eta_secs` was extrapolated rather than parsed.
    #[serde(default)]
    pub eta_estimated: bool,
    pub bytes_transferred: Option<u64>,
    pub bytes_total: Option<u64>,
    pub elapsed_secs: Option<u64>,
    pub last_update: Option<DateTime<Utc>>,
}

impl ProgressSnapshot {
    /// Merge a parsed event. Percent only moves forward.
    pub fn apply(&mut self, event: &ProgressEvent) {
        if let Some(percent) = event.percent {
            self.percent = self.percent.max(percent.clamp(0.0, 100.0));
        }
        if let Some(rate) = event.rate_bps {
            self.rate_bps = Some(rate);
            self.rate_text = event.rate_text.clone();
        }
        if let Some(eta) = event.eta_secs {
            self.eta_secs = Some(eta);
            self.eta_estimated = false;
        }
        if event.bytes_transferred.is_some() {
            self.bytes_transferred = event.bytes_transferred;
        }
        if event.bytes_total.is_some() {
            self.bytes_total = event.bytes_total;
        }
        self.last_update = Some(event.at);
    }

    /// ETA as `HH:MM:SS`.
    pub fn eta_string(&self) -> Option<String> {
        self.eta_secs
            .map(|secs| format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60))
    }
}

// =============================================================================
// FAILURE AND LINKS
// =============================================================================

/// Why a job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Cancelled,
    Stalled,
    OutputMissing,
    Subprocess,
    Spawn,
    Interrupted,
}

/// Terminal error detail. `reason` is always human readable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl JobFailure {
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            exit_code: None,
        }
    }

    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "cancelled")
    }

    pub fn stalled() -> Self {
        Self::new(FailureKind::Stalled, "stalled")
    }

    pub fn output_missing() -> Self {
        Self::new(FailureKind::OutputMissing, "output missing")
    }

    pub fn interrupted() -> Self {
        Self::new(FailureKind::Interrupted, "interrupted")
    }

    pub fn spawn(detail: impl fmt::Display) -> Self {
        Self::new(FailureKind::Spawn, format!("failed to start download: {}", detail))
    }

    /// Nonzero exit. Uses the last error line the utility printed, or `unknown`.
    pub fn subprocess(exit_code: Option<i32>, last_error: Option<&str>) -> Self {
        let reason = last_error
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("unknown")
            .to_string();
        Self {
            kind: FailureKind::Subprocess,
            reason,
            exit_code,
        }
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

/// One file exposed under the public root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicFile {
    /// Path relative to the job's public directory, `/`-separated.
    pub path: String,
    pub size: u64,
    pub url: String,
}

/// Stable external reference to a completed job's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicLink {
    pub job_id: JobId,
    pub target: String,
    /// Entry under the public root (`public/<job_id>`).
    pub path: PathBuf,
    /// Base URL of the job's public directory.
    pub url: String,
    pub files: Vec<PublicFile>,
    pub total_bytes: u64,
}

// =============================================================================
// JOB
// =============================================================================

/// Snapshot of one download job. Owned by the registry; everyone else gets clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub target: String,
    /// Masked login name (`anonymous` or `abc...`).
    pub login: String,
    pub platform: Option<Platform>,
    pub validate: bool,
    pub state: JobState,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub progress: ProgressSnapshot,
    pub output_path: Option<PathBuf>,
    pub link: Option<PublicLink>,
    pub error: Option<JobFailure>,
    /// Set while a completed job is waiting for a successful finalize.
    pub finalize_error: Option<String>,
    /// Bumped on every mutation; equal revisions mean equal snapshots.
    pub revision: u64,
}

impl Job {
    pub fn new(id: JobId, request: &SubmitRequest) -> Self {
        let now = Utc::now();
        Self {
            id,
            target: request.target.clone(),
            login: request.credentials.masked_username(),
            platform: request.platform,
            validate: request.validate,
            state: JobState::Queued,
            requested_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
            progress: ProgressSnapshot::default(),
            output_path: None,
            link: None,
            error: None,
            finalize_error: None,
            revision: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.revision += 1;
    }

    /// Fill in elapsed time, and an extrapolated ETA when the utility
    /// printed none: `elapsed * (100 - p) / p`.
    pub fn with_timing(mut self, now: DateTime<Utc>) -> Self {
        let Some(started) = self.started_at else {
            return self;
        };
        let end = self.finished_at.unwrap_or(now);
        let elapsed = (end - started).num_seconds().max(0) as u64;
        self.progress.elapsed_secs = Some(elapsed);

        let percent = self.progress.percent;
        if self.state == JobState::Running
            && (self.progress.eta_secs.is_none() || self.progress.eta_estimated)
            && percent > 0.0
            && percent < 100.0
        {
            let eta = elapsed as f64 * (100.0 - percent) / percent;
            self.progress.eta_secs = Some(eta.round() as u64);
            self.progress.eta_estimated = true;
        }
        self.progress.eta_text = self.progress.eta_string();
        self
    }
}
