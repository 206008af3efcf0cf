// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Liveness and readiness checks.
//!
//! The service is live whenever it can answer. It is ready when:
//! - the download utility exists and is executable
//! - every storage directory exists and accepts writes
//! - free space on the volume is above the configured minimum
//!
//! A failed [`Severity::Critical`] check makes the service not ready. Disk
//! space that cannot be measured is only a warning, since minimal containers
//! may lack `df`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::storage::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Result of one check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub name: String,
    pub ok: bool,
    pub severity: Severity,
    pub detail: String,
}

impl HealthCheck {
    fn pass(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            ok: true,
            severity: Severity::Info,
            detail: detail.into(),
        }
    }

    fn fail(name: &str, severity: Severity, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            ok: false,
            severity,
            detail: detail.into(),
        }
    }

    fn blocks_readiness(&self) -> bool {
        !self.ok && self.severity == Severity::Critical
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// `healthy` or `unhealthy`
    pub status: &'static str,
    pub live: bool,
    pub ready: bool,
    pub checks: Vec<HealthCheck>,
    pub timestamp: DateTime<Utc>,
}

/// Runs the readiness checks. Blocking; call from `spawn_blocking` in async code.
#[derive(Debug, Clone)]
pub struct HealthChecker {
    steamcmd_path: PathBuf,
    storage: Arc<Storage>,
    min_free_bytes: u64,
}

impl HealthChecker {
    pub fn new(steamcmd_path: impl Into<PathBuf>, storage: Arc<Storage>, min_free_bytes: u64) -> Self {
        Self {
            steamcmd_path: steamcmd_path.into(),
            storage,
            min_free_bytes,
        }
    }

    pub fn run(&self) -> HealthReport {
        let mut checks = vec![check_binary(&self.steamcmd_path)];
        for (name, dir) in [
            ("downloads_dir", self.storage.downloads_root()),
            ("public_dir", self.storage.public_root()),
            ("state_dir", self.storage.state_dir()),
        ] {
            checks.push(check_writable(name, dir));
        }
        checks.push(self.check_disk());

        let ready = !checks.iter().any(HealthCheck::blocks_readiness);
        HealthReport {
            status: if ready { "healthy" } else { "unhealthy" },
            live: true,
            ready,
            checks,
            timestamp: Utc::now(),
        }
    }

    fn check_disk(&self) -> HealthCheck {
        match disk_usage(self.storage.root()).map(|usage| usage.free_bytes) {
            Some(free) if free >= self.min_free_bytes => {
                HealthCheck::pass("disk_space", format!("{} MiB free", free / (1024 * 1024)))
            }
            Some(free) => HealthCheck::fail(
                "disk_space",
                Severity::Critical,
                format!(
                    "{} MiB free, below the {} MiB minimum",
                    free / (1024 * 1024),
                    self.min_free_bytes / (1024 * 1024)
                ),
            ),
            None => HealthCheck::fail("disk_space", Severity::Warning, "free space could not be measured"),
        }
    }
}

/// The download utility must exist and, on unix, carry an execute bit.
pub fn check_binary(path: &Path) -> HealthCheck {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) => {
            return HealthCheck::fail(
                "steamcmd",
                Severity::Critical,
                format!("{} not found: {}", path.display(), e),
            )
        }
    };
    if !meta.is_file() {
        return HealthCheck::fail(
            "steamcmd",
            Severity::Critical,
            format!("{} is not a file", path.display()),
        );
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            return HealthCheck::fail(
                "steamcmd",
                Severity::Critical,
                format!("{} is not executable", path.display()),
            );
        }
    }
    HealthCheck::pass("steamcmd", path.display().to_string())
}

/// Create and remove a marker file.
fn check_writable(name: &str, dir: &Path) -> HealthCheck {
    if !dir.is_dir() {
        return HealthCheck::fail(name, Severity::Critical, format!("{} does not exist", dir.display()));
    }
    let marker = dir.join(format!(".health-check-{}", std::process::id()));
    match fs::write(&marker, b"ok") {
        Ok(()) => {
            let _ = fs::remove_file(&marker);
            HealthCheck::pass(name, dir.display().to_string())
        }
        Err(e) => HealthCheck::fail(
            name,
            Severity::Critical,
            format!("{} is not writable: {}", dir.display(), e),
        ),
    }
}

/// Size of the filesystem holding the storage volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub used_bytes: u64,
    /// Available to unprivileged writers.
    pub free_bytes: u64,
}

/// Usage of the filesystem holding `path`, via `df -B1`.
pub fn disk_usage(path: &Path) -> Option<DiskUsage> {
    let output = std::process::Command::new("df")
        .args(["-B1", path.to_string_lossy().as_ref()])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_df(&String::from_utf8_lossy(&output.stdout))
}

fn parse_df(stdout: &str) -> Option<DiskUsage> {
    stdout.lines().skip(1).find_map(|line| {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let field = |i: usize| parts.get(i).and_then(|value| value.parse::<u64>().ok());
        Some(DiskUsage {
            total_bytes: field(1)?,
            used_bytes: field(2)?,
            free_bytes: field(3)?,
        })
    })
}
