// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Operational counters.
//!
//! Counters are lock-free atomics bumped by the supervisor; [`MetricsSnapshot`]
//! combines them with live registry counts for the `/status` and `/metrics`
//! endpoints. The metrics listener adds [`SystemUsage`] (volume disk space and
//! resident memory) and can render the snapshot in the Prometheus text format.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::health::{disk_usage, DiskUsage};
use crate::jobs::StateCounts;

/// Upper bounds of the download duration histogram, in seconds.
pub const DURATION_BUCKETS_SECS: [f64; 8] = [30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0, 21600.0];

/// Process-lifetime counters.
#[derive(Debug, Default)]
pub struct Metrics {
    downloads_started: AtomicU64,
    downloads_completed: AtomicU64,
    download_errors: AtomicU64,
    downloads_cancelled: AtomicU64,
    bytes_finalized: AtomicU64,
    download_millis: AtomicU64,
    /// Completed downloads per bucket, not cumulative.
    duration_buckets: [AtomicU64; DURATION_BUCKETS_SECS.len()],
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_started(&self) {
        self.downloads_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self, duration: Duration) {
        self.downloads_completed.fetch_add(1, Ordering::Relaxed);
        self.download_millis
            .fetch_add(duration.as_millis().min(u64::MAX as u128) as u64, Ordering::Relaxed);

        let secs = duration.as_secs_f64();
        if let Some(bucket) = DURATION_BUCKETS_SECS.iter().position(|bound| secs <= *bound) {
            self.duration_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_error(&self) {
        self.download_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.downloads_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_finalized(&self, bytes: u64) {
        self.bytes_finalized.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self, jobs: StateCounts, pool_limit: usize) -> MetricsSnapshot {
        let utilization = if pool_limit == 0 {
            0.0
        } else {
            jobs.running as f64 / pool_limit as f64
        };
        let completed = self.downloads_completed.load(Ordering::Relaxed);
        let sum_secs = self.download_millis.load(Ordering::Relaxed) as f64 / 1000.0;

        let mut cumulative = 0;
        let buckets = DURATION_BUCKETS_SECS
            .iter()
            .zip(&self.duration_buckets)
            .map(|(le, count)| {
                cumulative += count.load(Ordering::Relaxed);
                HistogramBucket {
                    le: *le,
                    count: cumulative,
                }
            })
            .collect();

        MetricsSnapshot {
            downloads_started_total: self.downloads_started.load(Ordering::Relaxed),
            downloads_completed_total: completed,
            download_errors_total: self.download_errors.load(Ordering::Relaxed),
            downloads_cancelled_total: self.downloads_cancelled.load(Ordering::Relaxed),
            bytes_finalized_total: self.bytes_finalized.load(Ordering::Relaxed),
            download_seconds_total: sum_secs,
            download_duration: DurationHistogram {
                buckets,
                count: completed,
                sum_secs,
            },
            jobs,
            pool: PoolUsage {
                limit: pool_limit,
                running: jobs.running,
                utilization,
            },
            system: None,
            timestamp: Utc::now(),
        }
    }
}

/// Supervisor slot usage.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolUsage {
    pub limit: usize,
    pub running: usize,
    /// running / limit, 0.0-1.0
    pub utilization: f64,
}

/// Cumulative count of completed downloads at or under `le` seconds.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HistogramBucket {
    pub le: f64,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DurationHistogram {
    pub buckets: Vec<HistogramBucket>,
    /// Same as the implicit `+Inf` bucket.
    pub count: u64,
    pub sum_secs: f64,
}

/// Host figures sampled when the metrics endpoint is scraped.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SystemUsage {
    pub disk: Option<DiskUsage>,
    pub memory_rss_bytes: Option<u64>,
}

impl SystemUsage {
    /// Blocking: shells out to `df`.
    pub fn collect(volume: &Path) -> Self {
        Self {
            disk: disk_usage(volume),
            memory_rss_bytes: resident_memory_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub downloads_started_total: u64,
    pub downloads_completed_total: u64,
    pub download_errors_total: u64,
    pub downloads_cancelled_total: u64,
    pub bytes_finalized_total: u64,
    pub download_seconds_total: f64,
    pub download_duration: DurationHistogram,
    pub jobs: StateCounts,
    pub pool: PoolUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemUsage>,
    pub timestamp: DateTime<Utc>,
}

impl MetricsSnapshot {
    pub fn with_system(mut self, system: SystemUsage) -> Self {
        self.system = Some(system);
        self
    }

    /// Prometheus text exposition format, version 0.0.4.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        let counters = [
            ("steam_downloads_total", "Downloads started", self.downloads_started_total),
            ("steam_downloads_completed_total", "Downloads completed", self.downloads_completed_total),
            ("steam_download_errors_total", "Downloads that failed", self.download_errors_total),
            ("steam_downloads_cancelled_total", "Downloads cancelled", self.downloads_cancelled_total),
            ("steam_bytes_finalized_total", "Bytes published", self.bytes_finalized_total),
        ];
        for (name, help, value) in counters {
            metric(&mut out, name, "counter", help, value as f64);
        }

        metric(&mut out, "steam_active_downloads", "gauge", "Downloads running", self.jobs.running as f64);
        metric(&mut out, "steam_queued_downloads", "gauge", "Downloads waiting for a slot", self.jobs.queued as f64);
        metric(&mut out, "steam_pool_utilization", "gauge", "Running downloads over the limit", self.pool.utilization);

        let histogram = &self.download_duration;
        let name = "steam_download_duration_seconds";
        let _ = writeln!(out, "# HELP {} Download duration in seconds", name);
        let _ = writeln!(out, "# TYPE {} histogram", name);
        for bucket in &histogram.buckets {
            let _ = writeln!(out, "{}_bucket{{le=\"{}\"}} {}", name, bucket.le, bucket.count);
        }
        let _ = writeln!(out, "{}_bucket{{le=\"+Inf\"}} {}", name, histogram.count);
        let _ = writeln!(out, "{}_sum {}", name, histogram.sum_secs);
        let _ = writeln!(out, "{}_count {}", name, histogram.count);

        if let Some(system) = &self.system {
            if let Some(disk) = &system.disk {
                metric(&mut out, "steam_disk_usage_bytes", "gauge", "Volume bytes used", disk.used_bytes as f64);
                metric(&mut out, "steam_disk_free_bytes", "gauge", "Volume bytes available", disk.free_bytes as f64);
                metric(&mut out, "steam_disk_total_bytes", "gauge", "Volume size in bytes", disk.total_bytes as f64);
            }
            if let Some(rss) = system.memory_rss_bytes {
                metric(&mut out, "steam_memory_usage_bytes", "gauge", "Resident memory in bytes", rss as f64);
            }
        }
        out
    }
}

fn metric(out: &mut String, name: &str, kind: &str, help: &str, value: f64) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} {}", name, kind);
    let _ = writeln!(out, "{} {}", name, value);
}

/// Resident set size from `/proc/self/status`. Linux only.
fn resident_memory_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss(&status)
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kib = line.split_whitespace().nth(1)?.parse::<u64>().ok()?;
    Some(kib * 1024)
}
