// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Service configuration.
//!
//! Every option can be given as a flag or an environment variable; flags win.
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `BIND_ADDRESS` | `0.0.0.0` | Interface for both listeners |
//! | `PORT` | `8080` | HTTP API port |
//! | `MAX_DOWNLOADS` | `5` | Concurrently running downloads |
//! | `LOG_LEVEL` | `info` | Default filter when `RUST_LOG` is unset |
//! | `LOG_FILE` | unset | Append logs to this file instead of stderr |
//! | `ENABLE_METRICS` | `true` | Serve `/metrics` on its own port |
//! | `METRICS_PORT` | `9090` | Metrics listener port |
//! | `STORAGE_PATH` | `/data` | Persistent volume root |
//! | `STEAMCMD_PATH` | `/app/steamcmd/steamcmd.sh` | Download utility |
//! | `STALL_TIMEOUT_SECS` | `600` | Silence before a job counts as stalled |
//! | `TERMINATE_GRACE_SECS` | `10` | SIGTERM-to-SIGKILL grace period |
//! | `MAX_FILE_AGE` | `86400` | Retention window in seconds |
//! | `CLEANUP_INTERVAL` | `3600` | Seconds between cleanup passes |
//! | `PUBLIC_URL` | empty | Prefix for public links |
//! | `MIN_FREE_DISK_MB` | `1024` | Readiness threshold for free space |
//! | `RATE_LIMIT_BURST` | `60` | Per-IP request burst, 0 disables |

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{ArgAction, Parser};

#[derive(Debug, Clone, Parser)]
#[command(name = "steamfetch")]
#[command(version)]
#[command(about = "Supervised SteamCMD download service with live progress and public links.")]
pub struct Config {
    /// Address both listeners bind to
    #[arg(long, env = "BIND_ADDRESS", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind_address: IpAddr,

    /// HTTP API port
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Maximum downloads running at once
    #[arg(long, env = "MAX_DOWNLOADS", default_value_t = 5)]
    pub max_downloads: usize,

    /// Log level used when RUST_LOG is not set
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Write logs to this file instead of stderr
    #[arg(long, env = "LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Serve JSON metrics on a separate port
    #[arg(long, env = "ENABLE_METRICS", default_value_t = true, action = ArgAction::Set)]
    pub enable_metrics: bool,

    /// Metrics listener port
    #[arg(long, env = "METRICS_PORT", default_value_t = 9090)]
    pub metrics_port: u16,

    /// Root of the persistent storage volume
    #[arg(long, env = "STORAGE_PATH", default_value = "/data")]
    pub storage_path: PathBuf,

    /// Path to the SteamCMD launcher
    #[arg(long, env = "STEAMCMD_PATH", default_value = "/app/steamcmd/steamcmd.sh")]
    pub steamcmd_path: PathBuf,

    /// Seconds without output before a download is considered stalled
    #[arg(long, env = "STALL_TIMEOUT_SECS", default_value_t = 600)]
    pub stall_timeout_secs: u64,

    /// Seconds between SIGTERM and SIGKILL when stopping a download
    #[arg(long, env = "TERMINATE_GRACE_SECS", default_value_t = 10)]
    pub terminate_grace_secs: u64,

    /// Retention window for finished jobs and their files, in seconds
    #[arg(long, env = "MAX_FILE_AGE", default_value_t = 86_400)]
    pub max_file_age_secs: u64,

    /// Seconds between cleanup passes
    #[arg(long, env = "CLEANUP_INTERVAL", default_value_t = 3_600)]
    pub cleanup_interval_secs: u64,

    /// External base URL prepended to public links
    #[arg(long, env = "PUBLIC_URL", default_value = "")]
    pub public_url: String,

    /// Free disk space (MiB) below which the service reports not ready
    #[arg(long, env = "MIN_FREE_DISK_MB", default_value_t = 1024)]
    pub min_free_disk_mb: u64,

    /// Per-IP request burst for the API; 0 disables rate limiting
    #[arg(long, env = "RATE_LIMIT_BURST", default_value_t = 60)]
    pub rate_limit_burst: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8080,
            max_downloads: 5,
            log_level: "info".to_string(),
            log_file: None,
            enable_metrics: true,
            metrics_port: 9090,
            storage_path: PathBuf::from("/data"),
            steamcmd_path: PathBuf::from("/app/steamcmd/steamcmd.sh"),
            stall_timeout_secs: 600,
            terminate_grace_secs: 10,
            max_file_age_secs: 86_400,
            cleanup_interval_secs: 3_600,
            public_url: String::new(),
            min_free_disk_mb: 1024,
            rate_limit_burst: 60,
        }
    }
}

impl Config {
    /// Reject combinations the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_downloads == 0 {
            bail!("MAX_DOWNLOADS must be at least 1");
        }
        if self.stall_timeout_secs == 0 {
            bail!("STALL_TIMEOUT_SECS must be at least 1");
        }
        if self.cleanup_interval_secs == 0 {
            bail!("CLEANUP_INTERVAL must be at least 1");
        }
        if self.enable_metrics && self.metrics_port == self.port {
            bail!(
                "METRICS_PORT ({}) must differ from PORT when metrics are enabled",
                self.metrics_port
            );
        }
        if !self.public_url.is_empty()
            && !(self.public_url.starts_with("http://") || self.public_url.starts_with("https://"))
        {
            bail!("PUBLIC_URL must start with http:// or https://");
        }
        Ok(())
    }

    pub fn api_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    pub fn metrics_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.metrics_port)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }

    pub fn max_file_age(&self) -> Duration {
        Duration::from_secs(self.max_file_age_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn min_free_disk_bytes(&self) -> u64 {
        self.min_free_disk_mb.saturating_mul(1024 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.api_addr().port(), 8080);
        assert_eq!(config.min_free_disk_bytes(), 1024 * 1024 * 1024);
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = Config::try_parse_from([
            "steamfetch",
            "--port",
            "9000",
            "--max-downloads",
            "2",
            "--enable-metrics",
            "false",
            "--storage-path",
            "/srv/games",
        ])
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.max_downloads, 2);
        assert!(!config.enable_metrics);
        assert_eq!(config.storage_path, PathBuf::from("/srv/games"));
    }

    #[test]
    fn test_validation_failures() {
        let zero = Config {
            max_downloads: 0,
            ..Config::default()
        };
        assert!(zero.validate().is_err());

        let clash = Config {
            port: 9090,
            ..Config::default()
        };
        assert!(clash.validate().is_err());
        let no_metrics = Config {
            port: 9090,
            enable_metrics: false,
            ..Config::default()
        };
        assert!(no_metrics.validate().is_ok());

        let bad_url = Config {
            public_url: "example.com".into(),
            ..Config::default()
        };
        assert!(bad_url.validate().is_err());
    }
}
