// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Structured logging setup.
//!
//! `RUST_LOG` wins when set; otherwise `LOG_LEVEL` applies to everything
//! except tower-http's per-request chatter. With `LOG_FILE` set, logs are
//! appended there without ANSI colors; if the file cannot be opened we fall
//! back to stderr and say so.

use std::fs::{self, File, OpenOptions};
use std::path::Path;

use anyhow::{Context, Result};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Install the global subscriber. Call once, early in `main`.
pub fn init(config: &Config) -> Result<()> {
    let filter = build_filter(&config.log_level);

    let file_error = match &config.log_file {
        Some(path) => match open_log_file(path) {
            Ok(file) => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(BoxMakeWriter::new(FileMakeWriter(file)))
                    .with_ansi(false)
                    .try_init()
                    .map_err(|e| anyhow::anyhow!("{}", e))
                    .context("Failed to install log subscriber")?;
                tracing::info!(path = %path.display(), "Logging to file");
                return Ok(());
            }
            Err(e) => Some(e),
        },
        None => None,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("{}", e))
        .context("Failed to install log subscriber")?;

    if let Some(e) = file_error {
        tracing::warn!(error = %e, "Could not open LOG_FILE; logging to stderr");
    }
    Ok(())
}

fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(format!("{},tower_http=warn", level.trim().to_ascii_lowercase()))
            .unwrap_or_else(|_| EnvFilter::new("info,tower_http=warn"))
    })
}

fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file: {}", path.display()))
}

/// Hands every event a clone of the same append-mode handle.
struct FileMakeWriter(File);

impl<'a> MakeWriter<'a> for FileMakeWriter {
    type Writer = Box<dyn std::io::Write + 'a>;

    fn make_writer(&'a self) -> Self::Writer {
        match self.0.try_clone() {
            Ok(file) => Box::new(file),
            Err(_) => Box::new(std::io::stderr()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_log_file_creates_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("steamfetch.log");
        open_log_file(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_bad_level_falls_back() {
        // Must not panic on garbage input.
        let _ = build_filter("not a level ===");
    }
}
