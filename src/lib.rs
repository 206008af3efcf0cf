// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! steamfetch - supervised SteamCMD download service
//!
//! Accepts download requests over HTTP, runs the SteamCMD utility for each one
//! under a concurrency limit, turns its console output into live progress and
//! publishes finished downloads under a public directory.
//!
//! **submit** -> **queued** -> **running** -> **completed** (+ public link) | **failed**
//!
//! # Core Modules
//!
//! - [`jobs`] - Job model, registry (single source of truth) and persisted ledger
//! - [`supervisor`] - Subprocess pool, stall detection, termination
//! - [`progress`] - Line splitting and progress marker parsing
//! - [`publisher`] - Per-job snapshot streams
//! - [`storage`] - Output verification, public links, retention cleanup
//! - [`server`] - HTTP API and metrics listener
//! - [`health`] - Readiness checks
//! - [`errors`] - HTTP error bodies with reference codes

pub mod app;
pub mod config;
pub mod error;
pub mod errors;
pub mod health;
pub mod jobs;
pub mod logging;
pub mod metrics;
pub mod progress;
pub mod publisher;
pub mod server;
pub mod storage;
pub mod supervisor;
pub mod sync;

pub use app::App;
pub use config::Config;
pub use error::{JobError, StorageError, SupervisorError};
pub use jobs::{Job, JobId, JobRegistry, JobState, SubmitRequest};
pub use progress::{LineSplitter, ProgressEvent, ProgressParser};
pub use publisher::StatusPublisher;
pub use storage::{CleanupReport, RetentionPolicy, Storage};
pub use supervisor::{Supervisor, SupervisorConfig};
