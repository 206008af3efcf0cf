// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download jobs: data model, registry and persisted ledger.
//!
//! ```no_run
//! use steamfetch::jobs::{JobRegistry, SubmitRequest};
//!
//! let registry = JobRegistry::new();
//! let id = registry.submit(SubmitRequest::new("740")).unwrap();
//! println!("{}", registry.get(&id).unwrap().state);
//! ```

pub mod ledger;
pub mod registry;
pub mod types;

pub use ledger::{JobLedger, LedgerWriter};
pub use registry::{JobEvent, JobRegistry, StartTicket, StateCounts};
pub use types::{
    Credentials, FailureKind, Job, JobFailure, JobId, JobState, Platform, ProgressSnapshot,
    PublicFile, PublicLink, SubmitRequest,
};
