// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Service wiring: builds every component from one [`Config`] and runs them
//! until a shutdown signal arrives.
//!
//! Shutdown order: stop accepting requests, stop the supervisor (running
//! downloads end as `interrupted`), stop the cleanup loop, flush the ledger.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::jobs::{JobLedger, JobRegistry};
use crate::metrics::Metrics;
use crate::server::{build_metrics_router, build_router, shutdown_signal, AppState, Server};
use crate::storage::{RetentionPolicy, Storage};
use crate::supervisor::{Supervisor, SupervisorConfig};

pub struct App {
    config: Config,
    storage: Arc<Storage>,
    registry: Arc<JobRegistry>,
    supervisor: Arc<Supervisor>,
    state: Arc<AppState>,
}

impl App {
    /// Create the storage layout and restore the job ledger.
    pub fn build(config: Config) -> Result<Self> {
        let storage = Arc::new(Storage::new(&config.storage_path, config.public_url.clone()));
        storage
            .ensure_layout()
            .with_context(|| format!("Failed to prepare storage under {}", config.storage_path.display()))?;

        let registry = Arc::new(JobRegistry::with_ledger(JobLedger::new(storage.state_dir())));
        let metrics = Arc::new(Metrics::new());
        let supervisor = Supervisor::new(
            Arc::clone(&registry),
            Arc::clone(&storage),
            Arc::clone(&metrics),
            SupervisorConfig::from_config(&config),
        );
        let state = AppState::new(
            config.clone(),
            Arc::clone(&registry),
            Arc::clone(&storage),
            Arc::clone(&metrics),
        );

        Ok(Self {
            config,
            storage,
            registry,
            supervisor,
            state,
        })
    }

    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Serve until SIGINT/SIGTERM, then shut everything down.
    pub async fn run(self) -> Result<()> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);

        let dispatcher = self.supervisor.spawn_dispatcher();
        let cleanup = spawn_cleanup(
            Arc::clone(&self.storage),
            Arc::clone(&self.registry),
            &self.config,
            stop_rx.clone(),
        );

        let signal_tx = Arc::clone(&stop_tx);
        let signals = tokio::spawn(async move {
            shutdown_signal().await;
            signal_tx.send_replace(true);
        });

        let metrics_server = if self.config.enable_metrics {
            let server = Server::new(self.config.metrics_addr());
            let router = build_metrics_router(self.state());
            Some(tokio::spawn(server.start(router, wait_for_stop(stop_rx.clone()))))
        } else {
            None
        };

        let result = Server::new(self.config.api_addr())
            .with_rate_limit(self.config.rate_limit_burst)
            .start(build_router(self.state()), wait_for_stop(stop_rx.clone()))
            .await;

        // The API listener may also have ended on a bind error.
        stop_tx.send_replace(true);
        signals.abort();

        self.supervisor.shutdown().await;
        if let Err(e) = dispatcher.await {
            debug!(error = %e, "Dispatcher task ended abnormally");
        }
        if let Err(e) = cleanup.await {
            debug!(error = %e, "Cleanup task ended abnormally");
        }
        if let Some(task) = metrics_server {
            match task.await {
                Ok(Err(e)) => warn!(error = %e, "Metrics listener failed"),
                Err(e) => debug!(error = %e, "Metrics task ended abnormally"),
                Ok(Ok(())) => {}
            }
        }

        let registry = Arc::clone(&self.registry);
        if let Err(e) = tokio::task::spawn_blocking(move || registry.flush()).await {
            warn!(error = %e, "Final ledger flush failed");
        }
        info!("Shutdown complete");
        result
    }
}

async fn wait_for_stop(mut stop: watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

/// Periodic storage reconciliation. The first pass runs immediately, which
/// retries finalization left over from a previous run.
pub fn spawn_cleanup(
    storage: Arc<Storage>,
    registry: Arc<JobRegistry>,
    config: &Config,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let policy = RetentionPolicy::new(config.max_file_age());
    let period = config.cleanup_interval();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.wait_for(|stopped| *stopped) => break,
            }

            let storage = Arc::clone(&storage);
            let registry = Arc::clone(&registry);
            let report = match tokio::task::spawn_blocking(move || storage.cleanup(&registry, &policy)).await {
                Ok(report) => report,
                Err(e) => {
                    warn!(error = %e, "Cleanup pass panicked");
                    continue;
                }
            };

            if report.is_noop() && report.errors.is_empty() {
                debug!("Cleanup pass: nothing to do");
            } else {
                info!(
                    purged_jobs = report.purged_jobs.len(),
                    removed_paths = report.removed_paths.len(),
                    finalized = report.finalized.len(),
                    errors = report.errors.len(),
                    "Cleanup pass finished"
                );
            }
            for error in &report.errors {
                warn!(error = %error, "Cleanup error");
            }
        }
        debug!("Cleanup loop stopped");
    })
}
