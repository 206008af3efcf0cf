// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP API.
//!
//! # Endpoints
//!
//! - `GET /health` - Liveness and readiness (503 when not ready)
//! - `GET /status` - Version, uptime, job counts and pool usage
//! - `POST /jobs` - Queue a download
//! - `GET /jobs?state=` - List jobs in submission order
//! - `GET /jobs/:id` - Job snapshot
//! - `GET /jobs/:id/events` - Server-Sent Events stream of snapshots
//! - `POST /jobs/:id/cancel` - Cancel a queued or running job
//! - `DELETE /jobs/:id` - Remove a finished or queued job and its files
//! - `GET /downloads` - Completed jobs with their public links
//!
//! Metrics live on a separate listener, see [`build_metrics_router`].
//!
//! # Example
//!
//! ```no_run
//! use steamfetch::server::{build_router, shutdown_signal, AppState, Server};
//!
//! # async fn example(state: std::sync::Arc<AppState>) -> anyhow::Result<()> {
//! let router = build_router(state);
//! Server::new("0.0.0.0:8080".parse()?)
//!     .with_rate_limit(60)
//!     .start(router, shutdown_signal())
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use futures_util::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tower_governor::{governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer};
use tower_http::timeout::TimeoutLayer;

use crate::config::Config;
use crate::errors::ApiError;
use crate::health::{HealthChecker, HealthReport};
use crate::jobs::{
    Credentials, Job, JobId, JobRegistry, JobState, Platform, PublicLink, StateCounts, SubmitRequest,
};
use crate::metrics::{Metrics, MetricsSnapshot, PoolUsage, SystemUsage};
use crate::publisher::StatusPublisher;
use crate::storage::Storage;

/// Maximum request body size (64 KiB).
const MAX_BODY_SIZE: usize = 64 * 1024;
/// Time allowed until response headers are sent.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// State shared across handlers.
pub struct AppState {
    pub registry: Arc<JobRegistry>,
    pub publisher: StatusPublisher,
    pub storage: Arc<Storage>,
    pub metrics: Arc<Metrics>,
    pub health: HealthChecker,
    pub config: Config,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        config: Config,
        registry: Arc<JobRegistry>,
        storage: Arc<Storage>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let health = HealthChecker::new(
            config.steamcmd_path.clone(),
            Arc::clone(&storage),
            config.min_free_disk_bytes(),
        );
        Arc::new(Self {
            publisher: StatusPublisher::new(Arc::clone(&registry)),
            registry,
            storage,
            metrics,
            health,
            config,
            started_at: Instant::now(),
        })
    }

    fn pool_limit(&self) -> usize {
        self.config.max_downloads
    }
}

/// API routes with body limit and request timeout. Rate limiting is added by
/// [`Server::start`] since it needs the peer address.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/jobs", post(submit_handler).get(list_handler))
        .route("/jobs/:id", get(job_handler).delete(delete_handler))
        .route("/jobs/:id/events", get(events_handler))
        .route("/jobs/:id/cancel", post(cancel_handler))
        .route("/downloads", get(downloads_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state)
}

/// Routes for the separate metrics listener:
///
/// - `GET /metrics` - JSON snapshot including volume disk and memory usage
/// - `GET /metrics/prometheus` - the same figures in Prometheus text format
pub fn build_metrics_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/metrics/prometheus", get(prometheus_handler))
        .with_state(state)
}

/// One listener.
#[derive(Debug, Clone)]
pub struct Server {
    addr: SocketAddr,
    rate_limit_burst: u32,
}

impl Server {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            rate_limit_burst: 0,
        }
    }

    /// Per-IP burst, refilled at one request per second. 0 disables.
    pub fn with_rate_limit(mut self, burst: u32) -> Self {
        self.rate_limit_burst = burst;
        self
    }

    /// Serve `router` until `shutdown` resolves.
    pub async fn start<F>(self, router: Router, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = if self.rate_limit_burst > 0 {
            let governor_conf = Arc::new(
                GovernorConfigBuilder::default()
                    .per_second(1)
                    .burst_size(self.rate_limit_burst)
                    .key_extractor(SmartIpKeyExtractor)
                    .finish()
                    .context("Invalid rate limit configuration")?,
            );
            router.layer(GovernorLayer {
                config: governor_conf,
            })
        } else {
            router
        };

        let listener = tokio::net::TcpListener::bind(self.addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                anyhow::anyhow!(
                    "Address {} is already in use. Stop the other instance or choose a different port.",
                    self.addr
                )
            } else {
                anyhow::anyhow!("Failed to bind to {}: {}", self.addr, e)
            }
        })?;

        tracing::info!(addr = %self.addr, "Listening");

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .with_context(|| format!("Server on {} failed", self.addr))?;

        tracing::info!(addr = %self.addr, "Listener stopped");
        Ok(())
    }
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// `POST /jobs` body.
#[derive(Debug, Deserialize)]
pub struct SubmitBody {
    pub app_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub guard_code: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub validate: Option<bool>,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    job_id: JobId,
    state: JobState,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    state: Option<String>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    version: &'static str,
    uptime_secs: u64,
    jobs: StateCounts,
    pool: PoolUsage,
    storage_path: String,
    public_url: String,
}

#[derive(Debug, Serialize)]
struct DownloadEntry {
    job_id: JobId,
    target: String,
    finished_at: Option<chrono::DateTime<chrono::Utc>>,
    link: PublicLink,
}

// =============================================================================
// Handlers
// =============================================================================

/// Runs the checks on the blocking pool; 503 when not ready.
async fn health_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let checker = state.health.clone();
    let report: HealthReport = tokio::task::spawn_blocking(move || checker.run())
        .await
        .map_err(|e| ApiError::internal(&format!("health check task failed: {}", e)))?;

    let status = if report.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok((status, Json(report)).into_response())
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let snapshot = state.metrics.snapshot(state.registry.counts(), state.pool_limit());
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        jobs: snapshot.jobs,
        pool: snapshot.pool,
        storage_path: state.storage.root().display().to_string(),
        public_url: state.config.public_url.clone(),
    })
}

/// Counters plus host figures; `df` runs on the blocking pool.
async fn full_snapshot(state: &AppState) -> MetricsSnapshot {
    let snapshot = state.metrics.snapshot(state.registry.counts(), state.pool_limit());
    let volume = state.storage.root().to_path_buf();
    match tokio::task::spawn_blocking(move || SystemUsage::collect(&volume)).await {
        Ok(system) => snapshot.with_system(system),
        Err(e) => {
            tracing::warn!(error = %e, "System usage sampling failed");
            snapshot
        }
    }
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Json<MetricsSnapshot> {
    Json(full_snapshot(&state).await)
}

async fn prometheus_handler(State(state): State<Arc<AppState>>) -> Response {
    let body = full_snapshot(&state).await.to_prometheus();
    (
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

async fn submit_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SubmitBody>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let Json(body) = payload.map_err(|e| ApiError::invalid_request(e.body_text(), None))?;

    let credentials = Credentials::from_parts(body.username, body.password, body.guard_code);
    let mut request = SubmitRequest::new(body.app_id).with_credentials(credentials);
    if let Some(platform) = body.platform.as_deref().filter(|p| !p.trim().is_empty()) {
        let platform = Platform::from_str(platform)
            .map_err(|e| ApiError::invalid_request(e, Some("platform")))?;
        request = request.with_platform(platform);
    }
    if let Some(validate) = body.validate {
        request.validate = validate;
    }

    let job_id = state.registry.submit(request)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id,
            state: JobState::Queued,
        }),
    ))
}

async fn list_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Job>>, ApiError> {
    let filter = query
        .state
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(JobState::from_str)
        .transpose()
        .map_err(|e| ApiError::invalid_request(e, Some("state")))?;
    Ok(Json(state.registry.list(filter)))
}

async fn job_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.publisher.snapshot(&JobId::from(id))?))
}

/// Streams `event: job` messages until the job is terminal or deleted.
async fn events_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let id = JobId::from(id);
    let snapshots = state.publisher.subscribe(&id)?;
    let events = snapshots.map(|job| {
        let event = Event::default().event("job").id(job.revision.to_string());
        let data = serde_json::to_string(&job).unwrap_or_else(|e| {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to encode job event");
            "{}".to_string()
        });
        Ok(event.data(data))
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let job = state.registry.cancel(&JobId::from(id))?;
    tracing::info!(job_id = %job.id, state = %job.state, "Cancel requested");
    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// Removes the registry entry first so a queued job can never start, then its files.
async fn delete_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let job = state.registry.delete(&JobId::from(id))?;

    let storage = Arc::clone(&state.storage);
    let purge_job = job.clone();
    match tokio::task::spawn_blocking(move || storage.purge(&purge_job)).await {
        Ok(Ok(removed)) => {
            tracing::info!(job_id = %job.id, removed = removed.len(), "Job deleted");
        }
        // Whatever is left becomes an orphan for the next cleanup pass.
        Ok(Err(e)) => tracing::warn!(job_id = %job.id, error = %e, "Job deleted; file removal failed"),
        Err(e) => tracing::warn!(job_id = %job.id, error = %e, "Job deleted; purge task failed"),
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn downloads_handler(State(state): State<Arc<AppState>>) -> Json<Vec<DownloadEntry>> {
    let entries = state
        .registry
        .list(Some(JobState::Completed))
        .into_iter()
        .filter_map(|job| {
            let link = job.link?;
            Some(DownloadEntry {
                job_id: job.id,
                target: job.target,
                finished_at: job.finished_at,
                link,
            })
        })
        .collect();
    Json(entries)
}

// =============================================================================
// Shutdown
// =============================================================================

/// Resolves on SIGINT or SIGTERM (Ctrl+C elsewhere).
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down"),
                    _ = sigint.recv() => tracing::info!("Received SIGINT, shutting down"),
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(error = %e, "Signal handlers unavailable; waiting for Ctrl+C");
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Received Ctrl+C, shutting down");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl+C, shutting down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_body_optional_fields() {
        let body: SubmitBody = serde_json::from_str(r#"{"app_id":"740"}"#).unwrap();
        assert_eq!(body.app_id, "740");
        assert!(body.username.is_none());
        assert!(body.validate.is_none());
    }

    #[test]
    fn test_server_rate_limit_default_off() {
        let server = Server::new("127.0.0.1:0".parse().unwrap());
        assert_eq!(server.rate_limit_burst, 0);
        assert_eq!(server.with_rate_limit(10).rate_limit_burst, 10);
    }
}
