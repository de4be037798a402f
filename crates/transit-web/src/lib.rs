//! Axum control surface for starting, watching and cancelling reconciliation runs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use transit_storage::DEFAULT_STALE_AFTER;
use transit_sync::{
    build_orchestrator, maybe_build_scheduler, ReconciliationOrchestrator, SyncConfig, SyncError,
    SyncHandle,
};
use uuid::Uuid;

pub const CRATE_NAME: &str = "transit-web";

const LIMITER_SWEEP_EVERY: Duration = Duration::from_secs(600);

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ReconciliationOrchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<ReconciliationOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[derive(Debug, Serialize)]
struct RunAccepted {
    run_id: Uuid,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    active_run_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
struct StatsBody {
    total: usize,
    with_coordinates: usize,
    missing_coordinates: usize,
    completion_rate: f64,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/sync/full", post(start_full_sync_handler))
        .route("/sync/coordinates", post(start_supplement_handler))
        .route("/sync/status", get(status_handler))
        .route("/sync/cancel", post(cancel_handler))
        .route("/stations/stats", get(stats_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(Arc::new(state))
}

/// Serves the control surface until Ctrl-C, with the scheduler when enabled.
pub async fn serve(config: SyncConfig) -> anyhow::Result<()> {
    let orchestrator = build_orchestrator(&config).await?;
    let shutdown = CancellationToken::new();

    let sweeper = orchestrator.limiter().spawn_sweeper(
        LIMITER_SWEEP_EVERY,
        DEFAULT_STALE_AFTER,
        shutdown.clone(),
    );

    let mut scheduler = maybe_build_scheduler(&config, Arc::clone(&orchestrator)).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.supplement_cron, "coordinate supplement scheduled");
    }

    let listener = TcpListener::bind(("0.0.0.0", config.web_port))
        .await
        .with_context(|| format!("binding port {}", config.web_port))?;
    info!(port = config.web_port, "transit web listening");

    let state = AppState::new(Arc::clone(&orchestrator));
    let signal_orchestrator = Arc::clone(&orchestrator);
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                warn!("could not listen for interrupt; serving until killed");
                std::future::pending::<()>().await;
            }
            if let Some(run_id) = signal_orchestrator.cancel_active() {
                warn!(%run_id, "shutting down; cancelled active run");
            }
        })
        .await
        .context("serving http")?;

    shutdown.cancel();
    let _ = sweeper.await;
    if let Some(sched) = scheduler.as_mut() {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(SyncConfig::from_env()).await
}

async fn start_full_sync_handler(State(state): State<Arc<AppState>>) -> Response {
    accepted_or_conflict(state.orchestrator.start_full_sync())
}

async fn start_supplement_handler(State(state): State<Arc<AppState>>) -> Response {
    accepted_or_conflict(state.orchestrator.start_supplement())
}

fn accepted_or_conflict(started: Result<SyncHandle, SyncError>) -> Response {
    match started {
        Ok(handle) => {
            info!(run_id = %handle.run_id, "run accepted");
            (
                StatusCode::ACCEPTED,
                Json(RunAccepted {
                    run_id: handle.run_id,
                }),
            )
                .into_response()
        }
        Err(SyncError::AlreadyRunning(active)) => (
            StatusCode::CONFLICT,
            Json(ErrorBody {
                error: "a sync run is already active".to_string(),
                active_run_id: Some(active),
            }),
        )
            .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.orchestrator.status()).into_response()
}

async fn cancel_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.orchestrator.cancel_active() {
        Some(run_id) => (StatusCode::ACCEPTED, Json(RunAccepted { run_id })).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: "no active run".to_string(),
                active_run_id: None,
            }),
        )
            .into_response(),
    }
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.orchestrator.coordinate_statistics().await {
        Ok(stats) => Json(StatsBody {
            total: stats.total,
            with_coordinates: stats.with_coordinates,
            missing_coordinates: stats.missing_coordinates,
            completion_rate: stats.completion_rate(),
        })
        .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn healthz_handler() -> &'static str {
    "ok"
}

fn server_error(err: anyhow::Error) -> Response {
    warn!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: format!("Server error: {err}"),
            active_run_id: None,
        }),
    )
        .into_response()
}
